//! Admission logic: windows, policy and the engine that evaluates them.

mod caller;
mod engine;
mod policy;
mod verdict;
mod window;

pub use caller::CallerId;
pub use engine::{AdmissionEngine, AdmissionError};
pub use policy::{AdmissionMode, Policy, WindowLimit};
pub use verdict::{QuotaUsage, UsageSnapshot, Verdict, WindowUsage};
pub use window::Window;
