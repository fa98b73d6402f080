//! Admission results.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::window::Window;

/// The outcome of one admission check.
///
/// `window` names the binding window: the first violated one on deny, the
/// minute window on allow. `reset_at` is absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    #[serde(rename = "reset_time")]
    pub reset_at: DateTime<Utc>,
    pub window: Window,
    pub quota_used: u64,
    pub quota_limit: u64,
}

impl Verdict {
    /// Whether the denial comes from the monthly quota rather than a window.
    pub fn is_quota_denial(&self) -> bool {
        !self.allowed && self.window == Window::Monthly
    }
}

/// Monthly quota usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    #[serde(rename = "reset_time")]
    pub reset_at: DateTime<Utc>,
}

/// Usage of one rolling window's current bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowUsage {
    #[serde(skip_serializing)]
    pub window: Window,
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
    #[serde(rename = "reset_time")]
    pub reset_at: DateTime<Utc>,
}

/// Read-only report of a caller's standing against every limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    #[serde(rename = "monthly_quota")]
    pub quota: QuotaUsage,
    /// Rolling windows in priority order; serialized as a map keyed by
    /// window name.
    #[serde(rename = "rate_limits", serialize_with = "by_window_name")]
    pub windows: Vec<WindowUsage>,
}

fn by_window_name<S: Serializer>(windows: &[WindowUsage], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(windows.iter().map(|usage| (usage.window.name(), usage)))
}

impl UsageSnapshot {
    /// Usage of a single rolling window.
    pub fn window(&self, window: Window) -> Option<&WindowUsage> {
        self.windows.iter().find(|usage| usage.window == window)
    }
}
