//! Admission policy: per-window limits and the monthly quota.
//!
//! The policy is loaded once at startup and never changes for the lifetime
//! of the process.

use serde::{Deserialize, Serialize};

use super::window::Window;
use crate::error::{GatewayError, Result};

/// How admitted requests are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Read-only `check` before the gated operation, `commit` after it
    /// succeeded. Concurrent requests may overshoot a limit slightly.
    #[default]
    CheckThenCommit,
    /// One conditional increment per counter before the gated operation.
    /// Limits are never overshot; every admitted attempt is counted.
    Atomic,
}

/// The complete set of admission limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Requests admitted per calendar minute
    #[serde(default = "default_per_minute")]
    pub requests_per_minute: u64,

    /// Requests admitted per calendar hour
    #[serde(default = "default_per_hour")]
    pub requests_per_hour: u64,

    /// Requests admitted per calendar day
    #[serde(default = "default_per_day")]
    pub requests_per_day: u64,

    /// Requests admitted per calendar month
    #[serde(default = "default_monthly_quota")]
    pub monthly_quota: u64,

    /// Report `limit - (current + 1)` as `remaining` on allow instead of the
    /// configured limit
    #[serde(default)]
    pub exact_remaining: bool,

    /// Counting strategy
    #[serde(default)]
    pub admission: AdmissionMode,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            requests_per_minute: default_per_minute(),
            requests_per_hour: default_per_hour(),
            requests_per_day: default_per_day(),
            monthly_quota: default_monthly_quota(),
            exact_remaining: false,
            admission: AdmissionMode::default(),
        }
    }
}

fn default_per_minute() -> u64 {
    60
}

fn default_per_hour() -> u64 {
    1000
}

fn default_per_day() -> u64 {
    10000
}

fn default_monthly_quota() -> u64 {
    100000
}

/// One window together with its configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    /// The window
    pub window: Window,
    /// Maximum admitted requests per bucket of the window
    pub limit: u64,
}

impl Policy {
    /// Create a policy from explicit limits.
    pub fn new(per_minute: u64, per_hour: u64, per_day: u64, monthly_quota: u64) -> Self {
        Self {
            requests_per_minute: per_minute,
            requests_per_hour: per_hour,
            requests_per_day: per_day,
            monthly_quota,
            ..Self::default()
        }
    }

    /// Load a policy from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse admission policy: {}", e)))
    }

    /// The configured limit for `window`.
    pub fn limit(&self, window: Window) -> u64 {
        match window {
            Window::Minute => self.requests_per_minute,
            Window::Hour => self.requests_per_hour,
            Window::Day => self.requests_per_day,
            Window::Monthly => self.monthly_quota,
        }
    }

    /// The rolling windows with their limits, in evaluation order.
    pub fn windows(&self) -> impl Iterator<Item = WindowLimit> + '_ {
        Window::ROLLING.into_iter().map(move |window| WindowLimit {
            window,
            limit: self.limit(window),
        })
    }
}
