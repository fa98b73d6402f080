//! HTTP surface of the gateway.
//!
//! Two ways in: a decision API that a fronting proxy calls before and after
//! forwarding, and an embeddable middleware that gates any inner router
//! directly.

mod middleware;
mod response;
mod server;
mod service;

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::error::{GatewayError, Result};
use crate::ratelimit::{AdmissionEngine, CallerId};

pub use middleware::{enforce, protect, track_requests};
pub use response::{apply_verdict_headers, ApiError, DeniedBody, ErrorBody};
pub use server::HttpServer;
pub use service::router;

/// State shared by every route and the enforcement middleware.
#[derive(Debug, Clone)]
pub struct AppState {
    engine: Arc<AdmissionEngine>,
    caller_header: HeaderName,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create the state, reading the caller identity from `caller_header`.
    pub fn new(engine: Arc<AdmissionEngine>, caller_header: &str) -> Result<Self> {
        let caller_header = HeaderName::from_bytes(caller_header.as_bytes()).map_err(|e| {
            GatewayError::Config(format!("invalid caller header {:?}: {}", caller_header, e))
        })?;

        Ok(Self {
            engine,
            caller_header,
            metrics: None,
        })
    }

    /// Serve `GET /metrics` from `handle`.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// The engine behind this state.
    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }

    /// Name of the header carrying the caller identity.
    pub fn caller_header(&self) -> &HeaderName {
        &self.caller_header
    }

    /// Extract the caller identity; absent, blank or non-text values count as
    /// missing. The value is used verbatim, surrounding whitespace included.
    pub(crate) fn caller(&self, headers: &HeaderMap) -> std::result::Result<CallerId, ApiError> {
        headers
            .get(&self.caller_header)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.trim().is_empty())
            .and_then(|value| CallerId::new(value).ok())
            .ok_or(ApiError::MissingCaller)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::Policy;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    /// State over a fresh memory store frozen at 2024-01-01 12:34:10 UTC.
    pub(crate) fn state(policy: Policy) -> (AppState, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 10).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let engine = AdmissionEngine::new(store, policy).with_clock(clock.clone());
        let state = AppState::new(Arc::new(engine), "X-API-Key").unwrap();
        (state, clock)
    }
}
