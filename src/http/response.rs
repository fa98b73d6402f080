//! Verdict headers and error bodies shared by the decision API and the
//! enforcement middleware.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::ratelimit::{AdmissionError, Verdict, Window};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_WINDOW: HeaderName = HeaderName::from_static("x-ratelimit-window");
pub const X_RATELIMIT_QUOTA_USED: HeaderName = HeaderName::from_static("x-ratelimit-quotaused");
pub const X_RATELIMIT_QUOTA_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-quotalimit");

/// Render an instant the way the reset header carries it.
pub fn format_reset(reset_at: DateTime<Utc>) -> String {
    reset_at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Write the `X-RateLimit-*` headers describing `verdict` into `headers`.
pub fn apply_verdict_headers(headers: &mut HeaderMap, verdict: &Verdict) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(verdict.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(verdict.remaining));
    if let Ok(reset) = HeaderValue::from_str(&format_reset(verdict.reset_at)) {
        headers.insert(X_RATELIMIT_RESET, reset);
    }
    headers.insert(
        X_RATELIMIT_WINDOW,
        HeaderValue::from_static(verdict.window.name()),
    );
    headers.insert(X_RATELIMIT_QUOTA_USED, HeaderValue::from(verdict.quota_used));
    headers.insert(X_RATELIMIT_QUOTA_LIMIT, HeaderValue::from(verdict.quota_limit));
}

/// Body of a 429 response.
#[derive(Debug, Serialize)]
pub struct DeniedBody {
    pub error: &'static str,
    pub code: &'static str,
    pub window: Window,
    pub limit: u64,
    pub reset_time: String,
    pub quota_used: u64,
    pub quota_limit: u64,
}

impl From<&Verdict> for DeniedBody {
    fn from(verdict: &Verdict) -> Self {
        let (error, code) = if verdict.is_quota_denial() {
            ("Monthly quota exceeded", "MONTHLY_QUOTA_EXCEEDED")
        } else {
            ("Rate limit exceeded", "RATE_LIMIT_EXCEEDED")
        };

        Self {
            error,
            code,
            window: verdict.window,
            limit: verdict.limit,
            reset_time: format_reset(verdict.reset_at),
            quota_used: verdict.quota_used,
            quota_limit: verdict.quota_limit,
        }
    }
}

/// Body of every other error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

/// Everything a gateway route can answer with besides success.
#[derive(Debug)]
pub enum ApiError {
    /// No usable caller identity on the request
    MissingCaller,
    /// A limit or the quota refused the request
    Denied(Verdict),
    /// The engine could not reach a decision
    Engine(AdmissionError),
    /// Counting an admitted request failed
    Commit(AdmissionError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::MissingCaller => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    error: "API key required".to_string(),
                    code: "MISSING_API_KEY",
                }),
            )
                .into_response(),
            ApiError::Denied(verdict) => {
                let mut response =
                    (StatusCode::TOO_MANY_REQUESTS, Json(DeniedBody::from(&verdict))).into_response();
                apply_verdict_headers(response.headers_mut(), &verdict);
                response
            }
            ApiError::Engine(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "Rate limit check failed".to_string(),
                    code: "RATE_LIMIT_ERROR",
                }),
            )
                .into_response(),
            ApiError::Commit(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "Failed to record request".to_string(),
                    code: "COMMIT_ERROR",
                }),
            )
                .into_response(),
        }
    }
}
