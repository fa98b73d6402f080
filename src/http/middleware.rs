//! Enforcement middleware for embedding the gateway in front of any router.

use std::time::Instant;

use axum::body::HttpBody;
use axum::extract::{MatchedPath, Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{debug, error, warn};

use super::response::{apply_verdict_headers, ApiError};
use super::AppState;
use crate::metrics;
use crate::ratelimit::AdmissionMode;

/// Gate `router` behind admission control.
pub fn protect(router: Router, state: AppState) -> Router {
    router.layer(from_fn_with_state(state, enforce))
}

/// Admit or refuse the request before the inner service runs.
///
/// In `check_then_commit` mode the request is counted only when the inner
/// response is 2xx; a failed count is logged and leaves the response alone.
/// In `atomic` mode the request was already counted when it was admitted.
pub async fn enforce(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let caller = match state.caller(request.headers()) {
        Ok(caller) => caller,
        Err(e) => return e.into_response(),
    };

    let mode = state.engine.policy().admission;
    let decision = match mode {
        AdmissionMode::CheckThenCommit => state.engine.check(&caller).await,
        AdmissionMode::Atomic => state.engine.admit(&caller).await,
    };

    let verdict = match decision {
        Ok(verdict) if verdict.allowed => verdict,
        Ok(verdict) => {
            metrics::record_rate_limited(&caller, verdict.window);
            return ApiError::Denied(verdict).into_response();
        }
        Err(e) => {
            warn!(caller = %caller, error = %e, "Admission failed, refusing request");
            return ApiError::Engine(e).into_response();
        }
    };

    let mut response = next.run(request).await;
    apply_verdict_headers(response.headers_mut(), &verdict);

    if response.status().is_server_error() {
        metrics::record_upstream_error(&caller, "server_error");
    }

    if mode == AdmissionMode::CheckThenCommit {
        if response.status().is_success() {
            if let Err(e) = state.engine.commit(&caller).await {
                error!(caller = %caller, error = %e, "Failed to count admitted request");
            }
        } else {
            debug!(
                caller = %caller,
                status = response.status().as_u16(),
                "Upstream did not succeed, request not counted"
            );
        }
    }

    response
}

/// Record request count, latency and sizes for every route.
///
/// Routes are labelled by their matched pattern so path parameters do not
/// multiply series; anything that matched no route is `unmatched`.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let request_bytes = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    let response = next.run(request).await;

    metrics::record_request(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed(),
        request_bytes,
        response.body().size_hint().exact(),
    );
    response
}
