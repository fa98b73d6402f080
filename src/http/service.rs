//! Decision API handlers.

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, field, info, instrument, warn, Span};

use super::response::{apply_verdict_headers, ApiError};
use super::AppState;
use crate::metrics;
use crate::ratelimit::{CallerId, Verdict};

/// Build the decision API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/admission/check", post(check))
        .route("/v1/admission/commit", post(commit))
        .route("/v1/admission/admit", post(admit))
        .route("/v1/rate-limit/info", get(info))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

fn verdict_response(caller: &CallerId, verdict: Verdict) -> Result<Response, ApiError> {
    if !verdict.allowed {
        metrics::record_rate_limited(caller, verdict.window);
        return Err(ApiError::Denied(verdict));
    }

    let mut headers = HeaderMap::new();
    apply_verdict_headers(&mut headers, &verdict);
    Ok((StatusCode::OK, headers, Json(verdict)).into_response())
}

#[instrument(skip(state, headers), fields(caller = field::Empty))]
async fn check(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let caller = state.caller(&headers)?;
    Span::current().record("caller", field::display(&caller));
    debug!("Processing admission check");

    let verdict = state.engine.check(&caller).await.map_err(|e| {
        warn!(error = %e, "Admission check failed, refusing request");
        ApiError::Engine(e)
    })?;

    info!(allowed = verdict.allowed, window = %verdict.window, "Admission decision made");
    verdict_response(&caller, verdict)
}

#[instrument(skip(state, headers), fields(caller = field::Empty))]
async fn commit(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, ApiError> {
    let caller = state.caller(&headers)?;
    Span::current().record("caller", field::display(&caller));

    state
        .engine
        .commit(&caller)
        .await
        .map_err(ApiError::Commit)?;

    debug!("Admitted request counted");
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, headers), fields(caller = field::Empty))]
async fn admit(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let caller = state.caller(&headers)?;
    Span::current().record("caller", field::display(&caller));
    debug!("Processing atomic admission");

    let verdict = state.engine.admit(&caller).await.map_err(|e| {
        warn!(error = %e, "Atomic admission failed, refusing request");
        ApiError::Engine(e)
    })?;

    info!(allowed = verdict.allowed, window = %verdict.window, "Admission decision made");
    verdict_response(&caller, verdict)
}

#[instrument(skip(state, headers), fields(caller = field::Empty))]
async fn info(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let caller = state.caller(&headers)?;
    Span::current().record("caller", field::display(&caller));

    let snapshot = state.engine.info(&caller).await.map_err(|e| {
        warn!(error = %e, "Failed to read usage");
        ApiError::Engine(e)
    })?;

    Ok(Json(json!({
        "api_key": caller.masked(),
        "info": snapshot,
    }))
    .into_response())
}

async fn health(State(state): State<AppState>) -> Response {
    let backend = state.engine.store().backend_name();
    let mut body = json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "store": backend,
    });

    match state.engine.ping().await {
        Ok(()) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => {
            warn!(store = backend, error = %e, "Health check failed");
            body["status"] = json!("unhealthy");
            body["error"] = json!(e.to_string());
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing;
    use crate::ratelimit::{AdmissionEngine, Policy};
    use crate::store::{CounterKey, CounterStore, Expiry, Reservation, StoreError};
    use crate::http::AppState;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    /// A store that is never reachable.
    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment(&self, _key: &CounterKey, _expiry: Expiry) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn read(&self, _key: &CounterKey) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn increment_within(
            &self,
            _key: &CounterKey,
            _limit: u64,
            _expiry: Expiry,
        ) -> Result<Reservation, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn release(&self, _key: &CounterKey) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn backend_name(&self) -> &'static str {
            "down"
        }
    }

    fn down_state() -> AppState {
        let engine = AdmissionEngine::new(Arc::new(DownStore), Policy::default());
        AppState::new(Arc::new(engine), "x-api-key").unwrap()
    }

    fn request(method: &str, uri: &str, caller: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(caller) = caller {
            builder = builder.header("X-API-Key", caller);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_check_allows_with_headers() {
        let (state, _) = testing::state(Policy::new(2, 100, 1000, 10000));
        let app = router(state);

        let response = app
            .oneshot(request("POST", "/v1/admission/check", Some("k1")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "2");
        assert_eq!(response.headers()["x-ratelimit-window"], "minute");
        assert_eq!(response.headers()["x-ratelimit-reset"], "2024-01-01T12:35:00Z");

        let body = json_body(response).await;
        assert_eq!(body["allowed"], true);
        assert_eq!(body["window"], "minute");
    }

    #[tokio::test]
    async fn test_check_commit_then_deny() {
        let (state, _) = testing::state(Policy::new(2, 100, 1000, 10000));
        let app = router(state);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request("POST", "/v1/admission/check", Some("k1")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let response = app
                .clone()
                .oneshot(request("POST", "/v1/admission/commit", Some("k1")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }

        let response = app
            .oneshot(request("POST", "/v1/admission/check", Some("k1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(response.headers()["x-ratelimit-quotaused"], "2");

        let body = json_body(response).await;
        assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["window"], "minute");
        assert_eq!(body["limit"], 2);
        assert_eq!(body["reset_time"], "2024-01-01T12:35:00Z");
        assert_eq!(body["quota_limit"], 10000);
    }

    #[tokio::test]
    async fn test_monthly_quota_denial() {
        let (state, _) = testing::state(Policy::new(60, 1000, 10000, 0));
        let app = router(state);

        let response = app
            .oneshot(request("POST", "/v1/admission/check", Some("k1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-window"], "monthly");

        let body = json_body(response).await;
        assert_eq!(body["code"], "MONTHLY_QUOTA_EXCEEDED");
        assert_eq!(body["reset_time"], "2024-02-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_missing_caller_is_unauthorized() {
        let (state, _) = testing::state(Policy::default());
        let app = router(state);

        for (method, uri) in [
            ("POST", "/v1/admission/check"),
            ("POST", "/v1/admission/commit"),
            ("POST", "/v1/admission/admit"),
            ("GET", "/v1/rate-limit/info"),
        ] {
            let response = app.clone().oneshot(request(method, uri, None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{} {}", method, uri);
            let body = json_body(response).await;
            assert_eq!(body["code"], "MISSING_API_KEY");
        }
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let app = router(down_state());

        let response = app
            .clone()
            .oneshot(request("POST", "/v1/admission/check", Some("k1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["code"], "RATE_LIMIT_ERROR");

        let response = app
            .oneshot(request("POST", "/v1/admission/commit", Some("k1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["code"], "COMMIT_ERROR");
    }

    #[tokio::test]
    async fn test_admit_route() {
        let (state, _) = testing::state(Policy::new(1, 100, 1000, 10000));
        let app = router(state);

        let response = app
            .clone()
            .oneshot(request("POST", "/v1/admission/admit", Some("k1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(response.headers()["x-ratelimit-quotaused"], "1");

        let response = app
            .oneshot(request("POST", "/v1/admission/admit", Some("k1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_info_masks_caller() {
        let (state, _) = testing::state(Policy::new(2, 100, 1000, 10000));
        let app = router(state);

        app.clone()
            .oneshot(request("POST", "/v1/admission/commit", Some("sk_live_1234567890")))
            .await
            .unwrap();

        let response = app
            .oneshot(request("GET", "/v1/rate-limit/info", Some("sk_live_1234567890")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["api_key"], "sk_l...7890");
        assert_eq!(body["info"]["monthly_quota"]["used"], 1);
        assert_eq!(body["info"]["monthly_quota"]["remaining"], 9999);
        assert_eq!(body["info"]["rate_limits"]["minute"]["current"], 1);
        assert_eq!(body["info"]["rate_limits"]["minute"]["remaining"], 1);
        assert_eq!(body["info"]["rate_limits"]["minute"]["reset_time"], "2024-01-01T12:35:00Z");
        assert_eq!(body["info"]["rate_limits"]["hour"]["current"], 1);
        assert_eq!(body["info"]["rate_limits"]["day"]["limit"], 1000);
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = testing::state(Policy::default());
        let response = router(state)
            .oneshot(request("GET", "/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "turnstile");
        assert_eq!(body["store"], "memory");
    }

    #[tokio::test]
    async fn test_denials_are_counted_by_window() {
        let handle = crate::metrics::install().unwrap();
        let (state, _) = testing::state(Policy::new(60, 1000, 10000, 0));
        let app = router(state.with_metrics(handle));

        let response = app
            .clone()
            .oneshot(request("POST", "/v1/admission/check", Some("svc-quota-caller")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.oneshot(request("GET", "/metrics", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains(
            "gateway_rate_limit_exceeded_total{api_key=\"svc-...ller\",window=\"monthly\"} 1"
        ));
    }

    #[tokio::test]
    async fn test_metrics_route_absent_without_recorder() {
        let (state, _) = testing::state(Policy::default());
        let response = router(state)
            .oneshot(request("GET", "/metrics", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_reports_store_outage() {
        let response = router(down_state())
            .oneshot(request("GET", "/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["status"], "unhealthy");
    }
}
