//! Ops HTTP surface: health, metrics, and flow inspection.

use crate::metrics::metrics_handler;
use crate::telemetry::Telemetry;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::sync::Arc;
use crate::flowtop::FlowEntry;
use trellis_registry::RegistryStore;

/// Shared state for ops handlers.
#[derive(Clone)]
pub struct OpsState {
    pub store: Arc<dyn RegistryStore>,
    pub telemetry: Arc<Telemetry>,
    pub ops_token: String,
}

/// GET /healthz - store connectivity check.
async fn healthz(State(state): State<OpsState>) -> (StatusCode, &'static str) {
    match state.store.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(err) => {
            tracing::error!(error = %err, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
    }
}

/// GET /flows - the current top flows by traffic. Gated by the ops
/// token.
async fn flows(State(state): State<OpsState>, headers: HeaderMap) -> Response {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if presented != Some(state.ops_token.as_str()) {
        return (StatusCode::UNAUTHORIZED, "bad authorization").into_response();
    }

    let snapshot: Vec<FlowEntry> = state.telemetry.flow_top().snapshot();
    Json(snapshot).into_response()
}

/// Build the ops router.
pub fn ops_router(state: OpsState, metrics_enabled: bool) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/flows", get(flows))
        .with_state(state);

    if metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_registry::MemoryRegistry;

    fn state() -> OpsState {
        OpsState {
            store: Arc::new(MemoryRegistry::new()),
            telemetry: Arc::new(Telemetry::new(8)),
            ops_token: "ops-secret".to_string(),
        }
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (status, body) = healthz(State(state())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn flows_requires_ops_token() {
        let state = state();
        state.telemetry.flow_top().add("flow-1", 3, 100);

        let denied = flows(State(state.clone()), HeaderMap::new()).await;
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "ops-secret".parse().unwrap());
        let allowed = flows(State(state), headers).await;
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[test]
    fn router_builds_with_and_without_metrics() {
        let _with = ops_router(state(), true);
        let _without = ops_router(state(), false);
    }
}
