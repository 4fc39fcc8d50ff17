//! The HTTP surface: accepts feature requests, assigns an [`ExecutionId`],
//! publishes the first event of the execution, and mounts the DLQ operator
//! API alongside a health check.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use execflow_events::{Event, EventMetadata, FeatureRequest, ProcessingHints};
use execflow_hlc::HlcClock;
use execflow_ids::{EventId, ExecutionId};
use execflow_queue::QueuePublisher;
use serde::Serialize;
use serde_json::json;

pub mod settings;

/// State shared by every gateway handler.
#[derive(Clone)]
pub struct GatewayState {
    /// Where the first event of an accepted request is published.
    pub publisher: Arc<dyn QueuePublisher>,
    /// Queue the first event is published to.
    pub requests_queue: String,
    /// Hosts `repository_url` is allowed to point at; empty means unrestricted.
    pub allowed_hosts: Vec<String>,
    /// Clock used to stamp the first event's HLC timestamp.
    pub clock: Arc<HlcClock>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    execution_id: ExecutionId,
    event_id: EventId,
}

async fn submit_feature_request(
    State(state): State<GatewayState>,
    Json(mut request): Json<FeatureRequest>,
) -> Response {
    if let Err(err) = request.validate(&state.allowed_hosts) {
        return error_response(StatusCode::BAD_REQUEST, err.to_string());
    }

    let execution_id = ExecutionId::new();
    let correlation_id = EventId::new();
    request.execution_id = Some(execution_id);
    request.requested_at = Some(chrono::Utc::now());

    let payload = match serde_json::to_vec(&request) {
        Ok(payload) => payload,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };

    let event = match Event::new(
        execution_id,
        correlation_id,
        "feature.execution.requested",
        1,
        state.clock.now(),
        payload,
        EventMetadata {
            producer_id: "execflow-gateway".to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            tenant: None,
            environment: None,
            tags: HashMap::new(),
            trace_context: None,
        },
        ProcessingHints::default(),
    ) {
        Ok(event) => event,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };

    if let Err(err) = state.publisher.publish(&state.requests_queue, &event).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }

    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse { execution_id, event_id: event.event_id }),
    )
        .into_response()
}

async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

/// Build the full gateway router: the submission endpoint, `/health`, and
/// the DLQ operator surface under `/api/v1`.
pub fn build_router(state: GatewayState, dlq: execflow_dlq::http::DlqState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/feature-requests", post(submit_feature_request))
        .with_state(state)
        .nest("/api/v1", execflow_dlq::http::dlq_router(dlq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use execflow_dlq::MemoryDlqStore;
    use execflow_queue::InMemoryBroker;
    use tower::ServiceExt;

    fn test_state(broker: Arc<InMemoryBroker>) -> GatewayState {
        GatewayState {
            publisher: broker,
            requests_queue: "feature.requests".to_string(),
            allowed_hosts: vec!["github.com".to_string()],
            clock: Arc::new(HlcClock::new()),
        }
    }

    fn sample_request_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "repository_url": "https://github.com/example/repo",
            "branch": "main",
            "specification": {
                "title": "Add retry metrics",
                "description": "Expose retry counts per tier.",
            },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let broker = Arc::new(InMemoryBroker::new());
        let dlq: execflow_dlq::http::DlqState = Arc::new(MemoryDlqStore::new(broker.clone(), "feature.events"));
        let router = build_router(test_state(broker), dlq);
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn valid_request_is_accepted_and_published() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut incoming = broker.subscribe("feature.requests");
        let dlq: execflow_dlq::http::DlqState = Arc::new(MemoryDlqStore::new(broker.clone(), "feature.events"));
        let router = build_router(test_state(broker), dlq);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/feature-requests")
                    .header("content-type", "application/json")
                    .body(Body::from(sample_request_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let event = incoming.recv().await.unwrap();
        assert_eq!(event.event_type, "feature.execution.requested");
        assert_eq!(event.sequence_number, 1);
    }

    #[tokio::test]
    async fn disallowed_host_is_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let dlq: execflow_dlq::http::DlqState = Arc::new(MemoryDlqStore::new(broker.clone(), "feature.events"));
        let router = build_router(test_state(broker), dlq);

        let body = serde_json::to_vec(&json!({
            "repository_url": "https://evil.example.com/repo",
            "branch": "main",
            "specification": {
                "title": "x",
                "description": "y",
            },
        }))
        .unwrap();

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/feature-requests")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
