//! The operator-facing REST surface over a [`DlqStore`], mounted under
//! `/api/v1/dlq` by the gateway binary.
//!
//! Kept deliberately thin: every handler parses its input, calls straight
//! through to the store, and maps the result (or [`DlqError`]) onto the
//! status codes this platform's operators depend on.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use execflow_ids::ExecutionId;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{DiscardRequest, DlqError, DlqFilter, FailureClassification, RequeueRequest};

/// Shared state every handler closes over: just the store, type-erased so
/// the gateway can wire in either backend without this module knowing which.
pub type DlqState = Arc<dyn crate::DlqStore>;

/// Build the `/dlq/*` router (mount it under `/api/v1` in the gateway app).
pub fn dlq_router(state: DlqState) -> Router {
    Router::new()
        .route("/dlq", get(list_entries))
        .route("/dlq/stats", get(stats))
        .route("/dlq/cleanup", post(cleanup))
        .route("/dlq/:id", get(get_entry).delete(discard_entry))
        .route("/dlq/:id/requeue", post(requeue_entry))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

impl IntoResponse for DlqError {
    fn into_response(self) -> Response {
        let status = match &self {
            DlqError::NotFound(_) => StatusCode::NOT_FOUND,
            DlqError::AlreadyResolved(_) => StatusCode::CONFLICT,
            DlqError::InvalidResolution(_) => StatusCode::BAD_REQUEST,
            DlqError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, self.to_string())
    }
}

//─────────────────────────────
//  GET /dlq
//─────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    limit: Option<String>,
    offset: Option<String>,
    execution_id: Option<String>,
    event_type: Option<String>,
    failure_class: Option<String>,
    manual_review_only: Option<String>,
    include_resolved: Option<String>,
    entered_after: Option<String>,
    entered_before: Option<String>,
}

fn parse_bool(raw: Option<&String>) -> bool {
    matches!(raw.map(String::as_str), Some("true") | Some("1"))
}

fn parse_classification(raw: &str) -> Result<FailureClassification, Response> {
    match raw {
        "transient" => Ok(FailureClassification::Transient),
        "permanent" => Ok(FailureClassification::Permanent),
        "validation" => Ok(FailureClassification::Validation),
        "resource" => Ok(FailureClassification::Resource),
        "unknown" => Ok(FailureClassification::Unknown),
        other => Err(error_response(
            StatusCode::BAD_REQUEST,
            format!("unrecognized failure_class: {other:?}"),
        )),
    }
}

fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>, Response> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("{field} must be RFC3339")))
}

fn build_filter(q: ListQuery) -> Result<DlqFilter, Response> {
    let limit = match q.limit {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| error_response(StatusCode::BAD_REQUEST, "limit must be a non-negative integer"))?,
        None => 0,
    };
    let offset = match q.offset {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| error_response(StatusCode::BAD_REQUEST, "offset must be a non-negative integer"))?,
        None => 0,
    };
    let execution_id = match q.execution_id {
        Some(raw) => Some(
            ExecutionId::parse(&raw)
                .map_err(|_| error_response(StatusCode::BAD_REQUEST, "execution_id is malformed"))?,
        ),
        None => None,
    };
    let failure_classification = match q.failure_class.as_deref() {
        Some(raw) => Some(parse_classification(raw)?),
        None => None,
    };
    let entered_after = match q.entered_after.as_deref() {
        Some(raw) => Some(parse_timestamp(raw, "entered_after")?),
        None => None,
    };
    let entered_before = match q.entered_before.as_deref() {
        Some(raw) => Some(parse_timestamp(raw, "entered_before")?),
        None => None,
    };

    Ok(DlqFilter {
        execution_id,
        event_type: q.event_type,
        failure_classification,
        manual_review_only: parse_bool(q.manual_review_only.as_ref()),
        include_resolved: parse_bool(q.include_resolved.as_ref()),
        entered_after,
        entered_before,
        limit,
        offset,
    })
}

async fn list_entries(State(state): State<DlqState>, Query(raw): Query<HashMap<String, String>>) -> Response {
    let q = ListQuery {
        limit: raw.get("limit").cloned(),
        offset: raw.get("offset").cloned(),
        execution_id: raw.get("execution_id").cloned(),
        event_type: raw.get("event_type").cloned(),
        failure_class: raw.get("failure_class").cloned(),
        manual_review_only: raw.get("manual_review_only").cloned(),
        include_resolved: raw.get("include_resolved").cloned(),
        entered_after: raw.get("entered_after").cloned(),
        entered_before: raw.get("entered_before").cloned(),
    };
    let filter = match build_filter(q) {
        Ok(filter) => filter,
        Err(response) => return response,
    };
    match state.list_entries(&filter).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => err.into_response(),
    }
}

//─────────────────────────────
//  GET /dlq/stats
//─────────────────────────────

async fn stats(State(state): State<DlqState>) -> Response {
    match state.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => err.into_response(),
    }
}

//─────────────────────────────
//  POST /dlq/cleanup
//─────────────────────────────

async fn cleanup(State(state): State<DlqState>) -> Response {
    match state.cleanup_expired().await {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(err) => err.into_response(),
    }
}

//─────────────────────────────
//  GET /dlq/{id}
//─────────────────────────────

async fn get_entry(State(state): State<DlqState>, Path(id): Path<String>) -> Response {
    match state.get_entry(&id).await {
        Ok(entry) => Json(entry).into_response(),
        Err(err) => err.into_response(),
    }
}

//─────────────────────────────
//  POST /dlq/{id}/requeue
//─────────────────────────────

async fn requeue_entry(
    State(state): State<DlqState>,
    Path(id): Path<String>,
    Json(req): Json<RequeueRequest>,
) -> Response {
    match state.requeue_entry(&id, req).await {
        Ok(_) => Json(json!({ "status": "requeued" })).into_response(),
        Err(err) => err.into_response(),
    }
}

//─────────────────────────────
//  DELETE /dlq/{id}
//─────────────────────────────

async fn discard_entry(
    State(state): State<DlqState>,
    Path(id): Path<String>,
    Json(req): Json<DiscardRequest>,
) -> Response {
    match state.discard_entry(&id, req).await {
        Ok(()) => Json(json!({ "status": "discarded" })).into_response(),
        Err(err) => err.into_response(),
    }
}
