//! Order orchestration endpoints.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use common::InstanceId;
use domain::NewOrder;
use history_store::{HistoryRecord, HistoryStore};
use orchestrator::{
    InMemoryNotificationPublisher, InMemoryOrderRepository, InstanceStatus, OrchestrationRuntime,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::ApiError;

/// Runtime type used by the gateway.
pub type GatewayRuntime<H> =
    OrchestrationRuntime<H, InMemoryOrderRepository, InMemoryNotificationPublisher>;

/// Shared application state accessible from all handlers.
pub struct AppState<H>
where
    H: HistoryStore,
{
    pub runtime: GatewayRuntime<H>,
}

// -- Response types --

/// Links returned when an instance is started.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedResponse {
    pub id: String,
    pub status_query_get_uri: String,
    pub history_get_uri: String,
    pub cancel_post_uri: String,
}

impl StartedResponse {
    fn new(instance_id: InstanceId) -> Self {
        Self {
            id: instance_id.to_string(),
            status_query_get_uri: format!("/orders/status/{instance_id}"),
            history_get_uri: format!("/orders/status/{instance_id}/history"),
            cancel_post_uri: format!("/orders/{instance_id}/cancel"),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub instance_id: String,
    pub order_id: Option<String>,
    pub state: String,
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub history_length: usize,
}

impl From<InstanceStatus> for StatusResponse {
    fn from(status: InstanceStatus) -> Self {
        Self {
            instance_id: status.instance_id.to_string(),
            order_id: status.order_id.map(|id| id.to_string()),
            state: status.state.to_string(),
            output: status.output,
            created_at: status.created_at,
            last_updated_at: status.last_updated_at,
            history_length: status.history_length,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub instance_id: String,
    pub events: Vec<HistoryRecord>,
}

// -- Handlers --

/// POST /orders/start: create an instance for the order in the body.
#[tracing::instrument(skip(state, body))]
pub async fn start<H: HistoryStore + Clone + 'static>(
    State(state): State<Arc<AppState<H>>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let new_order = parse_new_order(&body)?;
    let instance_id = state.runtime.start(new_order).await?;
    tracing::info!(%instance_id, "started order processing orchestration");

    let response = StartedResponse::new(instance_id);
    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, response.status_query_get_uri.clone())],
        Json(response),
    )
        .into_response())
}

/// GET /orders/status/:id: current status of an instance.
#[tracing::instrument(skip(state))]
pub async fn status<H: HistoryStore + Clone + 'static>(
    State(state): State<Arc<AppState<H>>>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let instance_id = parse_instance_id(&id)?;
    let status = state
        .runtime
        .tracker()
        .status(instance_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Instance {id} not found")))?;

    Ok(Json(status.into()))
}

/// GET /orders/status/:id/history: the recorded history of an instance.
#[tracing::instrument(skip(state))]
pub async fn history<H: HistoryStore + Clone + 'static>(
    State(state): State<Arc<AppState<H>>>,
    Path(id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let instance_id = parse_instance_id(&id)?;
    let events = state
        .runtime
        .tracker()
        .history(instance_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Instance {id} not found")))?;

    Ok(Json(HistoryResponse {
        instance_id: instance_id.to_string(),
        events,
    }))
}

/// POST /orders/:id/cancel: cancel a running instance.
#[tracing::instrument(skip(state))]
pub async fn cancel<H: HistoryStore + Clone + 'static>(
    State(state): State<Arc<AppState<H>>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<StatusResponse>), ApiError> {
    let instance_id = parse_instance_id(&id)?;

    if !state.runtime.cancel(instance_id).await? {
        return Err(ApiError::Conflict(format!(
            "Instance {id} has already finished"
        )));
    }

    let status = state
        .runtime
        .tracker()
        .status(instance_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Instance {id} not found")))?;

    Ok((StatusCode::ACCEPTED, Json(status.into())))
}

// -- Helpers --

fn parse_new_order(body: &[u8]) -> Result<NewOrder, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::BadRequest(
            "Request body cannot be empty.".to_string(),
        ));
    }

    let new_order: Option<NewOrder> = serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(error = %e, "failed to parse order from request body");
        ApiError::BadRequest("Invalid JSON format.".to_string())
    })?;

    new_order.ok_or_else(|| ApiError::BadRequest("Invalid order data.".to_string()))
}

fn parse_instance_id(id: &str) -> Result<InstanceId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid instance id: {e}")))
}
