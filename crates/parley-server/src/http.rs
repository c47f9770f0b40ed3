//! REST handlers alongside the WebSocket endpoint.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use parley_core::{ChatEvent, MessageId, StoredMessage, UserId};
use parley_telemetry::{names, MetricValue};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::error::ApiError;
use crate::identity::VerifiedIdentity;
use crate::server::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "connections": state.hub.connection_count(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub receiver_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// The caller's conversation with `receiver_id`, or broadcast history when
/// no receiver is given. Newest first.
pub async fn message_history(
    VerifiedIdentity(identity): VerifiedIdentity,
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    let config = &state.config;
    let limit = params
        .limit
        .unwrap_or(config.history_default_limit)
        .clamp(1, config.history_max_limit);
    let counterpart = params
        .receiver_id
        .filter(|r| !r.trim().is_empty())
        .map(UserId::from_raw);

    let messages = state
        .store
        .message_history(
            &identity.user_id,
            counterpart.as_ref(),
            limit,
            params.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(messages))
}

#[derive(Debug, Serialize)]
pub struct UsersResponse {
    pub users: Vec<UserId>,
}

/// Users the store considers online.
pub async fn online_users(State(state): State<AppState>) -> Result<Json<UsersResponse>, ApiError> {
    let users = state.store.list_online_users().await?;
    Ok(Json(UsersResponse { users }))
}

/// Users connected to this process right now.
pub async fn live_users(State(state): State<AppState>) -> Json<UsersResponse> {
    Json(UsersResponse {
        users: state.hub.list_online(),
    })
}

#[derive(Debug, Deserialize)]
pub struct InjectMessage {
    pub content: String,
    #[serde(default)]
    pub receiver_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InjectResponse {
    pub success: bool,
    pub id: MessageId,
}

/// Persist a message sent over HTTP and route it as if it arrived live.
pub async fn inject_message(
    VerifiedIdentity(identity): VerifiedIdentity,
    State(state): State<AppState>,
    Json(body): Json<InjectMessage>,
) -> Result<(StatusCode, Json<InjectResponse>), ApiError> {
    if body.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".into()));
    }
    let receiver = body
        .receiver_id
        .filter(|r| !r.trim().is_empty())
        .map(UserId::from_raw);

    let event = ChatEvent::message(&identity, body.content, receiver);
    let id = state
        .store
        .save_message(
            &event.user_id,
            event.receiver_id.as_ref(),
            event.content.as_deref().unwrap_or_default(),
            event.timestamp,
        )
        .await?;
    state.hub.route(event.with_id(id.clone())).await?;

    info!(user_id = %identity.user_id, message_id = %id, "message injected over http");
    if let Some(m) = &state.metrics {
        m.counter_inc(names::HTTP_MESSAGES_INJECTED, &[], 1);
    }
    Ok((StatusCode::CREATED, Json(InjectResponse { success: true, id })))
}

pub async fn metrics(State(state): State<AppState>) -> Json<Vec<MetricValue>> {
    Json(
        state
            .metrics
            .as_ref()
            .map(|m| m.current())
            .unwrap_or_default(),
    )
}
