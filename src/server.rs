// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// HTTP surface: a thin axum adapter over the broker, guard and producer.
//
// Responsibilities:
// - Accept messages and start their producer and heartbeat ticker
// - Admit subscribers through the concurrency guard and stream SSE
// - Forced cancellation of in-flight messages
// - Heartbeat endpoint
//
// Identity arrives pre-validated in the `x-user-id` header.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{Broker, BrokerError};
use crate::config::Config;
use crate::event::Message;
use crate::guard::{CapacityRejection, ConcurrencyGuard};
use crate::heartbeat::spawn_ticker;
use crate::relay::{spawn_producer, ProducerSettings};
use crate::transcode::Dialect;
use crate::upstream::{RelayRequest, UpstreamSource};

/// Header carrying the caller's pre-validated user id.
pub const USER_HEADER: &str = "x-user-id";

/// The address the relay binds to. Always localhost, never 0.0.0.0.
pub const BIND_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 9810);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("missing x-user-id header")]
    MissingIdentity,

    #[error("unknown message {0}")]
    UnknownMessage(String),

    #[error("message belongs to another user")]
    Forbidden,

    #[error(transparent)]
    Capacity(#[from] CapacityRejection),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            RelayError::MissingIdentity => (StatusCode::UNAUTHORIZED, "MISSING_IDENTITY"),
            RelayError::UnknownMessage(_) | RelayError::Broker(BrokerError::UnknownChannel(_)) => {
                (StatusCode::NOT_FOUND, "UNKNOWN_MESSAGE")
            }
            RelayError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            RelayError::Broker(BrokerError::AlreadyExists(_)) => {
                (StatusCode::CONFLICT, "MESSAGE_EXISTS")
            }
            RelayError::Capacity(rejection) => {
                let body = Json(json!({
                    "error": self.to_string(),
                    "code": rejection.code(),
                    "retry_after_secs": rejection.retry_after_secs,
                }));
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                if let Ok(value) = HeaderValue::from_str(&rejection.retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                return response;
            }
        };
        let body = Json(json!({ "error": self.to_string(), "code": code }));
        (status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// An accepted message and the token that cancels its producer.
#[derive(Clone)]
struct Tracked {
    message: Message,
    cancel: CancellationToken,
}

/// Shared state injected into axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub broker: Broker,
    pub guard: ConcurrencyGuard,
    pub upstream: Arc<dyn UpstreamSource>,
    messages: Arc<DashMap<String, Tracked>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, upstream: Arc<dyn UpstreamSource>) -> Self {
        let runtime = &config.runtime;
        let broker = Broker::new(runtime.broker.retire_grace);
        let guard = ConcurrencyGuard::new(
            runtime.concurrency.max_per_conversation,
            runtime.concurrency.retry_after_secs,
        );
        Self {
            config,
            broker,
            guard,
            upstream,
            messages: Arc::new(DashMap::new()),
        }
    }

    fn tracked(&self, message_id: &str, user_id: &str) -> Result<Tracked, RelayError> {
        let tracked = self
            .messages
            .get(message_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RelayError::UnknownMessage(message_id.to_string()))?;
        if !self.broker.contains(message_id) {
            self.messages.remove(message_id);
            return Err(RelayError::UnknownMessage(message_id.to_string()));
        }
        if tracked.message.user_id != user_id {
            return Err(RelayError::Forbidden);
        }
        Ok(tracked)
    }
}

/// Drop the registry entry once the channel has finished and its grace
/// period has passed. Earlier retirement is caught lazily by `tracked`.
fn forget_after_retirement(state: &AppState, message_id: &str) -> Result<(), RelayError> {
    let finished = state.broker.finished(message_id)?;
    let messages = Arc::clone(&state.messages);
    let grace = state.config.runtime.broker.retire_grace;
    let message_id = message_id.to_string();
    tokio::spawn(async move {
        finished.cancelled().await;
        tokio::time::sleep(grace).await;
        messages.remove(&message_id);
    });
    Ok(())
}

fn user_id(headers: &HeaderMap) -> Result<String, RelayError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(RelayError::MissingIdentity)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Heartbeat endpoint: GET /v1/heartbeat -> 200 OK
pub async fn heartbeat() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub prompt: String,
    #[serde(default)]
    pub dialect: Option<Dialect>,
}

/// POST /messages -> 202 {"message_id", "request_id"}
pub async fn create_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewMessage>,
) -> Result<impl IntoResponse, RelayError> {
    let user_id = user_id(&headers)?;
    // Capacity is checked before the channel exists; the lease itself is
    // taken by the subscriber.
    drop(state.guard.admit(&user_id, body.conversation_id)?);
    let message = Message::new(user_id, body.conversation_id);
    let publisher = state.broker.create_channel(&message)?;
    let cancel = CancellationToken::new();

    let runtime = &state.config.runtime;
    let request = RelayRequest {
        message_id: message.message_id.clone(),
        conversation_id: message.conversation_id,
        user_id: message.user_id.clone(),
        prompt: body.prompt,
        dialect: body.dialect.unwrap_or(runtime.upstream.dialect),
    };
    tracing::info!(
        message_id = %message.message_id,
        request_id = %message.request_id,
        user_id = %message.user_id,
        conversation_id = %message.conversation_id,
        dialect = ?request.dialect,
        "message accepted"
    );

    state.messages.insert(
        message.message_id.clone(),
        Tracked {
            message: message.clone(),
            cancel: cancel.clone(),
        },
    );
    forget_after_retirement(&state, &message.message_id)?;
    spawn_ticker(
        state.broker.clone(),
        message.message_id.clone(),
        runtime.heartbeat.interval,
    );
    let settings = ProducerSettings {
        protocol: state.config.protocol.clone(),
        idle_timeout: runtime.upstream.idle_timeout,
    };
    spawn_producer(publisher, Arc::clone(&state.upstream), request, settings, cancel);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message_id": message.message_id,
            "request_id": message.request_id,
        })),
    ))
}

/// GET /messages/:id/events -> SSE stream of the channel.
///
/// The concurrency lease lives inside the response stream, so it is
/// released on completion and on client disconnect alike.
pub async fn stream_events(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, RelayError> {
    let user_id = user_id(&headers)?;
    let tracked = state.tracked(&message_id, &user_id)?;
    let lease = state
        .guard
        .admit(&user_id, tracked.message.conversation_id)?;
    let subscription = state.broker.subscribe(&message_id)?;
    tracing::debug!(message_id = %message_id, user_id = %user_id, "subscriber attached");

    let events = subscription.map(move |event| {
        let _held = &lease;
        Ok::<_, Infallible>(
            Event::default()
                .event(event.name())
                .data(event.payload(&message_id).to_string()),
        )
    });
    Ok(Sse::new(events))
}

/// DELETE /messages/:id -> 204 after forced cancellation.
pub async fn cancel_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, RelayError> {
    let user_id = user_id(&headers)?;
    let tracked = state.tracked(&message_id, &user_id)?;
    tracked.cancel.cancel();
    state.broker.close(&message_id)?;
    state.messages.remove(&message_id);
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Router construction
// ---------------------------------------------------------------------------

/// Build the axum router. The upstream source is injected; no hard-coded
/// clients.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/heartbeat", get(heartbeat))
        .route("/messages", post(create_message))
        .route("/messages/:id", delete(cancel_message))
        .route("/messages/:id/events", get(stream_events))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
