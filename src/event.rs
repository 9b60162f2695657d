// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// Relay domain types: accepted messages and the provider-agnostic events
// published into their channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::transcode::Diagnostic;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One accepted user request awaiting a model reply.
///
/// Identity fields arrive pre-validated from the caller; the relay never
/// authenticates anything itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Opaque id, also the broker channel key.
    pub message_id: String,
    pub conversation_id: Uuid,
    pub user_id: String,
    /// Echoed in terminal events so clients can correlate logs.
    pub request_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Accept a new message with a freshly generated id.
    pub fn new(user_id: impl Into<String>, conversation_id: Uuid) -> Self {
        Self {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            conversation_id,
            user_id: user_id.into(),
            request_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// Lifecycle state carried by `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Queued,
    Working,
}

/// Machine-readable codes carried by `error` events.
pub mod codes {
    pub const UPSTREAM_UNAVAILABLE: &str = "UPSTREAM_UNAVAILABLE";
    pub const UPSTREAM_TIMEOUT: &str = "UPSTREAM_TIMEOUT";
    pub const UPSTREAM_STREAM_ERROR: &str = "UPSTREAM_STREAM_ERROR";
    pub const CANCELLED: &str = "CANCELLED";
    pub const STRUCTURAL_VIOLATION_LIMIT_EXCEEDED: &str = "STRUCTURAL_VIOLATION_LIMIT_EXCEEDED";
}

/// A single unit published into a channel.
///
/// The wire name of each variant is stable regardless of which upstream
/// dialect produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Status { state: StatusState },
    /// Plain-text dialect delta.
    ContentDelta { delta: String },
    SerpSummary { text: String },
    ThinkingStart,
    PhaseStart { id: u64, title: String },
    PhaseDelta { id: u64, text: String },
    ThinkingEnd,
    FinalDelta { text: String },
    SerpQueries { queries: Vec<String> },
    FinalEnd,
    /// Provider tool events are forwarded untouched.
    ToolStart { payload: serde_json::Value },
    ToolResult { payload: serde_json::Value },
    Completed {
        reply: String,
        request_id: String,
        diagnostics: Vec<Diagnostic>,
    },
    Error {
        error: String,
        code: String,
        request_id: String,
    },
    Heartbeat,
}

impl StreamEvent {
    /// SSE `event:` name.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Status { .. } => "status",
            StreamEvent::ContentDelta { .. } => "content_delta",
            StreamEvent::SerpSummary { .. } => "serp_summary",
            StreamEvent::ThinkingStart => "thinking_start",
            StreamEvent::PhaseStart { .. } => "phase_start",
            StreamEvent::PhaseDelta { .. } => "phase_delta",
            StreamEvent::ThinkingEnd => "thinking_end",
            StreamEvent::FinalDelta { .. } => "final_delta",
            StreamEvent::SerpQueries { .. } => "serp_queries",
            StreamEvent::FinalEnd => "final_end",
            StreamEvent::ToolStart { .. } => "tool_start",
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::Completed { .. } => "completed",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Heartbeat => "heartbeat",
        }
    }

    /// `completed` and `error` end a channel.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Completed { .. } | StreamEvent::Error { .. })
    }

    /// SSE `data:` payload. Every payload carries the message id.
    pub fn payload(&self, message_id: &str) -> serde_json::Value {
        match self {
            StreamEvent::Status { state } => {
                json!({ "state": state, "message_id": message_id })
            }
            StreamEvent::ContentDelta { delta } => {
                json!({ "message_id": message_id, "delta": delta })
            }
            StreamEvent::SerpSummary { text } => {
                json!({ "message_id": message_id, "text": text })
            }
            StreamEvent::PhaseStart { id, title } => {
                json!({ "message_id": message_id, "id": id, "title": title })
            }
            StreamEvent::PhaseDelta { id, text } => {
                json!({ "message_id": message_id, "id": id, "text": text })
            }
            StreamEvent::FinalDelta { text } => {
                json!({ "message_id": message_id, "text": text })
            }
            StreamEvent::SerpQueries { queries } => {
                json!({ "message_id": message_id, "queries": queries })
            }
            StreamEvent::ToolStart { payload } | StreamEvent::ToolResult { payload } => {
                json!({ "message_id": message_id, "payload": payload })
            }
            StreamEvent::Completed {
                reply,
                request_id,
                diagnostics,
            } => json!({
                "message_id": message_id,
                "reply": reply,
                "request_id": request_id,
                "diagnostics": diagnostics,
            }),
            StreamEvent::Error {
                error,
                code,
                request_id,
            } => json!({
                "message_id": message_id,
                "error": error,
                "code": code,
                "request_id": request_id,
            }),
            StreamEvent::ThinkingStart
            | StreamEvent::ThinkingEnd
            | StreamEvent::FinalEnd
            | StreamEvent::Heartbeat => json!({ "message_id": message_id }),
        }
    }

    /// Render as a complete `text/event-stream` frame.
    pub fn to_sse_frame(&self, message_id: &str) -> String {
        format!(
            "event: {}\ndata: {}\n\n",
            self.name(),
            self.payload(message_id)
        )
    }
}
