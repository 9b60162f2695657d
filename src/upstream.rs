// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// Upstream source: where raw model output comes from.
//
// The relay never builds provider-specific requests itself. It hands a
// prompt to an `UpstreamSource` and receives a stream of raw byte chunks in
// whatever dialect the provider adapter speaks.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use uuid::Uuid;

use crate::transcode::Dialect;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// What the producer asks the upstream for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayRequest {
    pub message_id: String,
    pub conversation_id: Uuid,
    pub user_id: String,
    pub prompt: String,
    pub dialect: Dialect,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("upstream returned HTTP {0}")]
    Status(u16),

    #[error("upstream timed out: {0}")]
    Timeout(String),

    #[error("upstream stream broke: {0}")]
    Body(String),

    #[error("no upstream configured")]
    NotConfigured,
}

// ---------------------------------------------------------------------------
// Trait: UpstreamSource (dependency injection point)
// ---------------------------------------------------------------------------

/// Opens the raw output stream for one message.
///
/// Implementations must be Send + Sync so a single instance can be shared
/// by every producer task via `Arc`.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn open(&self, request: &RelayRequest) -> Result<ByteStream, UpstreamError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// POSTs the request as JSON and streams the response body.
pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
    connect_timeout: Duration,
}

impl HttpUpstream {
    pub fn new(client: reqwest::Client, url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl UpstreamSource for HttpUpstream {
    async fn open(&self, request: &RelayRequest) -> Result<ByteStream, UpstreamError> {
        let send = self.client.post(&self.url).json(request).send();
        let response = tokio::time::timeout(self.connect_timeout, send)
            .await
            .map_err(|_| UpstreamError::Timeout(format!("no response from {}", self.url)))?
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout(e.to_string())
                } else {
                    UpstreamError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                message_id = %request.message_id,
                status = status.as_u16(),
                "upstream rejected request"
            );
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let body = response
            .bytes_stream()
            .map_err(|e| UpstreamError::Body(e.to_string()));
        Ok(Box::pin(body))
    }
}

/// Stand-in used when no upstream URL is configured: every open fails.
pub struct UnconfiguredUpstream;

#[async_trait]
impl UpstreamSource for UnconfiguredUpstream {
    async fn open(&self, _request: &RelayRequest) -> Result<ByteStream, UpstreamError> {
        Err(UpstreamError::NotConfigured)
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// Replays a fixed list of chunks. Used by unit tests and benchmarks.
#[derive(Debug, Clone, Default)]
pub struct ScriptedUpstream {
    chunks: Vec<Result<Bytes, UpstreamError>>,
    delay: Option<Duration>,
}

impl ScriptedUpstream {
    pub fn new<I, T>(chunks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(|c| Ok(c.into())).collect(),
            delay: None,
        }
    }

    /// Append a transport failure after the scripted chunks.
    pub fn then_fail(mut self, error: UpstreamError) -> Self {
        self.chunks.push(Err(error));
        self
    }

    /// Sleep before every chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl UpstreamSource for ScriptedUpstream {
    async fn open(&self, _request: &RelayRequest) -> Result<ByteStream, UpstreamError> {
        let delay = self.delay;
        let chunks = futures_util::stream::iter(self.chunks.clone()).then(move |chunk| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            chunk
        });
        Ok(Box::pin(chunks))
    }
}
