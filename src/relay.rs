// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// Producer pipeline: upstream bytes -> UTF-8 text -> transcoder -> broker.
//
// One producer task per in-flight message. It runs independently of the
// subscribers: a client disconnect never stops it. Every run ends with
// exactly one `completed` or `error` in the channel.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Publisher;
use crate::config::ProtocolConfig;
use crate::event::{codes, StatusState, StreamEvent};
use crate::transcode::{new_transcoder, TranscodeError, Transcoder};
use crate::upstream::{RelayRequest, UpstreamError, UpstreamSource};

/// How a producer run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed { code: &'static str },
    /// The channel was already terminal (forced close) before the producer
    /// could finish.
    Abandoned,
}

/// Producer knobs taken from config.
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub protocol: ProtocolConfig,
    pub idle_timeout: Duration,
}

/// Spawn the producer for one message.
pub fn spawn_producer(
    publisher: Publisher,
    upstream: Arc<dyn UpstreamSource>,
    request: RelayRequest,
    settings: ProducerSettings,
    cancel: CancellationToken,
) -> JoinHandle<Outcome> {
    tokio::spawn(async move {
        let outcome = produce(&publisher, upstream.as_ref(), &request, &settings, &cancel).await;
        match &outcome {
            Outcome::Completed => {
                tracing::info!(message_id = %request.message_id, "message completed")
            }
            Outcome::Failed { code } => {
                tracing::warn!(message_id = %request.message_id, code, "message failed")
            }
            Outcome::Abandoned => {
                tracing::info!(message_id = %request.message_id, "message abandoned")
            }
        }
        outcome
    })
}

/// Failure carried to the single terminal `error` event.
struct Failure {
    code: &'static str,
    error: String,
}

impl Failure {
    fn new(code: &'static str, error: impl Into<String>) -> Self {
        Self {
            code,
            error: error.into(),
        }
    }

    fn cancelled() -> Self {
        Self::new(codes::CANCELLED, "message cancelled")
    }
}

impl From<TranscodeError> for Failure {
    fn from(e: TranscodeError) -> Self {
        Self::new(codes::STRUCTURAL_VIOLATION_LIMIT_EXCEEDED, e.to_string())
    }
}

impl From<UpstreamError> for Failure {
    fn from(e: UpstreamError) -> Self {
        let code = match e {
            UpstreamError::Timeout(_) => codes::UPSTREAM_TIMEOUT,
            UpstreamError::Body(_) => codes::UPSTREAM_STREAM_ERROR,
            UpstreamError::Unreachable(_) | UpstreamError::Status(_) | UpstreamError::NotConfigured => {
                codes::UPSTREAM_UNAVAILABLE
            }
        };
        Self::new(code, e.to_string())
    }
}

async fn produce(
    publisher: &Publisher,
    upstream: &dyn UpstreamSource,
    request: &RelayRequest,
    settings: &ProducerSettings,
    cancel: &CancellationToken,
) -> Outcome {
    publisher.publish(StreamEvent::Status {
        state: StatusState::Working,
    });

    let mut transcoder = new_transcoder(request.dialect, &settings.protocol);
    let mut reply = String::new();
    let result = pump(
        publisher,
        upstream,
        request,
        settings,
        cancel,
        transcoder.as_mut(),
        &mut reply,
    )
    .await;

    if publisher.is_terminal() {
        return Outcome::Abandoned;
    }

    let request_id = publisher.request_id().to_string();
    let (terminal, outcome) = match result {
        Ok(()) => (
            StreamEvent::Completed {
                reply,
                request_id,
                diagnostics: transcoder.diagnostics(),
            },
            Outcome::Completed,
        ),
        Err(failure) => (
            StreamEvent::Error {
                error: failure.error,
                code: failure.code.into(),
                request_id,
            },
            Outcome::Failed { code: failure.code },
        ),
    };
    if publisher.publish(terminal) {
        outcome
    } else {
        Outcome::Abandoned
    }
}

async fn pump(
    publisher: &Publisher,
    upstream: &dyn UpstreamSource,
    request: &RelayRequest,
    settings: &ProducerSettings,
    cancel: &CancellationToken,
    transcoder: &mut dyn Transcoder,
    reply: &mut String,
) -> Result<(), Failure> {
    let mut body = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Failure::cancelled()),
        opened = upstream.open(request) => opened?,
    };

    let mut decoder = Utf8Decoder::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Failure::cancelled()),
            next = tokio::time::timeout(settings.idle_timeout, body.next()) => next,
        };
        let chunk = match next {
            Err(_) => {
                return Err(Failure::new(
                    codes::UPSTREAM_TIMEOUT,
                    format!("no upstream data for {:?}", settings.idle_timeout),
                ))
            }
            Ok(None) => break,
            Ok(Some(chunk)) => chunk?,
        };

        let text = decoder.push(&chunk);
        let mut events = Vec::new();
        let pushed = transcoder.push_into(&text, &mut events);
        forward(publisher, events, reply);
        pushed?;
        if publisher.is_terminal() {
            return Ok(());
        }
    }

    let rest = decoder.finish();
    let mut events = Vec::new();
    let finished = transcoder
        .push_into(&rest, &mut events)
        .and_then(|()| transcoder.finish_into(&mut events));
    forward(publisher, events, reply);
    finished?;
    Ok(())
}

/// Publish what the transcoder accepted. Runs before a fatal transcode
/// error is turned into the terminal event.
fn forward(publisher: &Publisher, events: Vec<StreamEvent>, reply: &mut String) {
    for event in events {
        match &event {
            StreamEvent::FinalDelta { text } => reply.push_str(text),
            StreamEvent::ContentDelta { delta } => reply.push_str(delta),
            _ => {}
        }
        publisher.publish(event);
    }
}

// ---------------------------------------------------------------------------
// UTF-8 decoding across chunk boundaries
// ---------------------------------------------------------------------------

/// Decodes a byte stream whose chunks may split a multi-byte code point.
/// Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(
                        std::str::from_utf8(&self.pending[start..start + valid]).unwrap_or_default(),
                    );
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start += valid + bad;
                        }
                        // Truncated code point: wait for the next chunk
                        None => {
                            start += valid;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        out
    }

    /// Flush a dangling partial code point at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::protocol_profile;
    use crate::event::Message;
    use crate::transcode::Dialect;
    use crate::upstream::ScriptedUpstream;
    use uuid::Uuid;

    struct Harness {
        broker: Broker,
        message: Message,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                broker: Broker::new(Duration::from_secs(30)),
                message: Message::new("u1", Uuid::new_v4()),
            }
        }

        fn run(
            &self,
            upstream: ScriptedUpstream,
            dialect: Dialect,
            cancel: CancellationToken,
        ) -> JoinHandle<Outcome> {
            let publisher = self.broker.create_channel(&self.message).unwrap();
            let request = RelayRequest {
                message_id: self.message.message_id.clone(),
                conversation_id: self.message.conversation_id,
                user_id: self.message.user_id.clone(),
                prompt: "hi".into(),
                dialect,
            };
            let settings = ProducerSettings {
                protocol: protocol_profile("7.0").unwrap(),
                idle_timeout: Duration::from_secs(5),
            };
            spawn_producer(publisher, Arc::new(upstream), request, settings, cancel)
        }

        fn backlog(&self) -> Vec<StreamEvent> {
            self.broker.backlog(&self.message.message_id).unwrap()
        }
    }

    fn terminal_count(events: &[StreamEvent]) -> usize {
        events.iter().filter(|e| e.is_terminal()).count()
    }

    #[tokio::test]
    async fn thinkingml_message_completes_with_reply() {
        let h = Harness::new();
        let upstream = ScriptedUpstream::new([
            "<thinking><phase id=\"1\"><title>A</title>x</phase></thinking><fin",
            "al>Hello, ",
            "world</final> trailing",
        ]);
        let outcome = h.run(upstream, Dialect::ThinkingMl, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);

        let events = h.backlog();
        assert_eq!(
            &events[..2],
            &[
                StreamEvent::Status {
                    state: StatusState::Queued
                },
                StreamEvent::Status {
                    state: StatusState::Working
                },
            ]
        );
        assert_eq!(terminal_count(&events), 1);
        match events.last() {
            Some(StreamEvent::Completed {
                reply,
                request_id,
                diagnostics,
            }) => {
                assert_eq!(reply, "Hello, world");
                assert_eq!(request_id, &h.message.request_id.to_string());
                assert!(diagnostics.is_empty());
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn text_dialect_reply_is_concatenation() {
        let h = Harness::new();
        let upstream = ScriptedUpstream::new(["Hel", "lo"]);
        h.run(upstream, Dialect::Text, CancellationToken::new()).await.unwrap();
        match h.backlog().last() {
            Some(StreamEvent::Completed { reply, .. }) => assert_eq!(reply, "Hello"),
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn split_code_point_reassembled() {
        let h = Harness::new();
        let bytes = "héllo".as_bytes();
        let upstream = ScriptedUpstream::new([bytes[..2].to_vec(), bytes[2..].to_vec()]);
        h.run(upstream, Dialect::Text, CancellationToken::new()).await.unwrap();
        match h.backlog().last() {
            Some(StreamEvent::Completed { reply, .. }) => assert_eq!(reply, "héllo"),
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broken_stream_becomes_error() {
        let h = Harness::new();
        let upstream =
            ScriptedUpstream::new(["partial"]).then_fail(UpstreamError::Body("reset".into()));
        let outcome = h.run(upstream, Dialect::Text, CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Failed {
                code: codes::UPSTREAM_STREAM_ERROR
            }
        );
        let events = h.backlog();
        assert_eq!(terminal_count(&events), 1);
        assert!(events.contains(&StreamEvent::ContentDelta {
            delta: "partial".into()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_upstream_times_out() {
        let h = Harness::new();
        let upstream = ScriptedUpstream::new(["late"]).with_delay(Duration::from_secs(10));
        let outcome = h.run(upstream, Dialect::Text, CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Failed {
                code: codes::UPSTREAM_TIMEOUT
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_becomes_error() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        let upstream = ScriptedUpstream::new(["a", "b"]).with_delay(Duration::from_secs(1));
        let handle = h.run(upstream, Dialect::Text, cancel.clone());
        cancel.cancel();
        assert_eq!(
            handle.await.unwrap(),
            Outcome::Failed {
                code: codes::CANCELLED
            }
        );
        assert_eq!(terminal_count(&h.backlog()), 1);
    }

    #[tokio::test]
    async fn violation_cap_becomes_error() {
        let h = Harness::new();
        let flood = "</title>".repeat(40);
        let upstream = ScriptedUpstream::new(["<thinking>".to_string(), flood]);
        let outcome = h.run(upstream, Dialect::ThinkingMl, CancellationToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Failed {
                code: codes::STRUCTURAL_VIOLATION_LIMIT_EXCEEDED
            }
        );
    }

    #[tokio::test]
    async fn events_before_violation_cap_are_published() {
        let h = Harness::new();
        let chunk = format!(
            "<thinking><phase id=\"1\"><title>A</title>ok</phase>{}",
            "</title>".repeat(40)
        );
        let upstream = ScriptedUpstream::new([chunk]);
        h.run(upstream, Dialect::ThinkingMl, CancellationToken::new())
            .await
            .unwrap();

        let backlog = h.backlog();
        assert!(backlog.contains(&StreamEvent::PhaseDelta {
            id: 1,
            text: "ok".into()
        }));
        match backlog.last() {
            Some(StreamEvent::Error { code, .. }) => {
                assert_eq!(code, codes::STRUCTURAL_VIOLATION_LIMIT_EXCEEDED)
            }
            other => panic!("expected error last, got {other:?}"),
        }
        assert_eq!(terminal_count(&backlog), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_close_abandons_producer() {
        let h = Harness::new();
        let upstream = ScriptedUpstream::new(["a", "b", "c"]).with_delay(Duration::from_secs(1));
        let handle = h.run(upstream, Dialect::Text, CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        h.broker.close(&h.message.message_id).unwrap();
        assert_eq!(handle.await.unwrap(), Outcome::Abandoned);
    }

    #[test]
    fn decoder_handles_invalid_and_truncated_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push(&[b'a', 0xE2, 0x82]), "a");
        assert_eq!(decoder.push(&[0xAC, b'b']), "\u{20AC}b");
        assert_eq!(decoder.push(&[0xFF, b'c']), "\u{FFFD}c");
        assert_eq!(decoder.push(&[0xE2]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
