// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// Transcoder types: dialects, structural violations, diagnostics and errors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::StreamEvent;

// ---------------------------------------------------------------------------
// Dialects
// ---------------------------------------------------------------------------

/// Shape of the raw text an upstream model produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Bare token deltas, forwarded as `content_delta`.
    Text,
    /// XML-tagged `<thinking>`/`<final>` output.
    #[serde(rename = "thinkingml")]
    ThinkingMl,
    /// One JSON event object per line.
    #[serde(rename = "jsonseq")]
    JsonSeq,
}

impl Dialect {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Dialect::Text),
            "thinkingml" => Some(Dialect::ThinkingMl),
            "jsonseq" => Some(Dialect::JsonSeq),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Trait: Transcoder
// ---------------------------------------------------------------------------

/// Turns raw upstream fragments into typed stream events.
///
/// Fragments may split a tag, a marker or a JSON line anywhere; each
/// implementation carries the undecided suffix into the next call.
pub trait Transcoder: Send {
    /// Consume one fragment, appending the events it completes to `out`.
    ///
    /// Events appended before a fatal error stay in `out`.
    fn push_into(
        &mut self,
        fragment: &str,
        out: &mut Vec<StreamEvent>,
    ) -> Result<(), TranscodeError>;

    /// Flush the carry at end of stream into `out`.
    fn finish_into(&mut self, out: &mut Vec<StreamEvent>) -> Result<(), TranscodeError>;

    fn push(&mut self, fragment: &str) -> Result<Vec<StreamEvent>, TranscodeError> {
        let mut events = Vec::new();
        self.push_into(fragment, &mut events)?;
        Ok(events)
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>, TranscodeError> {
        let mut events = Vec::new();
        self.finish_into(&mut events)?;
        Ok(events)
    }

    /// Structural violations recorded so far.
    fn diagnostics(&self) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Structural violations
// ---------------------------------------------------------------------------

/// A detected deviation from protocol shape. Reported, never fatal on its
/// own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    UnexpectedContentBeforeThinking,
    PhaseIdNotIncreasing { expected: u64, found: Option<u64> },
    MissingTitle { id: u64 },
    FinalNotImmediatelyAfterThinking,
    ContentOutsidePhase,
    MissingOrInvalidSerpQueriesBlock { reason: String },
    UnexpectedTag(String),
    UnexpectedEndOfStream,
    /// JSON-sequence event arriving out of protocol order.
    UnexpectedEvent(String),
    UnknownPhase(u64),
    UnknownEvent(String),
    MissingField { event: String, field: &'static str },
    MalformedLine { reason: String },
}

impl Violation {
    /// Stable machine-readable code.
    pub fn code(&self) -> String {
        match self {
            Violation::UnexpectedContentBeforeThinking => {
                "unexpected_content_before_thinking".into()
            }
            Violation::PhaseIdNotIncreasing { .. } => "phase_id_not_increasing".into(),
            Violation::MissingTitle { .. } => "missing_title".into(),
            Violation::FinalNotImmediatelyAfterThinking => {
                "final_not_immediately_after_thinking".into()
            }
            Violation::ContentOutsidePhase => "content_outside_phase".into(),
            Violation::MissingOrInvalidSerpQueriesBlock { .. } => {
                "missing_or_invalid_serp_queries_block".into()
            }
            Violation::UnexpectedTag(name) => format!("unexpected_tag:{name}"),
            Violation::UnexpectedEndOfStream => "unexpected_end_of_stream".into(),
            Violation::UnexpectedEvent(name) => format!("unexpected_event:{name}"),
            Violation::UnknownPhase(_) => "unknown_phase".into(),
            Violation::UnknownEvent(name) => format!("unknown_event:{name}"),
            Violation::MissingField { .. } => "missing_field".into(),
            Violation::MalformedLine { .. } => "malformed_line".into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::UnexpectedContentBeforeThinking => {
                write!(f, "content before <thinking>")
            }
            Violation::PhaseIdNotIncreasing {
                expected,
                found: Some(found),
            } => write!(f, "phase id {found} where {expected} was expected"),
            Violation::PhaseIdNotIncreasing {
                expected,
                found: None,
            } => write!(f, "phase without id where {expected} was expected"),
            Violation::MissingTitle { id } => write!(f, "phase {id} has no <title>"),
            Violation::FinalNotImmediatelyAfterThinking => {
                write!(f, "content between </thinking> and <final>")
            }
            Violation::ContentOutsidePhase => {
                write!(f, "thinking content outside any <phase>")
            }
            Violation::MissingOrInvalidSerpQueriesBlock { reason } => {
                write!(f, "serp_queries block: {reason}")
            }
            Violation::UnexpectedTag(name) => write!(f, "unexpected tag <{name}>"),
            Violation::UnexpectedEndOfStream => {
                write!(f, "stream ended before the closing tag or event")
            }
            Violation::UnexpectedEvent(name) => write!(f, "event \"{name}\" out of order"),
            Violation::UnknownPhase(id) => {
                write!(f, "phase_delta for phase {id} without phase_start")
            }
            Violation::UnknownEvent(name) => write!(f, "unknown event \"{name}\""),
            Violation::MissingField { event, field } => {
                write!(f, "event \"{event}\" is missing field \"{field}\"")
            }
            Violation::MalformedLine { reason } => write!(f, "malformed JSON line: {reason}"),
        }
    }
}

/// Serializable form of a violation, attached to `completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub detail: String,
}

impl From<&Violation> for Diagnostic {
    fn from(v: &Violation) -> Self {
        Self {
            code: v.code(),
            detail: v.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Diagnostics accumulator
// ---------------------------------------------------------------------------

/// Collects violations for one message and enforces the violation cap.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    items: Vec<Violation>,
    cap: usize,
}

impl Diagnostics {
    pub fn new(cap: usize) -> Self {
        Self {
            items: Vec::new(),
            cap,
        }
    }

    /// Record a violation. Fails once more than `cap` have been recorded.
    pub fn record(&mut self, violation: Violation) -> Result<(), TranscodeError> {
        tracing::debug!(code = %violation.code(), detail = %violation, "structural violation");
        self.items.push(violation);
        if self.items.len() > self.cap {
            return Err(TranscodeError::ViolationCapExceeded { limit: self.cap });
        }
        Ok(())
    }

    pub fn violations(&self) -> &[Violation] {
        &self.items
    }

    pub fn report(&self) -> Vec<Diagnostic> {
        self.items.iter().map(Diagnostic::from).collect()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Fatal transcoding outcome. Converted to an `error` event by the
/// producer; never crosses the relay boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscodeError {
    #[error("more than {limit} structural violations in one message")]
    ViolationCapExceeded { limit: usize },
}
