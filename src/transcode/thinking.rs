// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// ThinkingML structural parser.
//
// Consumes sanitized text and walks PRE -> THINKING -> BETWEEN -> FINAL ->
// TAIL, emitting typed events as soon as they are decidable. Structural
// violations are recorded and streaming continues; everything after
// </final> is dropped.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::ProtocolConfig;
use crate::event::StreamEvent;

use super::escape::TagGuard;
use super::serp::{is_serp_block, parse_block, COMMENT_CLOSE, COMMENT_OPEN, MAX_COMMENT_LEN};
use super::tag::{scan_tag, Tag, TagScan};
use super::types::{Diagnostic, Diagnostics, TranscodeError, Transcoder, Violation};

// ---------------------------------------------------------------------------
// Parser state
// ---------------------------------------------------------------------------

/// Position of the parser in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pre,
    Thinking,
    Between,
    Final,
    /// After `</final>`. Terminal; all input is discarded.
    Tail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TitleState {
    Awaiting,
    Reading(String),
    Done,
}

#[derive(Debug, Clone)]
struct OpenPhase {
    id: u64,
    title: TitleState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SerpQueriesState {
    Absent,
    Valid,
    Invalid,
}

enum CommentScan {
    Complete(usize),
    Incomplete,
    NotAComment,
}

/// Incremental ThinkingML parser.
#[derive(Debug, Clone)]
pub struct ThinkingParser {
    protocol: ProtocolConfig,
    stage: Stage,
    carry: String,
    open_phase: Option<OpenPhase>,
    max_phase_id: u64,
    /// Text of a `<serp>` summary while it is open.
    serp_summary: Option<String>,
    serp_summary_seen: bool,
    serp_queries: SerpQueriesState,
    reported_pre: bool,
    reported_between: bool,
    reported_outside_phase: bool,
    diagnostics: Diagnostics,
}

impl ThinkingParser {
    pub fn new(protocol: &ProtocolConfig) -> Self {
        Self {
            protocol: protocol.clone(),
            stage: Stage::Pre,
            carry: String::new(),
            open_phase: None,
            max_phase_id: 0,
            serp_summary: None,
            serp_summary_seen: false,
            serp_queries: SerpQueriesState::Absent,
            reported_pre: false,
            reported_between: false,
            reported_outside_phase: false,
            diagnostics: Diagnostics::new(protocol.max_violations),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Feed one sanitized fragment.
    pub fn push(&mut self, fragment: &str) -> Result<Vec<StreamEvent>, TranscodeError> {
        let mut events = Vec::new();
        self.push_into(fragment, &mut events)?;
        Ok(events)
    }

    /// Like [`push`](Self::push), keeping events produced before a fatal
    /// error in `events`.
    pub fn push_into(
        &mut self,
        fragment: &str,
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), TranscodeError> {
        if self.stage == Stage::Tail || fragment.is_empty() {
            return Ok(());
        }
        let mut buffer = std::mem::take(&mut self.carry);
        buffer.push_str(fragment);
        self.drive(&buffer, false, events)
    }

    /// End of stream: flush the carry and report an unterminated document.
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>, TranscodeError> {
        let mut events = Vec::new();
        self.finish_into(&mut events)?;
        Ok(events)
    }

    pub fn finish_into(&mut self, events: &mut Vec<StreamEvent>) -> Result<(), TranscodeError> {
        if self.stage != Stage::Tail {
            let buffer = std::mem::take(&mut self.carry);
            self.drive(&buffer, true, events)?;
        }

        let stage = std::mem::replace(&mut self.stage, Stage::Tail);
        match stage {
            Stage::Tail => {}
            Stage::Final => {
                self.check_serp_queries()?;
                self.diagnostics.record(Violation::UnexpectedEndOfStream)?;
            }
            Stage::Pre | Stage::Thinking | Stage::Between => {
                self.diagnostics.record(Violation::UnexpectedEndOfStream)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tokenizing
    // -----------------------------------------------------------------------

    fn drive(
        &mut self,
        buffer: &str,
        eof: bool,
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), TranscodeError> {
        let mut i = 0;
        while i < buffer.len() {
            if self.stage == Stage::Tail {
                return Ok(());
            }
            let rest = &buffer[i..];
            let Some(offset) = rest.find('<') else {
                return self.on_text(rest, events);
            };
            if offset > 0 {
                self.on_text(&rest[..offset], events)?;
                i += offset;
                continue;
            }

            if self.stage == Stage::Final {
                match scan_comment(rest, eof) {
                    CommentScan::Complete(len) => {
                        self.on_comment(&rest[..len], events)?;
                        i += len;
                        continue;
                    }
                    CommentScan::Incomplete => {
                        self.carry = rest.to_string();
                        return Ok(());
                    }
                    CommentScan::NotAComment => {}
                }
            }

            match scan_tag(rest) {
                TagScan::Tag(tag) => {
                    self.on_tag(&tag, events)?;
                    i += tag.len;
                }
                TagScan::NotATag => {
                    self.on_text("<", events)?;
                    i += 1;
                }
                TagScan::Incomplete if eof => return self.on_text(rest, events),
                TagScan::Incomplete => {
                    self.carry = rest.to_string();
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Text
    // -----------------------------------------------------------------------

    fn on_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) -> Result<(), TranscodeError> {
        if text.is_empty() {
            return Ok(());
        }
        let blank = text.trim().is_empty();

        match self.stage {
            Stage::Pre => {
                if let Some(summary) = self.serp_summary.as_mut() {
                    summary.push_str(text);
                    return Ok(());
                }
                if blank {
                    return Ok(());
                }
                if !self.reported_pre {
                    self.reported_pre = true;
                    self.diagnostics
                        .record(Violation::UnexpectedContentBeforeThinking)?;
                }
                events.push(StreamEvent::FinalDelta {
                    text: text.to_string(),
                });
            }
            Stage::Thinking => match self.open_phase.as_mut() {
                None => {
                    if !blank && !self.reported_outside_phase {
                        self.reported_outside_phase = true;
                        self.diagnostics.record(Violation::ContentOutsidePhase)?;
                    }
                }
                Some(phase) => {
                    if let TitleState::Reading(title) = &mut phase.title {
                        title.push_str(text);
                        return Ok(());
                    }
                    let id = phase.id;
                    if phase.title == TitleState::Awaiting {
                        if blank {
                            return Ok(());
                        }
                        phase.title = TitleState::Done;
                        self.diagnostics.record(Violation::MissingTitle { id })?;
                        events.push(StreamEvent::PhaseStart {
                            id,
                            title: String::new(),
                        });
                    }
                    events.push(StreamEvent::PhaseDelta {
                        id,
                        text: text.to_string(),
                    });
                }
            },
            Stage::Between => {
                if blank {
                    return Ok(());
                }
                if !self.reported_between {
                    self.reported_between = true;
                    self.diagnostics
                        .record(Violation::FinalNotImmediatelyAfterThinking)?;
                }
                events.push(StreamEvent::FinalDelta {
                    text: text.to_string(),
                });
            }
            Stage::Final => events.push(StreamEvent::FinalDelta {
                text: text.to_string(),
            }),
            Stage::Tail => {}
        }
        Ok(())
    }

    fn on_comment(
        &mut self,
        comment: &str,
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), TranscodeError> {
        if !is_serp_block(comment) {
            return self.on_text(comment, events);
        }
        if self.serp_queries != SerpQueriesState::Absent {
            self.serp_queries = SerpQueriesState::Invalid;
            return self
                .diagnostics
                .record(Violation::MissingOrInvalidSerpQueriesBlock {
                    reason: "more than one block".into(),
                });
        }
        match parse_block(comment) {
            Ok(queries) => {
                self.serp_queries = SerpQueriesState::Valid;
                events.push(StreamEvent::SerpQueries { queries });
                Ok(())
            }
            Err(e) => {
                self.serp_queries = SerpQueriesState::Invalid;
                self.diagnostics
                    .record(Violation::MissingOrInvalidSerpQueriesBlock {
                        reason: e.to_string(),
                    })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Tags
    // -----------------------------------------------------------------------

    fn on_tag(&mut self, tag: &Tag<'_>, events: &mut Vec<StreamEvent>) -> Result<(), TranscodeError> {
        let lowered = tag.name.to_ascii_lowercase();
        if !self.protocol.is_allowed_tag(&lowered) {
            return self.diagnostics.record(Violation::UnexpectedTag(lowered));
        }
        let name = if lowered == "think" {
            "thinking"
        } else {
            lowered.as_str()
        };

        match (self.stage, name, tag.closing) {
            (Stage::Pre, "serp", false) => {
                if self.serp_summary.is_none() && !self.serp_summary_seen {
                    self.serp_summary = Some(String::new());
                } else if !self.reported_pre {
                    self.reported_pre = true;
                    self.diagnostics
                        .record(Violation::UnexpectedContentBeforeThinking)?;
                }
            }
            (Stage::Pre, "serp", true) if self.serp_summary.is_some() => {
                self.flush_serp_summary(events);
            }
            (Stage::Pre, "thinking", false) => {
                self.flush_serp_summary(events);
                self.stage = Stage::Thinking;
                events.push(StreamEvent::ThinkingStart);
            }
            (Stage::Pre, "final", false) => {
                self.flush_serp_summary(events);
                self.diagnostics
                    .record(Violation::UnexpectedTag("final".into()))?;
                self.stage = Stage::Final;
            }
            (Stage::Thinking, "phase", false) => {
                self.close_phase(events)?;
                self.begin_phase(tag.attrs)?;
            }
            (Stage::Thinking, "phase", true) if self.open_phase.is_some() => {
                self.close_phase(events)?;
            }
            (Stage::Thinking, "title", false) => match self.open_phase.as_mut() {
                Some(phase) if phase.title == TitleState::Awaiting => {
                    phase.title = TitleState::Reading(String::new());
                }
                _ => {
                    self.diagnostics
                        .record(Violation::UnexpectedTag("title".into()))?;
                }
            },
            (Stage::Thinking, "title", true) => match self.open_phase.as_mut() {
                Some(phase) if matches!(phase.title, TitleState::Reading(_)) => {
                    let title = match std::mem::replace(&mut phase.title, TitleState::Done) {
                        TitleState::Reading(title) => title.trim().to_string(),
                        _ => String::new(),
                    };
                    events.push(StreamEvent::PhaseStart {
                        id: phase.id,
                        title,
                    });
                }
                _ => {
                    self.diagnostics
                        .record(Violation::UnexpectedTag("title".into()))?;
                }
            },
            (Stage::Thinking, "thinking", true) => {
                self.close_phase(events)?;
                self.stage = Stage::Between;
                events.push(StreamEvent::ThinkingEnd);
            }
            (Stage::Thinking, "final", false) => {
                self.close_phase(events)?;
                events.push(StreamEvent::ThinkingEnd);
                self.diagnostics
                    .record(Violation::UnexpectedTag("final".into()))?;
                self.stage = Stage::Final;
            }
            (Stage::Between, "final", false) => {
                self.stage = Stage::Final;
            }
            (Stage::Final, "final", true) => {
                self.check_serp_queries()?;
                events.push(StreamEvent::FinalEnd);
                self.stage = Stage::Tail;
                self.carry.clear();
            }
            (_, other, _) => {
                self.diagnostics
                    .record(Violation::UnexpectedTag(other.to_string()))?;
            }
        }
        Ok(())
    }

    fn flush_serp_summary(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(text) = self.serp_summary.take() {
            self.serp_summary_seen = true;
            events.push(StreamEvent::SerpSummary {
                text: text.trim().to_string(),
            });
        }
    }

    fn begin_phase(&mut self, attrs: &str) -> Result<(), TranscodeError> {
        let expected = self.max_phase_id + 1;
        let found = parse_phase_id(attrs);
        let id = match found {
            Some(id) if id == expected => id,
            Some(id) => {
                self.diagnostics.record(Violation::PhaseIdNotIncreasing {
                    expected,
                    found: Some(id),
                })?;
                id
            }
            None => {
                self.diagnostics.record(Violation::PhaseIdNotIncreasing {
                    expected,
                    found: None,
                })?;
                expected
            }
        };
        self.max_phase_id = self.max_phase_id.max(id);
        self.open_phase = Some(OpenPhase {
            id,
            title: TitleState::Awaiting,
        });
        Ok(())
    }

    fn close_phase(&mut self, events: &mut Vec<StreamEvent>) -> Result<(), TranscodeError> {
        let Some(phase) = self.open_phase.take() else {
            return Ok(());
        };
        match phase.title {
            TitleState::Awaiting => {
                self.diagnostics
                    .record(Violation::MissingTitle { id: phase.id })?;
                events.push(StreamEvent::PhaseStart {
                    id: phase.id,
                    title: String::new(),
                });
            }
            // Unterminated <title>: keep what was read
            TitleState::Reading(title) => events.push(StreamEvent::PhaseStart {
                id: phase.id,
                title: title.trim().to_string(),
            }),
            TitleState::Done => {}
        }
        Ok(())
    }

    fn check_serp_queries(&mut self) -> Result<(), TranscodeError> {
        if self.protocol.serp_queries_required && self.serp_queries == SerpQueriesState::Absent {
            self.serp_queries = SerpQueriesState::Invalid;
            self.diagnostics
                .record(Violation::MissingOrInvalidSerpQueriesBlock {
                    reason: "block missing".into(),
                })?;
        }
        Ok(())
    }
}

fn phase_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bid\s*=\s*["']?(\d+)"#).expect("phase id regex is valid")
    })
}

fn parse_phase_id(attrs: &str) -> Option<u64> {
    phase_id_regex()
        .captures(attrs)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn scan_comment(rest: &str, eof: bool) -> CommentScan {
    if let Some(body) = rest.strip_prefix(COMMENT_OPEN) {
        return match body.find(COMMENT_CLOSE) {
            Some(end) => {
                let len = COMMENT_OPEN.len() + end + COMMENT_CLOSE.len();
                if len <= MAX_COMMENT_LEN {
                    CommentScan::Complete(len)
                } else {
                    CommentScan::NotAComment
                }
            }
            None if !eof && rest.len() < MAX_COMMENT_LEN => CommentScan::Incomplete,
            None => CommentScan::NotAComment,
        };
    }
    if !eof && COMMENT_OPEN.starts_with(rest) {
        return CommentScan::Incomplete;
    }
    CommentScan::NotAComment
}

// ---------------------------------------------------------------------------
// ThinkingML transcoder (tag guard + parser)
// ---------------------------------------------------------------------------

/// Full ThinkingML pipeline: raw fragments are sanitized by the tag guard
/// before the structural parser sees them.
#[derive(Debug, Clone)]
pub struct ThinkingMlTranscoder {
    guard: TagGuard,
    parser: ThinkingParser,
}

impl ThinkingMlTranscoder {
    pub fn new(protocol: &ProtocolConfig) -> Self {
        Self {
            guard: TagGuard::new(protocol),
            parser: ThinkingParser::new(protocol),
        }
    }

    pub fn stage(&self) -> Stage {
        self.parser.stage()
    }
}

impl Transcoder for ThinkingMlTranscoder {
    fn push_into(
        &mut self,
        fragment: &str,
        out: &mut Vec<StreamEvent>,
    ) -> Result<(), TranscodeError> {
        if self.parser.stage() == Stage::Tail {
            return Ok(());
        }
        let sanitized = self.guard.push(fragment);
        self.parser.push_into(&sanitized, out)
    }

    fn finish_into(&mut self, out: &mut Vec<StreamEvent>) -> Result<(), TranscodeError> {
        if self.parser.stage() != Stage::Tail {
            let sanitized = self.guard.finish();
            self.parser.push_into(&sanitized, out)?;
        }
        self.parser.finish_into(out)
    }

    fn diagnostics(&self) -> Vec<Diagnostic> {
        self.parser.diagnostics().report()
    }
}
