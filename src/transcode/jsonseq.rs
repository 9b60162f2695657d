// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// JSON-sequence transcoder: one `{"event": "...", ...}` object per line.
//
// Partial lines are carried across fragments. Each complete line is parsed,
// checked against the ordering automaton and forwarded. Ordering problems
// are recorded and the event still goes out; lines that cannot be turned
// into an event at all are recorded and skipped.
//
// Decoded text goes through the tag guard. Delta text is guarded as a
// stream per lane (one phase, or the final answer), so a tag split across
// two deltas is still recognized.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::config::ProtocolConfig;
use crate::event::StreamEvent;

use super::escape::TagGuard;
use super::serp::normalize_queries;
use super::types::{Diagnostic, Diagnostics, TranscodeError, Transcoder, Violation};

/// Ordering automaton position. Variants are declared in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Start,
    AfterSummary,
    Thinking,
    AfterThinking,
    Final,
    AfterQueries,
    Tail,
}

/// Longest line carried while waiting for its newline.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Text stream a delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Phase(u64),
    Final,
}

impl Lane {
    fn event(self, text: String) -> StreamEvent {
        match self {
            Lane::Phase(id) => StreamEvent::PhaseDelta { id, text },
            Lane::Final => StreamEvent::FinalDelta { text },
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonSeqTranscoder {
    serp_queries_required: bool,
    stage: Stage,
    carry: String,
    overlong: bool,
    guard: TagGuard,
    lane: Option<Lane>,
    max_phase_id: u64,
    started: BTreeSet<u64>,
    open_phase: Option<u64>,
    phases_seen: usize,
    serp_queries_seen: bool,
    diagnostics: Diagnostics,
}

impl JsonSeqTranscoder {
    pub fn new(protocol: &ProtocolConfig) -> Self {
        Self {
            serp_queries_required: protocol.serp_queries_required,
            stage: Stage::Start,
            carry: String::new(),
            overlong: false,
            guard: TagGuard::new(protocol),
            lane: None,
            max_phase_id: 0,
            started: BTreeSet::new(),
            open_phase: None,
            phases_seen: 0,
            serp_queries_seen: false,
            diagnostics: Diagnostics::new(protocol.max_violations),
        }
    }

    /// Whether `final_end` has been seen.
    pub fn is_closed(&self) -> bool {
        self.stage == Stage::Tail
    }

    fn line(&mut self, line: &str, events: &mut Vec<StreamEvent>) -> Result<(), TranscodeError> {
        let line = line.trim();
        if line.is_empty() || self.stage == Stage::Tail {
            return Ok(());
        }

        let object = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(object)) => object,
            Ok(_) => {
                return self.diagnostics.record(Violation::MalformedLine {
                    reason: "line is not a JSON object".into(),
                })
            }
            Err(e) => {
                return self.diagnostics.record(Violation::MalformedLine {
                    reason: e.to_string(),
                })
            }
        };
        let Some(name) = object.get("event").and_then(Value::as_str) else {
            return self.diagnostics.record(Violation::MissingField {
                event: String::new(),
                field: "event",
            });
        };
        let name = name.to_string();
        if name != "phase_delta" && name != "final_delta" {
            self.close_lane(events);
        }

        match name.as_str() {
            "serp_summary" => {
                let Some(text) = self.string_field(&name, &object, "text")? else {
                    return Ok(());
                };
                if self.stage == Stage::Start {
                    self.stage = Stage::AfterSummary;
                } else {
                    self.out_of_order(&name)?;
                }
                let text = self.guard.sanitize(&text);
                events.push(StreamEvent::SerpSummary { text });
            }
            "thinking_start" => {
                if self.stage <= Stage::AfterSummary {
                    self.stage = Stage::Thinking;
                } else {
                    self.out_of_order(&name)?;
                }
                events.push(StreamEvent::ThinkingStart);
            }
            "phase_start" => {
                let Some(id) = self.id_field(&name, &object)? else {
                    return Ok(());
                };
                if self.stage != Stage::Thinking {
                    self.out_of_order(&name)?;
                }
                let expected = self.max_phase_id + 1;
                if id != expected {
                    self.diagnostics.record(Violation::PhaseIdNotIncreasing {
                        expected,
                        found: Some(id),
                    })?;
                }
                let title = match object.get("title").and_then(Value::as_str) {
                    Some(title) => self.guard.sanitize(title),
                    None => {
                        self.diagnostics.record(Violation::MissingTitle { id })?;
                        String::new()
                    }
                };
                self.max_phase_id = self.max_phase_id.max(id);
                self.started.insert(id);
                self.open_phase = Some(id);
                self.phases_seen += 1;
                events.push(StreamEvent::PhaseStart { id, title });
            }
            "phase_delta" => {
                let Some(id) = self.id_field(&name, &object)? else {
                    return Ok(());
                };
                let Some(text) = self.string_field(&name, &object, "text")? else {
                    return Ok(());
                };
                if !self.started.contains(&id) {
                    return self.diagnostics.record(Violation::UnknownPhase(id));
                }
                if self.stage != Stage::Thinking || self.open_phase != Some(id) {
                    self.out_of_order(&name)?;
                }
                self.delta(Lane::Phase(id), &text, events);
            }
            "thinking_end" => {
                if self.stage == Stage::Thinking && self.phases_seen > 0 {
                    self.stage = Stage::AfterThinking;
                } else {
                    self.out_of_order(&name)?;
                    self.stage = self.stage.max(Stage::AfterThinking);
                }
                self.open_phase = None;
                events.push(StreamEvent::ThinkingEnd);
            }
            "final_delta" => {
                let Some(text) = self.string_field(&name, &object, "text")? else {
                    return Ok(());
                };
                match self.stage {
                    Stage::AfterThinking | Stage::Final => self.stage = Stage::Final,
                    _ => self.out_of_order(&name)?,
                }
                self.delta(Lane::Final, &text, events);
            }
            "serp_queries" => {
                let raw = object.get("queries").and_then(|q| {
                    q.as_array().map(|items| {
                        items
                            .iter()
                            .filter_map(|item| item.as_str().map(str::to_string))
                            .collect::<Vec<_>>()
                    })
                });
                let Some(raw) = raw else {
                    return self.diagnostics.record(Violation::MissingField {
                        event: name.clone(),
                        field: "queries",
                    });
                };
                if self.serp_queries_seen {
                    return self
                        .diagnostics
                        .record(Violation::MissingOrInvalidSerpQueriesBlock {
                            reason: "more than one block".into(),
                        });
                }
                self.serp_queries_seen = true;
                match normalize_queries(raw) {
                    Ok(queries) => {
                        if self.stage == Stage::Final {
                            self.stage = Stage::AfterQueries;
                        } else {
                            self.out_of_order(&name)?;
                        }
                        events.push(StreamEvent::SerpQueries { queries });
                    }
                    Err(e) => {
                        self.diagnostics
                            .record(Violation::MissingOrInvalidSerpQueriesBlock {
                                reason: e.to_string(),
                            })?;
                    }
                }
            }
            "final_end" => {
                if self.stage < Stage::Final {
                    self.out_of_order(&name)?;
                }
                self.check_serp_queries()?;
                self.stage = Stage::Tail;
                self.carry.clear();
                events.push(StreamEvent::FinalEnd);
            }
            "tool_start" => events.push(StreamEvent::ToolStart {
                payload: Value::Object(object),
            }),
            "tool_result" => events.push(StreamEvent::ToolResult {
                payload: Value::Object(object),
            }),
            _ => self.diagnostics.record(Violation::UnknownEvent(name))?,
        }
        Ok(())
    }

    /// Guard delta text as one stream per lane. Switching lanes flushes
    /// what the previous lane was withholding.
    fn delta(&mut self, lane: Lane, text: &str, events: &mut Vec<StreamEvent>) {
        if self.lane != Some(lane) {
            self.close_lane(events);
            self.lane = Some(lane);
        }
        let clean = self.guard.push(text);
        if !clean.is_empty() {
            events.push(lane.event(clean));
        }
    }

    fn close_lane(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(lane) = self.lane.take() {
            let rest = self.guard.finish();
            if !rest.is_empty() {
                events.push(lane.event(rest));
            }
        }
    }

    fn out_of_order(&mut self, name: &str) -> Result<(), TranscodeError> {
        self.diagnostics
            .record(Violation::UnexpectedEvent(name.to_string()))
    }

    fn check_serp_queries(&mut self) -> Result<(), TranscodeError> {
        if self.serp_queries_required && !self.serp_queries_seen {
            self.serp_queries_seen = true;
            self.diagnostics
                .record(Violation::MissingOrInvalidSerpQueriesBlock {
                    reason: "block missing".into(),
                })?;
        }
        Ok(())
    }

    fn string_field(
        &mut self,
        event: &str,
        object: &Map<String, Value>,
        field: &'static str,
    ) -> Result<Option<String>, TranscodeError> {
        match object.get(field).and_then(Value::as_str) {
            Some(value) => Ok(Some(value.to_string())),
            None => {
                self.diagnostics.record(Violation::MissingField {
                    event: event.to_string(),
                    field,
                })?;
                Ok(None)
            }
        }
    }

    /// Phase ids are accepted as JSON numbers or numeric strings.
    fn id_field(
        &mut self,
        event: &str,
        object: &Map<String, Value>,
    ) -> Result<Option<u64>, TranscodeError> {
        let id = match object.get("id") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        if id.is_none() {
            self.diagnostics.record(Violation::MissingField {
                event: event.to_string(),
                field: "id",
            })?;
        }
        Ok(id)
    }
}

impl Transcoder for JsonSeqTranscoder {
    fn push_into(
        &mut self,
        fragment: &str,
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), TranscodeError> {
        if self.stage == Stage::Tail {
            return Ok(());
        }
        self.carry.push_str(fragment);

        while let Some(newline) = self.carry.find('\n') {
            let line: String = self.carry.drain(..=newline).collect();
            if std::mem::take(&mut self.overlong) {
                continue;
            }
            self.line(&line, events)?;
            if self.stage == Stage::Tail {
                return Ok(());
            }
        }

        if self.carry.len() > MAX_LINE_LEN {
            self.carry.clear();
            if !self.overlong {
                self.overlong = true;
                self.diagnostics.record(Violation::MalformedLine {
                    reason: format!("line longer than {MAX_LINE_LEN} bytes"),
                })?;
            }
        }
        Ok(())
    }

    fn finish_into(&mut self, events: &mut Vec<StreamEvent>) -> Result<(), TranscodeError> {
        if self.stage != Stage::Tail {
            let rest = std::mem::take(&mut self.carry);
            if !std::mem::take(&mut self.overlong) {
                self.line(&rest, events)?;
            }
        }
        if self.stage != Stage::Tail {
            self.close_lane(events);
            let reached_final = self.stage >= Stage::Final;
            self.stage = Stage::Tail;
            if reached_final {
                self.check_serp_queries()?;
            }
            self.diagnostics.record(Violation::UnexpectedEndOfStream)?;
        }
        Ok(())
    }

    fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.report()
    }
}
