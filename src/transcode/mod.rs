// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// Upstream transcoding: raw fragments in, typed stream events out.
//
// Responsibilities:
// - Escape the forbidden marker and non-allow-listed tags (tag guard),
//   in every dialect
// - Walk the ThinkingML structure PRE -> THINKING -> BETWEEN -> FINAL -> TAIL
// - Re-chunk and validate newline-delimited JSON event sequences
// - Carry partial tags, markers and lines across fragment boundaries
// - Record structural violations without aborting, up to a hard cap
// - Drop everything after the closing tag or event

mod escape;
mod jsonseq;
mod serp;
mod tag;
mod thinking;
mod types;

pub use escape::TagGuard;
pub use jsonseq::{JsonSeqTranscoder, MAX_LINE_LEN};
pub use serp::{
    normalize_queries, parse_block, render_block, SerpBlockError, MAX_SERP_QUERIES,
    MAX_SERP_QUERY_CHARS,
};
pub use tag::MAX_TAG_LEN;
pub use thinking::{Stage, ThinkingMlTranscoder, ThinkingParser};
pub use types::{Diagnostic, Diagnostics, Dialect, TranscodeError, Transcoder, Violation};

use crate::config::ProtocolConfig;
use crate::event::StreamEvent;

/// Plain token deltas: sanitized fragments are forwarded as `content_delta`.
#[derive(Debug, Clone)]
pub struct TextTranscoder {
    guard: TagGuard,
}

impl TextTranscoder {
    pub fn new(protocol: &ProtocolConfig) -> Self {
        Self {
            guard: TagGuard::new(protocol),
        }
    }
}

impl Transcoder for TextTranscoder {
    fn push_into(
        &mut self,
        fragment: &str,
        out: &mut Vec<StreamEvent>,
    ) -> Result<(), TranscodeError> {
        let delta = self.guard.push(fragment);
        if !delta.is_empty() {
            out.push(StreamEvent::ContentDelta { delta });
        }
        Ok(())
    }

    fn finish_into(&mut self, out: &mut Vec<StreamEvent>) -> Result<(), TranscodeError> {
        let delta = self.guard.finish();
        if !delta.is_empty() {
            out.push(StreamEvent::ContentDelta { delta });
        }
        Ok(())
    }

    fn diagnostics(&self) -> Vec<Diagnostic> {
        Vec::new()
    }
}

/// Build the transcoder for an upstream dialect.
pub fn new_transcoder(dialect: Dialect, protocol: &ProtocolConfig) -> Box<dyn Transcoder> {
    match dialect {
        Dialect::Text => Box::new(TextTranscoder::new(protocol)),
        Dialect::ThinkingMl => Box::new(ThinkingMlTranscoder::new(protocol)),
        Dialect::JsonSeq => Box::new(JsonSeqTranscoder::new(protocol)),
    }
}
