// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// Tag guard: streaming escaper run on raw upstream text before any
// structural parsing.
//
// - Escapes the forbidden marker wherever it appears
// - Escapes tags whose name is not on the protocol allow-list
// - Leaves allow-listed tags, their attributes and literal `<` untouched
// - Withholds an undecided suffix (partial tag or marker) until the next
//   fragment completes it

use crate::config::ProtocolConfig;

use super::tag::{escape_angles, scan_tag, TagScan};

/// Streaming sanitizer with a small carry buffer.
///
/// Concatenated output is identical for every fragmentation of the same
/// input.
#[derive(Debug, Clone)]
pub struct TagGuard {
    allowed_tags: Vec<String>,
    marker: String,
    carry: String,
}

impl TagGuard {
    pub fn new(protocol: &ProtocolConfig) -> Self {
        Self {
            allowed_tags: protocol.allowed_tags.clone(),
            marker: protocol.forbidden_marker.clone(),
            carry: String::new(),
        }
    }

    /// Sanitize one fragment. May return less than was pushed when the
    /// fragment ends mid-tag or mid-marker.
    pub fn push(&mut self, fragment: &str) -> String {
        if fragment.is_empty() {
            return String::new();
        }
        let mut buffer = std::mem::take(&mut self.carry);
        buffer.push_str(fragment);
        let (output, carry) = self.scan(&buffer, false);
        self.carry = carry;
        output
    }

    /// Flush the carry at end of stream, escaping it conservatively.
    pub fn finish(&mut self) -> String {
        let buffer = std::mem::take(&mut self.carry);
        let (output, _) = self.scan(&buffer, true);
        output
    }

    /// Sanitize a complete string in one pass. Leaves the carry alone.
    pub fn sanitize(&self, text: &str) -> String {
        self.scan(text, true).0
    }

    /// Bytes currently withheld.
    pub fn pending(&self) -> &str {
        &self.carry
    }

    fn is_allowed(&self, name: &str) -> bool {
        self.allowed_tags
            .iter()
            .any(|tag| tag.eq_ignore_ascii_case(name))
    }

    fn is_interesting(&self, c: char) -> bool {
        c == '<' || self.marker.starts_with(c)
    }

    /// Returns (sanitized output, undecided suffix).
    fn scan(&self, buffer: &str, eof: bool) -> (String, String) {
        let mut out = String::with_capacity(buffer.len());
        let mut i = 0;

        while i < buffer.len() {
            let rest = &buffer[i..];
            let Some(offset) = rest.find(|c| self.is_interesting(c)) else {
                out.push_str(rest);
                break;
            };
            out.push_str(&rest[..offset]);
            i += offset;
            let rest = &buffer[i..];

            // Forbidden marker takes precedence over tag recognition
            if !self.marker.is_empty() {
                if rest.starts_with(self.marker.as_str()) {
                    out.push_str(&escape_angles(&self.marker));
                    i += self.marker.len();
                    continue;
                }
                if rest.len() < self.marker.len() && self.marker.starts_with(rest) {
                    if eof {
                        out.push_str(&escape_angles(rest));
                        return (out, String::new());
                    }
                    return (out, rest.to_string());
                }
            }

            if !rest.starts_with('<') {
                // Marker lead character that did not start the marker
                let width = rest.chars().next().map_or(1, char::len_utf8);
                out.push_str(&rest[..width]);
                i += width;
                continue;
            }

            match scan_tag(rest) {
                TagScan::Tag(tag) => {
                    let raw = &rest[..tag.len];
                    if self.is_allowed(tag.name) {
                        out.push_str(raw);
                    } else {
                        out.push_str(&escape_angles(raw));
                    }
                    i += tag.len;
                }
                TagScan::NotATag => {
                    out.push('<');
                    i += 1;
                }
                TagScan::Incomplete => {
                    if eof {
                        out.push_str(&escape_angles(rest));
                        return (out, String::new());
                    }
                    return (out, rest.to_string());
                }
            }
        }

        (out, String::new())
    }
}
