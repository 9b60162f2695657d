// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// The trailing `serp_queries` comment block:
//
//   <!-- <serp_queries>
//   ["first query","second query"]
//   </serp_queries> -->

use std::sync::OnceLock;

use regex::Regex;

pub const MAX_SERP_QUERIES: usize = 5;
pub const MAX_SERP_QUERY_CHARS: usize = 120;

/// Opening of any HTML comment.
pub const COMMENT_OPEN: &str = "<!--";
pub const COMMENT_CLOSE: &str = "-->";

/// Longest comment withheld while waiting for `-->`.
pub const MAX_COMMENT_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SerpBlockError {
    #[error("comment is not a serp_queries block")]
    Shape,
    #[error("payload is not a JSON array of strings: {0}")]
    Json(String),
    #[error("no non-empty queries")]
    Empty,
    #[error("{0} queries, at most {MAX_SERP_QUERIES} allowed")]
    TooMany(usize),
    #[error("query longer than {MAX_SERP_QUERY_CHARS} characters")]
    TooLong,
}

fn block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\A<!--\s*<serp_queries>\s*(.*?)\s*</serp_queries>\s*-->\z")
            .expect("serp_queries block regex is valid")
    })
}

/// Whether a complete comment claims to be a serp_queries block.
pub fn is_serp_block(comment: &str) -> bool {
    comment.contains("<serp_queries>")
}

/// Render queries in the mandated block format.
pub fn render_block(queries: &[String]) -> String {
    let payload = serde_json::to_string(queries).unwrap_or_else(|_| "[]".to_string());
    format!("<!-- <serp_queries>\n{payload}\n</serp_queries> -->")
}

/// Parse a complete comment block into validated queries.
///
/// In the ThinkingML pipeline the block has already been through the tag
/// guard, so a query such as `<b>` arrives here, and leaves, as `&lt;b&gt;`.
pub fn parse_block(comment: &str) -> Result<Vec<String>, SerpBlockError> {
    let captures = block_regex()
        .captures(comment.trim())
        .ok_or(SerpBlockError::Shape)?;
    let payload = captures.get(1).map_or("", |m| m.as_str());
    let raw: Vec<String> =
        serde_json::from_str(payload).map_err(|e| SerpBlockError::Json(e.to_string()))?;
    normalize_queries(raw)
}

/// Trim, drop empties, deduplicate (order-preserving) and bound the list.
pub fn normalize_queries(raw: Vec<String>) -> Result<Vec<String>, SerpBlockError> {
    let mut queries: Vec<String> = Vec::with_capacity(raw.len());
    for query in raw {
        let query = query.trim();
        if query.is_empty() || queries.iter().any(|q| q == query) {
            continue;
        }
        if query.chars().count() > MAX_SERP_QUERY_CHARS {
            return Err(SerpBlockError::TooLong);
        }
        queries.push(query.to_string());
    }

    match queries.len() {
        0 => Err(SerpBlockError::Empty),
        n if n > MAX_SERP_QUERIES => Err(SerpBlockError::TooMany(n)),
        _ => Ok(queries),
    }
}
