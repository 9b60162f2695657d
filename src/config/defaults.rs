// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

use super::types::ProtocolConfig;

/// Sentinel the model emits when it fails to follow the output protocol.
pub const DEFAULT_FORBIDDEN_MARKER: &str = "<|parsing_failed|>";

pub const DEFAULT_MAX_VIOLATIONS: usize = 32;
pub const DEFAULT_RETIRE_GRACE_SECS: u64 = 30;
pub const DEFAULT_MAX_PER_CONVERSATION: usize = 1;
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 5;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 15;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;

/// Protocol revisions with a built-in profile, oldest first.
pub const KNOWN_PROTOCOL_VERSIONS: &[&str] = &["6.0", "7.0", "7.3"];

/// Revision used when the config does not name one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "7.3";

const BASE_TAGS: &[&str] = &["think", "thinking", "phase", "title", "final"];

/// Built-in profile for a protocol revision.
///
/// 6.0 predates search grounding, so `serp` is not allow-listed. 7.0 adds
/// the `<serp>` summary block. 7.3 makes the trailing `serp_queries`
/// comment block mandatory.
pub fn protocol_profile(version: &str) -> Option<ProtocolConfig> {
    let (with_serp, serp_required) = match version {
        "6.0" => (false, false),
        "7.0" => (true, false),
        "7.3" => (true, true),
        _ => return None,
    };

    let mut allowed_tags: Vec<String> = BASE_TAGS.iter().map(|t| t.to_string()).collect();
    if with_serp {
        allowed_tags.push("serp".to_string());
    }

    Some(ProtocolConfig {
        version: version.to_string(),
        allowed_tags,
        forbidden_marker: DEFAULT_FORBIDDEN_MARKER.to_string(),
        serp_queries_required: serp_required,
        max_violations: DEFAULT_MAX_VIOLATIONS,
    })
}

pub fn default_protocol() -> ProtocolConfig {
    protocol_profile(DEFAULT_PROTOCOL_VERSION)
        .expect("default protocol version has a built-in profile")
}
