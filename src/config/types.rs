// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use crate::transcode::Dialect;

// ---------------------------------------------------------------------------
// Top-level config (protocol + runtime)
// ---------------------------------------------------------------------------

/// Top-level parsed and validated relay config.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Streaming protocol rules. Changing these changes what clients see.
    pub protocol: ProtocolConfig,
    /// Runtime knobs that vary by deployment.
    pub runtime: RuntimeConfig,
    /// SHA256 hash of the raw YAML document: "sha256:{hex}".
    pub contract_hash: String,
}

// ---------------------------------------------------------------------------
// Protocol config
// ---------------------------------------------------------------------------

/// Versioned description of the ThinkingML output protocol.
///
/// Passed into the tag guard and the structural parser at construction
/// time so that protocol revisions can be swapped without code changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    /// Protocol revision label, e.g. "7.3".
    pub version: String,
    /// Tag names that are passed through unescaped. Stored lowercase.
    pub allowed_tags: Vec<String>,
    /// Literal the model emits when it gives up; always escaped.
    pub forbidden_marker: String,
    /// Whether the trailing `serp_queries` comment block is mandatory.
    pub serp_queries_required: bool,
    /// Structural violations tolerated before the stream is failed.
    pub max_violations: usize,
}

impl ProtocolConfig {
    /// Case-insensitive allow-list lookup.
    pub fn is_allowed_tag(&self, name: &str) -> bool {
        self.allowed_tags
            .iter()
            .any(|tag| tag.eq_ignore_ascii_case(name))
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        super::defaults::default_protocol()
    }
}

// ---------------------------------------------------------------------------
// Runtime config
// ---------------------------------------------------------------------------

/// Runtime configuration that varies by environment.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub broker: BrokerConfig,
    pub concurrency: ConcurrencyConfig,
    pub heartbeat: HeartbeatConfig,
    pub upstream: UpstreamConfig,
    /// Environment label (e.g. "dev", "production").
    pub environment: String,
}

/// Event broker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// How long a terminal channel stays subscribable before retirement.
    pub retire_grace: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            retire_grace: Duration::from_secs(super::defaults::DEFAULT_RETIRE_GRACE_SECS),
        }
    }
}

/// Concurrency guard settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyConfig {
    /// Simultaneous subscriptions allowed per (user, conversation).
    pub max_per_conversation: usize,
    /// Suggested client back-off carried in rejections.
    pub retry_after_secs: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_per_conversation: super::defaults::DEFAULT_MAX_PER_CONVERSATION,
            retry_after_secs: super::defaults::DEFAULT_RETRY_AFTER_SECS,
        }
    }
}

/// Heartbeat ticker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(super::defaults::DEFAULT_HEARTBEAT_SECS),
        }
    }
}

/// Upstream provider adapter settings.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamConfig {
    /// Endpoint that accepts a prompt and streams raw model output.
    pub url: Option<String>,
    /// Maximum silence between two upstream chunks.
    pub idle_timeout: Duration,
    /// Dialect assumed when a request does not name one.
    pub dialect: Dialect,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            idle_timeout: Duration::from_millis(super::defaults::DEFAULT_IDLE_TIMEOUT_MS),
            dialect: Dialect::ThinkingMl,
        }
    }
}
