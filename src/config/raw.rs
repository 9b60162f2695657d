// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// Raw YAML deserialization types (internal).
// Kept apart from the public config because durations, dialects and
// protocol profiles are resolved and validated between raw and typed.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub relay: String,
    pub protocol: Option<RawProtocolConfig>,
    pub broker: Option<RawBrokerConfig>,
    pub concurrency: Option<RawConcurrencyConfig>,
    pub heartbeat: Option<RawHeartbeatConfig>,
    pub upstream: Option<RawUpstreamConfig>,
    pub environment: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawProtocolConfig {
    pub version: Option<String>,
    pub allowed_tags: Option<Vec<String>>,
    pub forbidden_marker: Option<String>,
    pub serp_queries_required: Option<bool>,
    pub max_violations: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawBrokerConfig {
    pub retire_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConcurrencyConfig {
    pub max_per_conversation: Option<usize>,
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawHeartbeatConfig {
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawUpstreamConfig {
    pub url: Option<String>,
    pub idle_timeout_ms: Option<u64>,
    pub dialect: Option<String>,
}
