// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::transcode::Dialect;

use super::defaults::{
    protocol_profile, DEFAULT_PROTOCOL_VERSION, KNOWN_PROTOCOL_VERSIONS,
};
use super::error::ConfigError;
use super::interpolation::resolve_variables;
use super::raw;
use super::source::ConfigSource;
use super::types::*;

/// Load and validate a relay config from the given source.
///
/// Steps:
/// 1. Read raw YAML from source
/// 2. Compute SHA256 contract hash
/// 3. Parse YAML into raw deserialization types
/// 4. Resolve the protocol profile and apply overrides
/// 5. Resolve variable interpolation in string fields
/// 6. Validate ranges and build the typed Config
pub fn load_config(source: &dyn ConfigSource) -> Result<Config, ConfigError> {
    let raw_yaml = source.load()?;
    let contract_hash = compute_hash(&raw_yaml);

    let raw: raw::RawConfig = serde_yaml::from_str(&raw_yaml)?;

    if raw.relay != "v1" {
        return Err(ConfigError::Validation(format!(
            "unsupported config version \"{}\", expected \"v1\"",
            raw.relay
        )));
    }

    let protocol = build_protocol_config(raw.protocol)?;
    let runtime = RuntimeConfig {
        broker: build_broker_config(raw.broker),
        concurrency: build_concurrency_config(raw.concurrency)?,
        heartbeat: build_heartbeat_config(raw.heartbeat)?,
        upstream: build_upstream_config(raw.upstream)?,
        environment: match raw.environment {
            Some(env) => resolve_variables(&env)?,
            None => String::new(),
        },
    };

    Ok(Config {
        protocol,
        runtime,
        contract_hash,
    })
}

pub fn compute_hash(raw_yaml: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_yaml.as_bytes());
    let hash = hasher.finalize();
    format!("sha256:{:x}", hash)
}

fn build_protocol_config(
    raw: Option<raw::RawProtocolConfig>,
) -> Result<ProtocolConfig, ConfigError> {
    let Some(raw) = raw else {
        return Ok(ProtocolConfig::default());
    };

    let version = raw
        .version
        .unwrap_or_else(|| DEFAULT_PROTOCOL_VERSION.to_string());
    let mut protocol =
        protocol_profile(&version).ok_or_else(|| ConfigError::UnknownProtocol {
            version: version.clone(),
            known: KNOWN_PROTOCOL_VERSIONS.join(", "),
        })?;

    if let Some(tags) = raw.allowed_tags {
        let mut normalized = Vec::with_capacity(tags.len());
        for tag in tags {
            if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(ConfigError::Validation(format!(
                    "allowed tag \"{tag}\" must be non-empty ASCII letters"
                )));
            }
            normalized.push(tag.to_ascii_lowercase());
        }
        for required in ["thinking", "final"] {
            if !normalized.iter().any(|t| t == required) {
                return Err(ConfigError::Validation(format!(
                    "allowed_tags must include \"{required}\""
                )));
            }
        }
        protocol.allowed_tags = normalized;
    }

    if let Some(marker) = raw.forbidden_marker {
        if marker.is_empty() {
            return Err(ConfigError::Validation(
                "forbidden_marker must not be empty".into(),
            ));
        }
        protocol.forbidden_marker = marker;
    }

    if let Some(required) = raw.serp_queries_required {
        protocol.serp_queries_required = required;
    }

    if let Some(max) = raw.max_violations {
        if max == 0 {
            return Err(ConfigError::Validation(
                "max_violations must be at least 1".into(),
            ));
        }
        protocol.max_violations = max;
    }

    Ok(protocol)
}

fn build_broker_config(raw: Option<raw::RawBrokerConfig>) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    if let Some(secs) = raw.and_then(|r| r.retire_grace_secs) {
        config.retire_grace = Duration::from_secs(secs);
    }
    config
}

fn build_concurrency_config(
    raw: Option<raw::RawConcurrencyConfig>,
) -> Result<ConcurrencyConfig, ConfigError> {
    let mut config = ConcurrencyConfig::default();
    let Some(raw) = raw else {
        return Ok(config);
    };
    if let Some(max) = raw.max_per_conversation {
        if max == 0 {
            return Err(ConfigError::Validation(
                "concurrency.max_per_conversation must be at least 1".into(),
            ));
        }
        config.max_per_conversation = max;
    }
    if let Some(secs) = raw.retry_after_secs {
        config.retry_after_secs = secs;
    }
    Ok(config)
}

fn build_heartbeat_config(
    raw: Option<raw::RawHeartbeatConfig>,
) -> Result<HeartbeatConfig, ConfigError> {
    let mut config = HeartbeatConfig::default();
    if let Some(secs) = raw.and_then(|r| r.interval_secs) {
        if secs == 0 {
            return Err(ConfigError::Validation(
                "heartbeat.interval_secs must be at least 1".into(),
            ));
        }
        config.interval = Duration::from_secs(secs);
    }
    Ok(config)
}

fn build_upstream_config(
    raw: Option<raw::RawUpstreamConfig>,
) -> Result<UpstreamConfig, ConfigError> {
    let mut config = UpstreamConfig::default();
    let Some(raw) = raw else {
        return Ok(config);
    };
    if let Some(url) = raw.url {
        config.url = Some(resolve_variables(&url)?);
    }
    if let Some(ms) = raw.idle_timeout_ms {
        if ms == 0 {
            return Err(ConfigError::Validation(
                "upstream.idle_timeout_ms must be positive".into(),
            ));
        }
        config.idle_timeout = Duration::from_millis(ms);
    }
    if let Some(name) = raw.dialect {
        config.dialect = Dialect::parse(&name).ok_or_else(|| {
            ConfigError::Validation(format!(
                "unknown upstream dialect \"{name}\", expected text, thinkingml or jsonseq"
            ))
        })?;
    }
    Ok(config)
}
