// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::transcode::Dialect;
use std::io::Write;
use std::time::Duration;

fn load(yaml: &str) -> Result<Config, ConfigError> {
    load_config(&StringSource::new(yaml))
}

const FULL_YAML: &str = r#"relay: v1
protocol:
  version: "7.0"
  forbidden_marker: "[[GIVE_UP]]"
  serp_queries_required: true
  max_violations: 8
broker:
  retire_grace_secs: 5
concurrency:
  max_per_conversation: 2
  retry_after_secs: 9
heartbeat:
  interval_secs: 3
upstream:
  url: "http://127.0.0.1:7000/generate"
  idle_timeout_ms: 1500
  dialect: jsonseq
environment: "test"
"#;

// ---------------------------------------------------------------------------
// Happy paths
// ---------------------------------------------------------------------------

#[test]
fn minimal_config_uses_defaults() {
    let config = load("relay: v1\n").unwrap();

    assert_eq!(config.protocol, ProtocolConfig::default());
    assert_eq!(config.runtime.concurrency.max_per_conversation, 1);
    assert_eq!(config.runtime.heartbeat.interval, Duration::from_secs(15));
    assert_eq!(config.runtime.upstream.dialect, Dialect::ThinkingMl);
    assert!(config.runtime.upstream.url.is_none());
    assert!(config.contract_hash.starts_with("sha256:"));
}

#[test]
fn full_config_overrides_everything() {
    let config = load(FULL_YAML).unwrap();

    assert_eq!(config.protocol.version, "7.0");
    assert_eq!(config.protocol.forbidden_marker, "[[GIVE_UP]]");
    assert!(config.protocol.serp_queries_required);
    assert_eq!(config.protocol.max_violations, 8);
    assert!(config.protocol.is_allowed_tag("serp"));

    assert_eq!(config.runtime.broker.retire_grace, Duration::from_secs(5));
    assert_eq!(config.runtime.concurrency.max_per_conversation, 2);
    assert_eq!(config.runtime.concurrency.retry_after_secs, 9);
    assert_eq!(config.runtime.heartbeat.interval, Duration::from_secs(3));
    assert_eq!(
        config.runtime.upstream.url.as_deref(),
        Some("http://127.0.0.1:7000/generate")
    );
    assert_eq!(
        config.runtime.upstream.idle_timeout,
        Duration::from_millis(1500)
    );
    assert_eq!(config.runtime.upstream.dialect, Dialect::JsonSeq);
    assert_eq!(config.runtime.environment, "test");
}

#[test]
fn allowed_tags_override_is_lowercased() {
    let config = load(
        "relay: v1\nprotocol:\n  allowed_tags: [Thinking, FINAL, Phase, Title]\n",
    )
    .unwrap();
    assert_eq!(
        config.protocol.allowed_tags,
        vec!["thinking", "final", "phase", "title"]
    );
    assert!(!config.protocol.is_allowed_tag("serp"));
}

#[test]
fn contract_hash_is_deterministic() {
    let a = load(FULL_YAML).unwrap();
    let b = load(FULL_YAML).unwrap();
    let c = load("relay: v1\n").unwrap();
    assert_eq!(a.contract_hash, b.contract_hash);
    assert_ne!(a.contract_hash, c.contract_hash);
}

#[test]
fn loads_from_file_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(FULL_YAML.as_bytes()).unwrap();

    let config = load_config(&FileSource::new(&path)).unwrap();
    assert_eq!(config.runtime.environment, "test");
}

#[test]
fn upstream_url_interpolated_with_fallback() {
    let config = load(
        "relay: v1\nupstream:\n  url: \"${PARAPET_RELAY_TEST_UNSET_URL:-http://localhost:1/x}\"\n",
    )
    .unwrap();
    assert_eq!(
        config.runtime.upstream.url.as_deref(),
        Some("http://localhost:1/x")
    );
}

// ---------------------------------------------------------------------------
// Validation failures
// ---------------------------------------------------------------------------

#[test]
fn wrong_config_version_rejected() {
    let err = load("relay: v2\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
    assert!(err.to_string().contains("v2"));
}

#[test]
fn unknown_protocol_version_rejected() {
    let err = load("relay: v1\nprotocol:\n  version: \"5.1\"\n").unwrap_err();
    match err {
        ConfigError::UnknownProtocol { version, known } => {
            assert_eq!(version, "5.1");
            assert!(known.contains("7.3"));
        }
        other => panic!("expected UnknownProtocol, got {other:?}"),
    }
}

#[test]
fn non_letter_tag_rejected() {
    let err = load("relay: v1\nprotocol:\n  allowed_tags: [thinking, final, serp_queries]\n")
        .unwrap_err();
    assert!(err.to_string().contains("serp_queries"));
}

#[test]
fn allowed_tags_must_keep_structural_tags() {
    let err = load("relay: v1\nprotocol:\n  allowed_tags: [thinking, phase]\n").unwrap_err();
    assert!(err.to_string().contains("final"));
}

#[test]
fn zero_limits_rejected() {
    assert!(load("relay: v1\nconcurrency:\n  max_per_conversation: 0\n").is_err());
    assert!(load("relay: v1\nheartbeat:\n  interval_secs: 0\n").is_err());
    assert!(load("relay: v1\nprotocol:\n  max_violations: 0\n").is_err());
    assert!(load("relay: v1\nupstream:\n  idle_timeout_ms: 0\n").is_err());
}

#[test]
fn unknown_dialect_rejected() {
    let err = load("relay: v1\nupstream:\n  dialect: protobuf\n").unwrap_err();
    assert!(err.to_string().contains("protobuf"));
}

#[test]
fn unknown_fields_rejected() {
    let err = load("relay: v1\nbrokr:\n  retire_grace_secs: 1\n").unwrap_err();
    assert!(matches!(err, ConfigError::YamlError(_)));
}

#[test]
fn missing_file_is_io_error() {
    let err = load_config(&FileSource::new("/nonexistent/relay.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::IoError(_)));
}
