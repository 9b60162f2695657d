// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// Relay config loader and validator.
//
// Loads relay.yaml, resolves the protocol profile, applies overrides,
// resolves ${VAR} interpolation and computes a deterministic contract hash.

mod defaults;
mod error;
mod interpolation;
mod loader;
mod raw;
mod source;
mod types;

pub use defaults::{
    protocol_profile, DEFAULT_FORBIDDEN_MARKER, DEFAULT_PROTOCOL_VERSION,
    KNOWN_PROTOCOL_VERSIONS,
};
pub use error::ConfigError;
pub use interpolation::resolve_variables;
pub use loader::{compute_hash, load_config};
pub use source::{ConfigSource, FileSource, StringSource};
pub use types::*;

#[cfg(test)]
mod tests;
