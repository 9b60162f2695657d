// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

pub mod broker;
pub mod config;
pub mod event;
pub mod guard;
pub mod heartbeat;
pub mod relay;
pub mod server;
pub mod transcode;
pub mod upstream;
