// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use parapet_relay::config;
use parapet_relay::server;
use parapet_relay::upstream::{HttpUpstream, UnconfiguredUpstream, UpstreamSource};
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "parapet-relay", about = "Streaming chat-completion relay")]
struct Cli {
    /// Path to the relay.yaml config file
    #[arg(long, default_value = "relay.yaml", env = "RELAY_CONFIG")]
    config: String,

    /// Port to listen on
    #[arg(long, default_value_t = server::BIND_ADDR.1, env = "RELAY_PORT")]
    port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let addr = SocketAddr::from((server::BIND_ADDR.0, cli.port));
    tracing::info!(%addr, "relay starting");

    let source = config::FileSource::new(cli.config);
    let config = match config::load_config(&source) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let upstream_config = &config.runtime.upstream;
    tracing::info!(
        protocol = %config.protocol.version,
        environment = %config.runtime.environment,
        dialect = ?upstream_config.dialect,
        upstream = upstream_config.url.as_deref().unwrap_or("<none>"),
        contract_hash = %config.contract_hash,
        "config loaded"
    );

    let upstream: Arc<dyn UpstreamSource> = match &upstream_config.url {
        Some(url) => Arc::new(HttpUpstream::new(
            reqwest::Client::new(),
            url.clone(),
            upstream_config.idle_timeout,
        )),
        None => {
            tracing::warn!("no upstream url configured; every message will fail");
            Arc::new(UnconfiguredUpstream)
        }
    };

    let app = server::build_router(server::AppState::new(Arc::clone(&config), upstream));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind to address");

    tracing::info!(%addr, "relay listening");

    axum::serve(listener, app)
        .await
        .expect("server error");
}
