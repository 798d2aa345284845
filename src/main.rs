// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use restitch::config::Config;
use restitch::proxy;
use restitch::upstream::{HttpSender, ReqwestHttpSender};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "restitch",
    about = "Anti-truncation streaming proxy for Gemini-compatible APIs"
)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    tracing_subscriber::fmt()
        .json()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_max_level(if config.debug_mode {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    tracing::info!(
        upstreams = config.upstream_bases.len(),
        antiblock_prefixes = ?config.antiblock_model_prefixes,
        max_retries = config.max_consecutive_retries,
        retry_delay_ms = config.retry_delay.as_millis() as u64,
        rate_limit = config.enable_rate_limit,
        punctuation_heuristic = config.enable_punctuation_heuristic,
        "restitch starting"
    );

    let config = Arc::new(config);
    let http: Arc<dyn HttpSender> = Arc::new(ReqwestHttpSender::default());
    let state = proxy::build_state(config.clone(), http);

    // Reap idle rate buckets in the background.
    {
        let limiter = state.limiter.clone();
        let period = config.rate_limit_window.max(Duration::from_secs(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                limiter.prune_idle();
            }
        });
    }

    let app = proxy::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind to address");

    tracing::info!(%addr, "restitch listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}
