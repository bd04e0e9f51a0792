//! Talkback server binary

#![forbid(unsafe_code)]

use anyhow::Context;
use std::time::Duration;
use talkback::server::{self, AppState};
use talkback::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("loading configuration")?;
    info!(
        "Starting talkback on {} (model {}, {} pooled recognizers)",
        config.bind_addr, config.llm.model, config.stt.pool_size
    );

    let state = AppState::from_config(&config);
    let sweep_period = (config.playback_idle_timeout / 4).max(Duration::from_secs(1));
    let _sweeper = state.playback().spawn_sweeper(sweep_period);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!("🚀 Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, server::router(state))
        .await
        .context("server error")?;
    Ok(())
}
