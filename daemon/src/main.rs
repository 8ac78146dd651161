// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::Context;
use lantern_daemon::{Config, Daemon};
use tracing_subscriber::EnvFilter;

fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LANTERN_CONFIG").ok())
        .context("usage: lantern <config.toml> (or set LANTERN_CONFIG)")?;
    let config = Config::load(&config_path)
        .with_context(|| format!("loading config from {config_path}"))?;

    let daemon = Daemon::start(config).await?;
    daemon.wait().await;
    daemon.shutdown().await;
    Ok(())
}
