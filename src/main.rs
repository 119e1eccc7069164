// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Bridge gateway server binary

use acp_bridge::{Server, ServerConfig};
use clap::Parser;
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address for the server (overrides HOST/PORT)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Agent launch command override (overrides BRIDGE_AGENT_CMD)
    #[arg(long)]
    agent_cmd: Option<String>,

    /// Log level when neither RUST_LOG nor LOG_LEVEL is set
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| {
            tracing_subscriber::EnvFilter::try_new(
                std::env::var("LOG_LEVEL").unwrap_or_else(|_| args.log_level.clone()),
            )
        })
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting ACP bridge gateway");

    let mut config = ServerConfig::from_env();
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(agent_cmd) = args.agent_cmd {
        config.agent_cmd = Some(agent_cmd);
    }

    let server = Server::new(config).await?;
    server.run().await?;

    Ok(())
}
