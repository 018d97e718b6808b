//! relaykv server entry point.

use clap::Parser;
use relaykv::{Config, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!(
        version = relaykv::VERSION,
        addr = %config.bind_address(),
        role = if config.is_replica() { "replica" } else { "leader" },
        "Starting relaykv"
    );

    let server = Server::bind(config).await?;
    server.run_until_ctrl_c().await
}
