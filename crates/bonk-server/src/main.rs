use anyhow::Result;
use bonk_server::bootstrap::init_tracing;
use bonk_server::cli::Cli;
use bonk_server::config::ServerConfig;
use bonk_server::server::run_server;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ServerConfig::from_cli(&cli)?;
    run_server(config).await
}
