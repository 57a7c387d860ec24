use anyhow::Result;
use clap::Parser;
use relaymail::cli::{Cli, CliHandler};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "relaymail=debug" } else { "relaymail=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let handler = CliHandler::new(cli.config).await?;
    handler.handle_command(cli.command).await
}
