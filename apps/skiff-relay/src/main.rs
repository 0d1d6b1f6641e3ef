use anyhow::Result;
use clap::Parser;
use tracing::info;

use skiff_relay::cli::{self, Cli, Commands};
use skiff_relay::config::RelayConfig;
use skiff_relay::server;
use skiff_relay::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();

    if let Some(Commands::Probe(args)) = cli.command {
        return cli::run_probe(args).await;
    }

    let config = RelayConfig::try_from(cli.serve)?;
    info!(listen_addr = %config.listen_addr, "starting skiff relay");
    server::run(config, telemetry.metrics_handle()).await
}
