use anyhow::Result;
use clap::Parser;
use tether_relay::{
    cli::{self, Cli, Commands},
    telemetry::{self, Telemetry},
    RelayConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Debug { url, command }) = cli.command {
        telemetry::init_client_logging();
        return cli::run_debug_client(url, command).await;
    }

    let telemetry = Telemetry::init()?;
    let config = RelayConfig::try_from(cli.serve)?;
    tether_relay::run(config, telemetry.metrics_handle()).await
}
