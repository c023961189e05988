mod session;

use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tether_peer::{NegotiationConfig, WebRtcConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Pair two machines over WebRTC through a Tether relay")]
struct Cli {
    #[command(flatten)]
    pairing: PairingArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Wait for a controller and answer its offer.
    Host {
        /// Reuse a known session id instead of generating one.
        #[arg(long)]
        id: Option<String>,
    },
    /// Join a host by session id and send the offer.
    Controller {
        #[arg(long)]
        id: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct PairingArgs {
    #[arg(long, env = "TETHER_RELAY_URL", default_value = "http://localhost:3000", global = true)]
    pub relay: String,

    #[arg(long, env = "TETHER_POLL_INTERVAL_MS", default_value_t = 2000, global = true)]
    pub poll_interval_ms: u64,

    /// Give up pairing after this many seconds; 0 waits forever.
    #[arg(long, env = "TETHER_TIMEOUT_SECS", default_value_t = 300, global = true)]
    pub timeout_secs: u64,

    /// STUN server url; repeat for more. Defaults to a public STUN server.
    #[arg(long = "stun", env = "TETHER_STUN", value_delimiter = ',', global = true)]
    pub stun: Vec<String>,
}

impl PairingArgs {
    fn negotiation(&self) -> NegotiationConfig {
        NegotiationConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            timeout: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
        }
    }

    fn rtc(&self) -> WebRtcConfig {
        let mut config = WebRtcConfig::default();
        if !self.stun.is_empty() {
            config.ice_servers = self.stun.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let negotiation = cli.pairing.negotiation();
    let rtc = cli.pairing.rtc();

    match cli.command {
        Commands::Host { id } => session::host(&cli.pairing.relay, id, negotiation, rtc).await,
        Commands::Controller { id } => {
            session::controller(&cli.pairing.relay, &id, negotiation, rtc).await
        }
    }
}
