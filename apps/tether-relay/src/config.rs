use anyhow::Context;
use clap::Args;
use std::net::SocketAddr;
use std::time::Duration;
use tether_core::{OverwritePolicy, StoreConfig};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub store: StoreConfig,
    pub sweep_interval: Duration,
    /// Base URL printed in join links; falls back to the LAN address.
    pub public_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            store: StoreConfig::default(),
            sweep_interval: Duration::from_secs(30),
            public_url: None,
        }
    }
}

/// Server flags, each with an environment fallback.
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address the HTTP listener binds to.
    #[arg(long, env = "TETHER_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// Seconds since the last write after which a pending payload is dropped.
    #[arg(long, env = "TETHER_RELAY_SESSION_TTL_SECS", default_value_t = 600)]
    pub session_ttl_secs: u64,

    /// How often expired payloads are swept.
    #[arg(long, env = "TETHER_RELAY_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// `keep-delivered` or `redeliver`.
    #[arg(long, env = "TETHER_RELAY_OVERWRITE_POLICY", default_value = "keep-delivered")]
    pub overwrite_policy: String,

    #[arg(long, env = "TETHER_RELAY_PUBLIC_URL")]
    pub public_url: Option<String>,
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.session_ttl_secs == 0 {
            anyhow::bail!("session TTL must be at least one second");
        }
        if args.sweep_interval_secs == 0 {
            anyhow::bail!("sweep interval must be at least one second");
        }
        let overwrite_policy: OverwritePolicy = args.overwrite_policy.parse()?;
        let public_url = args
            .public_url
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        Ok(RelayConfig {
            listen_addr,
            store: StoreConfig {
                ttl: Duration::from_secs(args.session_ttl_secs),
                overwrite_policy,
            },
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
            public_url,
        })
    }
}
