use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tether_core::Direction;
use tracing::debug;

use crate::config::ServeArgs;

#[derive(Parser, Debug)]
#[command(name = "tether-relay", version)]
#[command(about = "Tether signaling relay and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Talk to a running relay
    Debug {
        /// Relay base URL
        #[arg(short, long, default_value = "http://localhost:3000")]
        url: String,

        #[command(subcommand)]
        command: DebugCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum DebugCommands {
    /// Publish a JSON payload for a session
    Put {
        #[arg(short, long)]
        session: String,

        #[arg(short, long, value_enum, default_value_t = DirectionArg::Offer)]
        direction: DirectionArg,

        /// Raw JSON body
        payload: String,
    },

    /// Poll a session once
    Get {
        #[arg(short, long)]
        session: String,

        #[arg(short, long, value_enum, default_value_t = DirectionArg::Offer)]
        direction: DirectionArg,

        /// Largest version already seen
        #[arg(long, default_value_t = 0)]
        version: u64,
    },

    /// Show the relay's LAN address
    LocalIp,

    /// Show live record counts
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DirectionArg {
    Offer,
    Answer,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Offer => Direction::Offer,
            DirectionArg::Answer => Direction::Answer,
        }
    }
}

pub async fn run_debug_client(url: String, command: DebugCommands) -> Result<()> {
    let base = url.trim_end_matches('/');
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("failed to build http client")?;

    let request = match command {
        DebugCommands::Put {
            session,
            direction,
            payload,
        } => {
            let endpoint = format!("{base}{}", Direction::from(direction).path());
            debug!(%endpoint, %session, "publishing payload");
            client
                .post(endpoint)
                .query(&[("id", session.as_str())])
                .header(CONTENT_TYPE, "application/json")
                .body(payload)
        }
        DebugCommands::Get {
            session,
            direction,
            version,
        } => {
            let endpoint = format!("{base}{}", Direction::from(direction).path());
            debug!(%endpoint, %session, version, "polling");
            client
                .get(endpoint)
                .query(&[("id", session), ("version", version.to_string())])
        }
        DebugCommands::LocalIp => client.get(format!("{base}/api/local-ip")),
        DebugCommands::Stats => client.get(format!("{base}/debug/stats")),
    };

    let response = request
        .send()
        .await
        .with_context(|| format!("request to {base} failed - is the relay running?"))?;
    let status = response.status();
    let body = response.text().await.context("failed to read response body")?;
    println!("{status}");
    println!("{body}");
    Ok(())
}
