use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tether_core::{LocalIpResponse, SessionId};
use tether_peer::{
    negotiate, Connection, ConnectionEvent, HttpRelay, NegotiationConfig, NegotiationHandle,
    PeerBackend, Role, WebRtcBackend, WebRtcConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use url::{Host, Url};

pub async fn host(
    relay_url: &str,
    id: Option<String>,
    negotiation: NegotiationConfig,
    rtc: WebRtcConfig,
) -> Result<()> {
    let session = match id {
        Some(raw) => SessionId::parse(&raw).ok_or_else(|| anyhow!("invalid session id {raw:?}"))?,
        None => SessionId::generate(),
    };
    let relay = HttpRelay::new(relay_url).context("invalid relay url")?;

    eprintln!("session id: {session}");
    match join_hints(&relay, relay_url, &session).await {
        Ok(hints) => {
            eprintln!("join with:  {}", hints.command);
            if let Some(page) = hints.pairing_page {
                eprintln!("web pairing page: {page}");
            }
        }
        Err(err) => warn!(error = %err, "could not look up the relay's LAN address"),
    }
    eprintln!("waiting for a controller...");

    let handle = negotiate(relay, WebRtcBackend::new(rtc), session, Role::Responder, negotiation);
    chat(handle).await
}

pub async fn controller(
    relay_url: &str,
    id: &str,
    negotiation: NegotiationConfig,
    rtc: WebRtcConfig,
) -> Result<()> {
    let session = SessionId::parse(id).ok_or_else(|| anyhow!("invalid session id {id:?}"))?;
    let relay = HttpRelay::new(relay_url).context("invalid relay url")?;

    eprintln!("connecting to session {session}...");
    let handle = negotiate(relay, WebRtcBackend::new(rtc), session, Role::Initiator, negotiation);
    chat(handle).await
}

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// How a controller on another machine reaches this session.
#[derive(Debug, PartialEq, Eq)]
struct JoinHints {
    command: String,
    /// Browser pairing page, only when the relay advertises a public url.
    pairing_page: Option<String>,
}

async fn join_hints(relay: &HttpRelay, relay_url: &str, session: &SessionId) -> Result<JoinHints> {
    let client = reqwest::Client::builder().timeout(LOOKUP_TIMEOUT).build()?;
    let body: LocalIpResponse = client
        .get(relay.url("/api/local-ip"))
        .send()
        .await
        .context("local ip request failed")?
        .json()
        .await
        .context("local ip response was not json")?;
    let relay_url = Url::parse(relay_url).context("invalid relay url")?;
    Ok(hints_for(&relay_url, body, session))
}

/// A relay reached over loopback is advertised under the machine's LAN address.
fn hints_for(relay: &Url, body: LocalIpResponse, session: &SessionId) -> JoinHints {
    let mut advertised = relay.clone();
    if is_loopback(relay) && advertised.set_host(Some(&body.ip)).is_err() {
        advertised = relay.clone();
    }
    let advertised = advertised.as_str().trim_end_matches('/');
    JoinHints {
        command: format!("tether controller --relay {advertised} --id {session}"),
        pairing_page: body
            .public_url
            .map(|url| format!("{}/mobile?id={session}", url.trim_end_matches('/'))),
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Wait for pairing, then relay stdin lines to the peer and print what it sends.
async fn chat<B: PeerBackend>(handle: NegotiationHandle<B>) -> Result<()> {
    let cancel = handle.cancellation();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = match handle.connected().await {
        Ok(connection) => {
            interrupt.abort();
            exchange(connection).await
        }
        Err(err) => Err(err).context("pairing failed"),
    };
    interrupt.abort();
    result
}

async fn exchange<B: PeerBackend>(mut connection: Connection<B>) -> Result<()> {
    eprintln!("connected; type a line and press enter to send it");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(line) => connection.send(line).await.context("send failed")?,
                None => break,
            },
            event = connection.recv() => match event {
                Some(ConnectionEvent::Data(data)) => println!("{}", String::from_utf8_lossy(&data)),
                Some(ConnectionEvent::Closed) | None => {
                    eprintln!("peer closed the connection");
                    return Ok(());
                }
                Some(ConnectionEvent::Error(err)) => return Err(err).context("connection failed"),
            },
        }
    }

    connection.close().await;
    Ok(())
}
