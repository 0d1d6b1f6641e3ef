use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use skiff_proto::{Envelope, EnvelopeKind, SessionId};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::config::{DEFAULT_LISTEN_ADDR, DEFAULT_MAX_MESSAGE_BYTES};
use crate::registry::CollisionPolicy;

#[derive(Parser, Debug)]
#[command(name = "skiff-relay", version)]
#[command(about = "Skiff signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address the WebSocket listener binds to.
    #[arg(long, env = "SKIFF_RELAY_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// How a second registration of a taken session id is handled.
    #[arg(
        long,
        env = "SKIFF_RELAY_COLLISION_POLICY",
        value_enum,
        default_value_t = CollisionPolicy::Replace
    )]
    pub collision_policy: CollisionPolicy,

    /// Messages larger than this are dropped as malformed.
    #[arg(long, env = "SKIFF_RELAY_MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a relay, register, optionally send one envelope and print what arrives
    Probe(ProbeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    /// Relay URL (e.g., ws://localhost:3001)
    #[arg(short, long, default_value = "ws://localhost:3001")]
    pub url: String,

    /// Session id to register; generated when omitted
    #[arg(long)]
    pub id: Option<String>,

    /// Target session id for the envelope to send
    #[arg(long)]
    pub to: Option<String>,

    /// Envelope type to send to the target
    #[arg(long, value_parser = parse_kind, default_value = "ice")]
    pub kind: EnvelopeKind,

    /// JSON payload of the envelope
    #[arg(long, default_value = "{}")]
    pub payload: String,

    /// Seconds to keep listening for forwarded envelopes
    #[arg(long, default_value_t = 5)]
    pub wait: u64,
}

fn parse_kind(value: &str) -> Result<EnvelopeKind, String> {
    match value {
        "offer" => Ok(EnvelopeKind::Offer),
        "answer" => Ok(EnvelopeKind::Answer),
        "ice" => Ok(EnvelopeKind::Ice),
        other => Err(format!("unsupported envelope type {other}; use offer, answer or ice")),
    }
}

pub async fn run_probe(args: ProbeArgs) -> Result<()> {
    let id = args
        .id
        .map(SessionId::from)
        .unwrap_or_else(SessionId::generate);
    debug!(url = %args.url, session_id = %id, "probe connecting");

    let (ws_stream, _) = timeout(Duration::from_secs(5), connect_async(args.url.as_str()))
        .await
        .context("connection timeout - is the relay running?")?
        .with_context(|| format!("failed to connect to {}", args.url))?;
    let (mut write, mut read) = ws_stream.split();

    let register = Envelope::register(&id).to_text()?;
    write.send(Message::text(register)).await?;
    println!("registered as {id}");

    if let Some(to) = args.to.map(SessionId::from) {
        let payload: serde_json::Value =
            serde_json::from_str(&args.payload).context("payload must be valid JSON")?;
        let envelope = Envelope::new(args.kind, payload, Some(to.clone()));
        envelope.validate()?;
        write.send(Message::text(envelope.to_text()?)).await?;
        println!("sent {} to {to}", args.kind.as_str());
    }

    let deadline = Instant::now() + Duration::from_secs(args.wait);
    let pretty = std::io::stdout().is_terminal();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match Envelope::parse(text.as_str()) {
                Ok(envelope) => print_envelope(&envelope, pretty)?,
                Err(err) => warn!(error = %err, "relay sent an unparseable frame"),
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(err))) => return Err(err.into()),
            Err(_) => break,
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}

fn print_envelope(envelope: &Envelope, pretty: bool) -> Result<()> {
    let rendered = if pretty {
        serde_json::to_string_pretty(envelope)?
    } else {
        serde_json::to_string(envelope)?
    };
    println!("{rendered}");
    Ok(())
}
