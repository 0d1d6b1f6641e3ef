mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use skiff_peer::{Command, Endpoint, EndpointEvent, EngineFactory, NegotiationState, SignalingClient};
use skiff_proto::SessionId;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.peer_config();
    let id = config.identity().context("failed to resolve session id")?;
    info!(%id, relay = %config.relay_url, "starting skiff endpoint");

    let (mut client, banner) = connect_relay(&config.relay_url, &id).await?;
    println!("{banner}");
    let inbound = client
        .take_inbound()
        .context("signaling inbound stream unavailable")?;
    let factory: Arc<dyn EngineFactory> = Arc::new(config.engine_factory());
    let (endpoint, mut events) =
        Endpoint::new(id, factory, client.sender(), config.negotiation.clone());
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let driver = tokio::spawn(endpoint.run(inbound, commands_rx));

    let target = cli.call_target();
    if let Some(peer) = target.clone() {
        commands
            .send(Command::Call(peer))
            .context("endpoint stopped before the call started")?;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    let ended = report(&event);
                    if ended && target.is_some() {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                let _ = commands.send(Command::HangUp);
                break;
            }
        }
    }

    // Closing the relay link ends the endpoint loop, which releases any engine.
    drop(commands);
    drop(client);
    if tokio::time::timeout(Duration::from_secs(5), driver)
        .await
        .is_err()
    {
        info!("endpoint did not stop in time");
    }
    Ok(())
}

/// Opens the relay link; the banner is only produced once the relay accepted the socket.
async fn connect_relay(relay_url: &str, id: &SessionId) -> Result<(SignalingClient, String)> {
    let client = SignalingClient::connect(relay_url, id.clone())
        .await
        .with_context(|| format!("failed to reach relay at {relay_url}"))?;
    let banner = format!("connected to {} as {id}", client.url());
    Ok((client, banner))
}

/// Prints one event; true once a call is over.
fn report(event: &EndpointEvent) -> bool {
    match event {
        EndpointEvent::StateChanged { peer, state } => {
            println!("{peer}: {state}");
            false
        }
        EndpointEvent::RemoteTrack { peer, track } => {
            println!("{peer}: receiving {} track {}", track.kind, track.id);
            false
        }
        EndpointEvent::CallEnded { peer, state } => {
            if *state == NegotiationState::Failed {
                println!("call with {peer} did not connect");
            } else {
                println!("call with {peer} ended");
            }
            true
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
