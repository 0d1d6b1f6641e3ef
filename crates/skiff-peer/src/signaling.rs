use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use skiff_proto::{Envelope, EnvelopeError, SessionId};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("websocket connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("signaling connection closed")]
    Closed,
}

/// WebSocket link to the relay, registered under one session id.
///
/// Outbound envelopes go through [`SignalingClient::sender`]; inbound ones
/// arrive on the receiver handed out once by [`SignalingClient::take_inbound`].
/// Frames that do not parse as envelopes are dropped.
#[derive(Debug)]
pub struct SignalingClient {
    id: SessionId,
    url: Url,
    outbound: mpsc::UnboundedSender<Envelope>,
    inbound: Option<mpsc::UnboundedReceiver<Envelope>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingClient {
    pub async fn connect(relay_url: &str, id: SessionId) -> Result<Self, SignalingError> {
        let url = websocket_url(relay_url)?;
        let (stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| SignalingError::ConnectTimeout(url.to_string()))?
            .map_err(|err| SignalingError::Connect {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        tracing::debug!(target = "skiff::signaling", url = %url, id = %id, "relay websocket connected");
        let (mut ws_write, mut ws_read) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Envelope>();

        // Registration goes out before anything queued by the caller.
        outbound
            .send(Envelope::register(&id))
            .map_err(|_| SignalingError::Closed)?;

        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let text = match envelope.to_text() {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "skiff::signaling", error = %err, "failed to encode envelope");
                        continue;
                    }
                };
                tracing::trace!(
                    target = "skiff::signaling",
                    event = "ws_out",
                    kind = envelope.kind.as_str(),
                    len = text.len()
                );
                if ws_write.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::debug!(target = "skiff::signaling", len = data.len(), "non-utf8 frame dropped");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "skiff::signaling", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "skiff::signaling", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                match Envelope::parse(&text) {
                    Ok(envelope) => {
                        tracing::trace!(
                            target = "skiff::signaling",
                            event = "ws_in",
                            kind = envelope.kind.as_str(),
                            from = ?envelope.from
                        );
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(target = "skiff::signaling", error = %err, "malformed envelope dropped")
                    }
                }
            }
        });

        Ok(Self {
            id,
            url,
            outbound,
            inbound: Some(inbound),
            tasks: vec![writer, reader],
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Envelope> {
        self.outbound.clone()
    }

    pub fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        self.outbound
            .send(envelope)
            .map_err(|_| SignalingError::Closed)
    }

    /// The inbound stream; `None` after the first call.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        self.inbound.take()
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

/// Accepts `ws`/`wss` as given and maps `http`/`https` onto them.
pub fn websocket_url(relay_url: &str) -> Result<Url, SignalingError> {
    let invalid = |reason: String| SignalingError::InvalidUrl {
        url: relay_url.to_owned(),
        reason,
    };
    let mut url = Url::parse(relay_url).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("invalid websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}
