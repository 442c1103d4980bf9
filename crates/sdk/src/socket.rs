//! WebSocket transport with automatic reconnect.

use crate::config::ClientConfig;
use crate::error::{NventError, NventResult};
use futures_util::{SinkExt, StreamExt};
use nvent_core::types::FlowEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Frames sent to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsRequest {
    Subscribe {
        #[serde(rename = "flowName")]
        flow_name: String,
        #[serde(rename = "runId")]
        run_id: String,
    },
    Ping,
}

/// Frames received from the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsFrame {
    History { events: Vec<FlowEvent> },
    Event { event: FlowEvent },
    Pong,
    Error { message: String },
}

/// Items surfaced to the consumer of a run subscription.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Bounded backfill, oldest first. Arrives once per (re)connect.
    History(Vec<FlowEvent>),
    /// One live event, in persistence order.
    Event(FlowEvent),
    /// The connection dropped and was re-established; history follows.
    Reconnected { attempt: u32 },
    /// Server-side subscription error.
    Error(String),
}

/// A live subscription to one run's event feed.
///
/// The driver task keeps the connection alive: on a drop it backs off
/// (1 s doubling to 10 s, jittered), reconnects, and resubscribes. The
/// consumer just reads `next()`.
pub struct FlowSocket {
    events: mpsc::Receiver<SocketEvent>,
}

impl FlowSocket {
    pub async fn subscribe(
        config: Arc<ClientConfig>,
        flow_name: impl Into<String>,
        run_id: impl Into<String>,
    ) -> NventResult<Self> {
        let url = ws_url(&config.base_url)?;
        let (tx, rx) = mpsc::channel(256);

        let driver = Driver {
            config,
            url,
            flow_name: flow_name.into(),
            run_id: run_id.into(),
            events: tx,
        };
        tokio::spawn(driver.run());

        Ok(Self { events: rx })
    }

    /// Next item from the feed; `None` once the driver gives up (only
    /// when the consumer side closed).
    pub async fn next(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }
}

struct Driver {
    config: Arc<ClientConfig>,
    url: Url,
    flow_name: String,
    run_id: String,
    events: mpsc::Sender<SocketEvent>,
}

impl Driver {
    async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            match self.session().await {
                SessionEnd::ConsumerGone => return,
                SessionEnd::Disconnected => {
                    let delay = self.config.reconnect.delay_for_attempt(attempt);
                    tracing::debug!(attempt, ?delay, "websocket disconnected, reconnecting");
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                    if self
                        .events
                        .send(SocketEvent::Reconnected { attempt })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                SessionEnd::Connected => {
                    // A full session ran; start the backoff ladder over.
                    attempt = 0;
                }
            }
        }
    }

    /// One connect-subscribe-read cycle.
    async fn session(&self) -> SessionEnd {
        let stream = match connect_async(self.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                tracing::debug!(error = %e, "websocket connect failed");
                return SessionEnd::Disconnected;
            }
        };
        let (mut write, mut read) = stream.split();

        let subscribe = WsRequest::Subscribe {
            flow_name: self.flow_name.clone(),
            run_id: self.run_id.clone(),
        };
        let frame = match serde_json::to_string(&subscribe) {
            Ok(json) => Message::Text(json.into()),
            Err(e) => {
                let _ = self.events.send(SocketEvent::Error(e.to_string())).await;
                return SessionEnd::ConsumerGone;
            }
        };
        if write.send(frame).await.is_err() {
            return SessionEnd::Disconnected;
        }

        let mut delivered = false;
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let frame = match serde_json::from_str::<WsFrame>(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::debug!(error = %e, "undecodable websocket frame");
                            continue;
                        }
                    };
                    let event = match frame {
                        WsFrame::History { events } => SocketEvent::History(events),
                        WsFrame::Event { event } => SocketEvent::Event(event),
                        WsFrame::Pong => continue,
                        WsFrame::Error { message } => SocketEvent::Error(message),
                    };
                    delivered = true;
                    if self.events.send(event).await.is_err() {
                        return SessionEnd::ConsumerGone;
                    }
                }
                Ok(Message::Ping(_)) => {
                    // Handled by the protocol layer.
                }
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "websocket closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "websocket read error");
                    break;
                }
            }
        }

        if delivered {
            SessionEnd::Connected
        } else {
            SessionEnd::Disconnected
        }
    }
}

enum SessionEnd {
    /// Session delivered traffic before dropping; reconnect immediately
    /// with a fresh backoff ladder.
    Connected,
    /// Never got going; back off before the next try.
    Disconnected,
    /// The consumer dropped the socket; stop driving.
    ConsumerGone,
}

fn ws_url(base: &Url) -> NventResult<Url> {
    let mut url = base.clone();
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(NventError::Config(format!(
                "unsupported scheme for websocket: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| NventError::Config("failed to set websocket scheme".to_string()))?;
    url.set_path("/api/_flows/ws");
    Ok(url)
}
