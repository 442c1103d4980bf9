use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use nvent_core::storage::ReadOptions;
use nvent_core::types::{FlowEvent, RunId};
use serde::{Deserialize, Serialize};

use crate::config::AppState;

/// History backfill cap. Clients page older events over HTTP.
const HISTORY_LIMIT: usize = 100;

/// Close code sent on server restart so clients reconnect with backoff.
const CLOSE_GOING_AWAY: u16 = 1001;

/// Requests a client may send over `/api/_flows/ws`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsRequest {
    /// Subscribe to one run's event feed.
    Subscribe {
        #[serde(rename = "flowName")]
        flow_name: String,
        #[serde(rename = "runId")]
        run_id: String,
    },
    /// Application-level heartbeat.
    Ping,
}

/// Frames the server sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Bounded backfill, oldest first, sent once per subscription.
    History { events: Vec<FlowEvent> },
    /// One live event, in persistence order.
    Event { event: FlowEvent },
    Pong,
    Error { message: String },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut shutdown = state.shutdown.clone();
    let mut live: Option<tokio::sync::broadcast::Receiver<FlowEvent>> = None;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "server restart".into(),
                    })))
                    .await;
                break;
            }

            event = recv_live(&mut live) => {
                match event {
                    Ok(event) => {
                        if send_json(&mut socket, &WsMessage::Event { event }).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "websocket peer lagged, events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        live = None;
                    }
                }
            }

            incoming = socket.recv() => {
                let Some(incoming) = incoming else { break };
                match incoming {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<WsRequest>(&text) {
                            Ok(WsRequest::Subscribe { flow_name, run_id }) => {
                                match subscribe(&state, &flow_name, &run_id).await {
                                    Ok((history, rx)) => {
                                        live = Some(rx);
                                        if send_json(&mut socket, &WsMessage::History { events: history })
                                            .await
                                            .is_err()
                                        {
                                            break;
                                        }
                                    }
                                    Err(message) => {
                                        let _ = send_json(&mut socket, &WsMessage::Error { message }).await;
                                    }
                                }
                            }
                            Ok(WsRequest::Ping) => {
                                if send_json(&mut socket, &WsMessage::Pong).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = send_json(
                                    &mut socket,
                                    &WsMessage::Error {
                                        message: format!("unrecognized request: {e}"),
                                    },
                                )
                                .await;
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Binary(_)) => {
                        let _ = send_json(
                            &mut socket,
                            &WsMessage::Error {
                                message: "binary frames are not supported".to_string(),
                            },
                        )
                        .await;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!("websocket connection closed");
}

/// Wait on the live feed, or pend forever when there is none yet.
async fn recv_live(
    live: &mut Option<tokio::sync::broadcast::Receiver<FlowEvent>>,
) -> Result<FlowEvent, tokio::sync::broadcast::error::RecvError> {
    match live {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Attach to a run: live subscription first, then bounded history, so
/// no event falls between the backfill and the feed.
async fn subscribe(
    state: &AppState,
    flow_name: &str,
    run_id: &str,
) -> Result<(Vec<FlowEvent>, tokio::sync::broadcast::Receiver<FlowEvent>), String> {
    let run_id = RunId::parse(run_id).ok_or_else(|| format!("invalid run id: {run_id}"))?;

    if state
        .service
        .orchestrator
        .run_record(flow_name, run_id)
        .await
        .map_err(|e| e.to_string())?
        .is_none()
    {
        return Err(format!("unknown run {run_id} for flow {flow_name}"));
    }

    let rx = state.service.fabric.subscribe_run(run_id);

    let mut history = state
        .service
        .orchestrator
        .run_events(run_id, &ReadOptions::tail(HISTORY_LIMIT))
        .await
        .map_err(|e| e.to_string())?;
    history.reverse();

    Ok((history, rx))
}

async fn send_json(socket: &mut WebSocket, message: &WsMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize websocket frame");
            Ok(())
        }
    }
}
