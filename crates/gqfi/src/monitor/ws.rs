//! WebSocket event streaming, grounded in the teacher's `api/ws.rs`: one
//! broadcast subscription per client, a backpressure notice when the
//! client falls behind instead of a silent drop.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use tracing::{debug, error, info};

use super::MonitorState;

pub async fn events_handler(ws: WebSocketUpgrade, State(state): State<MonitorState>) -> Response {
    let rx = state.events.subscribe();
    ws.on_upgrade(|socket| handle_socket(socket, rx))
}

async fn handle_socket(
    mut socket: WebSocket,
    mut rx: tokio::sync::broadcast::Receiver<crate::events::CampaignEvent>,
) {
    info!("monitor client connected");
    let mut dropped: usize = 0;

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if dropped > 0 {
                            let notice = serde_json::json!({
                                "type": "Backpressure",
                                "dropped_count": dropped,
                            });
                            if let Ok(json) = serde_json::to_string(&notice) {
                                let _ = socket.send(Message::Text(json)).await;
                            }
                            dropped = 0;
                        }
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if let Err(e) = socket.send(Message::Text(json)).await {
                                    error!("failed to send event to monitor client: {e}");
                                    break;
                                }
                            }
                            Err(e) => error!("failed to serialize campaign event: {e}"),
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        dropped += n as usize;
                        debug!("monitor client lagging, dropped {n} events");
                    }
                    Err(_) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("monitor websocket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    info!("monitor client disconnected");
}
