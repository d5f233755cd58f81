//! Live event stream
//!
//! WebSocket endpoint pushing store events to connected dashboards. On
//! connect the client receives a snapshot of every store it may see;
//! afterwards each bus event the caller is allowed to see is forwarded as
//! it happens. Slow consumers lag the broadcast channel and are dropped
//! rather than ever blocking the publisher.

use crate::identity::{can_see, caller_identity};
use crate::server::AppState;
use crate::store_client::StoreSnapshot;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use storeplane_bus::{BusStatus, StoreEvent};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Messages pushed to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    /// Initial snapshot of all visible stores
    Snapshot { stores: Vec<StoreSnapshot> },
    /// One live bus event
    Event { event: StoreEvent },
    /// Response to a client ping
    Pong,
}

/// `GET /stores/ws` - upgrade to the live stream. Live subscribers are
/// refused while the bus is degraded; callers fall back to polling.
pub async fn stream_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if state.bus.status() == BusStatus::Degraded {
        return (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "event bus degraded, live stream unavailable",
        )
            .into_response();
    }
    let caller = caller_identity(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, caller))
}

async fn handle_socket(socket: WebSocket, state: AppState, caller: String) {
    info!(caller = %caller, "live stream connected");
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.bus.subscribe();

    // Snapshot first, so late subscribers start from the current world.
    let mut owners: HashMap<String, String> = HashMap::new();
    match state.stores.list().await {
        Ok(stores) => {
            for store in &stores {
                if let Some(name) = store.metadata.name.clone() {
                    owners.insert(name, store.spec.owner.clone());
                }
            }
            let visible: Vec<StoreSnapshot> = stores
                .iter()
                .filter(|s| can_see(&caller, &s.spec.owner, &state.privileged))
                .map(StoreSnapshot::from)
                .collect();
            if send(&mut sender, ServerMessage::Snapshot { stores: visible })
                .await
                .is_err()
            {
                return;
            }
        }
        Err(e) => {
            warn!(error = %e, "snapshot listing failed, closing stream");
            return;
        }
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(caller = %caller, "client closed the stream");
                        break;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        if send(&mut sender, ServerMessage::Pong).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {} // ignore other client chatter
                    Some(Err(e)) => {
                        debug!(error = %e, "stream receive error");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if is_visible(&state, &caller, &mut owners, &event).await
                            && send(&mut sender, ServerMessage::Event { event }).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Backpressure: the consumer is too slow, drop it.
                        warn!(caller = %caller, missed, "subscriber lagged, disconnecting");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!(caller = %caller, "live stream closed");
}

/// Ownership filter for events; owners of stores created after connect are
/// looked up once and cached.
async fn is_visible(
    state: &AppState,
    caller: &str,
    owners: &mut HashMap<String, String>,
    event: &StoreEvent,
) -> bool {
    if let Some(owner) = owners.get(&event.store) {
        return can_see(caller, owner, &state.privileged);
    }
    match state.stores.get(&event.store).await {
        Ok(Some(store)) => {
            let owner = store.spec.owner.clone();
            owners.insert(event.store.clone(), owner.clone());
            can_see(caller, &owner, &state.privileged)
        }
        // Unknown store (already deleted, or lookup failed): keep quiet.
        _ => false,
    }
}

async fn send(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(&msg).map_err(axum::Error::new)?;
    sender.send(Message::Text(json)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_serialization() {
        let msg = ServerMessage::Event {
            event: StoreEvent {
                store: "shop1".to_string(),
                event: "STORE_READY".to_string(),
                message: "store is ready".to_string(),
                phase: Some("Ready".to_string()),
                timestamp: "2024-01-01T00:00:00Z".to_string(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"event\""));
        assert!(json.contains("STORE_READY"));
        assert!(json.contains("shop1"));
    }

    #[test]
    fn test_snapshot_message_shape() {
        let msg = ServerMessage::Snapshot { stores: vec![] };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"snapshot\""));
        assert!(json.contains("\"stores\":[]"));
    }
}
