//! WebSocket subscribers on `GET /ws`

use crate::hub::HubHandle;
use crate::subscriber::{run_subscriber, DeliverySettings, SubscriberSink};
use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bci_core::{BciError, BciResult, Message};
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub delivery: DeliverySettings,
    /// Cancelled when the session shuts down
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new().route("/ws", get(handle_websocket)).with_state(state)
}

/// Handle WebSocket upgrade
pub async fn handle_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let subscription = match state.hub.register().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("Rejecting WebSocket subscriber: {}", e);
            return;
        }
    };
    let (sender, mut receiver) = socket.split();
    let closed = state.shutdown.child_token();

    // Inbound frames only matter for noticing the peer going away
    let reader = {
        let closed = closed.clone();
        tokio::spawn(async move {
            while let Some(frame) = receiver.next().await {
                match frame {
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }
            closed.cancel();
        })
    };

    let sink = WebSocketSink { sender };
    run_subscriber(sink, subscription, state.hub, state.delivery, closed.clone()).await;
    closed.cancel();
    reader.abort();
}

struct WebSocketSink {
    sender: SplitSink<WebSocket, WsMessage>,
}

fn write_error(e: axum::Error) -> BciError {
    BciError::transport("websocket write", std::io::Error::other(e))
}

#[async_trait]
impl SubscriberSink for WebSocketSink {
    async fn send_message(&mut self, message: &Message) -> BciResult<()> {
        let text = message.to_json()?;
        self.sender.send(WsMessage::Text(text.into())).await.map_err(write_error)
    }

    async fn send_ping(&mut self) -> BciResult<()> {
        self.sender.send(WsMessage::Ping(Default::default())).await.map_err(write_error)
    }

    async fn close(&mut self) {
        if let Err(e) = self.sender.close().await {
            debug!("Error closing WebSocket: {}", e);
        }
    }
}
