// Socket transport
// JSON frames over a WebSocket: outbound `{"event", "data", "ack"?}`,
// inbound `{"event", "data"}` or ack replies `{"ack", "data"}`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::models::SessionIdentity;
use super::error::ChatError;

/// One named event with its JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl SocketFrame {
    pub fn new(event: &str, data: Value) -> Self {
        SocketFrame {
            event: event.to_string(),
            data,
        }
    }
}

/// Outbound half of a live socket
#[async_trait]
pub trait SocketSink: Send + Sync {
    async fn emit(&self, event: &str, data: Value) -> Result<(), ChatError>;

    /// Emit and wait for the server's acknowledgement payload
    async fn emit_with_ack(&self, event: &str, data: Value, timeout: Duration) -> Result<Value, ChatError>;

    async fn close(&self);
}

/// A freshly opened socket. The stream of inbound frames ends when the socket drops.
pub struct SocketLink {
    pub sink: Arc<dyn SocketSink>,
    pub events: mpsc::Receiver<SocketFrame>,
}

/// Opens socket sessions. Only the transport binder calls this.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, identity: &SessionIdentity) -> Result<SocketLink, ChatError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack: Option<u64>,
}

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type PendingAcks = Arc<StdMutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// WebSocket connector; the bearer token goes in the upgrade request
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: &str) -> Self {
        WsConnector { url: url.to_string() }
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self, identity: &SessionIdentity) -> Result<SocketLink, ChatError> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", identity.auth_token))
            .map_err(|e| ChatError::Config(format!("Invalid auth token: {}", e)))?;
        request.headers_mut().insert("Authorization", bearer);

        info!("Opening socket to {} as {}", self.url, identity.user_id);
        let (ws_stream, _) = connect_async(request).await?;
        let (writer, mut reader) = ws_stream.split();

        let pending: PendingAcks = Arc::new(StdMutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::channel(100);

        let pending_clone = pending.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = reader.next().await {
                match msg_result {
                    Ok(WsMessage::Text(text)) => {
                        let frame: WireFrame = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("Unparseable socket frame ({}): {}", e, text);
                                continue;
                            }
                        };
                        match (frame.event, frame.ack) {
                            (Some(event), _) => {
                                if event_tx.send(SocketFrame { event, data: frame.data }).await.is_err() {
                                    debug!("Event receiver dropped, stopping socket reader");
                                    break;
                                }
                            }
                            (None, Some(ack_id)) => {
                                let waiter = match pending_clone.lock() {
                                    Ok(mut pending) => pending.remove(&ack_id),
                                    Err(_) => None,
                                };
                                match waiter {
                                    Some(tx) => {
                                        let _ = tx.send(frame.data);
                                    }
                                    None => debug!("Late or unknown ack {}", ack_id),
                                }
                            }
                            (None, None) => debug!("Socket frame without event or ack"),
                        }
                    }
                    Ok(WsMessage::Close(reason)) => {
                        info!("Socket closed by server: {:?}", reason);
                        break;
                    }
                    Err(e) => {
                        error!("Socket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            // Dropping event_tx ends the inbound stream, which is how the binder sees the drop
        });

        let sink = WsSink {
            writer: TokioMutex::new(writer),
            pending,
            next_ack: AtomicU64::new(1),
        };
        Ok(SocketLink {
            sink: Arc::new(sink),
            events: event_rx,
        })
    }
}

struct WsSink {
    writer: TokioMutex<WsWriter>,
    pending: PendingAcks,
    next_ack: AtomicU64,
}

impl WsSink {
    async fn write(&self, frame: &WireFrame) -> Result<(), ChatError> {
        let text = serde_json::to_string(frame)?;
        let mut writer = self.writer.lock().await;
        writer.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    fn forget_ack(&self, ack_id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&ack_id);
        }
    }
}

#[async_trait]
impl SocketSink for WsSink {
    async fn emit(&self, event: &str, data: Value) -> Result<(), ChatError> {
        debug!("emit {}", event);
        self.write(&WireFrame {
            event: Some(event.to_string()),
            data,
            ack: None,
        })
        .await
    }

    async fn emit_with_ack(&self, event: &str, data: Value, timeout: Duration) -> Result<Value, ChatError> {
        let ack_id = self.next_ack.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        match self.pending.lock() {
            Ok(mut pending) => {
                pending.insert(ack_id, tx);
            }
            Err(_) => return Err(ChatError::Transport("ack table poisoned".to_string())),
        }

        debug!("emit {} (ack {})", event, ack_id);
        if let Err(e) = self
            .write(&WireFrame {
                event: Some(event.to_string()),
                data,
                ack: Some(ack_id),
            })
            .await
        {
            self.forget_ack(ack_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(ChatError::Transport("socket closed before ack".to_string())),
            Err(_) => {
                self.forget_ack(ack_id);
                Err(ChatError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.close().await {
            debug!("Error closing socket: {}", e);
        }
        // Wake anyone still waiting for an ack
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}
