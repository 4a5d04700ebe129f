// Socket connection management
// Owns the single live socket for the session: connect, room joins, bounded
// reconnects and teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch, Mutex as TokioMutex};

use crate::models::SessionIdentity;
use super::error::ChatError;
use super::events::names;
use super::transport::{SocketConnector, SocketFrame, SocketSink};

/// Connection health as seen by dependents
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    /// Retries exhausted; stays here until the host asks to reconnect
    Failed { reason: String },
}

/// Lifecycle notifications (`connect`, `disconnect`, `connect_error`)
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Connected,
    Disconnected { reason: String },
    ConnectError { attempt: u32, reason: String },
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Backoff before retry number `attempt + 1`: base * 2^(attempt - 1), capped
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

pub struct TransportBinder {
    connector: Arc<dyn SocketConnector>,
    policy: ReconnectPolicy,
    ack_timeout: Duration,
    sink: TokioMutex<Option<Arc<dyn SocketSink>>>,
    // Serializes connect/disconnect so two links never coexist
    connect_lock: TokioMutex<()>,
    generation: AtomicU64,
    status_tx: watch::Sender<ConnectionStatus>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
}

impl TransportBinder {
    pub fn new(connector: Arc<dyn SocketConnector>, policy: ReconnectPolicy, ack_timeout: Duration) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (lifecycle_tx, _) = broadcast::channel(32);
        TransportBinder {
            connector,
            policy,
            ack_timeout,
            sink: TokioMutex::new(None),
            connect_lock: TokioMutex::new(()),
            generation: AtomicU64::new(0),
            status_tx,
            lifecycle_tx,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    /// Send actions are only offered while connected
    pub fn can_send(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Identifies the current link; bumped whenever a link is replaced or torn down
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: ConnectionStatus) {
        debug!("Connection status -> {:?}", status);
        self.status_tx.send_replace(status);
    }

    fn publish(&self, event: LifecycleEvent) {
        // No subscribers is fine
        let _ = self.lifecycle_tx.send(event);
    }

    /// Open the socket for `identity`, replacing any existing link.
    ///
    /// Returns the new link generation and its inbound frames.
    pub async fn connect(&self, identity: &SessionIdentity) -> Result<(u64, mpsc::Receiver<SocketFrame>), ChatError> {
        let _guard = self.connect_lock.lock().await;
        self.teardown("rebinding").await;

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            info!("Connecting socket for {} (attempt {}/{})", identity.user_id, attempt, max_attempts);
            self.set_status(ConnectionStatus::Connecting { attempt });

            match self.connector.connect(identity).await {
                Ok(link) => match Self::join_rooms(link.sink.as_ref(), identity).await {
                    Ok(()) => {
                        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                        *self.sink.lock().await = Some(link.sink);
                        self.set_status(ConnectionStatus::Connected);
                        self.publish(LifecycleEvent::Connected);
                        info!("Socket connected for {} (link {})", identity.user_id, generation);
                        return Ok((generation, link.events));
                    }
                    Err(e) => {
                        link.sink.close().await;
                        error!("Failed to join rooms on attempt {}/{}: {}", attempt, max_attempts, e);
                        self.publish(LifecycleEvent::ConnectError { attempt, reason: e.to_string() });
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    error!("Failed to connect on attempt {}/{}: {}", attempt, max_attempts, e);
                    self.publish(LifecycleEvent::ConnectError { attempt, reason: e.to_string() });
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts {
                let backoff = self.policy.delay_after(attempt);
                info!("Retrying connection in {:?}", backoff);
                tokio::time::sleep(backoff).await;
            }
        }

        let err = last_error.unwrap_or_else(|| ChatError::Transport("connection failed".to_string()));
        error!("All {} connection attempts failed: {}", max_attempts, err);
        self.set_status(ConnectionStatus::Failed { reason: err.to_string() });
        self.publish(LifecycleEvent::Disconnected { reason: err.to_string() });
        Err(err)
    }

    async fn join_rooms(sink: &dyn SocketSink, identity: &SessionIdentity) -> Result<(), ChatError> {
        sink.emit(names::JOIN_USER_ROOM, Value::String(identity.user_id.clone())).await?;
        sink.emit(names::JOIN_ROLE_ROOM, Value::String(identity.role.as_str().to_string())).await?;
        debug!("Joined rooms user:{} role:{}", identity.user_id, identity.role);
        Ok(())
    }

    /// Close the current link on purpose (logout, identity change)
    pub async fn disconnect(&self, reason: &str) {
        let _guard = self.connect_lock.lock().await;
        if self.teardown(reason).await {
            self.set_status(ConnectionStatus::Disconnected);
            self.publish(LifecycleEvent::Disconnected { reason: reason.to_string() });
        }
    }

    /// Drop the current sink and invalidate its generation. Returns true if a link existed.
    async fn teardown(&self, reason: &str) -> bool {
        let previous = self.sink.lock().await.take();
        self.generation.fetch_add(1, Ordering::SeqCst);
        match previous {
            Some(sink) => {
                info!("Closing socket: {}", reason);
                sink.close().await;
                true
            }
            None => false,
        }
    }

    /// The inbound stream of link `generation` ended. Returns false when that
    /// link was already replaced or closed on purpose, so nobody should reconnect.
    pub(crate) async fn link_lost(&self, generation: u64, reason: &str) -> bool {
        let _guard = self.connect_lock.lock().await;
        if self.generation() != generation {
            return false;
        }
        warn!("Socket link {} lost: {}", generation, reason);
        if let Some(sink) = self.sink.lock().await.take() {
            sink.close().await;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.set_status(ConnectionStatus::Disconnected);
        self.publish(LifecycleEvent::Disconnected { reason: reason.to_string() });
        true
    }

    async fn current_sink(&self) -> Result<Arc<dyn SocketSink>, ChatError> {
        self.sink.lock().await.clone().ok_or(ChatError::NotConnected)
    }

    pub async fn emit(&self, event: &str, data: Value) -> Result<(), ChatError> {
        let sink = self.current_sink().await?;
        sink.emit(event, data).await
    }

    pub async fn emit_with_ack(&self, event: &str, data: Value) -> Result<Value, ChatError> {
        let sink = self.current_sink().await?;
        sink.emit_with_ack(event, data, self.ack_timeout).await
    }

    /// Fire-and-forget emit; failures are logged only
    pub async fn emit_quietly(&self, event: &str, data: Value) {
        if let Err(e) = self.emit(event, data).await {
            debug!("Skipping {}: {}", event, e);
        }
    }

    pub async fn emit_typing(&self, conversation_id: &str, user_id: &str) {
        self.emit_quietly(names::TYPING, json!({"conversationId": conversation_id, "userId": user_id}))
            .await;
    }
}
