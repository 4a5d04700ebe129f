// Common test utilities for integration tests
// In-memory backend and socket fakes plus helpers for driving a ChatEngine.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Once};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, LevelFilter};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use chatsync::config::EngineConfig;
use chatsync::models::{DeliveryState, DraftAttachment, Message, MessageClass, Notification, NotificationKind, Role, SessionIdentity};
use chatsync::sync::{canonical_id, ChatApi, ChatEngine, ChatError, EngineUpdate, SocketConnector, SocketFrame, SocketLink, SocketSink};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub fn identity(user_id: &str, role: Role) -> SessionIdentity {
    SessionIdentity::new(user_id, role, &format!("token-{}", user_id))
}

/// Fast retries, no warm-start cache
pub fn test_config() -> EngineConfig {
    EngineConfig {
        reconnect_attempts: 3,
        reconnect_delay_ms: 10,
        reconnect_max_delay_ms: 40,
        cache_path: None,
        ..EngineConfig::default()
    }
}

pub fn message(id: &str, from: &str, to: &str, text: &str, sent_at: DateTime<Utc>) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: canonical_id(from, to),
        sender_id: from.to_string(),
        receiver_id: to.to_string(),
        sender_role: "coordinator".to_string(),
        receiver_role: "mechanic".to_string(),
        text: Some(text.to_string()),
        attachments: vec![],
        sent_at,
        delivery_state: DeliveryState::Delivered,
        message_class: MessageClass::classify(Some(text), &[]),
    }
}

/// Wire payload of a `new_message` event
pub fn message_payload(id: &str, from: &str, to: &str, text: &str, sent_at: DateTime<Utc>) -> Value {
    json!({
        "_id": id,
        "senderId": from,
        "receiverId": to,
        "senderRole": "coordinator",
        "receiverRole": "mechanic",
        "text": text,
        "sentAt": sent_at.to_rfc3339(),
    })
}

pub fn chat_notification(id: &str, conversation_id: &str, sender_id: &str, read: bool) -> Notification {
    Notification {
        id: id.to_string(),
        title: format!("New message from {}", sender_id),
        message: "hello".to_string(),
        created_at: Utc::now(),
        read,
        kind: NotificationKind::Chat,
        sender_id: Some(sender_id.to_string()),
        sender_name: None,
        conversation_id: Some(conversation_id.to_string()),
    }
}

/// Backend fake. Every knob is public so tests can arrange failures and delays.
#[derive(Default)]
pub struct FakeApi {
    pub history: StdMutex<HashMap<String, Vec<Message>>>,
    pub history_calls: AtomicU32,
    pub notifications: StdMutex<Vec<Notification>>,
    pub unread_total: AtomicU32,
    pub send_ids: StdMutex<VecDeque<String>>,
    pub send_delay: StdMutex<Duration>,
    pub fail_sends: AtomicBool,
    pub mark_delay: StdMutex<Duration>,
    pub fail_marks: AtomicBool,
    pub sent: StdMutex<Vec<Message>>,
    /// Attachment names of every send attempt, persisted or not
    pub uploads: StdMutex<Vec<Vec<String>>>,
    pub read_conversations: StdMutex<Vec<String>>,
    pub marked_notifications: StdMutex<Vec<String>>,
    pub tokens: StdMutex<Vec<String>>,
    next_id: AtomicU64,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeApi::default())
    }

    pub fn set_history(&self, peer_id: &str, messages: Vec<Message>) {
        self.history.lock().unwrap().insert(peer_id.to_string(), messages);
    }

    pub fn queue_send_id(&self, id: &str) {
        self.send_ids.lock().unwrap().push_back(id.to_string());
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    pub fn set_mark_delay(&self, delay: Duration) {
        *self.mark_delay.lock().unwrap() = delay;
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn fetch_history(&self, _user_id: &str, peer_id: &str) -> Result<Vec<Message>, ChatError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.history.lock().unwrap().get(peer_id).cloned().unwrap_or_default())
    }

    async fn send_message(&self, message: &Message, attachments: &[DraftAttachment]) -> Result<Message, ChatError> {
        self.uploads
            .lock()
            .unwrap()
            .push(attachments.iter().map(|a| a.name.clone()).collect());
        let delay = *self.send_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChatError::Http {
                status: 500,
                message: "persistence failed".to_string(),
            });
        }
        let id = self
            .send_ids
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1));
        let mut confirmed = message.clone();
        confirmed.id = id;
        confirmed.delivery_state = DeliveryState::Delivered;
        self.sent.lock().unwrap().push(confirmed.clone());
        Ok(confirmed)
    }

    async fn mark_messages_read(&self, conversation_id: &str, _user_id: &str) -> Result<(), ChatError> {
        self.read_conversations.lock().unwrap().push(conversation_id.to_string());
        Ok(())
    }

    async fn fetch_notifications(&self, _user_id: &str) -> Result<Vec<Notification>, ChatError> {
        Ok(self.notifications.lock().unwrap().clone())
    }

    async fn mark_notification_read(&self, notification_id: &str) -> Result<(), ChatError> {
        let delay = *self.mark_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.fail_marks.load(Ordering::SeqCst) {
            return Err(ChatError::Http { status: 503, message: "unavailable".to_string() });
        }
        self.marked_notifications.lock().unwrap().push(notification_id.to_string());
        Ok(())
    }

    async fn mark_all_chat_notifications_read(&self, _user_id: &str) -> Result<(), ChatError> {
        let delay = *self.mark_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.fail_marks.load(Ordering::SeqCst) {
            return Err(ChatError::Http { status: 503, message: "unavailable".to_string() });
        }
        Ok(())
    }

    async fn unread_chat_count(&self, _user_id: &str, _role: Role) -> Result<u32, ChatError> {
        Ok(self.unread_total.load(Ordering::SeqCst))
    }

    fn set_auth_token(&self, token: &str) {
        self.tokens.lock().unwrap().push(token.to_string());
    }
}

/// Records everything the engine emits. Acks answer immediately.
#[derive(Default)]
pub struct FakeSink {
    pub emitted: StdMutex<Vec<(String, Value)>>,
    pub closed: AtomicU32,
}

impl FakeSink {
    pub fn emitted(&self, event: &str) -> Vec<Value> {
        self.emitted
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, data)| data.clone())
            .collect()
    }
}

#[async_trait]
impl SocketSink for FakeSink {
    async fn emit(&self, event: &str, data: Value) -> Result<(), ChatError> {
        self.emitted.lock().unwrap().push((event.to_string(), data));
        Ok(())
    }

    async fn emit_with_ack(&self, event: &str, data: Value, _timeout: Duration) -> Result<Value, ChatError> {
        self.emitted.lock().unwrap().push((event.to_string(), data));
        Ok(json!({ "ok": true }))
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out links sharing one recording sink. The test plays the server by
/// injecting frames into the latest link.
#[derive(Default)]
pub struct FakeConnector {
    pub sink: Arc<FakeSink>,
    frames: StdMutex<Option<mpsc::Sender<SocketFrame>>>,
    pub failures_left: AtomicU32,
    pub connects: AtomicU32,
    pub identities: StdMutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeConnector::default())
    }

    /// The next `count` connection attempts are refused
    pub fn refuse(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub async fn inject(&self, event: &str, data: Value) {
        let sender = self.frames.lock().unwrap().clone();
        match sender {
            Some(sender) => {
                sender
                    .send(SocketFrame::new(event, data))
                    .await
                    .expect("engine stopped reading the socket");
            }
            None => panic!("no live link to inject {} into", event),
        }
    }

    /// Simulate the server dropping the socket
    pub fn drop_link(&self) {
        self.frames.lock().unwrap().take();
    }
}

#[async_trait]
impl SocketConnector for FakeConnector {
    async fn connect(&self, identity: &SessionIdentity) -> Result<SocketLink, ChatError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.identities.lock().unwrap().push(identity.user_id.clone());
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ChatError::Transport("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::channel(100);
        *self.frames.lock().unwrap() = Some(tx);
        Ok(SocketLink {
            sink: self.sink.clone(),
            events: rx,
        })
    }
}

pub struct Harness {
    pub engine: ChatEngine,
    pub updates: mpsc::Receiver<EngineUpdate>,
    pub api: Arc<FakeApi>,
    pub connector: Arc<FakeConnector>,
}

/// Engine for `user_id` wired to fresh fakes; not started
pub fn harness(user_id: &str, role: Role) -> Harness {
    harness_with(user_id, role, test_config())
}

pub fn harness_with(user_id: &str, role: Role, config: EngineConfig) -> Harness {
    setup_logging();
    let api = FakeApi::new();
    let connector = FakeConnector::new();
    let (engine, updates) = ChatEngine::new(identity(user_id, role), config, api.clone(), connector.clone());
    Harness {
        engine,
        updates,
        api,
        connector,
    }
}

/// Wait for an update matching the predicate, skipping the others
pub async fn wait_for_update(
    updates: &mut mpsc::Receiver<EngineUpdate>,
    predicate: impl Fn(&EngineUpdate) -> bool,
    timeout_secs: u64,
) -> Result<EngineUpdate> {
    info!("Waiting for update...");
    match timeout(Duration::from_secs(timeout_secs), async {
        while let Some(update) = updates.recv().await {
            if predicate(&update) {
                return Ok(update);
            }
        }
        Err(anyhow::anyhow!("Update receiver closed"))
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("Timed out waiting for update")),
    }
}

/// Let spawned tasks run until the engine has handled what was injected.
/// Under a paused clock this returns once every task is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
