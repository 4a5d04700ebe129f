// Conversation synchronization engine
// One instance per logged-in session. The transport binder feeds one inbound
// event stream; the reconciliation store, unread ledger, typing signal and
// delivery tracker all consume it under a single state lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex};
use tokio::time::{Duration, Instant};

pub mod addressing;
pub mod chat_states;
pub mod connection;
pub mod delivery_receipts;
pub mod error;
pub mod events;
pub mod ledger;
pub mod message_archive;
pub mod reconciliation;
pub mod transport;

pub use addressing::{canonical_id, is_addressable};
pub use connection::{ConnectionStatus, LifecycleEvent, ReconnectPolicy, TransportBinder};
pub use error::ChatError;
pub use events::InboundEvent;
pub use ledger::{LedgerCache, UnreadLedger};
pub use message_archive::{ChatApi, HttpChatApi};
pub use reconciliation::{InboundOutcome, MessageStore};
pub use transport::{SocketConnector, SocketFrame, SocketLink, SocketSink, WsConnector};

use crate::config::EngineConfig;
use crate::models::{Attachment, DeliveryState, Draft, Message, MessageClass, Notification, Role, SessionIdentity};
use chat_states::TypingSignal;
use events::names;
use ledger::{LedgerOutcome, MarkSnapshot};
use reconciliation::{new_temp_id, ConfirmOutcome};

/// Changes pushed to the hosting view
#[derive(Debug, Clone, PartialEq)]
pub enum EngineUpdate {
    Connection(ConnectionStatus),
    /// Full visible sequence of the open conversation
    MessagesChanged { conversation_id: String, messages: Vec<Message> },
    /// Transient notice; `draft` goes back into the compose area
    SendFailed { temp_id: String, draft: Draft, reason: String },
    UnreadChanged { conversation_id: String, count: u32, total: u32 },
    UnreadCounts { counts: HashMap<String, u32>, total: u32 },
    NotificationAdded(Notification),
    NotificationsChanged { unread: usize },
    Typing { conversation_id: String, user_id: Option<String>, typing: bool },
    /// Server-side unread badge
    UnreadTotal(u32),
    Notice(String),
}

/// Everything the inbound stream mutates
pub struct ConversationState {
    pub store: MessageStore,
    pub ledger: UnreadLedger,
    pub typing: TypingSignal,
    peer: Option<(String, Role)>,
}

impl ConversationState {
    fn new(user_id: &str, config: &EngineConfig) -> Self {
        ConversationState {
            store: MessageStore::new(config.confirm_window(), config.dedup_window()),
            ledger: UnreadLedger::new(user_id),
            typing: TypingSignal::new(config.typing_window()),
            peer: None,
        }
    }

    fn messages_update(&self) -> Option<EngineUpdate> {
        self.store.conversation_id().map(|conversation_id| EngineUpdate::MessagesChanged {
            conversation_id: conversation_id.to_string(),
            messages: self.store.messages().to_vec(),
        })
    }

    fn counts_update(&self) -> EngineUpdate {
        EngineUpdate::UnreadCounts {
            counts: self.ledger.counts().clone(),
            total: self.ledger.total(),
        }
    }

    fn notifications_update(&self) -> EngineUpdate {
        EngineUpdate::NotificationsChanged {
            unread: self.ledger.unread_notifications(),
        }
    }
}

#[derive(Clone)]
pub struct ChatEngine {
    identity: Arc<RwLock<SessionIdentity>>,
    config: Arc<EngineConfig>,
    api: Arc<dyn ChatApi>,
    binder: Arc<TransportBinder>,
    state: Arc<TokioMutex<ConversationState>>,
    update_tx: mpsc::Sender<EngineUpdate>,
    forwarding_status: Arc<AtomicBool>,
}

impl ChatEngine {
    pub fn new(
        identity: SessionIdentity,
        config: EngineConfig,
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn SocketConnector>,
    ) -> (Self, mpsc::Receiver<EngineUpdate>) {
        let (update_tx, update_rx) = mpsc::channel(100);
        let binder = TransportBinder::new(connector, config.reconnect_policy(), config.ack_timeout());
        let state = ConversationState::new(&identity.user_id, &config);

        (Self {
            identity: Arc::new(RwLock::new(identity)),
            config: Arc::new(config),
            api,
            binder: Arc::new(binder),
            state: Arc::new(TokioMutex::new(state)),
            update_tx,
            forwarding_status: Arc::new(AtomicBool::new(false)),
        }, update_rx)
    }

    pub fn identity(&self) -> SessionIdentity {
        match self.identity.read() {
            Ok(identity) => identity.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn user_id(&self) -> String {
        self.identity().user_id
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.binder.status()
    }

    pub fn can_send(&self) -> bool {
        self.binder.can_send()
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.binder.subscribe()
    }

    fn publish(&self, update: EngineUpdate) {
        match self.update_tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => warn!("View is not draining updates, dropped {:?}", update),
            Err(TrySendError::Closed(_)) => debug!("No view attached"),
        }
    }

    fn publish_all(&self, updates: Vec<EngineUpdate>) {
        for update in updates {
            self.publish(update);
        }
    }

    /// Bound a backend call by the configured request timeout
    async fn call<T, F>(&self, what: &str, request: F) -> Result<T, ChatError>
    where
        F: Future<Output = Result<T, ChatError>>,
    {
        let limit = self.config.request_timeout();
        match tokio::time::timeout(limit, request).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} timed out after {:?}", what, limit);
                Err(ChatError::Timeout(limit.as_millis() as u64))
            }
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Warm-start the badge, connect the socket, then resync with the server.
    ///
    /// A connection failure is returned but leaves the engine usable: status
    /// stays `Failed` until `reconnect` succeeds.
    pub async fn start(&self) -> Result<(), ChatError> {
        self.warm_start().await;
        self.forward_status();

        let connected = self.connect_and_pump().await;
        if let Err(e) = self.sync_notifications().await {
            warn!("Initial notification sync failed: {}", e);
        }
        if let Err(e) = self.refresh_unread_total().await {
            debug!("Unread total unavailable: {}", e);
        }
        connected
    }

    /// Retry the socket after a terminal failure
    pub async fn reconnect(&self) -> Result<(), ChatError> {
        self.connect_and_pump().await?;
        self.after_reconnect().await;
        Ok(())
    }

    /// The token (or the whole identity) changed: tear down and rebind the socket
    pub async fn rebind(&self, identity: SessionIdentity) -> Result<(), ChatError> {
        let previous = self.identity();
        self.api.set_auth_token(&identity.auth_token);
        if previous.user_id != identity.user_id {
            info!("Identity changed from {} to {}, resetting state", previous.user_id, identity.user_id);
            let mut state = self.state.lock().await;
            *state = ConversationState::new(&identity.user_id, &self.config);
        }
        match self.identity.write() {
            Ok(mut current) => *current = identity,
            Err(poisoned) => *poisoned.into_inner() = identity,
        }
        self.connect_and_pump().await
    }

    /// Logout: persist the warm-start cache and close the socket
    pub async fn shutdown(&self) {
        if let Err(e) = self.save_unread_cache().await {
            warn!("Could not save unread cache: {}", e);
        }
        self.binder.disconnect("session closed").await;
        self.close_conversation().await;
    }

    fn forward_status(&self) {
        if self.forwarding_status.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut status_rx = self.binder.watch_status();
        let update_tx = self.update_tx.clone();
        tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let status = status_rx.borrow().clone();
                if update_tx.send(EngineUpdate::Connection(status)).await.is_err() {
                    break;
                }
            }
        });
    }

    async fn connect_and_pump(&self) -> Result<(), ChatError> {
        let identity = self.identity();
        let (generation, events) = self.binder.connect(&identity).await?;
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_event_pump(generation, events).await;
        });
        Ok(())
    }

    /// Serially handle inbound frames of one link; on an unexpected drop,
    /// reconnect within the binder's retry budget and keep going.
    async fn run_event_pump(self, mut generation: u64, mut events: mpsc::Receiver<SocketFrame>) {
        loop {
            while let Some(frame) = events.recv().await {
                if self.binder.generation() != generation {
                    debug!("Link {} superseded, stopping its pump", generation);
                    return;
                }
                self.handle_frame(frame).await;
            }

            if !self.binder.link_lost(generation, "socket stream ended").await {
                return;
            }
            let identity = self.identity();
            match self.binder.connect(&identity).await {
                Ok((next_generation, next_events)) => {
                    generation = next_generation;
                    events = next_events;
                    self.after_reconnect().await;
                }
                Err(e) => {
                    error!("Giving up on the socket: {}", e);
                    self.publish(EngineUpdate::Notice(format!("Messaging unavailable: {}", e)));
                    return;
                }
            }
        }
    }

    /// Catch up on whatever was missed while the socket was down
    async fn after_reconnect(&self) {
        let open = {
            let state = self.state.lock().await;
            match (state.store.conversation_id(), state.peer.clone()) {
                (Some(conversation_id), Some((peer_id, _))) => Some((conversation_id.to_string(), peer_id)),
                _ => None,
            }
        };
        if let Some((conversation_id, peer_id)) = open {
            if let Err(e) = self.load_history(&conversation_id, &peer_id).await {
                warn!("History refresh after reconnect failed: {}", e);
            }
        }
        if let Err(e) = self.sync_notifications().await {
            warn!("Notification refresh after reconnect failed: {}", e);
        }
    }

    // ---- inbound ---------------------------------------------------------

    pub async fn handle_frame(&self, frame: SocketFrame) {
        let event = events::decode_event(&frame);
        self.handle_event(event).await;
    }

    pub async fn handle_event(&self, event: InboundEvent) {
        let self_id = self.user_id();
        let mut updates = Vec::new();
        let mut read_receipt_for = None;
        let mut typing_decay = None;
        {
            let mut state = self.state.lock().await;
            match event {
                InboundEvent::NewMessage { message, sender_name } => {
                    let outcome = state.store.apply_inbound(message.clone(), &self_id);
                    match &outcome {
                        InboundOutcome::Appended | InboundOutcome::Confirmed { .. } => {
                            updates.extend(state.messages_update());
                            if outcome == InboundOutcome::Appended && message.sender_id != self_id {
                                read_receipt_for = Some(message.conversation_id.clone());
                            }
                        }
                        InboundOutcome::Duplicate | InboundOutcome::OtherConversation => {}
                    }
                    if let LedgerOutcome::Counted { conversation_id, count, notification_id } =
                        state.ledger.on_inbound_message(&message, sender_name.as_deref())
                    {
                        if let Some(notification) = state.ledger.notifications().iter().find(|n| n.id == notification_id) {
                            updates.push(EngineUpdate::NotificationAdded(notification.clone()));
                        }
                        updates.push(EngineUpdate::UnreadChanged {
                            conversation_id,
                            count,
                            total: state.ledger.total(),
                        });
                    }
                }
                InboundEvent::MessageDelivered { message_id } => {
                    if state.store.mark_delivered(&message_id) {
                        updates.extend(state.messages_update());
                    }
                }
                InboundEvent::MessageRead { message_id } => {
                    if state.store.mark_read(&message_id, &self_id) {
                        updates.extend(state.messages_update());
                    }
                }
                InboundEvent::MessagesRead { conversation_id, reader_id } => {
                    let changed = state.store.mark_conversation_read(&conversation_id, &self_id, reader_id.as_deref());
                    if !changed.is_empty() {
                        updates.extend(state.messages_update());
                    }
                }
                InboundEvent::Typing { conversation_id, user_id } => {
                    let now = Instant::now();
                    let was_typing = state.typing.is_typing(now);
                    if let Some(generation) = state.typing.on_typing(&conversation_id, &user_id, &self_id, now) {
                        if !was_typing {
                            updates.push(EngineUpdate::Typing {
                                conversation_id: conversation_id.clone(),
                                user_id: Some(user_id),
                                typing: true,
                            });
                        }
                        typing_decay = Some((generation, conversation_id, state.typing.window()));
                    }
                }
                InboundEvent::ComplaintAssigned(notification) | InboundEvent::VideoCall(notification) => {
                    if state.ledger.ingest(notification.clone()) {
                        updates.push(EngineUpdate::NotificationAdded(notification));
                        updates.push(state.notifications_update());
                    }
                }
                InboundEvent::ChatNotificationsRead { conversation_id, notification_ids } => {
                    state.ledger.apply_remote_read(conversation_id.as_deref(), &notification_ids);
                    updates.push(state.counts_update());
                    updates.push(state.notifications_update());
                }
                InboundEvent::AllChatNotificationsRead => {
                    state.ledger.apply_remote_read_all();
                    updates.push(state.counts_update());
                    updates.push(state.notifications_update());
                }
                InboundEvent::Ignored(_) => {}
            }
        }
        self.publish_all(updates);

        if let Some((generation, conversation_id, window)) = typing_decay {
            self.schedule_typing_decay(generation, conversation_id, window);
        }
        if let Some(conversation_id) = read_receipt_for {
            // The conversation is on screen, so the peer's message has been seen
            self.binder
                .emit_quietly(names::MARK_MESSAGES_READ, json!({"conversationId": conversation_id, "userId": self_id}))
                .await;
        }
    }

    fn schedule_typing_decay(&self, generation: u64, conversation_id: String, window: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let expired = {
                let mut state = engine.state.lock().await;
                state.typing.expire(generation, Instant::now())
            };
            if expired {
                engine.publish(EngineUpdate::Typing {
                    conversation_id,
                    user_id: None,
                    typing: false,
                });
            }
        });
    }

    // ---- conversations ---------------------------------------------------

    /// Open the conversation with `peer_id`: wholesale replace the visible
    /// sequence, zero its unread count, fetch history, tell the server it is read.
    pub async fn open_conversation(&self, peer_id: &str, peer_role: Role) -> Result<(), ChatError> {
        let self_id = self.user_id();
        if let Some(bad) = [self_id.as_str(), peer_id].into_iter().find(|id| !is_addressable(id)) {
            warn!("Cannot open a conversation with {}: invalid participant id {}", peer_id, bad);
            return Err(ChatError::InvalidAddress(bad.to_string()));
        }
        let conversation_id = canonical_id(&self_id, peer_id);
        let mut updates = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.store.open(&conversation_id);
            state.typing.set_conversation(Some(&conversation_id));
            state.peer = Some((peer_id.to_string(), peer_role));
            let cleared = state.ledger.on_conversation_opened(&conversation_id);
            updates.extend(state.messages_update());
            updates.push(EngineUpdate::UnreadChanged {
                conversation_id: conversation_id.clone(),
                count: 0,
                total: state.ledger.total(),
            });
            if cleared > 0 {
                updates.push(state.notifications_update());
            }
        }
        self.publish_all(updates);

        let loaded = self.load_history(&conversation_id, peer_id).await;
        self.mark_read_remote(&conversation_id, &self_id).await;
        loaded
    }

    pub async fn close_conversation(&self) {
        let mut state = self.state.lock().await;
        state.store.close();
        state.typing.set_conversation(None);
        state.ledger.on_conversation_closed();
        state.peer = None;
    }

    async fn load_history(&self, conversation_id: &str, peer_id: &str) -> Result<(), ChatError> {
        let self_id = self.user_id();
        match self.call("History fetch", self.api.fetch_history(&self_id, peer_id)).await {
            Ok(history) => {
                let update = {
                    let mut state = self.state.lock().await;
                    if state.store.load_history(conversation_id, history, &self_id) {
                        state.messages_update()
                    } else {
                        None
                    }
                };
                self.publish_all(update.into_iter().collect());
                Ok(())
            }
            Err(e) => {
                warn!("Could not load history for {}: {}", conversation_id, e);
                self.publish(EngineUpdate::Notice(format!("Could not load messages: {}", e)));
                Err(e)
            }
        }
    }

    async fn mark_read_remote(&self, conversation_id: &str, user_id: &str) {
        if let Err(e) = self.call("Mark read", self.api.mark_messages_read(conversation_id, user_id)).await {
            warn!("Server mark-read for {} failed: {}", conversation_id, e);
        }
        self.binder
            .emit_quietly(names::MARK_MESSAGES_READ, json!({"conversationId": conversation_id, "userId": user_id}))
            .await;
    }

    pub async fn open_conversation_id(&self) -> Option<String> {
        self.state.lock().await.store.conversation_id().map(|c| c.to_string())
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.store.messages().to_vec()
    }

    pub async fn is_peer_typing(&self) -> bool {
        self.state.lock().await.typing.is_typing(Instant::now())
    }

    /// Tell the peer we are typing in the open conversation
    pub async fn notify_typing(&self) {
        let conversation_id = self.open_conversation_id().await;
        if let Some(conversation_id) = conversation_id {
            self.binder.emit_typing(&conversation_id, &self.user_id()).await;
        }
    }

    // ---- sending ---------------------------------------------------------

    fn build_optimistic(identity: &SessionIdentity, conversation_id: &str, peer: &(String, Role), draft: &Draft) -> Message {
        let now = Utc::now();
        let attachments: Vec<Attachment> = draft
            .attachments
            .iter()
            .map(|a| Attachment {
                name: a.name.clone(),
                url: format!("local://{}", a.name),
                mime_type: a.mime_type.clone(),
                size_bytes: a.data.len() as u64,
            })
            .collect();
        let text = draft.text.clone().filter(|t| !t.trim().is_empty());
        Message {
            id: new_temp_id(now),
            conversation_id: conversation_id.to_string(),
            sender_id: identity.user_id.clone(),
            receiver_id: peer.0.clone(),
            sender_role: identity.role.as_str().to_string(),
            receiver_role: peer.1.as_str().to_string(),
            message_class: MessageClass::classify(text.as_deref(), &attachments),
            text,
            attachments,
            sent_at: now,
            delivery_state: DeliveryState::Optimistic,
        }
    }

    /// Send to the open conversation.
    ///
    /// The optimistic entry is visible before this awaits anything on the
    /// network. On failure it is rolled back and the draft is returned inside
    /// `ChatError::SendFailed`; there is no automatic retry.
    pub async fn send_message(&self, draft: Draft) -> Result<Message, ChatError> {
        if draft.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if !self.binder.can_send() {
            return Err(ChatError::SendFailed {
                draft,
                reason: ChatError::NotConnected.to_string(),
            });
        }

        let identity = self.identity();
        let (optimistic, update) = {
            let mut state = self.state.lock().await;
            let (conversation_id, peer) = match (state.store.conversation_id(), state.peer.clone()) {
                (Some(conversation_id), Some(peer)) => (conversation_id.to_string(), peer),
                _ => return Err(ChatError::NoOpenConversation),
            };
            let optimistic = Self::build_optimistic(&identity, &conversation_id, &peer, &draft);
            state.store.push_optimistic(optimistic.clone());
            (optimistic, state.messages_update())
        };
        self.publish_all(update.into_iter().collect());

        let temp_id = optimistic.id.clone();
        match self.call("Send", self.api.send_message(&optimistic, &draft.attachments)).await {
            Ok(confirmed) => {
                let update = {
                    let mut state = self.state.lock().await;
                    match state.store.confirm_send(&temp_id, confirmed.clone()) {
                        ConfirmOutcome::NotOpen => {
                            debug!("{} confirmed as {} after its conversation closed", temp_id, confirmed.id);
                            None
                        }
                        _ => state.messages_update(),
                    }
                };
                self.publish_all(update.into_iter().collect());
                info!("Message {} persisted as {}", temp_id, confirmed.id);
                self.relay(&confirmed).await;
                Ok(confirmed)
            }
            Err(e) => {
                let reason = e.to_string();
                error!("Send of {} failed: {}", temp_id, reason);
                let update = {
                    let mut state = self.state.lock().await;
                    state.store.rollback(&temp_id);
                    state.messages_update()
                };
                self.publish_all(update.into_iter().collect());
                self.publish(EngineUpdate::SendFailed {
                    temp_id,
                    draft: draft.clone(),
                    reason: reason.clone(),
                });
                Err(ChatError::SendFailed { draft, reason })
            }
        }
    }

    /// Push the persisted message to the peer's room. The ack confirms delivery.
    async fn relay(&self, confirmed: &Message) {
        let payload = match serde_json::to_value(confirmed) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Could not encode {} for relay: {}", confirmed.id, e);
                return;
            }
        };
        match self.binder.emit_with_ack(names::SEND_MESSAGE, payload).await {
            Ok(_) => {
                debug!("Relay of {} acknowledged", confirmed.id);
                let update = {
                    let mut state = self.state.lock().await;
                    if state.store.mark_delivered(&confirmed.id) {
                        state.messages_update()
                    } else {
                        None
                    }
                };
                self.publish_all(update.into_iter().collect());
            }
            Err(e) => warn!("Relay of {} not acknowledged: {}", confirmed.id, e),
        }
    }

    // ---- unread & notifications -------------------------------------------

    pub async fn unread_count(&self, conversation_id: &str) -> u32 {
        self.state.lock().await.ledger.count(conversation_id)
    }

    pub async fn unread_counts(&self) -> HashMap<String, u32> {
        self.state.lock().await.ledger.counts().clone()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.state.lock().await.ledger.notifications().to_vec()
    }

    /// Mark one notification read: local flip first, rolled back if the server refuses
    pub async fn mark_notification_read(&self, notification_id: &str) -> Result<(), ChatError> {
        let (snapshot, updates) = {
            let mut state = self.state.lock().await;
            let snapshot = state.ledger.mark_one(notification_id)?;
            (snapshot, vec![state.counts_update(), state.notifications_update()])
        };
        if snapshot.is_empty() {
            return Ok(());
        }
        self.publish_all(updates);

        let result = self.call("Mark notification read", self.api.mark_notification_read(notification_id)).await;
        self.settle_mark(snapshot, result).await
    }

    /// Mark every chat notification read and zero all counts, optimistically
    pub async fn mark_all_read(&self) -> Result<(), ChatError> {
        let user_id = self.user_id();
        let (snapshot, updates) = {
            let mut state = self.state.lock().await;
            let snapshot = state.ledger.mark_all();
            (snapshot, vec![state.counts_update(), state.notifications_update()])
        };
        self.publish_all(updates);

        let result = self
            .call("Mark all read", self.api.mark_all_chat_notifications_read(&user_id))
            .await;
        if result.is_ok() {
            self.binder
                .emit_quietly(names::MARK_ALL_CHAT_NOTIFICATIONS_READ, json!({ "userId": user_id }))
                .await;
        }
        self.settle_mark(snapshot, result).await
    }

    async fn settle_mark(&self, snapshot: MarkSnapshot, result: Result<(), ChatError>) -> Result<(), ChatError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Mark-read rejected, restoring previous state: {}", e);
                let updates = {
                    let mut state = self.state.lock().await;
                    state.ledger.rollback(snapshot);
                    vec![state.counts_update(), state.notifications_update()]
                };
                self.publish_all(updates);
                self.publish(EngineUpdate::Notice(format!("Could not mark as read: {}", e)));
                Err(ChatError::MarkReadFailed(e.to_string()))
            }
        }
    }

    /// Replace local notifications and counts with the server's view
    pub async fn sync_notifications(&self) -> Result<(), ChatError> {
        let user_id = self.user_id();
        let notifications = self.call("Notification fetch", self.api.fetch_notifications(&user_id)).await?;
        let updates = {
            let mut state = self.state.lock().await;
            state.ledger.resync(notifications);
            vec![state.counts_update(), state.notifications_update()]
        };
        self.publish_all(updates);
        Ok(())
    }

    pub async fn refresh_unread_total(&self) -> Result<u32, ChatError> {
        let identity = self.identity();
        let total = self
            .call("Unread count", self.api.unread_chat_count(&identity.user_id, identity.role))
            .await?;
        self.publish(EngineUpdate::UnreadTotal(total));
        Ok(total)
    }

    async fn warm_start(&self) {
        let Some(path) = self.config.cache_path.clone() else {
            return;
        };
        let user_id = self.user_id();
        let Some(cache) = LedgerCache::load(&path, &user_id, self.config.cache_max_age(), Utc::now()) else {
            return;
        };
        info!("Warm-starting unread counts from {}", path.display());
        let update = {
            let mut state = self.state.lock().await;
            state.ledger.seed(&cache);
            state.counts_update()
        };
        self.publish(update);
    }

    pub async fn save_unread_cache(&self) -> Result<(), ChatError> {
        let Some(path) = self.config.cache_path.clone() else {
            return Ok(());
        };
        let cache = self.state.lock().await.ledger.to_cache(Utc::now());
        cache.save(&path)
    }
}
