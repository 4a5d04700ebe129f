// Unread ledger and notification list
// Per-conversation unread counts plus the notifications shown in the panel.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::models::{Message, Notification, NotificationKind};
use super::addressing::peer_of;
use super::error::ChatError;

/// Result of feeding an inbound message to the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerOutcome {
    /// Count bumped and a notification added
    Counted { conversation_id: String, count: u32, notification_id: String },
    /// Open conversation or our own message
    Suppressed,
    /// Same logical event already ingested
    Duplicate,
}

/// What a local mark-read flipped, so a failed server call can undo it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkSnapshot {
    flipped: Vec<String>,
    removed_counts: HashMap<String, u32>,
}

impl MarkSnapshot {
    pub fn is_empty(&self) -> bool {
        self.flipped.is_empty() && self.removed_counts.is_empty()
    }
}

type DedupKey = (Option<String>, Option<String>, String, i64);

fn dedup_key(notification: &Notification) -> DedupKey {
    let millis = notification.created_at.timestamp_millis();
    (
        notification.conversation_id.clone(),
        notification.sender_id.clone(),
        notification.message.clone(),
        (millis + 500).div_euclid(1000),
    )
}

pub struct UnreadLedger {
    self_id: String,
    open_conversation: Option<String>,
    counts: HashMap<String, u32>,
    notifications: Vec<Notification>,
}

impl UnreadLedger {
    pub fn new(self_id: &str) -> Self {
        UnreadLedger {
            self_id: self_id.to_string(),
            open_conversation: None,
            counts: HashMap::new(),
            notifications: Vec::new(),
        }
    }

    pub fn count(&self, conversation_id: &str) -> u32 {
        self.counts.get(conversation_id).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &HashMap<String, u32> {
        &self.counts
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn unread_notifications(&self) -> usize {
        self.notifications.iter().filter(|n| !n.read).count()
    }

    /// A conversation became the open one: its count drops to zero and its
    /// chat notifications are marked read. Returns how many were unread.
    pub fn on_conversation_opened(&mut self, conversation_id: &str) -> u32 {
        self.open_conversation = Some(conversation_id.to_string());
        let cleared = self.counts.insert(conversation_id.to_string(), 0).unwrap_or(0);
        for notification in self.notifications.iter_mut() {
            if notification.kind == NotificationKind::Chat
                && notification.conversation_id.as_deref() == Some(conversation_id)
            {
                notification.read = true;
            }
        }
        if cleared > 0 {
            info!("Cleared {} unread in {}", cleared, conversation_id);
        }
        cleared
    }

    pub fn on_conversation_closed(&mut self) {
        self.open_conversation = None;
    }

    /// Count a `new_message` that is not for the open conversation
    pub fn on_inbound_message(&mut self, message: &Message, sender_name: Option<&str>) -> LedgerOutcome {
        if message.sender_id == self.self_id
            || self.open_conversation.as_deref() == Some(message.conversation_id.as_str())
        {
            return LedgerOutcome::Suppressed;
        }

        let preview = match message.text.as_deref() {
            Some(text) if !text.trim().is_empty() => text.to_string(),
            _ => format!("Sent {} attachment(s)", message.attachments.len()),
        };
        let title = match sender_name {
            Some(name) => format!("New message from {}", name),
            None => "New message".to_string(),
        };
        let notification = Notification {
            id: format!("chat-{}", message.id),
            title,
            message: preview,
            created_at: message.sent_at,
            read: false,
            kind: NotificationKind::Chat,
            sender_id: Some(message.sender_id.clone()),
            sender_name: sender_name.map(|s| s.to_string()),
            conversation_id: Some(message.conversation_id.clone()),
        };
        let notification_id = notification.id.clone();
        if !self.ingest(notification) {
            return LedgerOutcome::Duplicate;
        }

        let count = self.counts.entry(message.conversation_id.clone()).or_insert(0);
        *count += 1;
        debug!("Unread {} -> {}", message.conversation_id, count);
        LedgerOutcome::Counted {
            conversation_id: message.conversation_id.clone(),
            count: *count,
            notification_id,
        }
    }

    /// Add a notification unless the same logical event is already present.
    /// Returns false for duplicates.
    pub fn ingest(&mut self, mut notification: Notification) -> bool {
        if notification.kind == NotificationKind::Chat && notification.sender_id.is_none() {
            // Server rows often carry only the conversation; route them to the peer
            notification.sender_id = notification
                .conversation_id
                .as_deref()
                .and_then(|conversation_id| peer_of(conversation_id, &self.self_id));
        }
        let key = dedup_key(&notification);
        if self
            .notifications
            .iter()
            .any(|n| n.id == notification.id || dedup_key(n) == key)
        {
            debug!("Dropping duplicate notification {}", notification.id);
            return false;
        }
        self.notifications.push(notification);
        true
    }

    /// Optimistically mark one notification read
    pub fn mark_one(&mut self, notification_id: &str) -> Result<MarkSnapshot, ChatError> {
        let notification = self
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id)
            .ok_or_else(|| ChatError::UnknownNotification(notification_id.to_string()))?;

        let mut snapshot = MarkSnapshot::default();
        if notification.read {
            return Ok(snapshot);
        }
        notification.read = true;
        snapshot.flipped.push(notification.id.clone());

        if notification.kind == NotificationKind::Chat {
            if let Some(conversation_id) = notification.conversation_id.clone() {
                if let Some(count) = self.counts.get_mut(&conversation_id) {
                    if *count > 0 {
                        *count -= 1;
                        snapshot.removed_counts.insert(conversation_id, 1);
                    }
                }
            }
        }
        Ok(snapshot)
    }

    /// Optimistically mark every chat notification read and zero all counts
    pub fn mark_all(&mut self) -> MarkSnapshot {
        let mut snapshot = MarkSnapshot::default();
        for notification in self.notifications.iter_mut() {
            if notification.kind == NotificationKind::Chat && !notification.read {
                notification.read = true;
                snapshot.flipped.push(notification.id.clone());
            }
        }
        for (conversation_id, count) in self.counts.iter_mut() {
            if *count > 0 {
                snapshot.removed_counts.insert(conversation_id.clone(), *count);
                *count = 0;
            }
        }
        snapshot
    }

    /// Undo a mark-read whose server call failed. Counts are added back rather
    /// than overwritten so messages that arrived meanwhile are kept; the open
    /// conversation stays at zero.
    pub fn rollback(&mut self, snapshot: MarkSnapshot) {
        warn!(
            "Rolling back mark-read of {} notification(s) across {} conversation(s)",
            snapshot.flipped.len(),
            snapshot.removed_counts.len()
        );
        for notification in self.notifications.iter_mut() {
            if snapshot.flipped.contains(&notification.id) {
                let in_open = notification.conversation_id.is_some()
                    && notification.conversation_id == self.open_conversation;
                if !in_open {
                    notification.read = false;
                }
            }
        }
        for (conversation_id, removed) in snapshot.removed_counts {
            if self.open_conversation.as_deref() == Some(conversation_id.as_str()) {
                continue;
            }
            *self.counts.entry(conversation_id).or_insert(0) += removed;
        }
    }

    /// Server notification list is the source of truth: replace the list and
    /// rebuild counts from unread chat notifications.
    pub fn resync(&mut self, notifications: Vec<Notification>) {
        self.notifications.clear();
        for notification in notifications {
            self.ingest(notification);
        }

        self.counts.clear();
        for notification in self.notifications.iter_mut() {
            if notification.kind != NotificationKind::Chat {
                continue;
            }
            let Some(conversation_id) = notification.conversation_id.as_deref() else {
                continue;
            };
            if self.open_conversation.as_deref() == Some(conversation_id) {
                notification.read = true;
                continue;
            }
            if !notification.read {
                *self.counts.entry(conversation_id.to_string()).or_insert(0) += 1;
            }
        }
        info!(
            "Resynced {} notifications, {} unread chat messages",
            self.notifications.len(),
            self.total()
        );
    }

    /// Another session marked notifications read (`chat_notifications_read`)
    pub fn apply_remote_read(&mut self, conversation_id: Option<&str>, notification_ids: &[String]) {
        for notification in self.notifications.iter_mut() {
            let by_id = notification_ids.contains(&notification.id);
            let by_conversation = conversation_id.is_some()
                && notification.kind == NotificationKind::Chat
                && notification.conversation_id.as_deref() == conversation_id;
            if by_id || by_conversation {
                notification.read = true;
            }
        }
        if let Some(conversation_id) = conversation_id {
            self.counts.insert(conversation_id.to_string(), 0);
        }
    }

    /// Another session marked everything read (`all_chat_notifications_read`)
    pub fn apply_remote_read_all(&mut self) {
        for notification in self.notifications.iter_mut() {
            if notification.kind == NotificationKind::Chat {
                notification.read = true;
            }
        }
        for count in self.counts.values_mut() {
            *count = 0;
        }
    }

    /// Seed counts from the warm-start cache. Live counts win over cached ones.
    pub fn seed(&mut self, cache: &LedgerCache) {
        for (conversation_id, count) in &cache.counts {
            if self.open_conversation.as_deref() == Some(conversation_id.as_str()) {
                continue;
            }
            self.counts.entry(conversation_id.clone()).or_insert(*count);
        }
    }

    pub fn to_cache(&self, now: DateTime<Utc>) -> LedgerCache {
        LedgerCache {
            user_id: self.self_id.clone(),
            saved_at: now,
            counts: self
                .counts
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(id, count)| (id.clone(), *count))
                .collect(),
        }
    }
}

/// Snapshot of the unread counts kept on disk between runs.
///
/// Only a warm start for the badge: the server resync replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerCache {
    pub user_id: String,
    pub saved_at: DateTime<Utc>,
    pub counts: HashMap<String, u32>,
}

impl LedgerCache {
    /// Load a cache written for `user_id` no longer than `max_age` ago
    pub fn load(path: &Path, user_id: &str, max_age: Duration, now: DateTime<Utc>) -> Option<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(_) => return None,
        };
        let cache: LedgerCache = match serde_json::from_str(&contents) {
            Ok(cache) => cache,
            Err(e) => {
                warn!("Ignoring unreadable unread cache {}: {}", path.display(), e);
                return None;
            }
        };
        if cache.user_id != user_id {
            debug!("Unread cache belongs to {}, ignoring", cache.user_id);
            return None;
        }
        if now - cache.saved_at > max_age {
            debug!("Unread cache from {} is stale", cache.saved_at);
            return None;
        }
        Some(cache)
    }

    pub fn save(&self, path: &Path) -> Result<(), ChatError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        debug!("Saved unread cache to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeliveryState, MessageClass};
    use crate::sync::addressing::canonical_id;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn incoming(id: &str, from: &str, text: &str, sent_at: DateTime<Utc>) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: canonical_id(from, "u1"),
            sender_id: from.to_string(),
            receiver_id: "u1".to_string(),
            sender_role: "mechanic".to_string(),
            receiver_role: "coordinator".to_string(),
            text: Some(text.to_string()),
            attachments: Vec::new(),
            sent_at,
            delivery_state: DeliveryState::Delivered,
            message_class: MessageClass::Text,
        }
    }

    #[test]
    fn test_counts_only_non_open_peer_messages() {
        let mut ledger = UnreadLedger::new("u1");
        ledger.on_conversation_opened("u1_u2");

        assert_eq!(ledger.on_inbound_message(&incoming("a", "u2", "hi", at(0)), None), LedgerOutcome::Suppressed);
        let mut own = incoming("b", "u3", "mine", at(1));
        own.sender_id = "u1".to_string();
        assert_eq!(ledger.on_inbound_message(&own, None), LedgerOutcome::Suppressed);

        let outcome = ledger.on_inbound_message(&incoming("c", "u3", "brake job done", at(2)), Some("Sam"));
        assert_eq!(
            outcome,
            LedgerOutcome::Counted {
                conversation_id: "u1_u3".to_string(),
                count: 1,
                notification_id: "chat-c".to_string(),
            }
        );
        assert_eq!(ledger.count("u1_u2"), 0);
        assert_eq!(ledger.notifications()[0].title, "New message from Sam");
    }

    #[test]
    fn test_duplicate_events_not_double_counted() {
        let mut ledger = UnreadLedger::new("u1");
        ledger.on_inbound_message(&incoming("c", "u3", "ping", at(2)), None);
        // Replay under a different id, same second
        let outcome = ledger.on_inbound_message(&incoming("fallback-1", "u3", "ping", at(2)), None);
        assert_eq!(outcome, LedgerOutcome::Duplicate);
        assert_eq!(ledger.count("u1_u3"), 1);
        assert_eq!(ledger.notifications().len(), 1);
    }

    #[test]
    fn test_mark_one_and_rollback() {
        let mut ledger = UnreadLedger::new("u1");
        ledger.on_inbound_message(&incoming("a", "u3", "one", at(0)), None);
        ledger.on_inbound_message(&incoming("b", "u3", "two", at(5)), None);

        let snapshot = ledger.mark_one("chat-a").unwrap();
        assert_eq!(ledger.count("u1_u3"), 1);
        assert!(ledger.notifications()[0].read);

        ledger.rollback(snapshot);
        assert_eq!(ledger.count("u1_u3"), 2);
        assert!(!ledger.notifications()[0].read);

        assert!(matches!(ledger.mark_one("nope"), Err(ChatError::UnknownNotification(_))));
    }

    #[test]
    fn test_rollback_keeps_open_conversation_at_zero() {
        let mut ledger = UnreadLedger::new("u1");
        ledger.on_inbound_message(&incoming("a", "u3", "one", at(0)), None);
        ledger.on_inbound_message(&incoming("b", "u4", "two", at(1)), None);
        let snapshot = ledger.mark_all();
        assert_eq!(ledger.total(), 0);

        // User opens u3 while the request is pending, then it fails
        ledger.on_conversation_opened("u1_u3");
        ledger.on_inbound_message(&incoming("c", "u4", "three", at(2)), None);
        ledger.rollback(snapshot);

        assert_eq!(ledger.count("u1_u3"), 0);
        assert_eq!(ledger.count("u1_u4"), 2);
    }

    #[test]
    fn test_resync_rebuilds_counts() {
        let mut ledger = UnreadLedger::new("u1");
        ledger.on_conversation_opened("u1_u2");
        let chat = |id: &str, conversation: &str, read: bool, secs: i64| Notification {
            id: id.to_string(),
            title: "New message".to_string(),
            message: format!("body {}", id),
            created_at: at(secs),
            read,
            kind: NotificationKind::Chat,
            sender_id: Some("peer".to_string()),
            sender_name: None,
            conversation_id: Some(conversation.to_string()),
        };
        let complaint = Notification {
            id: "n9".to_string(),
            title: "Complaint assigned".to_string(),
            message: "CMP-104".to_string(),
            created_at: at(9),
            read: false,
            kind: NotificationKind::ComplaintAssignment,
            sender_id: None,
            sender_name: None,
            conversation_id: None,
        };
        ledger.resync(vec![
            chat("n1", "u1_u3", false, 1),
            chat("n2", "u1_u3", false, 2),
            chat("n3", "u1_u3", true, 3),
            chat("n4", "u1_u2", false, 4),
            chat("n1", "u1_u3", false, 1),
            complaint,
        ]);

        assert_eq!(ledger.notifications().len(), 5);
        assert_eq!(ledger.count("u1_u3"), 2);
        assert_eq!(ledger.count("u1_u2"), 0);
        assert_eq!(ledger.total(), 2);
    }

    #[test]
    fn test_chat_notification_without_sender_routed_to_peer() {
        let mut ledger = UnreadLedger::new("u1");
        let server_row = Notification {
            id: "n1".to_string(),
            title: "New message".to_string(),
            message: "hi".to_string(),
            created_at: at(0),
            read: false,
            kind: NotificationKind::Chat,
            sender_id: None,
            sender_name: None,
            conversation_id: Some("u1_u7".to_string()),
        };
        let mut foreign = server_row.clone();
        foreign.id = "n2".to_string();
        foreign.message = "not ours".to_string();
        foreign.conversation_id = Some("u5_u7".to_string());
        ledger.resync(vec![server_row, foreign]);

        assert_eq!(ledger.notifications()[0].sender_id.as_deref(), Some("u7"));
        assert_eq!(ledger.notifications()[1].sender_id, None);

        // The socket copy of the same message now matches the server row
        let outcome = ledger.on_inbound_message(&incoming("m1", "u7", "hi", at(0)), None);
        assert_eq!(outcome, LedgerOutcome::Duplicate);
        assert_eq!(ledger.count("u1_u7"), 1);
    }

    #[test]
    fn test_remote_reads() {
        let mut ledger = UnreadLedger::new("u1");
        ledger.on_inbound_message(&incoming("a", "u3", "one", at(0)), None);
        ledger.on_inbound_message(&incoming("b", "u4", "two", at(1)), None);

        ledger.apply_remote_read(Some("u1_u3"), &[]);
        assert_eq!(ledger.count("u1_u3"), 0);
        assert_eq!(ledger.unread_notifications(), 1);

        ledger.apply_remote_read_all();
        assert_eq!(ledger.total(), 0);
        assert_eq!(ledger.unread_notifications(), 0);
    }

    #[test]
    fn test_cache_round_trip_and_staleness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unread_cache.json");

        let mut ledger = UnreadLedger::new("u1");
        ledger.on_inbound_message(&incoming("a", "u3", "one", at(0)), None);
        ledger.to_cache(at(100)).save(&path).unwrap();

        let max_age = Duration::seconds(600);
        let cache = LedgerCache::load(&path, "u1", max_age, at(200)).unwrap();
        assert_eq!(cache.counts.get("u1_u3"), Some(&1));
        assert!(LedgerCache::load(&path, "u1", max_age, at(800)).is_none());
        assert!(LedgerCache::load(&path, "someone-else", max_age, at(200)).is_none());

        let mut fresh = UnreadLedger::new("u1");
        fresh.on_conversation_opened("u1_u3");
        fresh.seed(&cache);
        assert_eq!(fresh.count("u1_u3"), 0);
    }
}
