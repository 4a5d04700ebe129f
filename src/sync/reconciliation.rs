// Message reconciliation for the open conversation
// Merges history fetches, optimistic sends and socket events into one ordered,
// duplicate-free sequence.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use rand::{distributions::Alphanumeric, Rng};

use crate::models::{DeliveryState, Message};

/// Prefix of locally assigned ids
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Build a local temporary id: `temp-<millis>-<random>`
pub fn new_temp_id(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    format!("{}{}-{}", TEMP_ID_PREFIX, now.timestamp_millis(), suffix.to_lowercase())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// What happened to an inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// Replaced an optimistic entry in place
    Confirmed { temp_id: String, index: usize },
    /// Already present, dropped
    Duplicate,
    /// Appended at the end of the sequence
    Appended,
    /// Belongs to a conversation that is not open; the sequence is untouched
    OtherConversation,
}

/// Result of resolving a send by its exact temp id
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    Replaced { index: usize },
    /// The socket echo got there first
    AlreadyPresent,
    /// The temp entry was gone (conversation switched) but the conversation is open again
    Appended,
    /// Conversation no longer open, nothing to update
    NotOpen,
}

pub struct MessageStore {
    conversation_id: Option<String>,
    messages: Vec<Message>,
    confirm_window: Duration,
    dedup_window: Duration,
}

impl MessageStore {
    pub fn new(confirm_window: Duration, dedup_window: Duration) -> Self {
        MessageStore {
            conversation_id: None,
            messages: Vec::new(),
            confirm_window,
            dedup_window,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn is_open(&self, conversation_id: &str) -> bool {
        self.conversation_id.as_deref() == Some(conversation_id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Message> {
        self.messages.iter_mut()
    }

    /// Switch to another conversation. Contents are dropped, never merged.
    pub fn open(&mut self, conversation_id: &str) {
        if self.conversation_id.as_deref() != Some(conversation_id) {
            info!("Opening conversation {} (was {:?})", conversation_id, self.conversation_id);
        }
        self.conversation_id = Some(conversation_id.to_string());
        self.messages.clear();
    }

    pub fn close(&mut self) {
        self.conversation_id = None;
        self.messages.clear();
    }

    /// Replace the sequence with the server history.
    ///
    /// Entries absorbed while the fetch was in flight (optimistic sends, socket
    /// events) are re-applied on top so they are neither lost nor doubled.
    /// Returns false if the conversation was switched before the history arrived.
    pub fn load_history(&mut self, conversation_id: &str, history: Vec<Message>, self_id: &str) -> bool {
        if !self.is_open(conversation_id) {
            debug!("Discarding stale history for {}", conversation_id);
            return false;
        }

        let in_flight = std::mem::take(&mut self.messages);
        self.messages = Vec::with_capacity(history.len() + in_flight.len());
        for message in history {
            if message.conversation_id != conversation_id {
                warn!("History for {} contained message {} of {}", conversation_id, message.id, message.conversation_id);
                continue;
            }
            // Server rows are distinct unless their ids match
            if self.get(&message.id).is_some() {
                continue;
            }
            self.messages.push(message);
        }

        for message in in_flight {
            if unconfirmed(&message) {
                // A history entry may already be the persisted copy of this send
                if let Some(index) = self.find_confirmation_for(&message) {
                    debug!("Optimistic {} already persisted as {}", message.id, self.messages[index].id);
                    continue;
                }
                self.messages.push(message);
            } else {
                self.apply_inbound(message, self_id);
            }
        }
        info!("Loaded {} messages for {}", self.messages.len(), conversation_id);
        true
    }

    /// Append a locally sent message before any network confirmation
    pub fn push_optimistic(&mut self, message: Message) {
        debug!("Optimistic append {} to {}", message.id, message.conversation_id);
        self.messages.push(message);
    }

    /// Absorb a `new_message` event
    pub fn apply_inbound(&mut self, message: Message, self_id: &str) -> InboundOutcome {
        if !self.is_open(&message.conversation_id) {
            return InboundOutcome::OtherConversation;
        }

        // Exact id already absorbed (REST confirmation beat the echo, or a replay)
        if self.get(&message.id).is_some() {
            debug!("Dropping replay of {}", message.id);
            return InboundOutcome::Duplicate;
        }

        if message.sender_id == self_id {
            if let Some(index) = self.find_optimistic_match(&message) {
                let temp_id = self.messages[index].id.clone();
                self.replace_confirmed(index, message);
                debug!("Confirmed {} as {}", temp_id, self.messages[index].id);
                return InboundOutcome::Confirmed { temp_id, index };
            }
        }

        if self.find_duplicate(&message).is_some() {
            debug!("Dropping near-duplicate {} from {}", message.id, message.sender_id);
            return InboundOutcome::Duplicate;
        }

        self.messages.push(message);
        InboundOutcome::Appended
    }

    /// Resolve a send whose persistence call returned `confirmed`
    pub fn confirm_send(&mut self, temp_id: &str, confirmed: Message) -> ConfirmOutcome {
        if let Some(index) = self.messages.iter().position(|m| m.id == temp_id) {
            if self.get(&confirmed.id).is_some() {
                // Echo already produced the server row; drop the leftover
                self.messages.remove(index);
                return ConfirmOutcome::AlreadyPresent;
            }
            self.replace_confirmed(index, confirmed);
            return ConfirmOutcome::Replaced { index };
        }

        if !self.is_open(&confirmed.conversation_id) {
            return ConfirmOutcome::NotOpen;
        }
        if self.get(&confirmed.id).is_some() || self.find_duplicate(&confirmed).is_some() {
            return ConfirmOutcome::AlreadyPresent;
        }

        let mut confirmed = confirmed;
        confirmed.delivery_state = confirmed.delivery_state.max(DeliveryState::Delivered);
        self.messages.push(confirmed);
        ConfirmOutcome::Appended
    }

    /// Remove an optimistic entry after its send failed
    pub fn rollback(&mut self, temp_id: &str) -> Option<Message> {
        let index = self
            .messages
            .iter()
            .position(|m| m.id == temp_id && unconfirmed(m))?;
        info!("Rolling back optimistic message {}", temp_id);
        Some(self.messages.remove(index))
    }

    fn replace_confirmed(&mut self, index: usize, confirmed: Message) {
        let slot = &mut self.messages[index];
        let message_class = slot.message_class;
        *slot = confirmed;
        slot.message_class = message_class;
        slot.delivery_state = slot.delivery_state.max(DeliveryState::Delivered);
    }

    /// Oldest optimistic entry from the same sender inside the confirm window,
    /// preferring one with identical content when several are in flight.
    fn find_optimistic_match(&self, incoming: &Message) -> Option<usize> {
        let mut first_in_window = None;
        for (index, candidate) in self.messages.iter().enumerate() {
            if !unconfirmed(candidate)
                || candidate.conversation_id != incoming.conversation_id
                || candidate.sender_id != incoming.sender_id
                || !within(candidate.sent_at, incoming.sent_at, self.confirm_window)
            {
                continue;
            }
            if same_content(candidate, incoming) {
                return Some(index);
            }
            if first_in_window.is_none() {
                first_in_window = Some(index);
            }
        }
        first_in_window
    }

    fn find_confirmation_for(&self, optimistic: &Message) -> Option<usize> {
        self.messages.iter().position(|m| {
            !unconfirmed(m)
                && m.conversation_id == optimistic.conversation_id
                && m.sender_id == optimistic.sender_id
                && same_content(m, optimistic)
                && within(m.sent_at, optimistic.sent_at, self.confirm_window)
        })
    }

    fn find_duplicate(&self, incoming: &Message) -> Option<usize> {
        self.messages.iter().position(|m| {
            m.id == incoming.id
                || (m.conversation_id == incoming.conversation_id
                    && m.sender_id == incoming.sender_id
                    && same_content(m, incoming)
                    && within(m.sent_at, incoming.sent_at, self.dedup_window))
        })
    }
}

/// Still carries a local id. An acknowledged send may already be `Delivered`
/// while waiting for the server copy to replace it.
fn unconfirmed(message: &Message) -> bool {
    message.is_optimistic() || is_temp_id(&message.id)
}

fn within(a: DateTime<Utc>, b: DateTime<Utc>, window: Duration) -> bool {
    (a - b).abs() <= window
}

fn same_content(a: &Message, b: &Message) -> bool {
    a.text_or_empty() == b.text_or_empty()
        && a.attachments.len() == b.attachments.len()
        && a.attachments.iter().zip(b.attachments.iter()).all(|(x, y)| x.name == y.name)
}
