// Delivery and read receipts
// Tracks optimistic -> delivered -> read for messages in the open conversation.

use log::debug;

use crate::models::{DeliveryState, Message};
use super::reconciliation::MessageStore;

/// Move `message` forward to `target`. Never moves it backwards.
///
/// Returns true if the state changed.
pub fn advance(message: &mut Message, target: DeliveryState) -> bool {
    if target <= message.delivery_state {
        return false;
    }
    debug!("Message {} {:?} -> {:?}", message.id, message.delivery_state, target);
    message.delivery_state = target;
    true
}

impl MessageStore {
    /// Send acknowledgement or `message_delivered` event
    pub fn mark_delivered(&mut self, message_id: &str) -> bool {
        match self.get_mut(message_id) {
            Some(message) => advance(message, DeliveryState::Delivered),
            None => {
                debug!("Delivery receipt for unknown message {}", message_id);
                false
            }
        }
    }

    /// `message_read` for a single message the local user sent
    pub fn mark_read(&mut self, message_id: &str, self_id: &str) -> bool {
        match self.get_mut(message_id) {
            Some(message) if message.sender_id == self_id => advance(message, DeliveryState::Read),
            Some(_) => false,
            None => {
                debug!("Read receipt for unknown message {}", message_id);
                false
            }
        }
    }

    /// `messages_read` for a whole conversation: every confirmed message the
    /// local user sent there is now read. Optimistic entries stay as they are,
    /// they get replaced on confirmation.
    ///
    /// Returns the ids that changed.
    pub fn mark_conversation_read(&mut self, conversation_id: &str, self_id: &str, reader_id: Option<&str>) -> Vec<String> {
        if !self.is_open(conversation_id) {
            return Vec::new();
        }
        match reader_id {
            Some(reader) if reader != self_id => {}
            // Our own read marker echoed back, or nobody named: not a receipt
            _ => {
                debug!("Ignoring messages_read in {} from {:?}", conversation_id, reader_id);
                return Vec::new();
            }
        }

        let mut changed = Vec::new();
        for message in self.iter_mut() {
            if message.sender_id == self_id && !message.is_optimistic() && advance(message, DeliveryState::Read) {
                changed.push(message.id.clone());
            }
        }
        changed
    }
}
