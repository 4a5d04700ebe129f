// Conversation addressing
// Both participants must land on the same bucket no matter who starts the chat.

/// Separator between the two participant ids
pub const SEPARATOR: char = '_';

/// Whether `id` can take part in a canonical conversation id
pub fn is_addressable(id: &str) -> bool {
    !id.contains(SEPARATOR)
}

/// Canonical conversation id for an unordered pair of participants.
/// Neither id may contain [`SEPARATOR`]; callers check with [`is_addressable`].
pub fn canonical_id(user_a: &str, user_b: &str) -> String {
    debug_assert!(
        is_addressable(user_a) && is_addressable(user_b),
        "participant ids must not contain '{}': {:?}, {:?}",
        SEPARATOR,
        user_a,
        user_b
    );
    let (low, high) = if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    };
    format!("{}{}{}", low, SEPARATOR, high)
}

/// The participant of `conversation_id` that is not `self_id`.
///
/// Returns `None` when `self_id` is not part of the conversation.
pub fn peer_of(conversation_id: &str, self_id: &str) -> Option<String> {
    let prefix = format!("{}{}", self_id, SEPARATOR);
    let suffix = format!("{}{}", SEPARATOR, self_id);
    if let Some(peer) = conversation_id.strip_prefix(&prefix) {
        if !peer.is_empty() && canonical_id(self_id, peer) == conversation_id {
            return Some(peer.to_string());
        }
    }
    if let Some(peer) = conversation_id.strip_suffix(&suffix) {
        if !peer.is_empty() && canonical_id(self_id, peer) == conversation_id {
            return Some(peer.to_string());
        }
    }
    None
}
