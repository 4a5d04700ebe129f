// Inbound payload normalization
// Socket events and REST bodies arrive with drifting field names (`_id` vs `id`,
// `createdAt` vs `timestamp`, populated sender objects...). Everything is folded
// into the canonical models here so nothing deeper branches on wire shapes.

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Attachment, DeliveryState, Message, MessageClass, Notification, NotificationKind};
use super::addressing::{canonical_id, is_addressable};
use super::transport::SocketFrame;

pub mod names {
    pub const NEW_MESSAGE: &str = "new_message";
    pub const MESSAGE_DELIVERED: &str = "message_delivered";
    pub const MESSAGE_READ: &str = "message_read";
    pub const MESSAGES_READ: &str = "messages_read";
    pub const RECEIVE_TYPING: &str = "receive_typing";
    pub const NEW_COMPLAINT_ASSIGNED: &str = "new_complaint_assigned";
    pub const NEW_VIDEO_CALL_NOTIFICATION: &str = "new_video_call_notification";
    pub const CHAT_NOTIFICATIONS_READ: &str = "chat_notifications_read";
    pub const ALL_CHAT_NOTIFICATIONS_READ: &str = "all_chat_notifications_read";

    pub const JOIN_USER_ROOM: &str = "join_user_room";
    pub const JOIN_ROLE_ROOM: &str = "join_role_room";
    pub const TYPING: &str = "typing";
    pub const SEND_MESSAGE: &str = "send_message";
    pub const MARK_MESSAGES_READ: &str = "mark_messages_read";
    pub const MARK_ALL_CHAT_NOTIFICATIONS_READ: &str = "mark_all_chat_notifications_read";
}

/// A socket event after normalization
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewMessage { message: Message, sender_name: Option<String> },
    MessageDelivered { message_id: String },
    MessageRead { message_id: String },
    MessagesRead { conversation_id: String, reader_id: Option<String> },
    Typing { conversation_id: String, user_id: String },
    ComplaintAssigned(Notification),
    VideoCall(Notification),
    ChatNotificationsRead { conversation_id: Option<String>, notification_ids: Vec<String> },
    AllChatNotificationsRead,
    Ignored(String),
}

pub fn fallback_id() -> String {
    format!("fallback-{}", Uuid::new_v4())
}

/// First non-empty string (or number) among `keys`.
/// Populated references (`{"_id": ..}`) resolve to their id.
fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match value.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            Some(obj @ Value::Object(_)) => {
                if let Some(id) = str_field(obj, &["_id", "id"]) {
                    return Some(id);
                }
            }
            _ => {}
        }
    }
    None
}

/// Display name from a populated reference, e.g. `{"senderId": {"_id": "..", "name": ".."}}`
fn populated_name(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .filter(|v| v.is_object())
        .find_map(|obj| str_field(obj, &["name", "fullName", "username"]))
}

fn bool_field(value: &Value, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| value.get(*key).and_then(Value::as_bool))
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<i64>().ok().and_then(millis_to_datetime)),
        Value::Number(n) => n.as_i64().and_then(millis_to_datetime),
        _ => None,
    }
}

fn millis_to_datetime(raw: i64) -> Option<DateTime<Utc>> {
    // Seconds are still seen from older endpoints
    if raw.abs() < 100_000_000_000 {
        Utc.timestamp_opt(raw, 0).single()
    } else {
        Utc.timestamp_millis_opt(raw).single()
    }
}

fn timestamp_field(value: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter().find_map(|key| value.get(*key).and_then(parse_timestamp))
}

fn attachments_field(value: &Value) -> Vec<Attachment> {
    let items = match value.get("attachments").or_else(|| value.get("files")) {
        Some(Value::Array(items)) => items,
        _ => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| {
            let url = str_field(item, &["url", "fileUrl", "path"])?;
            let name = str_field(item, &["name", "fileName", "originalName", "filename"])
                .unwrap_or_else(|| url.rsplit('/').next().unwrap_or("file").to_string());
            Some(Attachment {
                name,
                url,
                mime_type: str_field(item, &["mimeType", "mimetype", "type"])
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size_bytes: ["sizeBytes", "size"]
                    .iter()
                    .find_map(|key| item.get(*key).and_then(Value::as_u64))
                    .unwrap_or(0),
            })
        })
        .collect()
}

fn delivery_state_field(value: &Value) -> DeliveryState {
    if bool_field(value, &["read", "isRead"]).unwrap_or(false) {
        return DeliveryState::Read;
    }
    match value.get("status").and_then(Value::as_str) {
        Some("read") | Some("seen") => DeliveryState::Read,
        _ => DeliveryState::Delivered,
    }
}

/// Some events wrap the message: `{"message": {...}}`
fn unwrap_message(value: &Value) -> &Value {
    match value.get("message") {
        Some(inner @ Value::Object(_)) => inner,
        _ => value,
    }
}

/// Normalize a message payload. Returns `None` (after logging) for payloads
/// that cannot be a message: no sender, or neither text nor attachments.
pub fn normalize_message(raw: &Value) -> Option<(Message, Option<String>)> {
    let value = unwrap_message(raw);
    let sender_id = match str_field(value, &["senderId", "sender", "from"]) {
        Some(id) => id,
        None => {
            warn!("Dropping message payload without sender: {}", value);
            return None;
        }
    };
    let receiver_id = str_field(value, &["receiverId", "receiver", "to"]).unwrap_or_default();
    let conversation_id = match str_field(value, &["conversationId", "chatId", "roomId"]) {
        Some(id) => id,
        None if is_addressable(&sender_id) && is_addressable(&receiver_id) => canonical_id(&sender_id, &receiver_id),
        None => {
            warn!("Dropping message from {}: participant ids cannot form a conversation id", sender_id);
            return None;
        }
    };

    let text = match value.get("text").or_else(|| value.get("content")).or_else(|| value.get("message")) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    };
    let attachments = attachments_field(value);

    let id = str_field(value, &["_id", "id", "messageId"]).unwrap_or_else(|| {
        let id = fallback_id();
        debug!("Message from {} had no id, using {}", sender_id, id);
        id
    });
    let sent_at = timestamp_field(value, &["sentAt", "createdAt", "timestamp"]).unwrap_or_else(Utc::now);
    let message_class = MessageClass::classify(text.as_deref(), &attachments);
    let sender_name = str_field(value, &["senderName"]).or_else(|| populated_name(value, &["senderId", "sender"]));

    let message = Message {
        id,
        conversation_id,
        sender_id,
        receiver_id,
        sender_role: str_field(value, &["senderRole", "senderModel"]).unwrap_or_default().to_lowercase(),
        receiver_role: str_field(value, &["receiverRole", "receiverModel"]).unwrap_or_default().to_lowercase(),
        text,
        attachments,
        sent_at,
        delivery_state: delivery_state_field(value),
        message_class,
    };
    if !message.has_content() {
        warn!("Dropping empty message payload from {}", message.sender_id);
        return None;
    }
    Some((message, sender_name))
}

/// Build the confirmed copy of `sent` from a persistence response. Falls back to
/// the sent content when the server only echoes an id.
pub fn normalize_confirmation(raw: &Value, sent: &Message) -> Message {
    let value = unwrap_envelope(raw);
    if let Some((mut confirmed, _)) = normalize_message(value) {
        confirmed.delivery_state = confirmed.delivery_state.max(DeliveryState::Delivered);
        return confirmed;
    }
    let mut confirmed = sent.clone();
    confirmed.id = str_field(unwrap_message(value), &["_id", "id", "messageId"]).unwrap_or_else(fallback_id);
    confirmed.delivery_state = DeliveryState::Delivered;
    confirmed
}

fn kind_field(value: &Value, default_kind: NotificationKind) -> NotificationKind {
    match value.get("type").and_then(Value::as_str) {
        Some("chat") | Some("message") => NotificationKind::Chat,
        Some("complaint_assignment") | Some("complaint") => NotificationKind::ComplaintAssignment,
        Some("video_call") => NotificationKind::VideoCall,
        _ => default_kind,
    }
}

pub fn normalize_notification(raw: &Value, default_kind: NotificationKind) -> Notification {
    let value = match raw.get("notification") {
        Some(inner @ Value::Object(_)) => inner,
        _ => raw,
    };
    let kind = kind_field(value, default_kind);
    let default_title = match kind {
        NotificationKind::Chat => "New message",
        NotificationKind::ComplaintAssignment => "New complaint assigned",
        NotificationKind::VideoCall => "Incoming video call",
    };
    let message = match value.get("message") {
        Some(Value::String(s)) => s.clone(),
        _ => str_field(value, &["body", "text", "description"]).unwrap_or_default(),
    };
    Notification {
        id: str_field(value, &["_id", "id", "notificationId"]).unwrap_or_else(fallback_id),
        title: str_field(value, &["title"]).unwrap_or_else(|| default_title.to_string()),
        message,
        created_at: timestamp_field(value, &["createdAt", "timestamp"]).unwrap_or_else(Utc::now),
        read: bool_field(value, &["read", "isRead"]).unwrap_or(false),
        kind,
        sender_id: str_field(value, &["senderId", "sender", "from"]),
        sender_name: str_field(value, &["senderName"]).or_else(|| populated_name(value, &["senderId", "sender"])),
        conversation_id: str_field(value, &["conversationId", "chatId"]),
    }
}

/// Strip `{"data": ...}` / `{"success": true, "data": ...}` envelopes
pub fn unwrap_envelope(value: &Value) -> &Value {
    match value.get("data") {
        Some(inner) if !inner.is_null() => inner,
        _ => value,
    }
}

/// List bodies come bare, enveloped, or under a named key
fn list_items<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    let value = unwrap_envelope(value);
    let list = if value.is_array() { Some(value) } else { value.get(key) };
    match list {
        Some(Value::Array(items)) => items,
        _ => &[],
    }
}

pub fn normalize_history(value: &Value) -> Vec<Message> {
    list_items(value, "messages")
        .iter()
        .filter_map(|item| normalize_message(item).map(|(message, _)| message))
        .collect()
}

pub fn normalize_notifications(value: &Value) -> Vec<Notification> {
    list_items(value, "notifications")
        .iter()
        .map(|item| normalize_notification(item, NotificationKind::Chat))
        .collect()
}

pub fn normalize_count(value: &Value) -> Option<u32> {
    let value = unwrap_envelope(value);
    if let Some(n) = value.as_u64() {
        return u32::try_from(n).ok();
    }
    ["count", "unreadCount", "total"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_u64))
        .and_then(|n| u32::try_from(n).ok())
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    match value.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                other => str_field(other, &["_id", "id"]),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Decode a socket frame into an engine event
pub fn decode_event(frame: &SocketFrame) -> InboundEvent {
    let data = &frame.data;
    let decoded = match frame.event.as_str() {
        names::NEW_MESSAGE => normalize_message(data)
            .map(|(message, sender_name)| InboundEvent::NewMessage { message, sender_name }),
        names::MESSAGE_DELIVERED => str_field(data, &["messageId", "_id", "id"])
            .map(|message_id| InboundEvent::MessageDelivered { message_id }),
        names::MESSAGE_READ => str_field(data, &["messageId", "_id", "id"])
            .map(|message_id| InboundEvent::MessageRead { message_id }),
        names::MESSAGES_READ => str_field(data, &["conversationId", "chatId"]).map(|conversation_id| {
            InboundEvent::MessagesRead {
                conversation_id,
                reader_id: str_field(data, &["userId", "readerId", "readBy"]),
            }
        }),
        names::RECEIVE_TYPING => match (
            str_field(data, &["conversationId", "chatId"]),
            str_field(data, &["userId", "senderId", "from"]),
        ) {
            (Some(conversation_id), Some(user_id)) => Some(InboundEvent::Typing { conversation_id, user_id }),
            _ => None,
        },
        names::NEW_COMPLAINT_ASSIGNED => Some(InboundEvent::ComplaintAssigned(normalize_notification(
            data,
            NotificationKind::ComplaintAssignment,
        ))),
        names::NEW_VIDEO_CALL_NOTIFICATION => Some(InboundEvent::VideoCall(normalize_notification(
            data,
            NotificationKind::VideoCall,
        ))),
        names::CHAT_NOTIFICATIONS_READ => Some(InboundEvent::ChatNotificationsRead {
            conversation_id: str_field(data, &["conversationId", "chatId"]),
            notification_ids: string_list(data, "notificationIds"),
        }),
        names::ALL_CHAT_NOTIFICATIONS_READ => Some(InboundEvent::AllChatNotificationsRead),
        other => {
            debug!("Ignoring socket event {}", other);
            return InboundEvent::Ignored(other.to_string());
        }
    };
    decoded.unwrap_or_else(|| {
        warn!("Malformed {} payload: {}", frame.event, data);
        InboundEvent::Ignored(frame.event.clone())
    })
}
