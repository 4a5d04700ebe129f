use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static::lazy_static! {
    static ref URGENT_PATTERN: Regex = Regex::new(r"(?i)urgent|asap|immediately|important").unwrap();
    static ref TASK_PATTERN: Regex = Regex::new(r"(?i)task|todo|action item").unwrap();
}

/// Portal a session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Coordinator,
    Mechanic,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Coordinator => "coordinator",
            Role::Mechanic => "mechanic",
        }
    }

    /// Who this portal chats with when no peer role is given
    pub fn default_peer(&self) -> Role {
        match self {
            Role::Admin => Role::Coordinator,
            Role::Coordinator => Role::Admin,
            Role::Mechanic => Role::Coordinator,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "coordinator" => Ok(Role::Coordinator),
            "mechanic" => Ok(Role::Mechanic),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Who is logged in. Owned by the host; the engine only reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionIdentity {
    pub user_id: String,
    pub role: Role,
    pub auth_token: String,
}

impl SessionIdentity {
    pub fn new(user_id: &str, role: Role, auth_token: &str) -> Self {
        SessionIdentity {
            user_id: user_id.to_string(),
            role,
            auth_token: auth_token.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub url: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// Lifecycle of a message as seen by its sender.
///
/// Ordered so that `max` never moves a message backwards.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Optimistic = 0, // Shown locally, not yet confirmed
    Delivered = 1,  // Persisted by the server
    Read = 2,       // Seen by the peer
}

/// Presentation hint derived from content at send time
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageClass {
    Text,
    Task,
    Urgent,
    File,
}

impl MessageClass {
    pub fn classify(text: Option<&str>, attachments: &[Attachment]) -> Self {
        let text = text.unwrap_or("");
        if URGENT_PATTERN.is_match(text) {
            MessageClass::Urgent
        } else if TASK_PATTERN.is_match(text) {
            MessageClass::Task
        } else if !attachments.is_empty() {
            MessageClass::File
        } else {
            MessageClass::Text
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub sender_role: String,
    pub receiver_role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub sent_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    pub message_class: MessageClass,
}

impl Message {
    pub fn is_optimistic(&self) -> bool {
        self.delivery_state == DeliveryState::Optimistic
    }

    /// A message needs text or at least one attachment
    pub fn has_content(&self) -> bool {
        let has_text = self.text.as_deref().map(|t| !t.trim().is_empty()).unwrap_or(false);
        has_text || !self.attachments.is_empty()
    }

    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

/// A file picked in the compose area, not uploaded yet
#[derive(Debug, Clone, PartialEq)]
pub struct DraftAttachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// What the user typed. Handed back on send failure so nothing has to be retyped.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Draft {
    pub text: Option<String>,
    pub attachments: Vec<DraftAttachment>,
}

impl Draft {
    pub fn text(text: &str) -> Self {
        Draft {
            text: Some(text.to_string()),
            attachments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        let blank = self.text.as_deref().map(|t| t.trim().is_empty()).unwrap_or(true);
        blank && self.attachments.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Chat,
    ComplaintAssignment,
    VideoCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub kind: NotificationKind,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub conversation_id: Option<String>,
}
