// REST collaborator
// History fetch, message persistence and the notification endpoints.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde_json::{json, Value};

use crate::models::{DraftAttachment, Message, Notification, Role};
use super::error::ChatError;
use super::events;

/// The backend calls the engine depends on
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Ordered history of the conversation between `user_id` and `peer_id`
    async fn fetch_history(&self, user_id: &str, peer_id: &str) -> Result<Vec<Message>, ChatError>;

    /// Persist a message; multipart when attachments are present
    async fn send_message(&self, message: &Message, attachments: &[DraftAttachment]) -> Result<Message, ChatError>;

    async fn mark_messages_read(&self, conversation_id: &str, user_id: &str) -> Result<(), ChatError>;

    async fn fetch_notifications(&self, user_id: &str) -> Result<Vec<Notification>, ChatError>;

    async fn mark_notification_read(&self, notification_id: &str) -> Result<(), ChatError>;

    async fn mark_all_chat_notifications_read(&self, user_id: &str) -> Result<(), ChatError>;

    async fn unread_chat_count(&self, user_id: &str, role: Role) -> Result<u32, ChatError>;

    /// Called when the session token is refreshed
    fn set_auth_token(&self, _token: &str) {}
}

pub struct HttpChatApi {
    client: Client,
    base_url: Url,
    token: RwLock<String>,
    timeout: Duration,
}

impl HttpChatApi {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, ChatError> {
        let base_url = Url::parse(base_url).map_err(|e| ChatError::Config(format!("Invalid API url '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ChatError::Config(format!("API url '{}' cannot be a base", base_url)));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(HttpChatApi {
            client,
            base_url,
            token: RwLock::new(token.to_string()),
            timeout,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self.token.read().map(|t| t.clone()).unwrap_or_default();
        request.bearer_auth(token)
    }

    fn request_error(&self, err: reqwest::Error) -> ChatError {
        if err.is_timeout() {
            ChatError::Timeout(self.timeout.as_millis() as u64)
        } else if err.is_decode() {
            ChatError::Decode(err.to_string())
        } else {
            ChatError::Transport(err.to_string())
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, ChatError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        error!("Backend answered {}: {}", status, body);
        Err(ChatError::Http {
            status: status.as_u16(),
            message: body,
        })
    }

    async fn execute_json(&self, request: RequestBuilder) -> Result<Value, ChatError> {
        let response = self.execute(request).await?;
        let bytes = response.bytes().await.map_err(|e| self.request_error(e))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn multipart_form(message: &Message, attachments: &[DraftAttachment]) -> Result<Form, ChatError> {
        let mut form = Form::new()
            .text("clientId", message.id.clone())
            .text("conversationId", message.conversation_id.clone())
            .text("senderId", message.sender_id.clone())
            .text("receiverId", message.receiver_id.clone())
            .text("senderRole", message.sender_role.clone())
            .text("receiverRole", message.receiver_role.clone());
        if let Some(text) = &message.text {
            form = form.text("text", text.clone());
        }
        for attachment in attachments {
            let part = Part::bytes(attachment.data.clone())
                .file_name(attachment.name.clone())
                .mime_str(&attachment.mime_type)
                .map_err(|e| ChatError::Config(format!("Invalid mime type '{}': {}", attachment.mime_type, e)))?;
            form = form.part("attachments", part);
        }
        Ok(form)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_history(&self, user_id: &str, peer_id: &str) -> Result<Vec<Message>, ChatError> {
        let url = self.endpoint(&["chat", "history", user_id, peer_id]);
        debug!("GET {}", url);
        let body = self.execute_json(self.client.get(url)).await?;
        let messages = events::normalize_history(&body);
        info!("Fetched {} history messages for {} <-> {}", messages.len(), user_id, peer_id);
        Ok(messages)
    }

    async fn send_message(&self, message: &Message, attachments: &[DraftAttachment]) -> Result<Message, ChatError> {
        let url = self.endpoint(&["chat", "messages"]);
        let request = if attachments.is_empty() {
            self.client.post(url).json(&json!({
                "clientId": message.id,
                "conversationId": message.conversation_id,
                "senderId": message.sender_id,
                "receiverId": message.receiver_id,
                "senderRole": message.sender_role,
                "receiverRole": message.receiver_role,
                "text": message.text,
            }))
        } else {
            info!("Uploading {} attachment(s) with {}", attachments.len(), message.id);
            self.client.post(url).multipart(Self::multipart_form(message, attachments)?)
        };
        let body = self.execute_json(request).await?;
        Ok(events::normalize_confirmation(&body, message))
    }

    async fn mark_messages_read(&self, conversation_id: &str, user_id: &str) -> Result<(), ChatError> {
        let url = self.endpoint(&["chat", "conversations", conversation_id, "read"]);
        self.execute(self.client.put(url).json(&json!({ "userId": user_id }))).await?;
        Ok(())
    }

    async fn fetch_notifications(&self, user_id: &str) -> Result<Vec<Notification>, ChatError> {
        let url = self.endpoint(&["notifications", user_id]);
        let body = self.execute_json(self.client.get(url)).await?;
        Ok(events::normalize_notifications(&body))
    }

    async fn mark_notification_read(&self, notification_id: &str) -> Result<(), ChatError> {
        let url = self.endpoint(&["notifications", notification_id, "read"]);
        self.execute(self.client.post(url)).await?;
        Ok(())
    }

    async fn mark_all_chat_notifications_read(&self, user_id: &str) -> Result<(), ChatError> {
        let url = self.endpoint(&["notifications", user_id, "chat", "read-all"]);
        self.execute(self.client.post(url)).await?;
        Ok(())
    }

    async fn unread_chat_count(&self, user_id: &str, role: Role) -> Result<u32, ChatError> {
        let mut url = self.endpoint(&["chat", "unread-count", user_id]);
        url.query_pairs_mut().append_pair("role", role.as_str());
        let body = self.execute_json(self.client.get(url)).await?;
        events::normalize_count(&body).ok_or_else(|| ChatError::Decode(format!("Unexpected unread count body: {}", body)))
    }

    fn set_auth_token(&self, token: &str) {
        if let Ok(mut current) = self.token.write() {
            *current = token.to_string();
        }
    }
}
