//! Messaging Gateway
//!
//! Platform-neutral interface between the escalation engine and the chat
//! transport. The engine only needs to send, delete, acknowledge a button
//! press and look up a chat's administrators; everything else about the
//! transport stays in the adapter (see `telegram`).

use async_trait::async_trait;

use crate::registry::ChatKind;

/// Error types for gateway operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}

/// Button for inline keyboards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyboardButton {
    pub text: String,
    pub callback_data: Option<String>,
    pub url: Option<String>,
}

impl KeyboardButton {
    pub fn callback(text: &str, data: &str) -> Self {
        Self {
            text: text.to_string(),
            callback_data: Some(data.to_string()),
            url: None,
        }
    }

    pub fn link(text: &str, url: &str) -> Self {
        Self {
            text: text.to_string(),
            callback_data: None,
            url: Some(url.to_string()),
        }
    }
}

/// Rows of buttons attached to an outgoing message
pub type Keyboard = Vec<Vec<KeyboardButton>>;

/// Callback payloads carried by reminder buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    /// Staff marks the original message as answered
    MarkAnswered(i32),
}

impl ButtonAction {
    /// Encode action as callback data string
    pub fn encode(&self) -> String {
        match self {
            Self::MarkAnswered(id) => format!("answered:{}", id),
        }
    }

    /// Decode callback data string to action
    pub fn decode(data: &str) -> Option<Self> {
        let (action, id) = data.split_once(':')?;
        match action {
            "answered" => id.trim().parse().ok().map(Self::MarkAnswered),
            _ => None,
        }
    }
}

/// A message seen in a chat the bot is in
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub channel_id: i64,
    /// Group title, `None` for private chats
    pub channel_title: Option<String>,
    /// `None` for private chats
    pub channel_kind: Option<ChatKind>,
    pub message_id: i32,
    pub sender_id: i64,
    pub sender_handle: String,
    pub text: String,
    pub reply_to_message_id: Option<i32>,
    /// Posted by the bot itself
    pub from_self: bool,
}

/// An inline button was pressed
#[derive(Debug, Clone)]
pub struct ButtonPress {
    /// Transport id used to acknowledge the press
    pub callback_id: String,
    pub presser_id: i64,
    pub presser_handle: String,
    pub payload: String,
}

/// The bot's own membership in a chat changed
#[derive(Debug, Clone)]
pub struct MembershipChanged {
    pub channel_id: i64,
    pub channel_title: String,
    pub channel_kind: ChatKind,
    pub new_status: MembershipStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStatus {
    /// Member or administrator
    Present,
    /// Left or kicked
    Removed,
}

/// Inbound event stream item
#[derive(Debug, Clone)]
pub enum InboundEvent {
    NewMessage(NewMessage),
    ButtonPress(ButtonPress),
    MembershipChanged(MembershipChanged),
}

/// Gateway trait - implemented by the chat transport
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Send a message, returning its id
    async fn send(
        &self,
        channel_id: i64,
        text: &str,
        thread_id: Option<i32>,
        keyboard: Option<Keyboard>,
    ) -> Result<i32, GatewayError>;

    /// Delete a message
    async fn delete(&self, channel_id: i64, message_id: i32) -> Result<(), GatewayError>;

    /// Answer a button press; `text` is shown only to the presser
    async fn acknowledge(&self, callback_id: &str, text: &str) -> Result<(), GatewayError>;

    /// User ids of the chat's administrators
    async fn fetch_staff(&self, channel_id: i64) -> Result<Vec<i64>, GatewayError>;
}

/// Telegram deep link to a message in a supergroup (`-100<id>` chat ids)
pub fn message_link(channel_id: i64, message_id: i32) -> Option<String> {
    const SUPERGROUP_OFFSET: i64 = 1_000_000_000_000;
    let internal = -channel_id - SUPERGROUP_OFFSET;
    (internal > 0).then(|| format!("https://t.me/c/{}/{}", internal, message_id))
}
