// Shared message and id types used across the halley crates.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, MessageError>;

#[derive(thiserror::Error, Debug)]
pub enum MessageError {
    #[error("invalid session id: {0}")]
    InvalidId(String),
    #[error("invalid channel: {0}")]
    InvalidChannel(String),
}

/// Opaque server-side session identifier.
///
/// ```
/// use halley_message::SessionId;
/// use std::str::FromStr;
///
/// let id = SessionId::new();
/// let parsed = SessionId::from_str(&id.to_string()).expect("parse");
/// assert_eq!(id, parsed);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    // Generate a fresh random id for a new session.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    // Wrap an existing UUID when decoding from the wire.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = MessageError;

    fn from_str(input: &str) -> Result<Self> {
        // Preserve the original input for clearer error messages.
        let uuid = Uuid::parse_str(input).map_err(|_| MessageError::InvalidId(input.into()))?;
        Ok(Self(uuid))
    }
}

/// Slash-separated channel name, e.g. `/chat/lobby` or `/meta/connect`.
///
/// Channels under `/meta/` carry protocol-control traffic; everything else is
/// application traffic. Channels under `/service/` are request/response style
/// and never broadcast.
///
/// ```
/// use halley_message::ChannelId;
/// use std::str::FromStr;
///
/// let channel = ChannelId::from_str("/meta/connect").expect("channel");
/// assert!(channel.is_meta());
/// assert!(!ChannelId::from_str("/chat/lobby").expect("channel").is_meta());
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is a protocol-control (`/meta/**`) channel.
    pub fn is_meta(&self) -> bool {
        self.0.starts_with("/meta/")
    }

    /// Whether this is a request/response (`/service/**`) channel.
    pub fn is_service(&self) -> bool {
        self.0.starts_with("/service/")
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChannelId {
    type Err = MessageError;

    fn from_str(input: &str) -> Result<Self> {
        // A channel is an absolute path with no empty segments.
        let valid = match input.strip_prefix('/') {
            Some(rest) if !rest.is_empty() => rest.split('/').all(|s| !s.is_empty()),
            _ => false,
        };
        if !valid {
            return Err(MessageError::InvalidChannel(input.into()));
        }
        Ok(Self(input.into()))
    }
}

/// A Bayeux message: a channel, a JSON data payload, and optional wire ids.
///
/// Messages are freely mutable while extensions intercept them; once a
/// message is admitted to a session queue the engine never hands out a
/// mutable reference again, so queued messages are effectively immutable.
///
/// ```
/// use halley_message::{ChannelId, Message};
/// use std::str::FromStr;
///
/// let channel = ChannelId::from_str("/chat/lobby").expect("channel");
/// let message = Message::new(channel, serde_json::json!({"text": "hi"}));
/// assert!(!message.is_meta());
/// assert_eq!(message.data()["text"], "hi");
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    channel: ChannelId,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    client_id: Option<SessionId>,
}

impl Message {
    pub fn new(channel: ChannelId, data: Value) -> Self {
        Self {
            channel,
            data,
            id: None,
            client_id: None,
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn client_id(&self) -> Option<SessionId> {
        self.client_id
    }

    /// Whether this is a protocol-control message, decided by its channel.
    pub fn is_meta(&self) -> bool {
        self.channel.is_meta()
    }

    pub fn set_channel(&mut self, channel: ChannelId) {
        self.channel = channel;
    }

    pub fn set_data(&mut self, data: Value) {
        self.data = data;
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    pub fn set_client_id(&mut self, client_id: SessionId) {
        self.client_id = Some(client_id);
    }

    // Builder-style variants used when composing messages inline.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.set_id(id);
        self
    }

    pub fn with_client_id(mut self, client_id: SessionId) -> Self {
        self.set_client_id(client_id);
        self
    }
}
