//! Wire events exchanged between the hub and connected clients.
//!
//! Every event travels as a single JSON text frame. The same shape is used for
//! client-originated messages and typing signals and for server-originated
//! presence (`status`) changes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FrameError;
use crate::identity::Identity;
use crate::ids::{MessageId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Typing,
    Status,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Typing => "typing",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "typing" => Ok(Self::Typing),
            "status" => Ok(Self::Status),
            other => Err(FrameError::UnknownKind(other.to_string())),
        }
    }
}

/// Presence state carried by `status` events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Online,
    Offline,
}

impl PresenceState {
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

/// A routable chat event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Server-assigned id, present once a message has been persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceState>,
    pub timestamp: DateTime<Utc>,
}

impl ChatEvent {
    pub fn message(sender: &Identity, content: impl Into<String>, receiver: Option<UserId>) -> Self {
        Self {
            kind: EventKind::Message,
            id: None,
            content: Some(content.into()),
            user_id: sender.user_id.clone(),
            username: sender.display_name.clone(),
            receiver_id: receiver,
            is_typing: false,
            status: None,
            timestamp: Utc::now(),
        }
    }

    pub fn typing(sender: &Identity, receiver: UserId, is_typing: bool) -> Self {
        Self {
            kind: EventKind::Typing,
            id: None,
            content: None,
            user_id: sender.user_id.clone(),
            username: sender.display_name.clone(),
            receiver_id: Some(receiver),
            is_typing,
            status: None,
            timestamp: Utc::now(),
        }
    }

    pub fn status(subject: &Identity, state: PresenceState) -> Self {
        Self {
            kind: EventKind::Status,
            id: None,
            content: None,
            user_id: subject.user_id.clone(),
            username: subject.display_name.clone(),
            receiver_id: None,
            is_typing: false,
            status: Some(state),
            timestamp: Utc::now(),
        }
    }

    /// Attach the id assigned by the persistence layer.
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// True when the event addresses a single receiver.
    pub fn is_directed(&self) -> bool {
        self.receiver_id.is_some()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A frame as sent by a client.
///
/// Sender, id and timestamp are never taken from the client: the connection's
/// verified identity is stamped on when the frame becomes a [`ChatEvent`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    #[serde(default)]
    pub is_typing: Option<bool>,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))
    }

    /// Validate the frame and turn it into an event sent by `sender`.
    pub fn into_event(self, sender: &Identity) -> Result<ChatEvent, FrameError> {
        let kind: EventKind = self.kind.parse()?;
        let receiver = self.receiver_id.filter(|r| !r.as_str().is_empty());
        match kind {
            EventKind::Message => {
                let content = self
                    .content
                    .filter(|c| !c.trim().is_empty())
                    .ok_or(FrameError::MissingField("content"))?;
                Ok(ChatEvent::message(sender, content, receiver))
            }
            EventKind::Typing => {
                let receiver = receiver.ok_or(FrameError::MissingField("receiver_id"))?;
                Ok(ChatEvent::typing(sender, receiver, self.is_typing.unwrap_or(true)))
            }
            // Presence is only ever announced by the hub.
            EventKind::Status => Err(FrameError::ServerOnly(kind)),
        }
    }
}

/// Parse raw frame text into an event from `sender`.
pub fn decode_frame(text: &str, sender: &Identity) -> Result<ChatEvent, FrameError> {
    InboundFrame::parse(text)?.into_event(sender)
}
