use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PersistenceError;
use crate::ids::{MessageId, UserId};

/// A chat message as returned from history queries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Persistence collaborator used by the hub and the HTTP surface.
///
/// Implementations must be safe to call concurrently. The hub never awaits
/// presence or typing writes on its control loop.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist a message and return its assigned id.
    async fn save_message(
        &self,
        sender: &UserId,
        receiver: Option<&UserId>,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<MessageId, PersistenceError>;

    /// Messages exchanged between `user` and `counterpart`, newest first.
    /// With no counterpart, returns broadcast messages.
    async fn message_history(
        &self,
        user: &UserId,
        counterpart: Option<&UserId>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>, PersistenceError>;

    async fn set_online(&self, user: &UserId, online: bool) -> Result<(), PersistenceError>;

    async fn set_typing(
        &self,
        user: &UserId,
        receiver: &UserId,
        is_typing: bool,
    ) -> Result<(), PersistenceError>;

    /// Users currently marked online and seen recently.
    async fn list_online_users(&self) -> Result<Vec<UserId>, PersistenceError>;
}
