//! In-process [`ChatStore`] that records every call.
//!
//! Used by hub and server tests to assert on persistence traffic and to
//! inject storage failures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use parley_core::{ChatStore, MessageId, PersistenceError, StoredMessage, UserId};

/// A presence-side write observed by the store, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceWrite {
    Online { user: UserId, online: bool },
    Typing { user: UserId, receiver: UserId, is_typing: bool },
}

#[derive(Default)]
pub struct MemoryChatStore {
    messages: Mutex<Vec<StoredMessage>>,
    presence: Mutex<Vec<PresenceWrite>>,
    online: Mutex<BTreeMap<UserId, bool>>,
    save_calls: AtomicUsize,
    fail_messages: AtomicBool,
    fail_presence: AtomicBool,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `save_message` calls fail.
    pub fn fail_message_writes(&self, fail: bool) {
        self.fail_messages.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent presence and typing writes fail.
    pub fn fail_presence_writes(&self, fail: bool) {
        self.fail_presence.store(fail, Ordering::SeqCst);
    }

    /// Number of `save_message` calls, including failed ones.
    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub fn saved_messages(&self) -> Vec<StoredMessage> {
        self.messages.lock().clone()
    }

    /// Successful presence and typing writes, oldest first.
    pub fn presence_writes(&self) -> Vec<PresenceWrite> {
        self.presence.lock().clone()
    }

    /// Offline writes recorded for `user`.
    pub fn offline_writes(&self, user: &UserId) -> usize {
        self.presence
            .lock()
            .iter()
            .filter(|w| matches!(w, PresenceWrite::Online { user: u, online: false } if u == user))
            .count()
    }

    fn check_presence(&self) -> Result<(), PersistenceError> {
        if self.fail_presence.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("presence writes disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn save_message(
        &self,
        sender: &UserId,
        receiver: Option<&UserId>,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<MessageId, PersistenceError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("message writes disabled".into()));
        }
        let id = MessageId::new();
        self.messages.lock().push(StoredMessage {
            id: id.clone(),
            sender_id: sender.clone(),
            receiver_id: receiver.cloned(),
            content: content.to_owned(),
            created_at: sent_at,
        });
        Ok(id)
    }

    async fn message_history(
        &self,
        user: &UserId,
        counterpart: Option<&UserId>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>, PersistenceError> {
        let messages = self.messages.lock();
        let between = |m: &&StoredMessage| match counterpart {
            Some(other) => {
                (&m.sender_id == user && m.receiver_id.as_ref() == Some(other))
                    || (&m.sender_id == other && m.receiver_id.as_ref() == Some(user))
            }
            None => m.receiver_id.is_none(),
        };
        Ok(messages
            .iter()
            .rev()
            .filter(between)
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn set_online(&self, user: &UserId, online: bool) -> Result<(), PersistenceError> {
        self.check_presence()?;
        self.online.lock().insert(user.clone(), online);
        self.presence.lock().push(PresenceWrite::Online {
            user: user.clone(),
            online,
        });
        Ok(())
    }

    async fn set_typing(
        &self,
        user: &UserId,
        receiver: &UserId,
        is_typing: bool,
    ) -> Result<(), PersistenceError> {
        self.check_presence()?;
        self.presence.lock().push(PresenceWrite::Typing {
            user: user.clone(),
            receiver: receiver.clone(),
            is_typing,
        });
        Ok(())
    }

    async fn list_online_users(&self) -> Result<Vec<UserId>, PersistenceError> {
        Ok(self
            .online
            .lock()
            .iter()
            .filter(|(_, online)| **online)
            .map(|(user, _)| user.clone())
            .collect())
    }
}
