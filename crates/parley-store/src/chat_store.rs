use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use parley_core::{ChatStore, MessageId, PersistenceError, StoredMessage, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;
use crate::presence::PresenceRepo;

/// How long an online flag stays trustworthy without a refresh.
pub const DEFAULT_ONLINE_WINDOW_SECS: i64 = 300;

/// [`ChatStore`] backed by the SQLite [`Database`].
///
/// Every call runs on the blocking pool; the connection mutex is never held
/// across an await point.
#[derive(Clone)]
pub struct SqliteChatStore {
    db: Database,
    online_window: Duration,
}

impl SqliteChatStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            online_window: Duration::seconds(DEFAULT_ONLINE_WINDOW_SECS),
        }
    }

    pub fn with_online_window(mut self, window: Duration) -> Self {
        self.online_window = window;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let result = tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(StoreError::from)?;
        Ok(result?)
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn save_message(
        &self,
        sender: &UserId,
        receiver: Option<&UserId>,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<MessageId, PersistenceError> {
        let sender = sender.clone();
        let receiver = receiver.cloned();
        let content = content.to_owned();
        self.blocking(move |db| MessageRepo::new(db).insert(&sender, receiver.as_ref(), &content, sent_at))
            .await
    }

    async fn message_history(
        &self,
        user: &UserId,
        counterpart: Option<&UserId>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>, PersistenceError> {
        let user = user.clone();
        let counterpart = counterpart.cloned();
        self.blocking(move |db| {
            let repo = MessageRepo::new(db);
            match counterpart {
                Some(other) => repo.conversation(&user, &other, limit, offset),
                None => repo.broadcasts(limit, offset),
            }
        })
        .await
    }

    async fn set_online(&self, user: &UserId, online: bool) -> Result<(), PersistenceError> {
        let user = user.clone();
        self.blocking(move |db| PresenceRepo::new(db).set_online(&user, online, Utc::now()))
            .await
    }

    async fn set_typing(
        &self,
        user: &UserId,
        receiver: &UserId,
        is_typing: bool,
    ) -> Result<(), PersistenceError> {
        let user = user.clone();
        let receiver = receiver.clone();
        self.blocking(move |db| {
            PresenceRepo::new(db).set_typing(&user, &receiver, is_typing, Utc::now())
        })
        .await
    }

    async fn list_online_users(&self) -> Result<Vec<UserId>, PersistenceError> {
        let window = self.online_window;
        self.blocking(move |db| PresenceRepo::new(db).online_since(Utc::now(), window))
            .await
    }
}
