use chrono::{DateTime, Duration, Utc};
use tracing::instrument;

use parley_core::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{format_ts, get};

/// Online and typing state, keyed by user.
pub struct PresenceRepo {
    db: Database,
}

impl PresenceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert the online flag and refresh `last_seen`.
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn set_online(&self, user: &UserId, online: bool, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO online_status (user_id, is_online, last_seen) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET is_online = excluded.is_online, last_seen = excluded.last_seen",
                rusqlite::params![user.as_str(), online, format_ts(at)],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(user_id = %user, receiver_id = %receiver))]
    pub fn set_typing(
        &self,
        user: &UserId,
        receiver: &UserId,
        is_typing: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO typing_status (user_id, receiver_id, is_typing, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, receiver_id) DO UPDATE SET is_typing = excluded.is_typing, updated_at = excluded.updated_at",
                rusqlite::params![user.as_str(), receiver.as_str(), is_typing, format_ts(at)],
            )?;
            Ok(())
        })
    }

    #[cfg(test)]
    pub(crate) fn is_typing(&self, user: &UserId, receiver: &UserId) -> Result<bool, StoreError> {
        use rusqlite::OptionalExtension;
        self.db.with_conn(|conn| {
            let flag = conn
                .query_row(
                    "SELECT is_typing FROM typing_status WHERE user_id = ?1 AND receiver_id = ?2",
                    [user.as_str(), receiver.as_str()],
                    |row| row.get::<_, bool>(0),
                )
                .optional()?;
            Ok(flag.unwrap_or(false))
        })
    }

    /// Users flagged online whose `last_seen` falls within `window` of `now`.
    #[instrument(skip(self))]
    pub fn online_since(&self, now: DateTime<Utc>, window: Duration) -> Result<Vec<UserId>, StoreError> {
        let cutoff = format_ts(now - window);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM online_status
                 WHERE is_online = 1 AND last_seen >= ?1
                 ORDER BY user_id",
            )?;
            let mut rows = stmt.query([cutoff])?;
            let mut users = Vec::new();
            while let Some(row) = rows.next()? {
                users.push(UserId::from_raw(get::<String>(row, 0, "online_status", "user_id")?));
            }
            Ok(users)
        })
    }
}
