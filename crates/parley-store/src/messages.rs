use chrono::{DateTime, Utc};
use tracing::instrument;

use parley_core::{MessageId, StoredMessage, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{format_ts, get, get_opt, parse_ts};

const TABLE: &str = "messages";
const COLUMNS: &str = "id, sender_id, receiver_id, content, created_at";

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a message and return its new id.
    #[instrument(skip(self, content), fields(sender_id = %sender, content_len = content.len()))]
    pub fn insert(
        &self,
        sender: &UserId,
        receiver: Option<&UserId>,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<MessageId, StoreError> {
        let id = MessageId::new();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.as_str(),
                    sender.as_str(),
                    receiver.map(|r| r.as_str()),
                    content,
                    format_ts(sent_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Conversation between two users in either direction, newest first.
    #[instrument(skip(self), fields(user_id = %user, counterpart = %counterpart))]
    pub fn conversation(
        &self,
        user: &UserId,
        counterpart: &UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3 OFFSET ?4"
        );
        self.query(
            &sql,
            rusqlite::params![user.as_str(), counterpart.as_str(), limit, offset],
        )
    }

    /// Broadcast messages, newest first.
    #[instrument(skip(self))]
    pub fn broadcasts(&self, limit: u32, offset: u32) -> Result<Vec<StoredMessage>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM messages
             WHERE receiver_id IS NULL
             ORDER BY created_at DESC, id DESC
             LIMIT ?1 OFFSET ?2"
        );
        self.query(&sql, rusqlite::params![limit, offset])
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
        })
    }

    fn query(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(map_row(row)?);
            }
            Ok(out)
        })
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> Result<StoredMessage, StoreError> {
    let created_at: String = get(row, 4, TABLE, "created_at")?;
    Ok(StoredMessage {
        id: MessageId::from_raw(get::<String>(row, 0, TABLE, "id")?),
        sender_id: UserId::from_raw(get::<String>(row, 1, TABLE, "sender_id")?),
        receiver_id: get_opt::<String>(row, 2, TABLE, "receiver_id")?.map(UserId::from_raw),
        content: get(row, 3, TABLE, "content")?,
        created_at: parse_ts(&created_at, TABLE, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn repo() -> MessageRepo {
        MessageRepo::new(Database::in_memory().unwrap())
    }

    fn user(id: &str) -> UserId {
        UserId::from_raw(id)
    }

    #[test]
    fn insert_assigns_prefixed_id() {
        let repo = repo();
        let id = repo.insert(&user("u1"), None, "hello", Utc::now()).unwrap();
        assert!(id.as_str().starts_with("msg_"));
        assert_eq!(repo.count().unwrap(), 1);
    }

    #[test]
    fn conversation_covers_both_directions_newest_first() {
        let repo = repo();
        let base = Utc::now();
        repo.insert(&user("u1"), Some(&user("u2")), "one", base).unwrap();
        repo.insert(&user("u2"), Some(&user("u1")), "two", base + Duration::seconds(1)).unwrap();
        repo.insert(&user("u1"), Some(&user("u3")), "other", base + Duration::seconds(2)).unwrap();
        repo.insert(&user("u1"), None, "public", base + Duration::seconds(3)).unwrap();

        let history = repo.conversation(&user("u1"), &user("u2"), 50, 0).unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["two", "one"]);
        assert_eq!(history[0].receiver_id, Some(user("u1")));
    }

    #[test]
    fn conversation_paginates() {
        let repo = repo();
        let base = Utc::now();
        for i in 0..5 {
            repo.insert(
                &user("u1"),
                Some(&user("u2")),
                &format!("m{i}"),
                base + Duration::seconds(i),
            )
            .unwrap();
        }

        let page = repo.conversation(&user("u2"), &user("u1"), 2, 1).unwrap();
        let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m3", "m2"]);
    }

    #[test]
    fn broadcasts_exclude_directed_messages() {
        let repo = repo();
        repo.insert(&user("u1"), None, "to all", Utc::now()).unwrap();
        repo.insert(&user("u1"), Some(&user("u2")), "private", Utc::now()).unwrap();

        let room = repo.broadcasts(10, 0).unwrap();
        assert_eq!(room.len(), 1);
        assert_eq!(room[0].content, "to all");
        assert!(room[0].receiver_id.is_none());
    }

    #[test]
    fn corrupt_timestamp_is_reported() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, content, created_at)
                 VALUES ('msg_x', 'u1', NULL, 'hi', 'not-a-date')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let result = MessageRepo::new(db).broadcasts(10, 0);
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "messages", column: "created_at", .. })
        ));
    }
}
