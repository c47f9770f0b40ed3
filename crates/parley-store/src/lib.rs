pub mod chat_store;
pub mod database;
pub mod error;
pub mod memory;
pub mod messages;
pub mod presence;
pub mod row_helpers;
pub mod schema;

pub use chat_store::SqliteChatStore;
pub use database::Database;
pub use error::StoreError;
pub use memory::{MemoryChatStore, PresenceWrite};
