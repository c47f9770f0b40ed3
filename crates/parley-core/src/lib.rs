pub mod errors;
pub mod events;
pub mod identity;
pub mod ids;
pub mod persistence;

pub use errors::{FrameError, PersistenceError};
pub use events::{decode_frame, ChatEvent, EventKind, InboundFrame, PresenceState};
pub use identity::Identity;
pub use ids::{ConnectionId, MessageId, UserId};
pub use persistence::{ChatStore, StoredMessage};
