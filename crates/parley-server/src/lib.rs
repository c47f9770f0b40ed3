pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod hub;
pub mod identity;
pub mod presence;
pub mod server;
pub mod transport;

pub use client::{Connection, InboundExit, OutboundExit, PumpSettings};
pub use config::{load_config, ConfigError, ServerConfig};
pub use error::ApiError;
pub use hub::{ConnectionHandle, Hub, HubError, HubHandle, HubSettings};
pub use server::{build_router, start, AppState, ServerHandle};
