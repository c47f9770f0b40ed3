//! Metric names recorded by the hub and HTTP surface.

pub const CONNECTIONS_ACTIVE: &str = "hub.connections.active";
pub const CONNECTIONS_TOTAL: &str = "hub.connections.total";
/// Labeled by `reason`: `unregistered`, `replaced`, `evicted`, `gone` or `shutdown`.
pub const DISCONNECTS_TOTAL: &str = "hub.disconnects.total";
/// Labeled by `kind`.
pub const EVENTS_ROUTED: &str = "hub.events.routed";
/// Events read from a connection after it was evicted or replaced.
pub const STALE_EVENTS_DROPPED: &str = "hub.events.stale_dropped";
pub const FANOUT_RECIPIENTS: &str = "hub.fanout.recipients";
pub const BACKPRESSURE_EVICTIONS: &str = "hub.backpressure.evictions";
pub const PERSIST_FAILURES: &str = "hub.persist.failures";
pub const PRESENCE_FAILURES: &str = "hub.presence.failures";
/// Labeled by `reason`.
pub const FRAMES_MALFORMED: &str = "hub.frames.malformed";
pub const HTTP_MESSAGES_INJECTED: &str = "http.messages.injected";
