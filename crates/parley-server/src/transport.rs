use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use tracing::debug;

use crate::client::{self, PumpSettings};
use crate::identity::VerifiedIdentity;
use crate::server::AppState;

/// WebSocket upgrade handler. Requests without an identity are refused
/// before the upgrade.
pub async fn ws_handler(
    VerifiedIdentity(identity): VerifiedIdentity,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    debug!(user_id = %identity.user_id, "upgrading connection");
    let settings = PumpSettings::from(state.config.as_ref());
    let AppState { hub, shutdown, config, .. } = state;
    ws.max_message_size(config.max_message_size)
        .on_upgrade(move |socket| client::serve_socket(socket, identity, hub, settings, shutdown))
}
