pub mod config;
pub mod routes;
pub mod signaling;

use std::sync::Arc;

use config::Config;
use signaling::registry::RoomRegistry;
use signaling::relay::RelayHub;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub relay: RelayHub,
    pub config: Arc<Config>,
}
