use std::sync::Arc;

use fleet_core::config::GatewayConfig;
use fleet_engine::Fleet;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub fleet: Arc<Fleet>,
}
