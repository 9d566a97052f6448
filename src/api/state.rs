//! Shared state threaded through every HTTP handler.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::kube_client::Substrate;
use crate::messaging::Hub;

/// Shared state for HTTP handlers, cloned cheaply per request (everything
/// inside is already an `Arc` or plain config data).
#[derive(Clone)]
pub struct AppState {
    /// Substrate client facade: backend identity plus per-request minting.
    pub substrate: Substrate,
    /// Process-wide configuration.
    pub config: AppConfig,
    /// The messaging hub, one per process, shared across all tenants.
    pub hub: Arc<Hub>,
}

impl AppState {
    /// Construct the shared state, spinning up the messaging hub's
    /// background tasks.
    #[must_use]
    pub fn new(substrate: Substrate, config: AppConfig) -> Self {
        let hub = Hub::new(config.state_root.clone());
        Self { substrate, config, hub }
    }

    /// The shared workspace mount root for a session's on-disk layout.
    #[must_use]
    pub fn workspace_root(&self) -> PathBuf {
        crate::workspace::mount_path().to_path_buf()
    }
}
