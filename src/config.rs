//! Process-wide configuration, assembled once at startup and immutable thereafter.
//!
//! Priority, lowest to highest: built-in [`Default`], a TOML file on disk,
//! then CLI flags / environment variables layered on top by [`crate::cli`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default container image for the worker Job.
const DEFAULT_WORKER_IMAGE: &str = "ghcr.io/agentic-sessions/worker:latest";

/// Log format written by the observability layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, suitable for an interactive terminal.
    #[default]
    Compact,
    /// Newline-delimited JSON, suitable for log aggregation.
    Json,
}

/// Process-wide, immutable application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Container image reference used for the worker Job's main container.
    pub worker_image: String,
    /// Default CPU request for worker containers (overridable per-session).
    pub default_cpu_request: String,
    /// Default CPU limit for worker containers (overridable per-session).
    pub default_cpu_limit: String,
    /// Default memory request for worker containers (overridable per-session).
    pub default_memory_request: String,
    /// Default memory limit for worker containers (overridable per-session).
    pub default_memory_limit: String,
    /// Default session timeout, in seconds, when the session spec omits one.
    pub default_timeout_seconds: u64,
    /// Storage class requested for the per-tenant shared workspace volume.
    ///
    /// `None` means let the substrate pick its default storage class.
    pub storage_class: Option<String>,
    /// Size of the per-tenant shared workspace volume.
    pub workspace_volume_size: String,
    /// Path, under the shared workspace mount, where per-session state lives.
    pub state_root: PathBuf,
    /// Cadence at which the Job Monitor polls each session's Job.
    pub job_monitor_poll_interval_secs: u64,
    /// Cadence at which the Messaging Hub pings idle websocket connections.
    pub hub_ping_interval_secs: u64,
    /// Log level passed to `tracing-subscriber`'s `EnvFilter` when `RUST_LOG` is unset.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Service account name granted to the backend-identity client.
    pub service_account: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_owned(),
            worker_image: DEFAULT_WORKER_IMAGE.to_owned(),
            default_cpu_request: "500m".to_owned(),
            default_cpu_limit: "2".to_owned(),
            default_memory_request: "512Mi".to_owned(),
            default_memory_limit: "4Gi".to_owned(),
            default_timeout_seconds: 3600,
            storage_class: None,
            workspace_volume_size: "10Gi".to_owned(),
            state_root: PathBuf::from("/state"),
            job_monitor_poll_interval_secs: 10,
            hub_ping_interval_secs: 30,
            log_level: "info".to_owned(),
            log_format: LogFormat::Compact,
            service_account: "agentic-session-operator".to_owned(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse as valid
    /// configuration TOML. A missing file is an error here; callers that want
    /// "file absent is fine" semantics should use [`Self::load_or_default`].
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from `path`, falling back to [`Default`] if the
    /// file does not exist. A file that exists but fails to parse is still
    /// surfaced as an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_bind_addr() {
        let config = AppConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.default_timeout_seconds, 3600);
    }

    #[test]
    fn load_or_default_falls_back_when_missing() {
        let path = PathBuf::from("/nonexistent/agentic-session-operator/config.toml");
        let config = AppConfig::load_or_default(&path).expect("falls back to default");
        assert_eq!(config.bind_addr, AppConfig::default().bind_addr);
    }

    #[test]
    fn load_roundtrips_through_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.bind_addr = "127.0.0.1:9000".to_owned();
        std::fs::write(&path, toml::to_string(&config).expect("serialize")).expect("write");

        let loaded = AppConfig::load(&path).expect("load");
        assert_eq!(loaded.bind_addr, "127.0.0.1:9000");
    }
}
