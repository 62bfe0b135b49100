//! Client configuration: optional TOML file, defaults for everything.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use cast_core::{CastError, CastResult};

/// Tunables for one device session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// GET_STATUS attempts made by `update` before giving up.
    pub status_attempts: u32,
    pub status_retry_interval_secs: u64,
    /// Address advertised to the device in content URLs.
    pub local_ip: Option<IpAddr>,
    /// 0 picks an ephemeral port.
    pub media_server_port: u16,
    pub transcoder: String,
    pub cache_disabled: bool,
    pub cache_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 5,
            status_attempts: 5,
            status_retry_interval_secs: 2,
            local_ip: None,
            media_server_port: 0,
            transcoder: "ffmpeg".to_string(),
            cache_disabled: false,
            cache_path: None,
        }
    }
}

impl ClientConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> CastResult<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        tracing::info!(path = %path.display(), "loading config file");
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| CastError::Other(format!("config parse error in {}: {e}", path.display())))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn status_retry_interval(&self) -> Duration {
        Duration::from_secs(self.status_retry_interval_secs)
    }

    /// Played-items cache location, `~/.config/castctl/cache.json` unless overridden.
    pub fn resolved_cache_path(&self) -> Option<PathBuf> {
        self.cache_path
            .clone()
            .or_else(|| dirs::config_dir().map(|d| d.join("castctl").join("cache.json")))
    }
}
