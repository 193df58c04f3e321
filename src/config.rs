//! Agent configuration
//!
//! The configuration mirrors the key names the host application passes over
//! its method surface (camelCase), so a config mapping received from the host
//! deserializes directly into [`AgentConfig`].

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
}

/// Main agent configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Project API key (required, non-empty)
    pub api_key: String,

    /// Ingestion host base URL; a trailing `/` is stripped
    #[serde(deserialize_with = "non_empty_or_default_host")]
    pub host: String,

    /// Queue size at which a capture triggers an inline flush
    pub flush_at: usize,

    /// Upper bound on the durable queue (advisory, not enforced)
    pub max_queue_size: usize,

    /// Events per delivery batch (max drained per flush cycle)
    pub max_batch_size: usize,

    /// Seconds between background flush cycles
    pub flush_interval: u64,

    /// Verbose transport logging
    pub debug: bool,

    /// Suppress all capture and network activity
    pub opt_out: bool,

    /// Fetch feature flags during setup
    pub preload_feature_flags: bool,

    /// Enable the session replay pipeline
    pub session_replay: bool,

    /// Tuning for the session replay pipeline
    pub session_replay_config: SessionReplayConfig,

    /// Override for the on-disk data directory (embedder/test use only;
    /// not part of the host method surface)
    #[serde(skip)]
    pub data_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            host: default_host(),
            flush_at: default_flush_at(),
            max_queue_size: default_max_queue_size(),
            max_batch_size: default_max_batch_size(),
            flush_interval: default_flush_interval(),
            debug: false,
            opt_out: false,
            preload_feature_flags: true,
            session_replay: false,
            session_replay_config: SessionReplayConfig::default(),
            data_dir: None,
        }
    }
}

fn default_host() -> String {
    "https://us.i.posthog.com".to_string()
}

fn default_flush_at() -> usize {
    20
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_max_batch_size() -> usize {
    50
}

fn default_flush_interval() -> u64 {
    30
}

fn non_empty_or_default_host<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let host = String::deserialize(deserializer)?;
    if host.is_empty() {
        Ok(default_host())
    } else {
        Ok(host)
    }
}

impl AgentConfig {
    /// Validate configuration, returning an error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(Error::Config("apiKey must not be empty".to_string()));
        }
        Ok(())
    }

    /// Resolve the data directory the store lives in.
    ///
    /// `$HOME/.local/share/posthog_flutter`, falling back to the resolved
    /// home directory, then `/tmp/posthog_flutter`.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        default_data_dir()
    }
}

/// Default on-disk data directory
pub fn default_data_dir() -> PathBuf {
    home_dir()
        .map(|home| home.join(".local/share/posthog_flutter"))
        .unwrap_or_else(|| PathBuf::from("/tmp/posthog_flutter"))
}

/// Session replay tuning knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionReplayConfig {
    /// JPEG quality, 1-100
    pub compression_quality: u8,

    /// Snapshots per batch
    pub batch_size: usize,

    /// Max milliseconds before flushing a non-empty batch
    pub batch_interval_ms: u64,

    /// Largest image edge in pixels; 0 means unlimited
    pub max_image_dimension: u32,
}

impl Default for SessionReplayConfig {
    fn default() -> Self {
        Self {
            compression_quality: default_compression_quality(),
            batch_size: default_replay_batch_size(),
            batch_interval_ms: default_batch_interval_ms(),
            max_image_dimension: 0,
        }
    }
}

fn default_compression_quality() -> u8 {
    75
}

fn default_replay_batch_size() -> usize {
    10
}

fn default_batch_interval_ms() -> u64 {
    5000
}
