//! # Config - Store Configuration
//!
//! Tunables for the feed store, loadable from TOML:
//!
//! ```toml
//! flush_threshold = 64
//!
//! [wal]
//! path = "/var/lib/feeds/store.wal"
//! sync = true
//! ```
//!
//! Every field has a default, so an empty document is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default pending-change count at which a store-head writer flushes
/// eagerly instead of coalescing with queued writers.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Pending changes below this count may be deferred to the next writer.
    /// `0` disables coalescing.
    pub flush_threshold: usize,
    /// Write-ahead log for the reference backend; `None` keeps it volatile.
    pub wal: Option<WalConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            wal: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalConfig {
    pub path: PathBuf,
    /// `fsync` after every appended batch.
    #[serde(default)]
    pub sync: bool,
}

impl StoreConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("invalid store config")
    }

    /// Reads and parses the TOML file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).context("failed to serialize store config")
    }

    /// Config with a durable log at `path`.
    pub fn with_wal<P: Into<PathBuf>>(mut self, path: P, sync: bool) -> Self {
        self.wal = Some(WalConfig {
            path: path.into(),
            sync,
        });
        self
    }
}
