//! Replicator settings and the source they are read from.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Everything the peer replicator reads from the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorSettings {
    /// Name advertised to other peers. Acceptance decisions are keyed by it.
    pub device_name: String,
    pub platform: String,
    /// Mesh room to join.
    pub room: String,
    /// Shared secret; compared only as a salted, time-windowed hash.
    pub passphrase: String,

    /// Peer names always accepted (regular expressions, comma separated).
    pub allow_list: String,
    /// Peer names always denied. Wins over the allow list.
    pub deny_list: String,
    /// Peers synced as soon as they are discovered.
    pub auto_sync_list: String,
    /// Peers whose change notifications trigger an automatic pull.
    pub auto_watch_list: String,

    /// No interactive prompts: unknown peers are denied.
    pub headless: bool,
    /// Start broadcasting local changes on startup.
    pub auto_broadcast: bool,

    pub batch_size: usize,
    pub rpc_timeout_ms: u64,
    pub prompt_timeout_ms: u64,

    /// File-event debounce window.
    pub queue_min_delay_ms: u64,
    pub queue_max_delay_ms: u64,
    pub queue_concurrency: usize,

    // Compared with peers before replicating.
    pub encrypt: bool,
    pub chunk_size: u32,
    pub hash_algorithm: String,
    pub obfuscate_paths: bool,
    pub case_sensitive_paths: bool,
}

impl Default for ReplicatorSettings {
    fn default() -> Self {
        Self {
            device_name: "docmesh device".to_string(),
            platform: std::env::consts::OS.to_string(),
            room: "docmesh".to_string(),
            passphrase: String::new(),
            allow_list: String::new(),
            deny_list: String::new(),
            auto_sync_list: String::new(),
            auto_watch_list: String::new(),
            headless: false,
            auto_broadcast: false,
            batch_size: 250,
            rpc_timeout_ms: 30_000,
            prompt_timeout_ms: 30_000,
            queue_min_delay_ms: 2_000,
            queue_max_delay_ms: 10_000,
            queue_concurrency: 4,
            encrypt: false,
            chunk_size: 100,
            hash_algorithm: "sha256".to_string(),
            obfuscate_paths: false,
            case_sensitive_paths: false,
        }
    }
}

impl ReplicatorSettings {
    /// Parses settings from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::Config(format!("invalid settings: {e}")))
    }

    /// Serializes settings to pretty JSON.
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reads settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.prompt_timeout_ms)
    }
}

/// Read-only access to the current settings plus a save hook.
pub trait SettingsSource: Send + Sync {
    fn current(&self) -> ReplicatorSettings;
    fn save(&self, settings: ReplicatorSettings) -> SyncResult<()>;
}

/// Settings held in memory.
#[derive(Debug, Default)]
pub struct MemorySettingsSource {
    settings: RwLock<ReplicatorSettings>,
}

impl MemorySettingsSource {
    pub fn new(settings: ReplicatorSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }
}

impl SettingsSource for MemorySettingsSource {
    fn current(&self) -> ReplicatorSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save(&self, settings: ReplicatorSettings) -> SyncResult<()> {
        *self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
        Ok(())
    }
}
