//! Configuration values compared between peers before replicating.
//!
//! The passphrase never leaves the device. Peers exchange
//! `sha256(room | passphrase | hour)` instead and accept a match against
//! the current or the previous hour, so clocks a little apart still agree.

use crate::settings::ReplicatorSettings;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

const WINDOW_SECS: u64 = 60 * 60;

/// The subset of settings exchanged over `getTweakValues`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TweakValues {
    pub passphrase_hash: String,
    pub encrypt: bool,
    pub chunk_size: u32,
    pub hash_algorithm: String,
    pub obfuscate_paths: bool,
    pub case_sensitive_paths: bool,
}

/// Outcome of comparing our tweak values with a peer's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TweakComparison {
    /// Replication must not proceed.
    pub passphrase_mismatch: bool,
    /// Fields that differ; replication proceeds with a warning.
    pub differences: Vec<String>,
}

impl TweakComparison {
    #[must_use]
    pub fn is_compatible(&self) -> bool {
        !self.passphrase_mismatch
    }
}

fn current_window() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / WINDOW_SECS
}

/// Salted hash of the passphrase for one time window.
pub fn passphrase_hash(room: &str, passphrase: &str, window: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(room.as_bytes());
    hasher.update(b"|");
    hasher.update(passphrase.as_bytes());
    hasher.update(b"|");
    hasher.update(window.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

impl TweakValues {
    /// Our values for the current window.
    pub fn from_settings(settings: &ReplicatorSettings) -> Self {
        Self::for_window(settings, current_window())
    }

    /// Our values for an explicit window.
    pub fn for_window(settings: &ReplicatorSettings, window: u64) -> Self {
        Self {
            passphrase_hash: passphrase_hash(&settings.room, &settings.passphrase, window),
            encrypt: settings.encrypt,
            chunk_size: settings.chunk_size,
            hash_algorithm: settings.hash_algorithm.clone(),
            obfuscate_paths: settings.obfuscate_paths,
            case_sensitive_paths: settings.case_sensitive_paths,
        }
    }

    /// Compares a peer's values with ours at the current time.
    pub fn compare(settings: &ReplicatorSettings, remote: &TweakValues) -> TweakComparison {
        Self::compare_at(settings, remote, current_window())
    }

    /// Compares a peer's values with ours as of `window`.
    pub fn compare_at(
        settings: &ReplicatorSettings,
        remote: &TweakValues,
        window: u64,
    ) -> TweakComparison {
        let local = Self::for_window(settings, window);
        // Either clock may sit on the other side of an hour boundary.
        let passphrase_mismatch = remote.passphrase_hash != local.passphrase_hash
            && [window.saturating_sub(1), window.saturating_add(1)]
                .into_iter()
                .all(|w| remote.passphrase_hash != passphrase_hash(&settings.room, &settings.passphrase, w));

        let mut differences = Vec::new();
        if remote.encrypt != local.encrypt {
            differences.push("encrypt".to_string());
        }
        if remote.chunk_size != local.chunk_size {
            differences.push("chunkSize".to_string());
        }
        if remote.hash_algorithm != local.hash_algorithm {
            differences.push("hashAlgorithm".to_string());
        }
        if remote.obfuscate_paths != local.obfuscate_paths {
            differences.push("obfuscatePaths".to_string());
        }
        if remote.case_sensitive_paths != local.case_sensitive_paths {
            differences.push("caseSensitivePaths".to_string());
        }

        TweakComparison {
            passphrase_mismatch,
            differences,
        }
    }
}
