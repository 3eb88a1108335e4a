//! Per-peer trust decisions.
//!
//! A request from a peer is honoured when, checked in order:
//! 1. a decision for this session (by peer id) exists,
//! 2. a persisted decision for the peer's name exists,
//! 3. the peer's name matches the deny list (deny) or the allow list,
//! 4. otherwise a headless device denies, and an interactive one asks.

use crate::capabilities::Capabilities;
use docmesh_storage::KeyValueStoreExt;
use docmesh_types::PeerId;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// KV key prefix for persisted decisions.
pub const ACCEPTANCE_KEY_PREFIX: &str = "peer-acceptance/";

pub const OPTION_ACCEPT: &str = "Accept";
pub const OPTION_ACCEPT_TEMPORARILY: &str = "Accept temporarily";
pub const OPTION_DENY: &str = "Deny";
pub const OPTION_DENY_TEMPORARILY: &str = "Deny temporarily";
pub const OPTION_IGNORE: &str = "Ignore this time";

/// A trust verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    Denied,
}

impl Decision {
    #[must_use]
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

/// Resolves and remembers acceptance decisions.
pub struct AcceptanceModel {
    caps: Capabilities,
    session: Mutex<HashMap<PeerId, Decision>>,
    prompt_lock: tokio::sync::Mutex<()>,
}

/// Splits a comma separated pattern list; invalid patterns are skipped.
pub fn compile_patterns(list: &str) -> Vec<Regex> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = p, "ignoring invalid peer pattern: {e}");
                None
            }
        })
        .collect()
}

/// Whether `name` matches any pattern in the list.
pub fn matches_list(list: &str, name: &str) -> bool {
    compile_patterns(list).iter().any(|re| re.is_match(name))
}

impl AcceptanceModel {
    pub fn new(caps: Capabilities) -> Self {
        Self {
            caps,
            session: Mutex::new(HashMap::new()),
            prompt_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn key(name: &str) -> String {
        format!("{ACCEPTANCE_KEY_PREFIX}{name}")
    }

    /// The session-scoped decision for a peer id.
    pub fn session_decision(&self, peer_id: &PeerId) -> Option<Decision> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .copied()
    }

    /// The persisted decision for a peer name.
    pub fn persisted_decision(&self, name: &str) -> Option<Decision> {
        match self.caps.kv.get_json::<Decision>(&Self::key(name)) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(name, "failed to read acceptance decision: {e}");
                None
            }
        }
    }

    /// Decision from session, persisted state or the lists, without asking.
    pub fn cached_decision(&self, peer_id: &PeerId, name: &str) -> Option<Decision> {
        if let Some(decision) = self.session_decision(peer_id) {
            return Some(decision);
        }
        if let Some(decision) = self.persisted_decision(name) {
            return Some(decision);
        }
        let settings = self.caps.settings.current();
        if matches_list(&settings.deny_list, name) {
            return Some(Decision::Denied);
        }
        if matches_list(&settings.allow_list, name) {
            return Some(Decision::Accepted);
        }
        None
    }

    /// Resolves whether `peer_id` (advertised as `name`) may talk to us,
    /// prompting when nothing is known yet.
    pub async fn is_accepted(&self, peer_id: &PeerId, name: &str) -> bool {
        if let Some(decision) = self.cached_decision(peer_id, name) {
            return decision.is_accepted();
        }
        let settings = self.caps.settings.current();
        if settings.headless {
            debug!(%peer_id, name, "unknown peer denied on headless device");
            return false;
        }

        let _prompt = self.prompt_lock.lock().await;
        // Another prompt may have settled it while we waited.
        if let Some(decision) = self.cached_decision(peer_id, name) {
            return decision.is_accepted();
        }

        let options: Vec<String> = [
            OPTION_ACCEPT,
            OPTION_ACCEPT_TEMPORARILY,
            OPTION_DENY,
            OPTION_DENY_TEMPORARILY,
            OPTION_IGNORE,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        let message = format!("Device \"{name}\" wants to synchronise with this device.");
        let choice = tokio::time::timeout(
            settings.prompt_timeout(),
            self.caps.confirm.ask_select_string(&message, &options),
        )
        .await
        .ok()
        .flatten();

        match choice.as_deref() {
            Some(OPTION_ACCEPT) => {
                self.persist(name, Decision::Accepted);
                true
            }
            Some(OPTION_ACCEPT_TEMPORARILY) => {
                self.set_session(peer_id, Decision::Accepted);
                true
            }
            Some(OPTION_DENY) => {
                self.persist(name, Decision::Denied);
                false
            }
            Some(OPTION_DENY_TEMPORARILY) => {
                self.set_session(peer_id, Decision::Denied);
                false
            }
            _ => {
                debug!(%peer_id, name, "acceptance prompt ignored");
                false
            }
        }
    }

    /// Remembers a decision for this session only.
    pub fn set_session(&self, peer_id: &PeerId, decision: Decision) {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer_id.clone(), decision);
    }

    /// Remembers a decision for a peer name across restarts.
    pub fn persist(&self, name: &str, decision: Decision) {
        info!(name, ?decision, "persisting acceptance decision");
        if let Err(e) = self.caps.kv.set_json(&Self::key(name), &decision) {
            warn!(name, "failed to persist acceptance decision: {e}");
        }
    }

    /// Forgets the persisted decision for a name.
    pub fn revoke(&self, name: &str) {
        if let Err(e) = self.caps.kv.delete(&Self::key(name)) {
            warn!(name, "failed to revoke acceptance decision: {e}");
        }
    }

    /// Forgets every session decision.
    pub fn clear_session(&self) {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
