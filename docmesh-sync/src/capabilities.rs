//! Platform capabilities handed to the replicator at construction.

use crate::settings::SettingsSource;
use async_trait::async_trait;
use docmesh_storage::KeyValueStore;
use std::sync::Arc;

/// Interactive confirmation collaborator. Every method may take arbitrarily
/// long; `None`/`false` means the user cancelled.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn ask_yes_no(&self, message: &str) -> bool;

    /// Returns the chosen option, or `None` when cancelled.
    async fn ask_select_string(&self, message: &str, options: &[String]) -> Option<String>;

    async fn ask_string(
        &self,
        title: &str,
        prompt: &str,
        placeholder: &str,
        is_secret: bool,
    ) -> Option<String>;
}

/// A confirm service that never gets an answer.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessConfirm;

#[async_trait]
impl Confirm for HeadlessConfirm {
    async fn ask_yes_no(&self, _message: &str) -> bool {
        false
    }

    async fn ask_select_string(&self, _message: &str, _options: &[String]) -> Option<String> {
        None
    }

    async fn ask_string(
        &self,
        _title: &str,
        _prompt: &str,
        _placeholder: &str,
        _is_secret: bool,
    ) -> Option<String> {
        None
    }
}

/// Everything the platform provides.
#[derive(Clone)]
pub struct Capabilities {
    pub confirm: Arc<dyn Confirm>,
    /// Persisted decisions.
    pub kv: Arc<dyn KeyValueStore>,
    pub settings: Arc<dyn SettingsSource>,
}

impl Capabilities {
    pub fn new(
        confirm: Arc<dyn Confirm>,
        kv: Arc<dyn KeyValueStore>,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        Self {
            confirm,
            kv,
            settings,
        }
    }
}
