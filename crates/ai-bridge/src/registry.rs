use std::collections::HashMap;
use std::sync::Arc;

use crate::adapters::base::Adapter;
use crate::errors::{BridgeError, BridgeResult};

/// Maps provider ids to adapters.
///
/// Populate it during setup, then move it into an `Arc` shared with the
/// engine; from there on it is only read.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Into<String>>(
        &mut self,
        provider_id: S,
        adapter: Arc<dyn Adapter>,
    ) -> BridgeResult<()> {
        let provider_id = provider_id.into();
        if self.adapters.contains_key(&provider_id) {
            return Err(BridgeError::DuplicateProvider(provider_id));
        }
        tracing::debug!(provider = %provider_id, adapter = adapter.name(), "registered adapter");
        self.adapters.insert(provider_id, adapter);
        Ok(())
    }

    /// Never falls back to a default adapter
    pub fn resolve(&self, provider_id: &str) -> BridgeResult<Arc<dyn Adapter>> {
        self.adapters
            .get(provider_id)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownProvider(provider_id.to_string()))
    }

    /// Registered provider ids, sorted
    pub fn providers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}
