use std::sync::Arc;

use strum_macros::{Display, EnumIter};

use super::{base::Adapter, databricks::DatabricksAdapter, openai::OpenAiAdapter};
use crate::errors::{BridgeError, BridgeResult};
use crate::registry::AdapterRegistry;
use crate::settings::{BridgeSettings, ProviderSettings};

#[derive(EnumIter, Display, Debug, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Databricks,
    /// Framework bridged adapters; built by the caller around its own runnable
    Chain,
}

pub fn get_adapter(settings: ProviderSettings) -> BridgeResult<Arc<dyn Adapter>> {
    match settings.provider_kind() {
        ProviderKind::OpenAi => Ok(Arc::new(OpenAiAdapter::new(settings.into_config())?)),
        ProviderKind::Databricks => {
            let image_format = settings.image_format();
            Ok(Arc::new(
                DatabricksAdapter::new(settings.into_config())?.with_image_format(image_format),
            ))
        }
        ProviderKind::Chain => Err(BridgeError::Config(
            "chain adapters wrap a caller supplied runnable and are registered directly"
                .to_string(),
        )),
    }
}

/// Build a registry holding one adapter per configured provider
pub fn build_registry(settings: &BridgeSettings) -> BridgeResult<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();
    for (provider_id, provider) in &settings.providers {
        registry.register(provider_id.clone(), get_adapter(provider.clone())?)?;
    }
    Ok(registry)
}
