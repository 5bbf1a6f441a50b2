//! Configuration-driven adapter selection.
//!
//! Adapters register a [`ProviderFactory`] under a name; the host
//! application then builds the adapter named in its [`ProviderConfig`]
//! without knowing the concrete type:
//!
//! ```rust,ignore
//! use llm_conduit::registry::{ProviderConfig, ProviderRegistry};
//!
//! let registry = ProviderRegistry::new();
//! registry.register(Box::new(MyVendorFactory));
//!
//! let config: ProviderConfig = serde_json::from_str(r#"{"provider": "my-vendor", "model": "m-1"}"#)?;
//! let provider = registry.build(&config)?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::provider::DynProvider;
use crate::usage::ModelPricing;

/// Settings common to every adapter.
///
/// Adapter-specific keys go in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Registered adapter name, matched case-insensitively.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Credential for authenticated vendors.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Endpoint override.
    pub base_url: Option<String>,
    /// Pricing used by usage accounting.
    pub pricing: Option<ModelPricing>,
    /// Adapter-specific options.
    pub extra: HashMap<String, serde_json::Value>,
}

impl ProviderConfig {
    /// A config for `provider` running `model`.
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    /// Sets the API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the pricing table.
    #[must_use]
    pub fn pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Adds an adapter-specific option.
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Reads a string option from `extra`.
    pub fn get_extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }
}

/// Builds one kind of adapter from configuration.
pub trait ProviderFactory: Send + Sync {
    /// Lowercase registration name, e.g. `"openai"`.
    fn name(&self) -> &str;

    /// Creates an adapter instance.
    fn build(&self, config: &ProviderConfig) -> Result<Arc<dyn DynProvider>, LlmError>;
}

/// A name → factory map.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ProviderFactory>>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory, replacing any previous one with the same name.
    pub fn register(&self, factory: Box<dyn ProviderFactory>) -> &Self {
        let name = factory.name().to_lowercase();
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::from(factory));
        self
    }

    /// Removes a factory. Returns `true` if one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name.to_lowercase())
            .is_some()
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&name.to_lowercase())
    }

    /// Registered names, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Builds the adapter named by `config.provider`.
    ///
    /// # Errors
    ///
    /// [`LlmError::InvalidRequest`] if no factory has that name, or
    /// whatever the factory itself returns.
    pub fn build(&self, config: &ProviderConfig) -> Result<Arc<dyn DynProvider>, LlmError> {
        let factory = {
            let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
            factories.get(&config.provider.to_lowercase()).cloned()
        };
        let Some(factory) = factory else {
            return Err(LlmError::InvalidRequest(format!(
                "unknown provider '{}'. Available: {:?}",
                config.provider,
                self.providers()
            )));
        };
        tracing::debug!(provider = %config.provider, model = %config.model, "building provider");
        factory.build(config)
    }
}
