//! Plugin contract and provider registry.
//!
//! A plugin turns one input string into one [`FeatureOutput`]. It reaches the
//! network only through [`PluginCtx::call_external`], which routes the call
//! through the bank's [`CallGateway`] so it can be cached and replayed.

pub mod translategemma;
pub mod vdu_kirciuoklis;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::trace;

use crate::bank::{FeatureConfig, FeatureKind, FeatureOutput};
use crate::gateway::{CallGateway, CallScope, CallSource, ExternalCallRequest, GatewayError};

pub use translategemma::{TranslateGemma, TranslateGemmaConfig};
pub use vdu_kirciuoklis::{VduKirciuoklis, VduKirciuoklisConfig};

// =============================================================================
// ERRORS
// =============================================================================

/// Rejected feature options.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct OptionsError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The provider has nothing for this input. Triggers fallback, never surfaced.
    #[error("no result")]
    NoResult,

    #[error("invalid options: {0}")]
    InvalidOptions(#[from] OptionsError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("{0}")]
    Failed(String),
}

impl PluginError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Deserialize a feature's options into a plugin's typed options.
pub fn parse_options<T: DeserializeOwned>(options: &Map<String, Value>) -> Result<T, OptionsError> {
    serde_json::from_value(Value::Object(options.clone())).map_err(|e| OptionsError(e.to_string()))
}

// =============================================================================
// TRAIT
// =============================================================================

#[async_trait]
pub trait Plugin: Send + Sync {
    fn kind(&self) -> FeatureKind;

    /// Registry lookup key.
    fn provider(&self) -> &str;

    fn version(&self) -> &str;

    /// Items of one chain processed at once. `None` uses the executor default.
    fn item_concurrency(&self) -> Option<usize> {
        None
    }

    fn validate_options(&self, _options: &Map<String, Value>) -> Result<(), OptionsError> {
        Ok(())
    }

    async fn run(
        &self,
        input: &str,
        options: &Map<String, Value>,
        ctx: &PluginCtx<'_>,
    ) -> Result<FeatureOutput, PluginError>;
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Replay accounting for one item's external calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub replayed: usize,
    pub live: usize,
}

/// Handed to [`Plugin::run`]; scoped to one feature and one input.
pub struct PluginCtx<'a> {
    gateway: &'a CallGateway,
    scope: &'a CallScope,
    replayed: AtomicUsize,
    live: AtomicUsize,
}

impl<'a> PluginCtx<'a> {
    pub fn new(gateway: &'a CallGateway, scope: &'a CallScope) -> Self {
        Self {
            gateway,
            scope,
            replayed: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        }
    }

    pub fn feature_id(&self) -> &str {
        &self.scope.feature_id
    }

    pub async fn call_external(&self, request: ExternalCallRequest) -> Result<Value, GatewayError> {
        let outcome = self.gateway.call(self.scope, &request).await?;
        match outcome.source {
            CallSource::Replay => self.replayed.fetch_add(1, Ordering::Relaxed),
            CallSource::Live => self.live.fetch_add(1, Ordering::Relaxed),
        };
        Ok(outcome.response)
    }

    /// `call_external` followed by decoding the response body.
    pub async fn call_external_as<T: DeserializeOwned>(
        &self,
        request: ExternalCallRequest,
    ) -> Result<T, PluginError> {
        let operation = request.operation.clone();
        let response = self.call_external(request).await?;
        serde_json::from_value(response).map_err(|e| {
            PluginError::failed(format!("unexpected {operation} response: {e}"))
        })
    }

    /// Fine-grained progress hook, independent of item-level events.
    pub fn emit_progress(&self, n: usize) {
        trace!(feature_id = %self.scope.feature_id, n, "plugin progress");
    }

    pub fn call_stats(&self) -> CallStats {
        CallStats {
            replayed: self.replayed.load(Ordering::Relaxed),
            live: self.live.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Provider name -> plugin.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    order: Vec<String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plugin`, replacing any plugin with the same provider name.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Option<Arc<dyn Plugin>> {
        let provider = plugin.provider().to_string();
        if !self.plugins.contains_key(&provider) {
            self.order.push(provider.clone());
        }
        self.plugins.insert(provider, plugin)
    }

    pub fn with(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.register(plugin);
        self
    }

    pub fn resolve(&self, provider: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(provider).cloned()
    }

    /// Every provider referenced by `features` without a plugin, first-seen order.
    pub fn missing_providers(&self, features: &[FeatureConfig]) -> Vec<String> {
        let mut missing: Vec<String> = Vec::new();
        for feature in features {
            if !self.plugins.contains_key(&feature.provider)
                && !missing.contains(&feature.provider)
            {
                missing.push(feature.provider.clone());
            }
        }
        missing
    }

    /// Plugins in registration order.
    pub fn plugins(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.order.iter().filter_map(|p| self.plugins.get(p))
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
