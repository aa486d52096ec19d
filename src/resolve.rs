//! Feature identity resolution and fallback-chain grouping.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::bank::{collapse_group_key, FeatureConfig, FeatureKind};
use crate::plugin::{Plugin, PluginRegistry};

static NON_SLUG_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("Invalid slug regex"));

const EMPTY_SLUG: &str = "feature";

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateFeatureId {
    pub id: String,
    pub index: usize,
    pub first_index: usize,
}

impl fmt::Display for DuplicateFeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} at feature index {} (first declared at index {})",
            self.id, self.index, self.first_index
        )
    }
}

/// Bank configuration problems found before any plugin runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing plugins for providers: {}", .0.join(", "))]
    MissingProviders(Vec<String>),

    #[error("Invalid options for provider={provider:?} at feature index {index}: {message}")]
    InvalidOptions {
        index: usize,
        provider: String,
        message: String,
    },

    #[error("Duplicate feature ids: {}", join_display(.0))]
    DuplicateFeatureIds(Vec<DuplicateFeatureId>),
}

fn join_display(items: &[DuplicateFeatureId]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// =============================================================================
// IDS
// =============================================================================

/// Lowercase, collapse runs outside `[a-z0-9]` into `-`, trim dashes.
pub fn slug(provider: &str) -> String {
    let lowered = provider.to_lowercase();
    let slug = NON_SLUG_RUN.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        EMPTY_SLUG.to_string()
    } else {
        slug.to_string()
    }
}

/// One id per feature, in declaration order.
///
/// Explicit non-blank ids are used verbatim; the rest become
/// `<slug(provider)>-<n>` with a 1-based counter per slug.
pub fn resolve_feature_ids(features: &[FeatureConfig]) -> Result<Vec<String>, ConfigError> {
    let mut counters: HashMap<String, usize> = HashMap::new();
    let ids: Vec<String> = features
        .iter()
        .map(|feature| match feature.id.as_deref() {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => {
                let prefix = slug(&feature.provider);
                let n = counters.entry(prefix.clone()).or_insert(0);
                *n += 1;
                format!("{prefix}-{n}")
            }
        })
        .collect();

    let mut first_seen: HashMap<&str, usize> = HashMap::new();
    let mut duplicates = Vec::new();
    for (index, id) in ids.iter().enumerate() {
        match first_seen.get(id.as_str()) {
            Some(&first_index) => duplicates.push(DuplicateFeatureId {
                id: id.clone(),
                index,
                first_index,
            }),
            None => {
                first_seen.insert(id.as_str(), index);
            }
        }
    }
    if !duplicates.is_empty() {
        return Err(ConfigError::DuplicateFeatureIds(duplicates));
    }
    Ok(ids)
}

// =============================================================================
// RESOLUTION
// =============================================================================

#[derive(Clone)]
pub struct ResolvedFeature {
    pub feature: FeatureConfig,
    pub plugin: Arc<dyn Plugin>,
    pub feature_id: String,
    pub feature_index: usize,
    pub collapse_group_key: String,
}

impl ResolvedFeature {
    pub fn kind(&self) -> FeatureKind {
        self.plugin.kind()
    }
}

impl fmt::Debug for ResolvedFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedFeature")
            .field("feature_id", &self.feature_id)
            .field("feature_index", &self.feature_index)
            .field("provider", &self.feature.provider)
            .field("collapse_group_key", &self.collapse_group_key)
            .finish()
    }
}

/// Fail with every provider that has no registered plugin.
pub fn ensure_providers(
    features: &[FeatureConfig],
    registry: &PluginRegistry,
) -> Result<(), ConfigError> {
    let missing = registry.missing_providers(features);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::MissingProviders(missing))
    }
}

/// Run each plugin's options validator; stop at the first rejection.
pub fn validate_options(
    features: &[FeatureConfig],
    registry: &PluginRegistry,
) -> Result<(), ConfigError> {
    for (index, feature) in features.iter().enumerate() {
        let Some(plugin) = registry.resolve(&feature.provider) else {
            continue;
        };
        plugin
            .validate_options(&feature.options)
            .map_err(|e| ConfigError::InvalidOptions {
                index,
                provider: feature.provider.clone(),
                message: e.0,
            })?;
    }
    Ok(())
}

/// Bind every feature to its plugin and id.
pub fn resolve_features(
    features: &[FeatureConfig],
    registry: &PluginRegistry,
) -> Result<Vec<ResolvedFeature>, ConfigError> {
    ensure_providers(features, registry)?;
    let ids = resolve_feature_ids(features)?;

    features
        .iter()
        .zip(ids)
        .enumerate()
        .map(|(feature_index, (feature, feature_id))| {
            let plugin = registry
                .resolve(&feature.provider)
                .ok_or_else(|| ConfigError::MissingProviders(vec![feature.provider.clone()]))?;
            let collapse_group_key = collapse_group_key(plugin.kind(), feature.normalized_group());
            Ok(ResolvedFeature {
                feature: feature.clone(),
                plugin,
                feature_id,
                feature_index,
                collapse_group_key,
            })
        })
        .collect()
}

/// Full preflight: providers, option validators, ids. No plugin runs.
pub fn preflight(
    features: &[FeatureConfig],
    registry: &PluginRegistry,
) -> Result<Vec<ResolvedFeature>, ConfigError> {
    ensure_providers(features, registry)?;
    validate_options(features, registry)?;
    resolve_features(features, registry)
}

// =============================================================================
// GROUPING
// =============================================================================

/// Features competing for one output slot, tried in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackChain {
    pub key: String,
    /// Indices into the resolved feature list.
    pub members: Vec<usize>,
}

/// Chains ordered by the first declaration of each collapse key.
pub fn group_chains(resolved: &[ResolvedFeature]) -> Vec<FallbackChain> {
    let mut chains: Vec<FallbackChain> = Vec::new();
    let mut by_key: HashMap<&str, usize> = HashMap::new();
    for (idx, feature) in resolved.iter().enumerate() {
        match by_key.get(feature.collapse_group_key.as_str()) {
            Some(&chain) => chains[chain].members.push(idx),
            None => {
                by_key.insert(feature.collapse_group_key.as_str(), chains.len());
                chains.push(FallbackChain {
                    key: feature.collapse_group_key.clone(),
                    members: vec![idx],
                });
            }
        }
    }
    chains
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::FeatureOutput;
    use crate::plugin::{PluginCtx, PluginError};
    use async_trait::async_trait;
    use serde_json::{Map, Value};

    struct Stub {
        provider: &'static str,
        kind: FeatureKind,
    }

    #[async_trait]
    impl Plugin for Stub {
        fn kind(&self) -> FeatureKind {
            self.kind
        }
        fn provider(&self) -> &str {
            self.provider
        }
        fn version(&self) -> &str {
            "0"
        }
        async fn run(
            &self,
            input: &str,
            _options: &Map<String, Value>,
            _ctx: &PluginCtx<'_>,
        ) -> Result<FeatureOutput, PluginError> {
            Ok(FeatureOutput::text(input))
        }
    }

    fn registry() -> PluginRegistry {
        PluginRegistry::new()
            .with(Arc::new(Stub {
                provider: "TranslateGemma",
                kind: FeatureKind::Translation,
            }))
            .with(Arc::new(Stub {
                provider: "deepl",
                kind: FeatureKind::Translation,
            }))
            .with(Arc::new(Stub {
                provider: "vdu_kirciuoklis",
                kind: FeatureKind::Phonetics,
            }))
    }

    #[test]
    fn slug_collapses_and_trims() {
        assert_eq!(slug("VDU__Kirčiuoklis!"), "vdu-ki-iuoklis");
        assert_eq!(slug("--translate gemma--"), "translate-gemma");
        assert_eq!(slug("***"), "feature");
    }

    #[test]
    fn ids_count_per_slug_and_keep_explicit_ids() {
        let features = vec![
            FeatureConfig::new("TranslateGemma"),
            FeatureConfig::new("deepl"),
            FeatureConfig::new("TranslateGemma").with_id("custom"),
            FeatureConfig::new("TranslateGemma").with_id("  "),
        ];
        let ids = resolve_feature_ids(&features).unwrap();
        assert_eq!(ids, vec!["translategemma-1", "deepl-1", "custom", "translategemma-2"]);
    }

    #[test]
    fn duplicate_ids_are_all_reported() {
        let features = vec![
            FeatureConfig::new("deepl"),
            FeatureConfig::new("deepl").with_id("deepl-1"),
            FeatureConfig::new("deepl").with_id("x"),
            FeatureConfig::new("deepl").with_id("x"),
        ];
        let err = resolve_feature_ids(&features).unwrap_err();
        match &err {
            ConfigError::DuplicateFeatureIds(dups) => {
                assert_eq!(dups.len(), 2);
                assert_eq!(dups[0].index, 1);
                assert_eq!(dups[1].first_index, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(err.to_string().contains("\"deepl-1\" at feature index 1"));
    }

    #[test]
    fn chains_group_by_kind_and_normalized_group() {
        let features = vec![
            FeatureConfig::new("TranslateGemma"),
            FeatureConfig::new("vdu_kirciuoklis"),
            FeatureConfig::new("deepl").with_group(" default "),
            FeatureConfig::new("deepl").with_group("alt"),
        ];
        let resolved = resolve_features(&features, &registry()).unwrap();
        let chains = group_chains(&resolved);
        assert_eq!(chains.len(), 3);
        assert_eq!(chains[0].key, "TRANSLATION:default");
        assert_eq!(chains[0].members, vec![0, 2]);
        assert_eq!(chains[1].key, "PHONETICS:default");
        assert_eq!(chains[2].key, "TRANSLATION:alt");
    }

    #[test]
    fn missing_providers_are_enumerated() {
        let features = vec![
            FeatureConfig::new("deepl"),
            FeatureConfig::new("p1"),
            FeatureConfig::new("p2"),
        ];
        let err = preflight(&features, &registry()).unwrap_err();
        assert_eq!(err, ConfigError::MissingProviders(vec!["p1".into(), "p2".into()]));
        assert_eq!(err.to_string(), "Missing plugins for providers: p1, p2");
    }
}
