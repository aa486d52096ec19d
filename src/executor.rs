//! Runs a bank's features over its inputs.
//!
//! Features sharing a kind and group form a fallback chain. For each input,
//! members are tried in declaration order until one produces an output; the
//! rest are skipped for that input. Chains run concurrently, and so do the
//! items within a chain, each bounded by [`map_bounded`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::bank::{FeatureKind, FeatureOutput, InputBank};
use crate::call_log::CallLog;
use crate::gateway::{CallGateway, CallScope, RateGate, ReplayPolicy, Transport};
use crate::plugin::{PluginCtx, PluginError, PluginRegistry};
use crate::pool::map_bounded;
use crate::progress::{ItemOutcome, ItemProgressEvent, NoopProgress, ProgressObserver};
use crate::resolve::{group_chains, resolve_features, ConfigError, FallbackChain, ResolvedFeature};

pub const DEFAULT_FEATURE_CONCURRENCY: usize = 4;

// =============================================================================
// OPTIONS
// =============================================================================

/// What a non-`NoResult` plugin failure does to the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorPolicy {
    /// Abort the bank.
    #[default]
    Fail,
    /// Drop the item from that chain and keep going.
    SkipItem,
}

impl ErrorPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorPolicy::Fail => "FAIL",
            ErrorPolicy::SkipItem => "SKIP_ITEM",
        }
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "FAIL" => Ok(ErrorPolicy::Fail),
            "SKIP_ITEM" => Ok(ErrorPolicy::SkipItem),
            other => Err(format!(
                "unknown error policy {other:?} (expected FAIL or SKIP_ITEM)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    pub replay_policy: ReplayPolicy,
    /// Chains run at once. `None` runs every chain concurrently.
    pub feature_parallelism: Option<usize>,
    /// Item concurrency for plugins without their own override.
    pub feature_concurrency: usize,
    pub error_policy: ErrorPolicy,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            replay_policy: ReplayPolicy::default(),
            feature_parallelism: None,
            feature_concurrency: DEFAULT_FEATURE_CONCURRENCY,
            error_policy: ErrorPolicy::default(),
        }
    }
}

// =============================================================================
// RESULTS
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureItemResult {
    pub input: String,
    pub output: Option<FeatureOutput>,
    pub error: Option<String>,
}

impl FeatureItemResult {
    fn empty(input: &str) -> Self {
        Self {
            input: input.to_string(),
            output: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRunResult {
    pub feature_id: String,
    pub provider: String,
    pub kind: FeatureKind,
    pub version: String,
    /// Explicit group, if the author set one.
    pub group: Option<String>,
    /// One entry per bank input, in input order.
    pub outputs: Vec<FeatureItemResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteBankResult {
    pub bank_title: String,
    /// In feature declaration order.
    pub feature_results: Vec<FeatureRunResult>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Feature \"{feature_id}\" failed for input \"{input}\": {source}")]
    ItemFailed {
        feature_id: String,
        input: String,
        source: PluginError,
    },
}

// =============================================================================
// EXECUTOR
// =============================================================================

pub struct Executor {
    registry: PluginRegistry,
    gateway: CallGateway,
    options: ExecutorOptions,
    observer: Arc<dyn ProgressObserver>,
}

/// Per-bank state shared by every chain.
#[derive(Clone, Copy)]
struct BankRun<'a> {
    features: &'a [ResolvedFeature],
    scopes: &'a [CallScope],
    done: &'a [AtomicUsize],
    data: &'a [String],
}

impl Executor {
    pub fn new(
        registry: PluginRegistry,
        log: Arc<dyn CallLog>,
        transport: Arc<dyn Transport>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            registry,
            gateway: CallGateway::new(log, transport, options.replay_policy),
            options,
            observer: Arc::new(NoopProgress),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    #[instrument(skip(self, bank), fields(title = %bank.title, items = bank.data.len()))]
    pub async fn execute_bank(&self, bank: &InputBank) -> Result<ExecuteBankResult, ExecutorError> {
        let features = resolve_features(&bank.features, &self.registry)?;
        let scopes: Vec<CallScope> = features
            .iter()
            .map(|f| {
                let gate = f.feature.max_rpm.and_then(RateGate::per_minute).map(Arc::new);
                CallScope::new(
                    f.feature.provider.clone(),
                    f.feature_id.clone(),
                    Arc::new(f.feature.options.clone()),
                )
                .with_rate_gate(gate)
            })
            .collect();
        let done: Vec<AtomicUsize> = features.iter().map(|_| AtomicUsize::new(0)).collect();
        let chains = group_chains(&features);

        let run = BankRun {
            features: &features,
            scopes: &scopes,
            done: &done,
            data: &bank.data,
        };
        let parallelism = self
            .options
            .feature_parallelism
            .unwrap_or(chains.len())
            .max(1);
        info!(
            features = features.len(),
            chains = chains.len(),
            parallelism,
            policy = %self.options.replay_policy,
            "executing bank"
        );

        let chain_outputs =
            map_bounded(&chains, parallelism, move |_, chain| self.run_chain(chain, run)).await?;

        let mut slots: Vec<Option<FeatureRunResult>> = features.iter().map(|_| None).collect();
        for (chain, member_outputs) in chains.iter().zip(chain_outputs) {
            for (&member, outputs) in chain.members.iter().zip(member_outputs) {
                let f = &features[member];
                slots[member] = Some(FeatureRunResult {
                    feature_id: f.feature_id.clone(),
                    provider: f.plugin.provider().to_string(),
                    kind: f.kind(),
                    version: f.plugin.version().to_string(),
                    group: f.feature.explicit_group().map(str::to_string),
                    outputs,
                });
            }
        }

        Ok(ExecuteBankResult {
            bank_title: bank.title.clone(),
            feature_results: slots.into_iter().flatten().collect(),
        })
    }

    /// Outputs per chain member, each in input order.
    async fn run_chain(
        &self,
        chain: &FallbackChain,
        run: BankRun<'_>,
    ) -> Result<Vec<Vec<FeatureItemResult>>, ExecutorError> {
        let concurrency = chain
            .members
            .iter()
            .map(|&m| {
                run.features[m]
                    .plugin
                    .item_concurrency()
                    .unwrap_or(self.options.feature_concurrency)
                    .max(1)
            })
            .max()
            .unwrap_or(1);
        debug!(chain = %chain.key, members = chain.members.len(), concurrency, "running chain");

        let per_item = map_bounded(run.data, concurrency, move |index, input| {
            self.run_item(chain, run, index, input)
        })
        .await?;

        let mut outputs: Vec<Vec<FeatureItemResult>> = chain
            .members
            .iter()
            .map(|_| Vec::with_capacity(run.data.len()))
            .collect();
        for item in per_item {
            for (slot, result) in outputs.iter_mut().zip(item) {
                slot.push(result);
            }
        }
        Ok(outputs)
    }

    /// One input through one chain; one result per member.
    async fn run_item(
        &self,
        chain: &FallbackChain,
        run: BankRun<'_>,
        index: usize,
        input: &str,
    ) -> Result<Vec<FeatureItemResult>, ExecutorError> {
        let mut resolved = false;
        let mut errored = false;
        let mut results = Vec::with_capacity(chain.members.len());

        for &member in &chain.members {
            let feature = &run.features[member];
            if resolved || errored {
                results.push(FeatureItemResult::empty(input));
                self.emit(run, member, index, ItemOutcome::Skipped);
                continue;
            }

            let ctx = PluginCtx::new(&self.gateway, &run.scopes[member]);
            let result = feature
                .plugin
                .run(input, &feature.feature.options, &ctx)
                .await
                .and_then(|output| check_kind(feature, output));

            match result {
                Ok(output) => {
                    results.push(FeatureItemResult {
                        input: input.to_string(),
                        output: Some(output),
                        error: None,
                    });
                    resolved = true;
                    self.emit(run, member, index, ItemOutcome::from_call_stats(ctx.call_stats()));
                }
                Err(PluginError::NoResult) => {
                    results.push(FeatureItemResult::empty(input));
                    self.emit(run, member, index, ItemOutcome::Skipped);
                }
                Err(err) => {
                    self.emit(run, member, index, ItemOutcome::Error);
                    if self.options.error_policy == ErrorPolicy::Fail {
                        return Err(ExecutorError::ItemFailed {
                            feature_id: feature.feature_id.clone(),
                            input: input.to_string(),
                            source: err,
                        });
                    }
                    warn!(
                        feature_id = %feature.feature_id,
                        index,
                        error = %err,
                        "item failed; skipping"
                    );
                    results.push(FeatureItemResult {
                        input: input.to_string(),
                        output: None,
                        error: Some(err.to_string()),
                    });
                    errored = true;
                }
            }
        }
        Ok(results)
    }

    fn emit(&self, run: BankRun<'_>, member: usize, index: usize, outcome: ItemOutcome) {
        let feature = &run.features[member];
        let done = run.done[member].fetch_add(1, Ordering::Relaxed) + 1;
        self.observer.on_item(&ItemProgressEvent {
            feature_id: feature.feature_id.clone(),
            plugin_name: feature.plugin.provider().to_string(),
            total: run.data.len(),
            index,
            done,
            outcome,
        });
    }
}

fn check_kind(feature: &ResolvedFeature, output: FeatureOutput) -> Result<FeatureOutput, PluginError> {
    if output.kind() == feature.kind() {
        Ok(output)
    } else {
        Err(PluginError::failed(format!(
            "plugin {} returned {} output for a {} feature",
            feature.plugin.provider(),
            output.kind(),
            feature.kind()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_policy_parses_loosely() {
        assert_eq!("skip-item".parse::<ErrorPolicy>().unwrap(), ErrorPolicy::SkipItem);
        assert_eq!(" fail ".parse::<ErrorPolicy>().unwrap(), ErrorPolicy::Fail);
        assert!("ignore".parse::<ErrorPolicy>().is_err());
    }

    #[test]
    fn error_policy_serde_matches_config_spelling() {
        let policy: ErrorPolicy = serde_json::from_str("\"SKIP_ITEM\"").unwrap();
        assert_eq!(policy, ErrorPolicy::SkipItem);
        assert_eq!(ExecutorOptions::default().feature_concurrency, 4);
    }
}
