//! Runtime configuration and the built-in plugin set.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::executor::{ErrorPolicy, ExecutorOptions, DEFAULT_FEATURE_CONCURRENCY};
use crate::gateway::ReplayPolicy;
use crate::plugin::{
    PluginRegistry, TranslateGemma, TranslateGemmaConfig, VduKirciuoklis, VduKirciuoklisConfig,
};

pub const DEFAULT_IN_DIR: &str = "databanks/sources";
pub const DEFAULT_OUT_DIR: &str = "databanks/dist";

#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimePaths {
    /// Directory of input bank files (`*.json`).
    pub in_dir: PathBuf,
    /// Receives `<bankId>.bank.json` and `logs/<bankId>/`.
    pub out_dir: PathBuf,
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self {
            in_dir: PathBuf::from(DEFAULT_IN_DIR),
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeDefaults {
    pub replay_policy: ReplayPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_parallelism: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_concurrency: Option<usize>,
    pub error_policy: ErrorPolicy,
}

impl RuntimeDefaults {
    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            replay_policy: self.replay_policy,
            feature_parallelism: self.feature_parallelism,
            feature_concurrency: self
                .feature_concurrency
                .unwrap_or(DEFAULT_FEATURE_CONCURRENCY),
            error_policy: self.error_policy,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default)]
    pub paths: RuntimePaths,
    #[serde(default)]
    pub defaults: RuntimeDefaults,
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigFileError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// `translategemma` and `vdu_kirciuoklis`, configured from the environment.
pub fn builtin_registry() -> PluginRegistry {
    PluginRegistry::new()
        .with(Arc::new(TranslateGemma::new(TranslateGemmaConfig::from_env())))
        .with(Arc::new(VduKirciuoklis::new(VduKirciuoklisConfig::from_env())))
}
