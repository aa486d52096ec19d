//! Bank-directory orchestration: load, preflight, execute, write.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::{error, info};

use crate::bank::{InputBank, OutputBank, OutputBankFeature, OutputBankItem, OutputBankItemFeatureValue};
use crate::call_log::{bank_log_path, CallLogError, JsonlCallLog};
use crate::config::RuntimeConfig;
use crate::executor::{ExecuteBankResult, Executor, ExecutorError};
use crate::gateway::Transport;
use crate::plugin::PluginRegistry;
use crate::progress::{NoopProgress, ProgressObserver};
use crate::resolve::{preflight, ConfigError};

pub const BANK_FILE_SUFFIX: &str = ".bank.json";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid bank schema in {file}: {message}")]
    InvalidBank { file: String, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    CallLog(#[from] CallLogError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RuntimeError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| RuntimeError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankReport {
    pub bank_id: String,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankFailure {
    pub bank_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: Vec<BankReport>,
    pub failed: Vec<BankFailure>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Runtime {
    config: RuntimeConfig,
    registry: PluginRegistry,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn ProgressObserver>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, registry: PluginRegistry, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            registry,
            transport,
            observer: Arc::new(NoopProgress),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// `*.json` files in the input directory, sorted by name.
    pub fn bank_files(&self) -> Result<Vec<PathBuf>, RuntimeError> {
        let in_dir = &self.config.paths.in_dir;
        let mut files = Vec::new();
        for entry in std::fs::read_dir(in_dir).map_err(RuntimeError::io(in_dir))? {
            let path = entry.map_err(RuntimeError::io(in_dir))?.path();
            let is_json = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("json"));
            if is_json && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Process every bank; one bank failing does not stop the rest.
    pub async fn run(&self) -> Result<RunSummary, RuntimeError> {
        let out_dir = &self.config.paths.out_dir;
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(RuntimeError::io(out_dir))?;

        let mut summary = RunSummary::default();
        for path in self.bank_files()? {
            let bank_id = bank_id(&path);
            match self.process_bank_file(&path).await {
                Ok(report) => {
                    info!(bank_id = %report.bank_id, output = %report.output_path.display(), "bank done");
                    summary.succeeded.push(report);
                }
                Err(err) => {
                    error!(bank_id = %bank_id, error = %err, "bank failed");
                    summary.failed.push(BankFailure {
                        bank_id,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(summary)
    }

    pub async fn process_bank_file(&self, path: &Path) -> Result<BankReport, RuntimeError> {
        let bank_id = bank_id(path);
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(RuntimeError::io(path))?;
        let bank = parse_bank(&raw, path)?;

        // Nothing touches the output directory until the bank is known-good.
        preflight(&bank.features, &self.registry)?;

        let out_dir = &self.config.paths.out_dir;
        let log = JsonlCallLog::open(bank_log_path(out_dir, &bank_id))?;
        let _lock = log.lock_exclusive()?;
        info!(bank_id = %bank_id, log = %log.path().display(), "processing bank");

        let executor = Executor::new(
            self.registry.clone(),
            Arc::new(log),
            self.transport.clone(),
            self.config.defaults.executor_options(),
        )
        .with_observer(self.observer.clone());
        let result = executor.execute_bank(&bank).await?;

        let output = build_output_bank(&bank, &result, now_rfc3339());
        let output_path = out_dir.join(format!("{bank_id}{BANK_FILE_SUFFIX}"));
        let mut json = serde_json::to_string_pretty(&output)?;
        json.push('\n');
        tokio::fs::write(&output_path, json)
            .await
            .map_err(RuntimeError::io(&output_path))?;

        Ok(BankReport {
            bank_id,
            output_path,
        })
    }
}

/// File stem, e.g. `greetings` for `greetings.json`.
pub fn bank_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn parse_bank(raw: &str, path: &Path) -> Result<InputBank, RuntimeError> {
    let file = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    serde_json::from_str(raw).map_err(|e| RuntimeError::InvalidBank {
        file,
        message: e.to_string(),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Assemble the output bank by item position from successful outputs only.
pub fn build_output_bank(
    bank: &InputBank,
    result: &ExecuteBankResult,
    generated_at: String,
) -> OutputBank {
    let features = result
        .feature_results
        .iter()
        .map(|f| OutputBankFeature {
            id: f.feature_id.clone(),
            kind: f.kind,
            group: f.group.clone(),
            provider: f.provider.clone(),
            version: f.version.clone(),
        })
        .collect();

    let data = bank
        .data
        .iter()
        .enumerate()
        .map(|(index, input)| {
            let features = result
                .feature_results
                .iter()
                .filter_map(|f| {
                    let item = f.outputs.get(index)?;
                    if item.error.is_some() {
                        return None;
                    }
                    let output = item.output.clone()?;
                    Some((f.feature_id.clone(), OutputBankItemFeatureValue { output }))
                })
                .collect();
            OutputBankItem {
                input: input.clone(),
                features,
            }
        })
        .collect();

    OutputBank {
        schema_version: bank.schema_version.clone(),
        title: bank.title.clone(),
        description: bank.description.clone(),
        author: bank.author.clone(),
        source_language: bank.source_language.clone(),
        generated_at,
        features,
        data,
    }
}
