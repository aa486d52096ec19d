#![forbid(unsafe_code)]

//! # feature-bank
//!
//! Enriches "banks" of short text inputs with per-item features (translations,
//! stress accents, morphology) computed by pluggable providers.
//!
//! Every external call a provider makes goes through a gateway that keys it
//! deterministically and records it in a per-bank JSONL call log, so a bank can
//! be re-run offline from the log (`REPLAY_ONLY`) or resumed after a partial
//! failure (`REPLAY_THEN_LIVE`) without repeating finished calls.
//!
//! Features of the same kind and group form a fallback chain: for each input,
//! providers are tried in declaration order until one produces an output.

pub mod bank;
pub mod call_log;
pub mod config;
pub mod executor;
pub mod gateway;
pub mod plugin;
pub mod pool;
pub mod progress;
pub mod resolve;
pub mod runtime;

pub use bank::{
    FeatureConfig, FeatureKind, FeatureOutput, InputBank, OutputBank, OutputBankView,
    PhoneticsPiece, TranslationOutput,
};
pub use call_log::{ApiCallLog, CallLog, CallLogError, JsonlCallLog, MemoryCallLog};
pub use config::{builtin_registry, RuntimeConfig};
pub use executor::{
    ErrorPolicy, ExecuteBankResult, Executor, ExecutorError, ExecutorOptions, FeatureRunResult,
};
pub use gateway::{
    CallGateway, ExternalCallRequest, GatewayError, HttpTransport, ReplayPolicy, Transport,
    TransportRequest,
};
pub use plugin::{Plugin, PluginCtx, PluginError, PluginRegistry};
pub use progress::{
    ItemOutcome, ItemProgressEvent, JsonlProgressSink, ProgressObserver, ProgressWorker,
};
pub use resolve::ConfigError;
pub use runtime::{build_output_bank, RunSummary, Runtime, RuntimeError};
