//! Item-level progress events and observers.

use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{mpsc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::plugin::CallStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemOutcome {
    Passed,
    Replayed,
    PartialReplay,
    Skipped,
    Error,
}

impl ItemOutcome {
    /// Outcome of a successful run given its external call sources.
    pub fn from_call_stats(stats: CallStats) -> Self {
        match (stats.replayed, stats.live) {
            (r, 0) if r > 0 => ItemOutcome::Replayed,
            (r, l) if r > 0 && l > 0 => ItemOutcome::PartialReplay,
            _ => ItemOutcome::Passed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Passed => "PASSED",
            ItemOutcome::Replayed => "REPLAYED",
            ItemOutcome::PartialReplay => "PARTIAL_REPLAY",
            ItemOutcome::Skipped => "SKIPPED",
            ItemOutcome::Error => "ERROR",
        }
    }

    /// Severity used when several outcomes collapse into one cell.
    pub fn priority(&self) -> u8 {
        match self {
            ItemOutcome::Passed => 1,
            ItemOutcome::Replayed => 2,
            ItemOutcome::PartialReplay => 3,
            ItemOutcome::Skipped => 4,
            ItemOutcome::Error => 5,
        }
    }
}

/// One state transition of one item under one feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemProgressEvent {
    pub feature_id: String,
    pub plugin_name: String,
    pub total: usize,
    pub index: usize,
    /// Items finished so far for this feature, including this one.
    pub done: usize,
    pub outcome: ItemOutcome,
}

pub trait ProgressObserver: Send + Sync {
    fn on_item(&self, event: &ItemProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ItemProgressEvent) + Send + Sync,
{
    fn on_item(&self, event: &ItemProgressEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {
    fn on_item(&self, _event: &ItemProgressEvent) {}
}

/// Logs errors and feature completion; everything else at debug.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressObserver for TracingProgress {
    fn on_item(&self, event: &ItemProgressEvent) {
        if event.outcome == ItemOutcome::Error {
            warn!(
                feature_id = %event.feature_id,
                plugin = %event.plugin_name,
                index = event.index,
                "item failed"
            );
        }
        if event.done == event.total {
            info!(
                feature_id = %event.feature_id,
                plugin = %event.plugin_name,
                total = event.total,
                "feature finished"
            );
        } else {
            debug!(
                feature_id = %event.feature_id,
                index = event.index,
                done = event.done,
                total = event.total,
                outcome = event.outcome.as_str(),
                "item progress"
            );
        }
    }
}

/// Forwards every event to each inner observer in order.
#[derive(Default)]
pub struct FanoutProgress {
    observers: Vec<std::sync::Arc<dyn ProgressObserver>>,
}

impl FanoutProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: std::sync::Arc<dyn ProgressObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl ProgressObserver for FanoutProgress {
    fn on_item(&self, event: &ItemProgressEvent) {
        for observer in &self.observers {
            observer.on_item(event);
        }
    }
}

// =============================================================================
// TALLY
// =============================================================================

/// Outcome counts for one feature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureTally {
    pub plugin_name: String,
    pub total: usize,
    pub counts: BTreeMap<&'static str, usize>,
    /// Highest-priority outcome seen.
    pub worst: Option<ItemOutcome>,
}

/// Accumulates per-feature outcome counts for an end-of-run summary.
#[derive(Debug, Default)]
pub struct OutcomeTally {
    features: Mutex<BTreeMap<String, FeatureTally>>,
}

impl OutcomeTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, FeatureTally> {
        self.features
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProgressObserver for OutcomeTally {
    fn on_item(&self, event: &ItemProgressEvent) {
        let mut features = self.features.lock().unwrap_or_else(PoisonError::into_inner);
        let tally = features.entry(event.feature_id.clone()).or_default();
        tally.plugin_name.clone_from(&event.plugin_name);
        tally.total = event.total;
        *tally.counts.entry(event.outcome.as_str()).or_insert(0) += 1;
        if tally
            .worst
            .map_or(true, |worst| event.outcome.priority() > worst.priority())
        {
            tally.worst = Some(event.outcome);
        }
    }
}

// =============================================================================
// JSONL SINK
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("progress worker failed: {0}")]
    Join(String),
}

/// Streams events as JSON lines from a background writer thread.
#[derive(Clone)]
pub struct JsonlProgressSink {
    sender: mpsc::Sender<ItemProgressEvent>,
}

pub struct ProgressWorker {
    handle: Option<std::thread::JoinHandle<Result<(), ProgressError>>>,
}

impl ProgressWorker {
    /// Wait for every queued event to be written. Drop all sinks first.
    pub fn join(mut self) -> Result<(), ProgressError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(ProgressError::Join("progress worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlProgressSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, ProgressWorker), ProgressError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<ItemProgressEvent>();
        let handle = std::thread::spawn(move || write_progress_loop(file, receiver));
        Ok((
            Self { sender },
            ProgressWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl ProgressObserver for JsonlProgressSink {
    fn on_item(&self, event: &ItemProgressEvent) {
        if self.sender.send(event.clone()).is_err() {
            warn!(feature_id = %event.feature_id, "progress writer closed; event dropped");
        }
    }
}

fn write_progress_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<ItemProgressEvent>,
) -> Result<(), ProgressError> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        let line =
            serde_json::to_string(&event).map_err(|e| ProgressError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}
