//! Append-only JSONL log of external calls, used for replay.
//!
//! Every live call is appended as one line. At open time the whole file is read
//! back into a key -> record index; the last line for a key wins. The file is
//! never rewritten implicitly: duplicates accumulate until [`JsonlCallLog::compact`]
//! is invoked explicitly.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub const LOG_FILE_NAME: &str = "api-calls.log.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ok,
    Error,
}

/// One persisted external call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallLog {
    pub key: String,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_identity: Option<Value>,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub duration_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CallLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("call log lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
}

#[async_trait]
pub trait CallLog: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<ApiCallLog>, CallLogError>;
    async fn put(&self, record: ApiCallLog) -> Result<(), CallLogError>;
}

/// Location of a bank's call log under the output directory.
pub fn bank_log_path(out_dir: &Path, bank_id: &str) -> PathBuf {
    out_dir.join("logs").join(bank_id).join(LOG_FILE_NAME)
}

// =============================================================================
// JSONL FILE LOG
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallLogStats {
    /// Non-blank lines in the file, including superseded and malformed ones.
    pub lines: usize,
    /// Distinct keys visible through `get`.
    pub keys: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactStats {
    pub lines_before: usize,
    pub lines_after: usize,
}

struct JsonlInner {
    index: HashMap<String, ApiCallLog>,
    writer: BufWriter<File>,
    lines: usize,
}

#[derive(Clone)]
pub struct JsonlCallLog {
    path: PathBuf,
    inner: Arc<Mutex<JsonlInner>>,
}

impl JsonlCallLog {
    /// Open (creating if absent) the log at `path` and rebuild its index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CallLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (index, lines, skipped) = match std::fs::read(&path) {
            Ok(bytes) => load_index(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (HashMap::new(), 0, 0),
            Err(e) => return Err(e.into()),
        };
        if skipped > 0 {
            warn!(path = %path.display(), skipped, "skipped malformed call log lines");
        }
        debug!(path = %path.display(), lines, keys = index.len(), "opened call log");

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            inner: Arc::new(Mutex::new(JsonlInner {
                index,
                writer: BufWriter::new(file),
                lines,
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Advisory lock guarding against a second process appending to this log.
    pub fn lock_exclusive(&self) -> Result<CallLogLock, CallLogError> {
        CallLogLock::new(&self.path)
    }

    pub fn stats(&self) -> Result<CallLogStats, CallLogError> {
        self.with_inner(|inner| {
            Ok(CallLogStats {
                lines: inner.lines,
                keys: inner.index.len(),
            })
        })
    }

    /// Rewrite the file keeping only the visible record of each key.
    ///
    /// Surviving lines keep the relative order of their last occurrence.
    pub async fn compact(&self) -> Result<CompactStats, CallLogError> {
        let log = self.clone();
        tokio::task::spawn_blocking(move || {
            log.with_inner(|inner| {
                inner.writer.flush()?;
                let bytes = std::fs::read(&log.path)?;

                let mut last_seen: HashMap<String, (usize, &[u8])> = HashMap::new();
                let mut lines_before = 0usize;
                for (pos, line) in non_blank_lines(&bytes).enumerate() {
                    lines_before += 1;
                    if let Some(record) = parse_line(line) {
                        last_seen.insert(record.key, (pos, line));
                    }
                }
                let mut kept: Vec<(usize, &[u8])> = last_seen.into_values().collect();
                kept.sort_by_key(|(pos, _)| *pos);

                let tmp_path = log.path.with_extension("jsonl.tmp");
                {
                    let mut tmp = BufWriter::new(File::create(&tmp_path)?);
                    for (_, line) in &kept {
                        tmp.write_all(line)?;
                        tmp.write_all(b"\n")?;
                    }
                    tmp.flush()?;
                }
                std::fs::rename(&tmp_path, &log.path)?;

                let file = OpenOptions::new().create(true).append(true).open(&log.path)?;
                inner.writer = BufWriter::new(file);
                inner.lines = kept.len();

                Ok(CompactStats {
                    lines_before,
                    lines_after: kept.len(),
                })
            })
        })
        .await
        .map_err(|e| CallLogError::Join(e.to_string()))?
    }

    fn with_inner<F, R>(&self, f: F) -> Result<R, CallLogError>
    where
        F: FnOnce(&mut JsonlInner) -> Result<R, CallLogError>,
    {
        let mut guard = self.inner.lock().map_err(|_| CallLogError::Poisoned)?;
        f(&mut guard)
    }
}

#[async_trait]
impl CallLog for JsonlCallLog {
    async fn get(&self, key: &str) -> Result<Option<ApiCallLog>, CallLogError> {
        self.with_inner(|inner| Ok(inner.index.get(key).cloned()))
    }

    async fn put(&self, record: ApiCallLog) -> Result<(), CallLogError> {
        let line = serde_json::to_string(&record).map_err(|e| CallLogError::Serde(e.to_string()))?;
        let log = self.clone();
        tokio::task::spawn_blocking(move || {
            log.with_inner(|inner| {
                writeln!(inner.writer, "{line}")?;
                inner.writer.flush()?;
                inner.lines += 1;
                inner.index.insert(record.key.clone(), record);
                Ok(())
            })
        })
        .await
        .map_err(|e| CallLogError::Join(e.to_string()))?
    }
}

fn non_blank_lines(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
}

fn parse_line(line: &[u8]) -> Option<ApiCallLog> {
    let record: ApiCallLog = serde_json::from_slice(line).ok()?;
    if record.key.is_empty() {
        return None;
    }
    Some(record)
}

fn load_index(bytes: &[u8]) -> (HashMap<String, ApiCallLog>, usize, usize) {
    let mut index = HashMap::new();
    let mut lines = 0usize;
    let mut skipped = 0usize;
    for line in non_blank_lines(bytes) {
        lines += 1;
        match parse_line(line) {
            Some(record) => {
                index.insert(record.key.clone(), record);
            }
            None => skipped += 1,
        }
    }
    (index, lines, skipped)
}

#[derive(Debug)]
pub struct CallLogLock {
    _file: File,
}

impl CallLogLock {
    fn new(log_path: &Path) -> Result<Self, CallLogError> {
        let mut lock_path = log_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

// =============================================================================
// IN-MEMORY LOG
// =============================================================================

/// Call log kept entirely in memory. Records every `put` in order.
#[derive(Default)]
pub struct MemoryCallLog {
    records: Mutex<Vec<ApiCallLog>>,
}

impl MemoryCallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ApiCallLog>) -> Self {
        Self {
            records: Mutex::new(records.into_iter().collect()),
        }
    }

    /// All records ever written, including superseded ones.
    pub fn records(&self) -> Vec<ApiCallLog> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CallLog for MemoryCallLog {
    async fn get(&self, key: &str) -> Result<Option<ApiCallLog>, CallLogError> {
        let records = self.records.lock().map_err(|_| CallLogError::Poisoned)?;
        Ok(records.iter().rev().find(|r| r.key == key).cloned())
    }

    async fn put(&self, record: ApiCallLog) -> Result<(), CallLogError> {
        let mut records = self.records.lock().map_err(|_| CallLogError::Poisoned)?;
        records.push(record);
        Ok(())
    }
}
