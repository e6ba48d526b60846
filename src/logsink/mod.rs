//! Durable, queryable structured log sink.
//!
//! Every orchestration run and every activity it spawns appends
//! [`LogRecord`]s to a shared append-only sink keyed by run id. Concurrent
//! writers funnel through an unbounded channel into a single writer task,
//! so each record lands complete and uninterleaved. Sink failures are
//! reported through `tracing` and never fail the pipeline.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

/// Log severity, mirroring the classic level set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARNING"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// One append-only log table entry.
///
/// Partitioned by run id; the row key is unique per entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogRecord {
    /// Orchestration run id.
    pub partition_key: String,
    /// Unique row key within the partition.
    pub row_key: String,
    /// Entry timestamp, UTC.
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    /// Module that produced the entry.
    pub module: String,
    /// Function that produced the entry.
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestration_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_name: Option<String>,
    /// Scene identifier the entry relates to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene: Option<String>,
}

const MAX_MESSAGE_LENGTH: usize = 4096;

impl LogRecord {
    pub fn new(run_id: &str, level: LogLevel, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_MESSAGE_LENGTH {
            message.truncate(MAX_MESSAGE_LENGTH - 3);
            message.push_str("...");
        }
        Self {
            partition_key: run_id.to_string(),
            row_key: Uuid::new_v4().to_string(),
            time: Utc::now(),
            level,
            message,
            module: String::new(),
            function: String::new(),
            orchestration_name: None,
            activity_id: None,
            activity_name: None,
            scene: None,
        }
    }
}

/// Append-only sink for structured log records.
pub trait LogSink: Send + Sync {
    /// Appends one record. Must tolerate concurrent callers.
    fn append(&self, record: LogRecord);

    /// Returns the records for one run, in append order. Sinks that do
    /// not retain records return an empty vec.
    fn records_for(&self, run_id: &str) -> Vec<LogRecord>;
}

/// In-memory sink, used by tests and the status endpoint.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<HashMap<String, Vec<LogRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogSink for MemorySink {
    fn append(&self, record: LogRecord) {
        let mut records = self.records.lock().expect("log sink poisoned");
        records
            .entry(record.partition_key.clone())
            .or_default()
            .push(record);
    }

    fn records_for(&self, run_id: &str) -> Vec<LogRecord> {
        let records = self.records.lock().expect("log sink poisoned");
        records.get(run_id).cloned().unwrap_or_default()
    }
}

/// NDJSON file sink: one complete JSON record per line, written by a
/// dedicated task fed through a channel. Also retains records in memory
/// for querying.
pub struct NdjsonSink {
    tx: mpsc::UnboundedSender<LogRecord>,
    memory: Arc<MemorySink>,
}

impl NdjsonSink {
    /// Opens (creating parent directories as needed) and starts the
    /// writer task.
    pub fn open(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<LogRecord>();
        let memory = Arc::new(MemorySink::new());
        let retained = Arc::clone(&memory);

        tokio::spawn(async move {
            let mut file = file;
            while let Some(record) = rx.recv().await {
                retained.append(record.clone());
                match serde_json::to_string(&record) {
                    Ok(line) => {
                        if let Err(e) = writeln!(file, "{line}") {
                            error!(error = %e, "failed to append log record");
                        }
                    }
                    Err(e) => error!(error = %e, "failed to serialize log record"),
                }
            }
        });

        Ok(Self { tx, memory })
    }
}

impl LogSink for NdjsonSink {
    fn append(&self, record: LogRecord) {
        if self.tx.send(record).is_err() {
            warn!("log writer task stopped, dropping record");
        }
    }

    fn records_for(&self, run_id: &str) -> Vec<LogRecord> {
        self.memory.records_for(run_id)
    }
}

/// Per-activity logging handle: fills the shared context fields on every
/// record and mirrors each entry to `tracing`.
#[derive(Clone)]
pub struct RunLogger {
    sink: Arc<dyn LogSink>,
    run_id: String,
    orchestration_name: String,
    activity_id: Option<String>,
    activity_name: Option<String>,
    scene: Option<String>,
}

impl RunLogger {
    pub fn new(sink: Arc<dyn LogSink>, run_id: &str, orchestration_name: &str) -> Self {
        Self {
            sink,
            run_id: run_id.to_string(),
            orchestration_name: orchestration_name.to_string(),
            activity_id: None,
            activity_name: None,
            scene: None,
        }
    }

    /// Derives a logger scoped to one activity invocation.
    pub fn activity(&self, activity_name: &str) -> Self {
        let mut logger = self.clone();
        logger.activity_id = Some(Uuid::new_v4().to_string());
        logger.activity_name = Some(activity_name.to_string());
        logger
    }

    /// Derives a logger that tags every record with a scene identifier.
    pub fn with_scene(&self, scene: &str) -> Self {
        let mut logger = self.clone();
        logger.scene = Some(scene.to_string());
        logger
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log(&self, level: LogLevel, module: &str, function: &str, message: impl Into<String>) {
        let mut record = LogRecord::new(&self.run_id, level, message);
        record.module = module.to_string();
        record.function = function.to_string();
        record.orchestration_name = Some(self.orchestration_name.clone());
        record.activity_id = self.activity_id.clone();
        record.activity_name = self.activity_name.clone();
        record.scene = self.scene.clone();

        match level {
            LogLevel::Debug => tracing::debug!(run = %self.run_id, "{}", record.message),
            LogLevel::Info => tracing::info!(run = %self.run_id, "{}", record.message),
            LogLevel::Warning => tracing::warn!(run = %self.run_id, "{}", record.message),
            LogLevel::Error => tracing::error!(run = %self.run_id, "{}", record.message),
        }

        self.sink.append(record);
    }

    pub fn debug(&self, module: &str, function: &str, message: impl Into<String>) {
        self.log(LogLevel::Debug, module, function, message);
    }

    pub fn info(&self, module: &str, function: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, module, function, message);
    }

    pub fn warning(&self, module: &str, function: &str, message: impl Into<String>) {
        self.log(LogLevel::Warning, module, function, message);
    }

    pub fn error(&self, module: &str, function: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, module, function, message);
    }
}

/// Formats a timestamp the way the log table stores it.
pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_partitions_by_run() {
        let sink = MemorySink::new();
        sink.append(LogRecord::new("run-a", LogLevel::Info, "first"));
        sink.append(LogRecord::new("run-b", LogLevel::Info, "other"));
        sink.append(LogRecord::new("run-a", LogLevel::Error, "second"));

        let records = sink.records_for("run-a");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "first");
        assert_eq!(records[1].level, LogLevel::Error);
        assert!(sink.records_for("run-c").is_empty());
    }

    #[test]
    fn long_messages_are_truncated() {
        let record = LogRecord::new("run", LogLevel::Info, "x".repeat(10_000));
        assert_eq!(record.message.len(), MAX_MESSAGE_LENGTH);
        assert!(record.message.ends_with("..."));
    }

    #[test]
    fn run_logger_fills_context() {
        let sink = Arc::new(MemorySink::new());
        let logger = RunLogger::new(
            Arc::clone(&sink) as Arc<dyn LogSink>,
            "run-1",
            "geotemplate_bulk_transform",
        );
        let activity = logger.activity("transform").with_scene("https://x/y/a.tif");
        activity.info("engine", "render", "rendered scene");

        let records = sink.records_for("run-1");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.activity_name.as_deref(), Some("transform"));
        assert_eq!(record.scene.as_deref(), Some("https://x/y/a.tif"));
        assert_eq!(
            record.orchestration_name.as_deref(),
            Some("geotemplate_bulk_transform")
        );
        assert!(record.activity_id.is_some());
        assert_eq!(record.module, "engine");
    }

    #[tokio::test]
    async fn ndjson_sink_writes_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.ndjson");
        let sink = NdjsonSink::open(path.clone()).unwrap();

        for i in 0..10 {
            sink.append(LogRecord::new("run-x", LogLevel::Info, format!("entry {i}")));
        }
        // Give the writer task a chance to drain.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 10);
        for line in lines {
            let parsed: LogRecord = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.partition_key, "run-x");
        }
        assert_eq!(sink.records_for("run-x").len(), 10);
    }
}
