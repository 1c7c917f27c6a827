//! Structured operation logging.
//!
//! Every public operation on an instance emits a [`LogRecord`] carrying a
//! correlation id ([`TracerId`]). Records go to an injectable [`LogSink`]; the
//! default sink forwards them to `tracing`. Logging is a side channel and has
//! no effect on routing.

use std::fmt;
use std::sync::Mutex;

use rand::Rng;
use tracing_subscriber::{fmt as tracing_fmt, prelude::*, EnvFilter};

/// Correlation id attached to every record of one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TracerId(pub u64);

impl TracerId {
    /// A fresh random eight-digit id.
    pub fn generate() -> Self {
        TracerId(rand::thread_rng().gen_range(10_000_000..100_000_000))
    }
}

impl fmt::Display for TracerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    /// Operation that produced the record, e.g. `"Cipher.transmit"`.
    pub block: &'static str,
    pub message: String,
    pub tracer_id: TracerId,
    /// Route, channel or queue the record is about.
    pub subject: Option<String>,
}

pub trait LogSink: Send + Sync + 'static {
    fn log(&self, record: &LogRecord);
}

impl<F> LogSink for F
where
    F: Fn(&LogRecord) + Send + Sync + 'static,
{
    fn log(&self, record: &LogRecord) {
        self(record)
    }
}

/// Forwards records to `tracing` under the `cipher` module.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, record: &LogRecord) {
        let subject = record.subject.as_deref().unwrap_or("");
        match record.level {
            LogLevel::Debug => tracing::debug!(
                module = "cipher", block = record.block, tracer_id = record.tracer_id.0,
                subject, "{}", record.message
            ),
            LogLevel::Info => tracing::info!(
                module = "cipher", block = record.block, tracer_id = record.tracer_id.0,
                subject, "{}", record.message
            ),
            LogLevel::Warn => tracing::warn!(
                module = "cipher", block = record.block, tracer_id = record.tracer_id.0,
                subject, "{}", record.message
            ),
            LogLevel::Error => tracing::error!(
                module = "cipher", block = record.block, tracer_id = record.tracer_id.0,
                subject, "{}", record.message
            ),
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn records_for(&self, block: &str) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.block == block)
            .collect()
    }
}

impl LogSink for MemoryLogSink {
    fn log(&self, record: &LogRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

/// Thin helper that stamps records before handing them to the sink.
pub(crate) struct Instrument<'a> {
    sink: &'a dyn LogSink,
    block: &'static str,
    tracer_id: TracerId,
}

impl<'a> Instrument<'a> {
    pub(crate) fn new(sink: &'a dyn LogSink, block: &'static str, tracer_id: TracerId) -> Self {
        Self {
            sink,
            block,
            tracer_id,
        }
    }

    pub(crate) fn emit(&self, level: LogLevel, subject: Option<&str>, message: impl Into<String>) {
        self.sink.log(&LogRecord {
            level,
            block: self.block,
            message: message.into(),
            tracer_id: self.tracer_id,
            subject: subject.map(str::to_string),
        });
    }

    pub(crate) fn info(&self, subject: &str, message: impl Into<String>) {
        self.emit(LogLevel::Info, Some(subject), message);
    }

    pub(crate) fn warn(&self, subject: &str, message: impl Into<String>) {
        self.emit(LogLevel::Warn, Some(subject), message);
    }

    pub(crate) fn error(&self, subject: &str, message: impl Into<String>) {
        self.emit(LogLevel::Error, Some(subject), message);
    }
}

/// Installs a global `tracing` subscriber with an env-filter.
///
/// `RUST_LOG` wins over `default_filter`. Returns `false` if a subscriber was
/// already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(tracing_fmt::layer())
        .with(filter)
        .try_init()
        .is_ok()
}
