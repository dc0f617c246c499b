//! Append-only structured outputs.
//!
//! Every SL attempt, every position closure, and periodic metrics snapshots
//! are appended to line-oriented files by a background task. Producers never
//! block: records are enqueued with `try_send` and dropped (with a one-time
//! warning) when the channel saturates.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::warn;

use ratchet_core::{Direction, Price, Symbol, Ticket, Usd};

/// One record per SL attempt, successful or not.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SlAttemptRecord {
    pub timestamp: DateTime<Utc>,
    pub ticket: Ticket,
    pub symbol: Symbol,
    pub direction: Direction,
    pub entry_price: Price,
    pub current_price: Price,
    pub profit_usd: Usd,
    pub target_sl: Price,
    pub applied_sl: Option<Price>,
    pub reason: String,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// One record per position closure, whatever the path that closed it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClosureRecord {
    pub ticket: Ticket,
    pub symbol: Symbol,
    pub close_time: DateTime<Utc>,
    pub close_reason: String,
    pub profit_usd: Usd,
}

/// Aggregated counters published periodically.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MetricsSnapshotRecord {
    pub timestamp: DateTime<Utc>,
    pub update_attempts: u64,
    pub update_successes: u64,
    pub update_failures: u64,
    pub success_rate: f64,
    pub lock_contention_rate: f64,
    pub emergency_invocations: u64,
    pub rate_limited_skips: u64,
    pub mean_activation_ms: f64,
    pub open_positions: u64,
    pub open_circuits: u64,
}

/// Configuration used when spawning a [`Journal`].
#[derive(Clone, Debug)]
pub struct JournalSettings {
    /// Directory where all journal files are appended.
    pub dir: PathBuf,
    /// How often buffered lines are flushed to disk.
    pub flush_interval: Duration,
    /// Capacity of the asynchronous channel accepting records.
    pub channel_capacity: usize,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./journal"),
            flush_interval: Duration::from_secs(1),
            channel_capacity: 4_096,
        }
    }
}

/// Background component appending journal records to disk.
pub struct Journal {
    handle: JournalHandle,
    task: Option<JoinHandle<Result<()>>>,
}

impl Journal {
    /// Starts a new journal task with the provided configuration.
    pub async fn spawn(settings: JournalSettings) -> Result<Self> {
        tokio::fs::create_dir_all(&settings.dir)
            .await
            .with_context(|| format!("failed to create {}", settings.dir.display()))?;

        let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
        let worker = JournalWorker::new(&settings, rx)?;
        let task = tokio::spawn(worker.run(settings.flush_interval));
        Ok(Self {
            handle: JournalHandle { sender: tx },
            task: Some(task),
        })
    }

    /// Returns a handle that can be cloned and used across tasks.
    pub fn handle(&self) -> JournalHandle {
        self.handle.clone()
    }

    /// Signals the journal to stop and waits for buffers to flush.
    ///
    /// An explicit stop message is used because handle clones may outlive
    /// this call inside still-running components.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.handle.sender.send(JournalMessage::Shutdown).await;
        drop(self.handle);
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(result) => result?,
                Err(err) => return Err(anyhow!("journal task aborted: {err}")),
            }
        }
        Ok(())
    }
}

/// Cloneable producer side of the journal.
#[derive(Clone)]
pub struct JournalHandle {
    sender: mpsc::Sender<JournalMessage>,
}

impl JournalHandle {
    /// Enqueues an SL attempt record.
    pub fn record_attempt(&self, record: SlAttemptRecord) {
        self.enqueue(
            JournalMessage::Attempt(Box::new(record)),
            "attempt",
            &ATTEMPT_SATURATION,
        );
    }

    /// Enqueues a closure record.
    pub fn record_closure(&self, record: ClosureRecord) {
        self.enqueue(
            JournalMessage::Closure(Box::new(record)),
            "closure",
            &CLOSURE_SATURATION,
        );
    }

    /// Enqueues a metrics snapshot.
    pub fn record_metrics(&self, record: MetricsSnapshotRecord) {
        self.enqueue(
            JournalMessage::Metrics(Box::new(record)),
            "metrics",
            &METRICS_SATURATION,
        );
    }

    fn enqueue(&self, message: JournalMessage, label: &'static str, flag: &'static AtomicBool) {
        match self.sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if !flag.swap(true, Ordering::Relaxed) {
                    warn!("journal channel saturated; dropping {label} records");
                }
            }
            Err(TrySendError::Closed(_)) => {
                warn!("journal channel closed; ignoring {label} record");
            }
        }
    }
}

enum JournalMessage {
    Attempt(Box<SlAttemptRecord>),
    Closure(Box<ClosureRecord>),
    Metrics(Box<MetricsSnapshotRecord>),
    Shutdown,
}

static ATTEMPT_SATURATION: AtomicBool = AtomicBool::new(false);
static CLOSURE_SATURATION: AtomicBool = AtomicBool::new(false);
static METRICS_SATURATION: AtomicBool = AtomicBool::new(false);

struct JournalWorker {
    rx: mpsc::Receiver<JournalMessage>,
    attempts: BufWriter<File>,
    closures: BufWriter<File>,
    metrics: BufWriter<File>,
    attempts_csv: csv::Writer<File>,
}

impl JournalWorker {
    fn new(settings: &JournalSettings, rx: mpsc::Receiver<JournalMessage>) -> Result<Self> {
        let csv_path = settings.dir.join("sl_attempts.csv");
        let write_csv_header = !csv_path.exists();
        let attempts_csv = csv::WriterBuilder::new()
            .has_headers(write_csv_header)
            .from_writer(append_file(&csv_path)?);
        Ok(Self {
            rx,
            attempts: BufWriter::new(append_file(&settings.dir.join("sl_attempts.jsonl"))?),
            closures: BufWriter::new(append_file(&settings.dir.join("closures.jsonl"))?),
            metrics: BufWriter::new(append_file(&settings.dir.join("metrics.jsonl"))?),
            attempts_csv,
        })
    }

    async fn run(mut self, flush_interval: Duration) -> Result<()> {
        let mut ticker = interval(flush_interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(JournalMessage::Shutdown) | None => break,
                    Some(message) => self.write(message)?,
                },
                _ = ticker.tick() => self.flush()?,
            }
        }
        self.flush()?;
        Ok(())
    }

    fn write(&mut self, message: JournalMessage) -> Result<()> {
        match message {
            JournalMessage::Attempt(record) => {
                write_json_line(&mut self.attempts, record.as_ref())?;
                self.attempts_csv
                    .serialize(record.as_ref())
                    .context("failed to append csv attempt row")?;
            }
            JournalMessage::Closure(record) => {
                write_json_line(&mut self.closures, record.as_ref())?;
            }
            JournalMessage::Metrics(record) => {
                write_json_line(&mut self.metrics, record.as_ref())?;
            }
            JournalMessage::Shutdown => {}
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.attempts.flush()?;
        self.closures.flush()?;
        self.metrics.flush()?;
        self.attempts_csv.flush()?;
        Ok(())
    }
}

fn append_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open journal file {}", path.display()))
}

fn write_json_line<T: Serialize>(writer: &mut BufWriter<File>, record: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")?;
    Ok(())
}
