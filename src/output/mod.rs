//! Snapshot output
//!
//! The aggregator hands finished snapshots to an [`OutputGroup`], which offers
//! each one to every configured [`Sink`]. `send` must never block: a sink that
//! cannot keep up drops snapshots on its own side and reports an error, which
//! is logged and otherwise ignored.

use crate::metrics::TimestampedStats;
use crate::observability::spans;
use crate::production::SnapshotReceiver;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The sink's buffer is full; this snapshot was dropped for it
    #[error("queue full, snapshot dropped")]
    QueueFull,

    #[error("sink disconnected")]
    Disconnected,
}

/// Consumer of finished snapshots.
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Hand over a snapshot without blocking.
    fn send(&self, snapshot: Arc<TimestampedStats>) -> Result<(), SinkError>;
}

/// Fans snapshots out to a set of sinks.
#[derive(Default)]
pub struct OutputGroup {
    sinks: Vec<Arc<dyn Sink>>,
}

impl OutputGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sink: Arc<dyn Sink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Offer one snapshot to every sink. Returns how many refused it.
    pub fn dispatch(&self, snapshot: &Arc<TimestampedStats>) -> usize {
        let _span = spans::output_span(snapshot.timestamp(), self.sinks.len()).entered();
        let mut failed = 0;
        for sink in &self.sinks {
            if let Err(e) = sink.send(snapshot.clone()) {
                warn!(sink = sink.name(), error = %e, "Sink failed to take snapshot");
                failed += 1;
            }
        }
        failed
    }

    /// Dispatch until the aggregator's output channel closes.
    pub async fn run(self, mut snapshots: SnapshotReceiver) {
        while let Some(snapshot) = snapshots.recv().await {
            self.dispatch(&snapshot);
        }
        debug!("Snapshot channel closed, output stopped");
    }
}

/// Render a snapshot as a heading plus one sorted `key: value` line per metric.
pub fn format_snapshot(snapshot: &TimestampedStats) -> (String, Vec<String>) {
    let heading = format!("[output] (ts:{}) Aggregated data:", snapshot.timestamp());
    let mut lines: Vec<String> = snapshot
        .counters()
        .iter()
        .map(|(key, value)| format!("{}: {}", key, value))
        .chain(
            snapshot
                .dists()
                .iter()
                .map(|(key, dist)| format!("{}: {}", key, dist)),
        )
        .collect();
    lines.sort();
    (heading, lines)
}

/// Writes snapshots as text from a background thread.
pub struct WriterSink {
    name: String,
    tx: Option<mpsc::SyncSender<Arc<TimestampedStats>>>,
    worker: Option<JoinHandle<()>>,
}

impl WriterSink {
    pub fn new<W>(writer: W, name: impl Into<String>, capacity: usize) -> Self
    where
        W: Write + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::sync_channel::<Arc<TimestampedStats>>(capacity);
        let thread_name = name.clone();
        let worker = std::thread::spawn(move || {
            let mut writer = writer;
            for snapshot in rx {
                if let Err(e) = write_snapshot(&mut writer, &snapshot) {
                    warn!(sink = %thread_name, error = %e, "Failed to write snapshot");
                }
            }
        });

        WriterSink {
            name,
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    pub fn stdout(capacity: usize) -> Self {
        Self::new(std::io::stdout(), "stdout", capacity)
    }

    /// Stop accepting snapshots and wait until the queued ones are written.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn write_snapshot<W: Write>(writer: &mut W, snapshot: &TimestampedStats) -> std::io::Result<()> {
    let (heading, lines) = format_snapshot(snapshot);
    writeln!(writer, "{}", heading)?;
    for line in lines {
        writeln!(writer, "{}", line)?;
    }
    writer.flush()
}

impl Sink for WriterSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, snapshot: Arc<TimestampedStats>) -> Result<(), SinkError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(SinkError::Disconnected);
        };
        tx.try_send(snapshot).map_err(|e| match e {
            mpsc::TrySendError::Full(_) => SinkError::QueueFull,
            mpsc::TrySendError::Disconnected(_) => SinkError::Disconnected,
        })
    }
}

impl Drop for WriterSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps the most recent snapshot for on-demand JSON rendering.
#[derive(Default)]
pub struct SnapshotSink {
    last: Mutex<Option<Arc<TimestampedStats>>>,
}

impl SnapshotSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<Arc<TimestampedStats>> {
        self.last.lock().clone()
    }

    /// JSON of the last snapshot, `null` before the first one arrives.
    pub fn render_json(&self) -> serde_json::Result<String> {
        match self.last() {
            Some(snapshot) => serde_json::to_string(&*snapshot),
            None => Ok("null".to_string()),
        }
    }
}

impl Sink for SnapshotSink {
    fn name(&self) -> &str {
        "snapshot"
    }

    fn send(&self, snapshot: Arc<TimestampedStats>) -> Result<(), SinkError> {
        *self.last.lock() = Some(snapshot);
        Ok(())
    }
}
