//! Time abstraction layer
//!
//! The coordinator never reads the wall clock or sleeps on its own. It gets the
//! current time from a [`Clock`], tick timestamps from a [`Ticker`] and defers
//! survey timeouts through a [`Scheduler`]. Production code plugs in the tokio
//! backed implementations, tests plug in the manual ones and drive time by
//! hand.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Timestamp in milliseconds since epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1000))
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Unix seconds, the unit survey timestamps are expressed in.
    pub fn as_secs(&self) -> i64 {
        (self.0 / 1000) as i64
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

/// Clock abstraction for time operations
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(ms)
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        ManualClock {
            now_ms: Arc::new(AtomicU64::new(start.0)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Timestamp) {
        self.now_ms.store(to.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now_ms.load(Ordering::SeqCst))
    }
}

/// Source of survey ticks.
pub trait Ticker: Send {
    /// Wait for the next tick and return its timestamp in unix seconds.
    /// `None` means the ticker is finished and no more ticks will come.
    fn tick(&mut self) -> Pin<Box<dyn Future<Output = Option<i64>> + Send + '_>>;
}

/// Ticker fed by hand through a [`TickSender`].
pub struct ChannelTicker {
    rx: mpsc::UnboundedReceiver<i64>,
}

/// Sending half of a [`ChannelTicker`]. Dropping every sender ends the ticker.
#[derive(Clone)]
pub struct TickSender {
    tx: mpsc::UnboundedSender<i64>,
}

impl ChannelTicker {
    pub fn new() -> (TickSender, ChannelTicker) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TickSender { tx }, ChannelTicker { rx })
    }
}

impl TickSender {
    /// Fire a tick. Returns `false` if the ticker is gone.
    pub fn tick(&self, timestamp: i64) -> bool {
        self.tx.send(timestamp).is_ok()
    }
}

impl Ticker for ChannelTicker {
    fn tick(&mut self) -> Pin<Box<dyn Future<Output = Option<i64>> + Send + '_>> {
        Box::pin(self.rx.recv())
    }
}

/// A deferred one-shot callback.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs callbacks after a delay. Callbacks must only enqueue work for their
/// owner; they run outside of it.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, after: Duration, task: Task);
}

/// Scheduler backed by `tokio::time::sleep`. Must be used inside a runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, after: Duration, task: Task) {
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            task();
        });
    }
}

/// Scheduler whose callbacks fire only when its time is advanced.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualSchedulerState>>,
}

#[derive(Default)]
struct ManualSchedulerState {
    elapsed: Duration,
    pending: Vec<(Duration, Task)>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of callbacks not yet fired.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Move time forward and run every callback that became due, earliest
    /// first. Returns how many ran.
    pub fn advance(&self, by: Duration) -> usize {
        let mut due = {
            let mut state = self.inner.lock();
            state.elapsed += by;
            let now = state.elapsed;
            let (due, later): (Vec<_>, Vec<_>) = state
                .pending
                .drain(..)
                .partition(|(deadline, _)| *deadline <= now);
            state.pending = later;
            due
        };

        // Stable sort keeps scheduling order for equal deadlines.
        due.sort_by_key(|(deadline, _)| *deadline);
        let fired = due.len();
        for (_, task) in due {
            task();
        }
        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, after: Duration, task: Task) {
        let mut state = self.inner.lock();
        let deadline = state.elapsed + after;
        state.pending.push((deadline, task));
    }
}
