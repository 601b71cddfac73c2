//! Aggregator - Actor that owns the open snapshot
//!
//! Every input reaches the aggregator through one channel, so the order the
//! coordinator and the sessions send in is the order it is applied in. The
//! coordinator always sends `NewTimestamp(ts)` before it asks any client for
//! `ts`, which means fragments for `ts` can never overtake their snapshot.
//!
//! ```text
//! ┌─────────────┐  new-ts / complete  ┌──────────────┐  Arc<snapshot>  ┌────────┐
//! │ Coordinator │────────────────────▶│  Aggregator  │────────────────▶│ Output │
//! └─────────────┘                     │ (owns state) │                 └────────┘
//! ┌─────────────┐      fragments      │              │
//! │  Sessions   │────────────────────▶│              │
//! └─────────────┘                     └──────────────┘
//! ```

use crate::metrics::{StatKey, TimestampedStats};
use crate::protocol::Stats;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Input to the aggregator core.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorEvent {
    /// A tick fired. Start a snapshot for this timestamp.
    NewTimestamp(i64),
    /// Metric data for the timestamp carried inside the `Stats`.
    Fragment(Stats),
    /// Every client answered or the survey timed out.
    Complete(i64),
}

/// Kind of value a metric carried the last time it was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricShape {
    Counter,
    Distribution,
}

pub type MetricShapes = BTreeMap<StatKey, MetricShape>;

/// Single-threaded aggregation state.
#[derive(Debug, Default)]
pub struct Aggregator {
    current: Option<TimestampedStats>,
    shapes: MetricShapes,
    late_fragments: u64,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp of the open snapshot, if any.
    pub fn open_timestamp(&self) -> Option<i64> {
        self.current.as_ref().map(TimestampedStats::timestamp)
    }

    pub fn shapes(&self) -> &MetricShapes {
        &self.shapes
    }

    /// Fragments discarded because their snapshot was not open.
    pub fn late_fragments(&self) -> u64 {
        self.late_fragments
    }

    /// Apply one event. Returns the snapshot it finished, if any.
    pub fn apply(&mut self, event: AggregatorEvent) -> Option<TimestampedStats> {
        match event {
            AggregatorEvent::NewTimestamp(ts) => self.on_new_timestamp(ts),
            AggregatorEvent::Fragment(stats) => {
                self.on_fragment(&stats);
                None
            }
            AggregatorEvent::Complete(ts) => self.on_complete(ts),
        }
    }

    fn on_new_timestamp(&mut self, ts: i64) -> Option<TimestampedStats> {
        if self.open_timestamp() == Some(ts) {
            debug!(timestamp = ts, "Snapshot already open");
            return None;
        }

        let previous = self.current.replace(TimestampedStats::new(ts));
        match previous {
            Some(prev) if !prev.is_empty() => {
                warn!(
                    timestamp = prev.timestamp(),
                    next = ts,
                    "Snapshot never completed, flushing it before the next one"
                );
                Some(self.finish(prev))
            }
            _ => None,
        }
    }

    fn on_fragment(&mut self, stats: &Stats) {
        match self.current.as_mut() {
            Some(snapshot) if snapshot.timestamp() == stats.timestamp => {
                let rejected = snapshot.merge(stats);
                if rejected > 0 {
                    warn!(
                        timestamp = stats.timestamp,
                        rejected, "Discarded invalid distributions"
                    );
                }
            }
            current => {
                self.late_fragments += 1;
                warn!(
                    timestamp = stats.timestamp,
                    open = ?current.map(|s| s.timestamp()),
                    "Discarding fragment for a timestamp that is not open"
                );
            }
        }
    }

    fn on_complete(&mut self, ts: i64) -> Option<TimestampedStats> {
        if self.open_timestamp() != Some(ts) {
            debug!(timestamp = ts, "Completion for a snapshot that is not open");
            return None;
        }
        let snapshot = self.current.take()?;
        Some(self.finish(snapshot))
    }

    /// Close out whatever is still open. Empty snapshots are dropped.
    pub fn flush(&mut self) -> Option<TimestampedStats> {
        let snapshot = self.current.take()?;
        if snapshot.is_empty() {
            return None;
        }
        Some(self.finish(snapshot))
    }

    fn finish(&mut self, snapshot: TimestampedStats) -> TimestampedStats {
        for key in snapshot.counters().keys() {
            self.shapes.insert(key.clone(), MetricShape::Counter);
        }
        for key in snapshot.dists().keys() {
            self.shapes.insert(key.clone(), MetricShape::Distribution);
        }
        snapshot
    }
}

/// Messages that can be sent to the AggregatorActor
#[derive(Debug)]
pub enum AggregatorMessage {
    Event(AggregatorEvent),

    /// Shapes of every metric emitted so far
    Shapes {
        response: oneshot::Sender<MetricShapes>,
    },

    /// Number of fragments discarded as late
    LateFragments {
        response: oneshot::Sender<u64>,
    },

    /// Flush the open snapshot and stop
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Handle for communicating with the AggregatorActor
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<AggregatorMessage>,
}

impl AggregatorHandle {
    pub fn new(tx: mpsc::UnboundedSender<AggregatorMessage>) -> Self {
        AggregatorHandle { tx }
    }

    #[inline]
    pub fn new_timestamp(&self, ts: i64) {
        let _ = self
            .tx
            .send(AggregatorMessage::Event(AggregatorEvent::NewTimestamp(ts)));
    }

    #[inline]
    pub fn fragment(&self, stats: Stats) {
        if !stats.is_empty() {
            let _ = self
                .tx
                .send(AggregatorMessage::Event(AggregatorEvent::Fragment(stats)));
        }
    }

    #[inline]
    pub fn complete(&self, ts: i64) {
        let _ = self
            .tx
            .send(AggregatorMessage::Event(AggregatorEvent::Complete(ts)));
    }

    pub async fn shapes(&self) -> MetricShapes {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(AggregatorMessage::Shapes { response: tx }).is_err() {
            return MetricShapes::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn late_fragments(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(AggregatorMessage::LateFragments { response: tx })
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Graceful shutdown
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(AggregatorMessage::Shutdown { response: tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// The AggregatorActor owns the Aggregator exclusively
pub struct AggregatorActor {
    aggregator: Aggregator,
    rx: mpsc::UnboundedReceiver<AggregatorMessage>,
    output: mpsc::UnboundedSender<Arc<TimestampedStats>>,
}

impl AggregatorActor {
    /// Spawn the actor. Finished snapshots go to `output`.
    pub fn spawn(output: mpsc::UnboundedSender<Arc<TimestampedStats>>) -> AggregatorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = AggregatorActor {
            aggregator: Aggregator::new(),
            rx,
            output,
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        AggregatorHandle::new(tx)
    }

    fn emit(&self, snapshot: TimestampedStats) {
        info!(
            timestamp = snapshot.timestamp(),
            counters = snapshot.counters().len(),
            dists = snapshot.dists().len(),
            "Snapshot complete"
        );
        if self.output.send(Arc::new(snapshot)).is_err() {
            debug!("Snapshot output closed");
        }
    }

    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                AggregatorMessage::Event(event) => {
                    if let Some(snapshot) = self.aggregator.apply(event) {
                        self.emit(snapshot);
                    }
                }

                AggregatorMessage::Shapes { response } => {
                    let _ = response.send(self.aggregator.shapes().clone());
                }

                AggregatorMessage::LateFragments { response } => {
                    let _ = response.send(self.aggregator.late_fragments());
                }

                AggregatorMessage::Shutdown { response } => {
                    if let Some(snapshot) = self.aggregator.flush() {
                        self.emit(snapshot);
                    }
                    let _ = response.send(());
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{StatDist, StatValue};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn count(ts: i64, name: &str, n: f64) -> AggregatorEvent {
        AggregatorEvent::Fragment(Stats::count(ts, name, n))
    }

    #[test]
    fn test_fragments_merge_until_complete() {
        let mut agg = Aggregator::new();
        assert!(agg.apply(AggregatorEvent::NewTimestamp(1000)).is_none());
        assert!(agg.apply(count(1000, "foo", 1.0)).is_none());
        assert!(agg.apply(count(1000, "foo", 2.0)).is_none());

        let snapshot = agg.apply(AggregatorEvent::Complete(1000)).unwrap();
        assert_eq!(snapshot.timestamp(), 1000);
        assert_eq!(snapshot.counter("foo"), Some(3.0));
        assert_eq!(agg.open_timestamp(), None);
    }

    #[test]
    fn test_complete_is_exactly_once() {
        let mut agg = Aggregator::new();
        agg.apply(AggregatorEvent::NewTimestamp(1000));
        agg.apply(count(1000, "foo", 1.0));

        assert!(agg.apply(AggregatorEvent::Complete(1000)).is_some());
        assert!(agg.apply(AggregatorEvent::Complete(1000)).is_none());
    }

    #[test]
    fn test_complete_for_unknown_timestamp_is_noop() {
        let mut agg = Aggregator::new();
        agg.apply(AggregatorEvent::NewTimestamp(1000));
        assert!(agg.apply(AggregatorEvent::Complete(990)).is_none());
        assert_eq!(agg.open_timestamp(), Some(1000));
    }

    #[test]
    fn test_late_fragment_discarded() {
        let mut agg = Aggregator::new();
        agg.apply(AggregatorEvent::NewTimestamp(1000));
        agg.apply(AggregatorEvent::Complete(1000));
        agg.apply(AggregatorEvent::NewTimestamp(1010));

        agg.apply(count(1000, "foo", 5.0));
        assert_eq!(agg.late_fragments(), 1);

        agg.apply(count(1010, "bar", 1.0));
        let snapshot = agg.apply(AggregatorEvent::Complete(1010)).unwrap();
        assert_eq!(snapshot.counter("foo"), None);
        assert_eq!(snapshot.counter("bar"), Some(1.0));
    }

    #[test]
    fn test_fragment_with_nothing_open_is_late() {
        let mut agg = Aggregator::new();
        agg.apply(count(1000, "foo", 1.0));
        assert_eq!(agg.late_fragments(), 1);
        assert_eq!(agg.open_timestamp(), None);
    }

    #[test]
    fn test_new_timestamp_flushes_unfinished_snapshot() {
        let mut agg = Aggregator::new();
        agg.apply(AggregatorEvent::NewTimestamp(1000));
        agg.apply(count(1000, "foo", 1.0));

        let flushed = agg.apply(AggregatorEvent::NewTimestamp(1010)).unwrap();
        assert_eq!(flushed.timestamp(), 1000);
        assert_eq!(agg.open_timestamp(), Some(1010));

        // the flushed one is gone for good
        assert!(agg.apply(AggregatorEvent::Complete(1000)).is_none());
    }

    #[test]
    fn test_new_timestamp_drops_empty_snapshot() {
        let mut agg = Aggregator::new();
        agg.apply(AggregatorEvent::NewTimestamp(1000));
        assert!(agg.apply(AggregatorEvent::NewTimestamp(1010)).is_none());
        assert_eq!(agg.open_timestamp(), Some(1010));
    }

    #[test]
    fn test_repeated_new_timestamp_keeps_data() {
        let mut agg = Aggregator::new();
        agg.apply(AggregatorEvent::NewTimestamp(1000));
        agg.apply(count(1000, "foo", 1.0));
        assert!(agg.apply(AggregatorEvent::NewTimestamp(1000)).is_none());

        let snapshot = agg.apply(AggregatorEvent::Complete(1000)).unwrap();
        assert_eq!(snapshot.counter("foo"), Some(1.0));
    }

    #[test]
    fn test_shapes_follow_emitted_snapshots() {
        let mut agg = Aggregator::new();
        agg.apply(AggregatorEvent::NewTimestamp(1000));
        agg.apply(count(1000, "requests", 1.0));
        agg.apply(AggregatorEvent::Fragment(Stats::value(1000, "latency", 3.0)));
        assert!(agg.shapes().is_empty());

        agg.apply(AggregatorEvent::Complete(1000));
        assert_eq!(
            agg.shapes().get("requests").copied(),
            Some(MetricShape::Counter)
        );
        assert_eq!(
            agg.shapes().get("latency").copied(),
            Some(MetricShape::Distribution)
        );
    }

    #[test]
    fn test_flush_skips_empty() {
        let mut agg = Aggregator::new();
        agg.apply(AggregatorEvent::NewTimestamp(1000));
        assert!(agg.flush().is_none());

        agg.apply(AggregatorEvent::NewTimestamp(1010));
        agg.apply(count(1010, "foo", 1.0));
        assert_eq!(agg.flush().map(|s| s.timestamp()), Some(1010));
    }

    #[test]
    fn test_fragment_order_does_not_matter() {
        let mut fragments = Vec::new();
        for i in 0..40 {
            let v = (i as f64) * 1.5 - 7.0;
            fragments.push(Stats::value(1000, "v", v));
            fragments.push(Stats::count(1000, "c", i as f64));
            let mut d = Stats::new(1000);
            d.dists.push(StatDist::new("v", [2.0, v, v + 1.0, 2.0 * v + 1.0, v * v + (v + 1.0) * (v + 1.0)]));
            d.values.push(StatValue::new("w", v));
            fragments.push(d);
        }

        let run = |frags: &[Stats]| {
            let mut agg = Aggregator::new();
            agg.apply(AggregatorEvent::NewTimestamp(1000));
            for f in frags {
                agg.apply(AggregatorEvent::Fragment(f.clone()));
            }
            agg.apply(AggregatorEvent::Complete(1000)).unwrap()
        };

        let baseline = run(&fragments);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5 {
            fragments.shuffle(&mut rng);
            let shuffled = run(&fragments);

            assert_eq!(shuffled.counter("c"), baseline.counter("c"));
            for key in ["v", "w"] {
                let a = shuffled.dist(key).unwrap().to_array();
                let b = baseline.dist(key).unwrap().to_array();
                for (x, y) in a.iter().zip(b.iter()) {
                    assert!((x - y).abs() < 1e-6, "{key}: {x} vs {y}");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_actor_emits_snapshots() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = AggregatorActor::spawn(out_tx);

        handle.new_timestamp(1000);
        handle.fragment(Stats::count(1000, "foo", 1.0));
        handle.fragment(Stats::count(1000, "foo", 2.0));
        handle.complete(1000);

        let snapshot = out_rx.recv().await.unwrap();
        assert_eq!(snapshot.timestamp(), 1000);
        assert_eq!(snapshot.counter("foo"), Some(3.0));

        let shapes = handle.shapes().await;
        assert_eq!(shapes.get("foo").copied(), Some(MetricShape::Counter));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_actor_shutdown_flushes_open_snapshot() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = AggregatorActor::spawn(out_tx);

        handle.new_timestamp(1000);
        handle.fragment(Stats::count(1000, "foo", 1.0));
        handle.fragment(Stats::count(990, "late", 1.0));
        assert_eq!(handle.late_fragments().await, 1);

        handle.shutdown().await;
        assert_eq!(out_rx.recv().await.unwrap().timestamp(), 1000);
        assert!(out_rx.recv().await.is_none());

        // stopped actor answers with neutral values
        assert!(handle.shapes().await.is_empty());
    }
}
