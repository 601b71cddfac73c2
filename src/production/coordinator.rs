//! Coordinator - Actor that owns the client registry and the open surveys
//!
//! Every tick the coordinator opens a survey, tells the aggregator a new
//! timestamp has started, asks every registered client to report, and arms a
//! timeout. A survey closes when its last outstanding client answers, when the
//! last outstanding client disconnects, or when the timeout fires, whichever
//! comes first. Closing is what tells the aggregator the snapshot is done, and
//! since a closed survey is gone from the book, it can only happen once.
//!
//! ```text
//!   ticker ──tick──▶ ┌──────────────────┐ ──new-ts / complete──▶ Aggregator
//!                    │   Coordinator    │
//! sessions ──msg──▶  │ (owns registry + │ ──report_all──▶ sessions
//! scheduler ─tmo──▶  │  survey book)    │
//!                    └──────────────────┘
//! ```

use super::aggregator::AggregatorHandle;
use super::connection::{SessionError, SessionHandle};
use super::survey::{ClientId, Completion, Survey, SurveyBook};
use crate::io::{Clock, Scheduler, SystemClock, Ticker, TokioScheduler};
use crate::observability::spans;
use crate::protocol::Stats;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Clients surveyed on a tick.
pub const CLIENTS_METRIC: &str = "stagger.clients";
/// Clients still outstanding when a survey timed out.
pub const TIMEOUTS_METRIC: &str = "stagger.timeouts";
/// Milliseconds from the tick to a client's `stats_complete`.
pub const SURVEY_LATENCY_METRIC: &str = "stagger.survey_latency";

/// More open surveys than this means clients are not keeping up.
const MAX_EXPECTED_IN_FLIGHT: usize = 2;

/// The coordinator's view of a connected client.
pub trait Peer: Send + 'static {
    /// Queue a `report_all` for `timestamp`. Must not block.
    fn request_stats(&self, timestamp: i64) -> Result<(), SessionError>;

    /// Ask the client's session to close.
    fn shutdown(&self);
}

impl Peer for SessionHandle {
    fn request_stats(&self, timestamp: i64) -> Result<(), SessionError> {
        self.send(crate::protocol::Message::report_all(timestamp))
    }

    fn shutdown(&self) {
        self.close();
    }
}

/// Timing knobs for the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// How long a survey waits for stragglers
    pub timeout: Duration,
    /// How long `shutdown` waits for sessions after broadcasting
    pub shutdown_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

/// Messages that can be sent to the CoordinatorActor
pub enum CoordinatorMessage<P = SessionHandle> {
    /// A session connected
    Register { id: ClientId, peer: P },

    /// The client sent `register_process`
    SetTags {
        id: ClientId,
        tags: BTreeMap<String, String>,
    },

    /// The session closed
    Remove { id: ClientId },

    /// Start a survey without waiting for the ticker
    Tick { timestamp: i64 },

    /// The client sent `stats_complete` for `timestamp`
    ClientComplete { id: ClientId, timestamp: i64 },

    /// A survey's timeout fired
    Timeout { timestamp: i64 },

    ClientCount {
        response: oneshot::Sender<usize>,
    },

    /// Broadcast shutdown to every session, wait out the grace period, stop
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Handle for communicating with the CoordinatorActor
pub struct CoordinatorHandle<P = SessionHandle> {
    tx: mpsc::UnboundedSender<CoordinatorMessage<P>>,
    next_id: Arc<AtomicU64>,
}

impl<P> Clone for CoordinatorHandle<P> {
    fn clone(&self) -> Self {
        CoordinatorHandle {
            tx: self.tx.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<P: Peer> CoordinatorHandle<P> {
    pub fn new(tx: mpsc::UnboundedSender<CoordinatorMessage<P>>) -> Self {
        CoordinatorHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Reserve a fresh client id. Ids start at 1 and are never reused.
    pub fn allocate_id(&self) -> ClientId {
        ClientId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn register(&self, id: ClientId, peer: P) {
        let _ = self.tx.send(CoordinatorMessage::Register { id, peer });
    }

    #[inline]
    pub fn set_tags(&self, id: ClientId, tags: BTreeMap<String, String>) {
        let _ = self.tx.send(CoordinatorMessage::SetTags { id, tags });
    }

    #[inline]
    pub fn remove(&self, id: ClientId) {
        let _ = self.tx.send(CoordinatorMessage::Remove { id });
    }

    #[inline]
    pub fn tick(&self, timestamp: i64) {
        let _ = self.tx.send(CoordinatorMessage::Tick { timestamp });
    }

    #[inline]
    pub fn client_complete(&self, id: ClientId, timestamp: i64) {
        let _ = self
            .tx
            .send(CoordinatorMessage::ClientComplete { id, timestamp });
    }

    pub async fn client_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(CoordinatorMessage::ClientCount { response: tx })
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Graceful shutdown
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(CoordinatorMessage::Shutdown { response: tx })
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

struct Client<P> {
    peer: P,
    tags: BTreeMap<String, String>,
}

/// Registry and survey state, driven one message at a time.
pub struct Coordinator<P> {
    clients: BTreeMap<ClientId, Client<P>>,
    surveys: SurveyBook,
    aggregator: AggregatorHandle,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    timeout: Duration,
    /// Route for timeout callbacks back into our own queue. Weak so the
    /// queue still closes once every handle is gone.
    inbox: mpsc::WeakUnboundedSender<CoordinatorMessage<P>>,
    /// Timeouts recorded since the last tick, reported on the next one.
    pending_timeouts: usize,
    /// Replaced sessions whose `Remove` is still on its way, per id.
    stale_removals: BTreeMap<ClientId, usize>,
}

impl<P: Peer> Coordinator<P> {
    pub fn new(
        aggregator: AggregatorHandle,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        timeout: Duration,
        inbox: mpsc::WeakUnboundedSender<CoordinatorMessage<P>>,
    ) -> Self {
        Coordinator {
            clients: BTreeMap::new(),
            surveys: SurveyBook::new(),
            aggregator,
            clock,
            scheduler,
            timeout,
            inbox,
            pending_timeouts: 0,
            stale_removals: BTreeMap::new(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn surveys_in_flight(&self) -> usize {
        self.surveys.in_flight()
    }

    pub fn tags(&self, id: ClientId) -> Option<&BTreeMap<String, String>> {
        self.clients.get(&id).map(|c| &c.tags)
    }

    /// Apply one message. `ClientCount` is answered here; `Shutdown` only
    /// broadcasts, waiting out the grace period is the caller's job.
    pub fn handle(&mut self, msg: CoordinatorMessage<P>) {
        match msg {
            CoordinatorMessage::Register { id, peer } => self.register_client(id, peer),
            CoordinatorMessage::SetTags { id, tags } => self.set_tags(id, tags),
            CoordinatorMessage::Remove { id } => self.session_closed(id),
            CoordinatorMessage::Tick { timestamp } => self.on_tick(timestamp),
            CoordinatorMessage::ClientComplete { id, timestamp } => {
                self.on_client_complete(id, timestamp)
            }
            CoordinatorMessage::Timeout { timestamp } => self.on_timeout(timestamp),
            CoordinatorMessage::ClientCount { response } => {
                let _ = response.send(self.client_count());
            }
            CoordinatorMessage::Shutdown { response } => {
                self.shutdown();
                let _ = response.send(());
            }
        }
    }

    pub fn register_client(&mut self, id: ClientId, peer: P) {
        let client = Client {
            peer,
            tags: BTreeMap::new(),
        };
        if let Some(old) = self.clients.insert(id, client) {
            warn!(client.id = %id, "Duplicate registration, replacing client");
            old.peer.shutdown();
            *self.stale_removals.entry(id).or_default() += 1;
        }
        info!(client.id = %id, clients = self.clients.len(), "Client added");
    }

    pub fn set_tags(&mut self, id: ClientId, tags: BTreeMap<String, String>) {
        let Some(client) = self.clients.get_mut(&id) else {
            debug!(client.id = %id, "Tags for unknown client");
            return;
        };
        if !client.tags.is_empty() {
            warn!(client.id = %id, "Client registered again, replacing tags");
        }
        info!(client.id = %id, tags = ?tags, "Client registered");
        client.tags = tags;
    }

    /// A session ended. The first removals after a replacement belong to the
    /// replaced sessions and leave the current client alone.
    pub fn session_closed(&mut self, id: ClientId) {
        if let Some(stale) = self.stale_removals.get_mut(&id) {
            *stale -= 1;
            if *stale == 0 {
                self.stale_removals.remove(&id);
            }
            debug!(client.id = %id, "Replaced session closed");
            return;
        }
        self.remove_client(id);
    }

    pub fn remove_client(&mut self, id: ClientId) {
        match self.clients.remove(&id) {
            Some(client) => {
                client.peer.shutdown();
                info!(client.id = %id, clients = self.clients.len(), "Client removed");
            }
            None => debug!(client.id = %id, "Remove for unknown client"),
        }

        for timestamp in self.surveys.remove_client(id) {
            debug!(timestamp, "Survey closed by disconnect");
            self.aggregator.complete(timestamp);
        }
    }

    pub fn on_tick(&mut self, timestamp: i64) {
        let _span = spans::survey_span(timestamp).entered();

        self.aggregator.new_timestamp(timestamp);
        if self.pending_timeouts > 0 {
            self.aggregator.fragment(Stats::count(
                timestamp,
                TIMEOUTS_METRIC,
                self.pending_timeouts as f64,
            ));
            self.pending_timeouts = 0;
        }

        if self.clients.is_empty() {
            debug!(timestamp, "No clients to survey");
            return;
        }

        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        if !self.surveys.open(Survey::new(timestamp, ids.iter().copied(), self.clock.now())) {
            warn!(timestamp, "Survey already open for timestamp");
            return;
        }
        if self.surveys.in_flight() > MAX_EXPECTED_IN_FLIGHT {
            warn!(
                in_flight = self.surveys.in_flight(),
                "Surveys piling up, clients are not reporting within the interval"
            );
        }

        self.aggregator
            .fragment(Stats::count(timestamp, CLIENTS_METRIC, ids.len() as f64));

        let failed: Vec<ClientId> = self
            .clients
            .iter()
            .filter_map(|(id, client)| match client.peer.request_stats(timestamp) {
                Ok(()) => None,
                Err(e) => {
                    warn!(client.id = %id, error = %e, "Failed to request stats, dropping client");
                    Some(*id)
                }
            })
            .collect();
        info!(timestamp, clients = ids.len(), failed = failed.len(), "Survey started");

        for id in failed {
            self.remove_client(id);
        }

        if self.surveys.get(timestamp).is_some() {
            let inbox = self.inbox.clone();
            self.scheduler.schedule(
                self.timeout,
                Box::new(move || {
                    if let Some(tx) = inbox.upgrade() {
                        let _ = tx.send(CoordinatorMessage::Timeout { timestamp });
                    }
                }),
            );
        }
    }

    pub fn on_client_complete(&mut self, id: ClientId, timestamp: i64) {
        match self.surveys.record_completion(id, timestamp, self.clock.now()) {
            Completion::NoSurvey => {
                debug!(client.id = %id, timestamp, "Completion for closed survey");
            }
            Completion::Duplicate => {
                debug!(client.id = %id, timestamp, "Duplicate completion");
            }
            Completion::Recorded { latency, closed } => {
                self.aggregator.fragment(Stats::value(
                    timestamp,
                    SURVEY_LATENCY_METRIC,
                    latency.as_millis() as f64,
                ));
                if closed {
                    debug!(timestamp, "Survey complete");
                    self.aggregator.complete(timestamp);
                }
            }
        }
    }

    pub fn on_timeout(&mut self, timestamp: i64) {
        let Some(survey) = self.surveys.close(timestamp) else {
            return;
        };
        warn!(
            timestamp,
            outstanding = survey.outstanding(),
            asked = survey.asked(),
            "Survey timed out"
        );
        self.pending_timeouts += survey.outstanding();
        self.aggregator.complete(timestamp);
    }

    /// Tell every session to close and forget them.
    pub fn shutdown(&mut self) {
        info!(clients = self.clients.len(), "Shutting down sessions");
        for client in self.clients.values() {
            client.peer.shutdown();
        }
        self.clients.clear();
    }
}

/// The CoordinatorActor owns the Coordinator exclusively
pub struct CoordinatorActor<P> {
    coordinator: Coordinator<P>,
    rx: mpsc::UnboundedReceiver<CoordinatorMessage<P>>,
    ticker: Box<dyn Ticker>,
    shutdown_grace: Duration,
}

impl<P: Peer> CoordinatorActor<P> {
    /// Spawn with the wall clock and tokio timers.
    pub fn spawn(
        config: CoordinatorConfig,
        aggregator: AggregatorHandle,
        ticker: Box<dyn Ticker>,
    ) -> CoordinatorHandle<P> {
        Self::spawn_with_time(
            config,
            aggregator,
            ticker,
            Arc::new(SystemClock),
            Arc::new(TokioScheduler),
        )
    }

    pub fn spawn_with_time(
        config: CoordinatorConfig,
        aggregator: AggregatorHandle,
        ticker: Box<dyn Ticker>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
    ) -> CoordinatorHandle<P> {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(aggregator, clock, scheduler, config.timeout, tx.downgrade());

        let actor = CoordinatorActor {
            coordinator,
            rx,
            ticker,
            shutdown_grace: config.shutdown_grace,
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        CoordinatorHandle::new(tx)
    }

    async fn run(self) {
        let CoordinatorActor {
            mut coordinator,
            mut rx,
            mut ticker,
            shutdown_grace,
        } = self;
        let mut ticking = true;

        loop {
            tokio::select! {
                tick = ticker.tick(), if ticking => match tick {
                    Some(timestamp) => coordinator.on_tick(timestamp),
                    None => {
                        info!("Ticker finished");
                        ticking = false;
                    }
                },

                msg = rx.recv() => match msg {
                    Some(CoordinatorMessage::Shutdown { response }) => {
                        coordinator.shutdown();
                        tokio::time::sleep(shutdown_grace).await;
                        let _ = response.send(());
                        break;
                    }
                    Some(msg) => coordinator.handle(msg),
                    None => break,
                },
            }
        }
        debug!("Coordinator stopped");
    }
}
