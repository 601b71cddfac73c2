//! Reporting client
//!
//! Applications record metrics into a [`Metrics`] registry at any time. When
//! the server sends `report_all`, the [`Client`] answers with one
//! `stats_complete` built from the whole registry under a single lock, so the
//! server never sees a half-updated state.
//!
//! Four kinds of metric are supported:
//!
//! - counts: the last reported value is sent
//! - rate counters: for monotonically growing values, the growth since the
//!   previous report is sent
//! - distributions: samples recorded since the previous report, sent
//!   pre-aggregated
//! - callbacks: evaluated at report time and sent as counts

use crate::metrics::{Distribution, StatKey};
use crate::production::{write_frame, SessionError};
use crate::protocol::{Message, ProtocolError, RegisterProcess, StaggerCodec, StatCount, StatDist, Stats};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connecting to {0} timed out")]
    ConnectTimeout(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

type Callback = Box<dyn Fn() -> f64 + Send>;

#[derive(Debug, Clone, Copy, Default)]
struct RateCounter {
    current: f64,
    reported: f64,
}

#[derive(Default)]
struct Registry {
    callbacks: BTreeMap<StatKey, Callback>,
    counts: BTreeMap<StatKey, f64>,
    rate_counters: BTreeMap<StatKey, RateCounter>,
    dists: BTreeMap<StatKey, Distribution>,
}

/// Thread-safe metric registry.
#[derive(Default)]
pub struct Metrics {
    registry: Mutex<Registry>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `callback` at every report and send the result as a count.
    pub fn register_callback<F>(&self, key: impl Into<StatKey>, callback: F)
    where
        F: Fn() -> f64 + Send + 'static,
    {
        self.registry
            .lock()
            .callbacks
            .insert(key.into(), Box::new(callback));
    }

    pub fn report_count(&self, key: impl Into<StatKey>, value: f64) {
        self.registry.lock().counts.insert(key.into(), value);
    }

    /// Set several counts at once.
    pub fn report_counts<K, I>(&self, counts: I)
    where
        K: Into<StatKey>,
        I: IntoIterator<Item = (K, f64)>,
    {
        let mut registry = self.registry.lock();
        for (key, value) in counts {
            registry.counts.insert(key.into(), value);
        }
    }

    /// Record the current value of a monotonically growing counter.
    pub fn report_rate_counter(&self, key: impl Into<StatKey>, value: f64) {
        self.registry
            .lock()
            .rate_counters
            .entry(key.into())
            .or_default()
            .current = value;
    }

    /// Add a sample to a distribution.
    pub fn report_distribution(&self, key: impl Into<StatKey>, value: f64) {
        let mut registry = self.registry.lock();
        match registry.dists.entry(key.into()) {
            std::collections::btree_map::Entry::Occupied(mut e) => e.get_mut().add_entry(value),
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(Distribution::from_value(value));
            }
        }
    }

    /// Add several samples, possibly to several distributions, at once.
    pub fn report_distributions<K, I, V>(&self, samples: I)
    where
        K: Into<StatKey>,
        I: IntoIterator<Item = (K, V)>,
        V: IntoIterator<Item = f64>,
    {
        let mut registry = self.registry.lock();
        for (key, values) in samples {
            let key = key.into();
            for value in values {
                match registry.dists.get_mut(&key) {
                    Some(d) => d.add_entry(value),
                    None => {
                        registry.dists.insert(key.clone(), Distribution::from_value(value));
                    }
                }
            }
        }
    }

    /// Build the report for `timestamp` and start the next reporting period.
    pub fn report(&self, timestamp: i64) -> Stats {
        let mut registry = self.registry.lock();
        let mut stats = Stats::new(timestamp);

        for (key, callback) in &registry.callbacks {
            stats.counts.push(StatCount::new(key.as_str(), callback()));
        }
        for (key, value) in &registry.counts {
            stats.counts.push(StatCount::new(key.as_str(), *value));
        }
        for (key, counter) in registry.rate_counters.iter_mut() {
            stats
                .counts
                .push(StatCount::new(key.as_str(), counter.current - counter.reported));
            counter.reported = counter.current;
        }
        for (key, dist) in std::mem::take(&mut registry.dists) {
            stats.dists.push(StatDist::new(key.as_str(), dist.to_array()));
        }
        stats
    }
}

/// `cmd` and `pid` tags identifying this process.
pub fn process_tags() -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    let cmd = std::env::args().next().unwrap_or_default();
    tags.insert("cmd".to_string(), cmd);
    tags.insert("pid".to_string(), std::process::id().to_string());
    tags
}

/// One connection to a stagger server.
pub struct Client<S> {
    framed: Framed<S, StaggerCodec>,
    metrics: Arc<Metrics>,
}

impl Client<TcpStream> {
    /// Dial the server and register with `tags`.
    pub async fn connect(
        addr: &str,
        tags: BTreeMap<String, String>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ClientError> {
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ClientError::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => return Err(ClientError::ConnectTimeout(addr.to_string())),
        };
        let _ = stream.set_nodelay(true);

        let mut client = Client::from_stream(stream, metrics);
        client.register(tags).await?;
        info!(addr, "Connected to stagger");
        Ok(client)
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established stream. Nothing is sent.
    pub fn from_stream(stream: S, metrics: Arc<Metrics>) -> Self {
        Client {
            framed: Framed::new(stream, StaggerCodec::default()),
            metrics,
        }
    }

    pub async fn register(&mut self, tags: BTreeMap<String, String>) -> Result<(), ClientError> {
        let msg = Message::RegisterProcess(RegisterProcess { tags });
        write_frame(&mut self.framed, msg, WRITE_TIMEOUT).await?;
        Ok(())
    }

    /// Answer pings and report requests until the server hangs up.
    pub async fn run(mut self) -> Result<(), ClientError> {
        while let Some(frame) = self.framed.next().await {
            let reply = match frame.map_err(SessionError::from)? {
                Message::Ping => Message::Pong,
                Message::Pong => continue,
                Message::ReportAll(request) => {
                    debug!(timestamp = request.timestamp, "Reporting");
                    Message::StatsComplete(self.metrics.report(request.timestamp))
                }
                other => {
                    let err = ProtocolError::UnexpectedMessage(other.method().as_str());
                    return Err(SessionError::from(err).into());
                }
            };
            write_frame(&mut self.framed, reply, WRITE_TIMEOUT).await?;
        }
        debug!("Server closed the connection");
        Ok(())
    }
}
