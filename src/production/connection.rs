//! Client session
//!
//! One task per connection. It reads frames, forwards metric data to the
//! aggregator and completions to the coordinator, drains the bounded outbound
//! queue, and keeps the connection alive with pings. When it ends, for any
//! reason, it tells the coordinator to drop the client.

use super::aggregator::AggregatorHandle;
use super::coordinator::CoordinatorHandle;
use super::survey::ClientId;
use crate::config::ServerConfig;
use crate::observability::spans;
use crate::protocol::{Message, ProtocolError, StaggerCodec, DEFAULT_MAX_FRAME_BYTES};
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no traffic for {0:?}")]
    IdleTimeout(Duration),

    #[error("write timed out")]
    WriteTimeout,

    #[error("send queue full")]
    SendQueueFull,

    #[error("session closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// The client identified itself with `register_process`
    Registered,
    Closed,
}

/// Per-session limits and keepalive timing.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub send_queue_capacity: usize,
    /// Ping the peer after this long without hearing from it
    pub ping_after: Duration,
    /// Give up on the peer after this long without hearing from it
    pub idle_deadline: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl SessionConfig {
    pub fn from_server(config: &ServerConfig) -> Self {
        SessionConfig {
            send_queue_capacity: config.send_queue_capacity,
            ping_after: config.ping_after(),
            idle_deadline: config.idle_deadline(),
            write_timeout: config.write_timeout(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            send_queue_capacity: 8,
            ping_after: Duration::from_secs(5),
            idle_deadline: Duration::from_secs(20),
            write_timeout: Duration::from_secs(1),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Cheap handle for queueing messages to a session and closing it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: ClientId,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    state: Arc<Mutex<SessionState>>,
}

impl SessionHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Queue a message without waiting. A full queue is an error, the caller
    /// is expected to drop the session rather than wait for it.
    pub fn send(&self, msg: Message) -> Result<(), SessionError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::SendQueueFull,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    /// Ask the session to close. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }
}

/// Write one frame, bounded by `deadline`.
pub(crate) async fn write_frame<W>(
    sink: &mut W,
    msg: Message,
    deadline: Duration,
) -> Result<(), SessionError>
where
    W: Sink<Message, Error = ProtocolError> + Unpin,
{
    match timeout(deadline, sink.send(msg)).await {
        Ok(result) => result.map_err(SessionError::from),
        Err(_) => Err(SessionError::WriteTimeout),
    }
}

/// `from + delay`, clamped to a year out instead of overflowing.
fn after(from: Instant, delay: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(365 * 86_400);
    from + delay.min(FAR_FUTURE)
}

pub struct Session<S> {
    id: ClientId,
    client_addr: String,
    framed: Framed<S, StaggerCodec>,
    outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    coordinator: CoordinatorHandle,
    aggregator: AggregatorHandle,
    config: SessionConfig,
    state: Arc<Mutex<SessionState>>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        id: ClientId,
        client_addr: String,
        stream: S,
        config: SessionConfig,
        coordinator: CoordinatorHandle,
        aggregator: AggregatorHandle,
    ) -> (Self, SessionHandle) {
        let (tx, outbound) = mpsc::channel(config.send_queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(SessionState::Connected));
        let handle = SessionHandle {
            id,
            tx,
            cancel: cancel.clone(),
            state: state.clone(),
        };
        let session = Session {
            id,
            client_addr,
            framed: Framed::new(stream, StaggerCodec::new(config.max_frame_bytes)),
            outbound,
            cancel,
            coordinator,
            aggregator,
            config,
            state,
        };
        (session, handle)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Serve the connection until it closes. `Ok` means an orderly close by
    /// either side.
    pub async fn run(self) -> Result<(), SessionError> {
        let span = spans::session_span(self.id.0, &self.client_addr);
        self.serve().instrument(span).await
    }

    async fn serve(self) -> Result<(), SessionError> {
        let Session {
            id,
            client_addr,
            framed,
            mut outbound,
            cancel,
            coordinator,
            aggregator,
            config,
            state,
        } = self;
        info!(client.address = %client_addr, "Client connected");

        let (mut sink, mut frames) = framed.split();
        let mut last_rx = Instant::now();
        let mut last_ping = last_rx;

        let result = loop {
            let ping_at = after(last_rx.max(last_ping), config.ping_after);
            let dead_at = after(last_rx, config.idle_deadline);

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Shutdown requested");
                    break Ok(());
                }

                frame = frames.next() => {
                    let msg = match frame {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => break Err(SessionError::Protocol(e)),
                        None => {
                            debug!("Peer closed the connection");
                            break Ok(());
                        }
                    };
                    last_rx = Instant::now();

                    match msg {
                        Message::Ping => {
                            if let Err(e) = write_frame(&mut sink, Message::Pong, config.write_timeout).await {
                                break Err(e);
                            }
                        }
                        Message::Pong => {}
                        Message::RegisterProcess(register) => {
                            *state.lock() = SessionState::Registered;
                            coordinator.set_tags(id, register.tags);
                        }
                        Message::StatsPartial(stats) => {
                            aggregator.fragment(stats);
                        }
                        Message::StatsComplete(stats) => {
                            let timestamp = stats.timestamp;
                            aggregator.fragment(stats);
                            coordinator.client_complete(id, timestamp);
                        }
                        Message::ReportAll(_) => {
                            break Err(ProtocolError::UnexpectedMessage("report_all").into());
                        }
                    }
                }

                out = outbound.recv() => {
                    let Some(msg) = out else {
                        break Ok(());
                    };
                    if let Err(e) = write_frame(&mut sink, msg, config.write_timeout).await {
                        break Err(e);
                    }
                }

                _ = sleep_until(ping_at) => {
                    last_ping = Instant::now();
                    if let Err(e) = write_frame(&mut sink, Message::Ping, config.write_timeout).await {
                        break Err(e);
                    }
                }

                _ = sleep_until(dead_at) => {
                    break Err(SessionError::IdleTimeout(config.idle_deadline));
                }
            }
        };

        let was = std::mem::replace(&mut *state.lock(), SessionState::Closed);
        debug!(state = ?was, "Session ending");
        cancel.cancel();
        outbound.close();
        let _ = timeout(config.write_timeout, sink.close()).await;

        match &result {
            Ok(()) => info!(client.address = %client_addr, "Session closed"),
            Err(e) => warn!(client.address = %client_addr, reason = %e, "Session closed"),
        }
        coordinator.remove(id);
        result
    }
}
