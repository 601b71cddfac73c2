use super::aggregator::{AggregatorActor, AggregatorHandle};
use super::connection::{Session, SessionConfig};
use super::coordinator::{CoordinatorActor, CoordinatorConfig, CoordinatorHandle};
use crate::config::{ConfigError, ServerConfig};
use crate::io::Ticker;
use crate::metrics::TimestampedStats;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Receiving end of the finished snapshots.
pub type SnapshotReceiver = mpsc::UnboundedReceiver<Arc<TimestampedStats>>;

pub struct StaggerServer {
    listener: TcpListener,
    session_config: SessionConfig,
    coordinator: CoordinatorHandle,
    aggregator: AggregatorHandle,
}

impl StaggerServer {
    /// Bind the listener and start the aggregator and coordinator. Snapshots
    /// start flowing out of the returned receiver as surveys complete.
    pub async fn bind(
        config: ServerConfig,
        ticker: Box<dyn Ticker>,
    ) -> Result<(Self, SnapshotReceiver), ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let aggregator = AggregatorActor::spawn(output_tx);
        let coordinator = CoordinatorActor::spawn(
            CoordinatorConfig {
                timeout: config.timeout(),
                shutdown_grace: config.shutdown_grace(),
            },
            aggregator.clone(),
            ticker,
        );

        info!(
            addr = %config.listen_addr,
            interval_secs = config.interval_secs,
            timeout_ms = config.timeout_ms,
            "Stagger server listening"
        );

        let server = StaggerServer {
            listener,
            session_config: SessionConfig::from_server(&config),
            coordinator,
            aggregator,
        };
        Ok((server, output_rx))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    pub fn aggregator(&self) -> &AggregatorHandle {
        &self.aggregator
    }

    /// Accept clients until `shutdown` is cancelled, then close every session,
    /// wait out the grace period and flush the aggregator.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_session(stream, addr),
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }

        info!("Shutting down");
        drop(self.listener);
        self.coordinator.shutdown().await;
        self.aggregator.shutdown().await;
        info!("Shutdown complete");
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let id = self.coordinator.allocate_id();
        let (session, handle) = Session::new(
            id,
            addr.to_string(),
            stream,
            self.session_config,
            self.coordinator.clone(),
            self.aggregator.clone(),
        );
        self.coordinator.register(id, handle);

        tokio::spawn(async move {
            let _ = session.run().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ChannelTicker;

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let (_ticks, ticker) = ChannelTicker::new();
        let config = ServerConfig::default()
            .with_listen_addr("127.0.0.1:0")
            .with_timeout_ms(60_000);

        assert!(matches!(
            StaggerServer::bind(config, Box::new(ticker)).await,
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_error_names_address() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let (_ticks, ticker) = ChannelTicker::new();

        match StaggerServer::bind(ServerConfig::default().with_listen_addr(addr.clone()), Box::new(ticker)).await {
            Err(ServerError::Bind { addr: reported, .. }) => assert_eq!(reported, addr),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("bind to a taken port succeeded"),
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_ticks, ticker) = ChannelTicker::new();
        let config = ServerConfig::default()
            .with_listen_addr("127.0.0.1:0")
            .with_shutdown_grace_ms(10);
        let (server, mut snapshots) = StaggerServer::bind(config, Box::new(ticker)).await.unwrap();
        let coordinator = server.coordinator().clone();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));
        assert_eq!(coordinator.client_count().await, 0);

        shutdown.cancel();
        task.await.unwrap();
        // aggregator stopped, so the output channel closes
        assert!(snapshots.recv().await.is_none());
    }
}
