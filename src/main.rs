#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use clap::Parser;
use stagger::config::ServerConfig;
use stagger::observability::init_tracing;
use stagger::output::{OutputGroup, WriterSink};
use stagger::production::{AlignedTicker, StaggerServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Stagger metrics aggregation server
#[derive(Parser, Debug)]
#[command(name = "stagger", version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address clients connect to
    #[arg(long)]
    listen: Option<String>,

    /// Survey interval in seconds
    #[arg(long)]
    interval: Option<u64>,

    /// Survey timeout in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Do not write snapshots to stdout
    #[arg(long)]
    no_log_output: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    dump_config: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(listen) = self.listen {
            config = config.with_listen_addr(listen);
        }
        if let Some(interval) = self.interval {
            config = config.with_interval_secs(interval);
        }
        if let Some(timeout) = self.timeout {
            config = config.with_timeout_ms(timeout);
        }
        if self.log_json {
            config = config.with_json_logs(true);
        }
        if self.no_log_output {
            config = config.with_log_output(false);
        }
        Ok(config)
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let dump = args.dump_config;
    let config = args.into_config()?;

    if dump {
        print!("{}", toml::to_string(&config)?);
        return Ok(());
    }

    config.validate()?;
    init_tracing(&config.log).map_err(|e| e as Box<dyn std::error::Error>)?;

    let ticker = AlignedTicker::new(config.interval());
    let log_output = config.output.log_output;
    let sink_capacity = config.output.sink_queue_capacity;
    let (server, snapshots) = StaggerServer::bind(config, Box::new(ticker)).await?;

    let mut outputs = OutputGroup::new();
    if log_output {
        outputs.add(Arc::new(WriterSink::stdout(sink_capacity)));
    }
    let output_task = tokio::spawn(outputs.run(snapshots));

    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.run(shutdown.clone()));

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");
    shutdown.cancel();

    server_task.await?;
    output_task.await?;
    Ok(())
}
