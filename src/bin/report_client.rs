//! Connects to a stagger server and reports synthetic metrics, reconnecting
//! whenever the connection drops.

use clap::Parser;
use rand::Rng;
use stagger::client::{process_tags, Client, Metrics};
use stagger::config::LogConfig;
use stagger::observability::init_tracing;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Stagger test client
#[derive(Parser, Debug)]
#[command(name = "report-client", version, about)]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:5865")]
    addr: String,

    /// How often synthetic samples are recorded, in milliseconds
    #[arg(long, default_value_t = 100)]
    sample_ms: u64,

    /// Metric name prefix
    #[arg(long, default_value = "test")]
    prefix: String,
}

fn spawn_sampler(metrics: Arc<Metrics>, prefix: String, every: Duration) {
    let requests = Arc::new(AtomicU64::new(0));
    let live = requests.clone();
    metrics.register_callback(format!("{prefix}.uptime_samples"), move || {
        live.load(Ordering::Relaxed) as f64
    });

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            let (latency, queue, batch) = {
                let mut rng = rand::thread_rng();
                (
                    rng.gen_range(1.0..250.0),
                    rng.gen_range(0..64) as f64,
                    rng.gen_range(1..20),
                )
            };
            let total = requests.fetch_add(batch, Ordering::Relaxed) + batch;

            metrics.report_distribution(format!("{prefix}.latency_ms"), latency);
            metrics.report_count(format!("{prefix}.queue_depth"), queue);
            metrics.report_rate_counter(format!("{prefix}.requests"), total as f64);
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(&LogConfig::default()).map_err(|e| e as Box<dyn std::error::Error>)?;

    let metrics = Arc::new(Metrics::new());
    spawn_sampler(
        metrics.clone(),
        args.prefix.clone(),
        Duration::from_millis(args.sample_ms.max(1)),
    );

    // A wrong address should fail fast rather than retry forever.
    let mut client = Client::connect(&args.addr, process_tags(), metrics.clone()).await?;
    loop {
        match client.run().await {
            Ok(()) => info!("Server closed the connection"),
            Err(e) => warn!(error = %e, "Lost connection to stagger"),
        }

        client = loop {
            match Client::connect(&args.addr, process_tags(), metrics.clone()).await {
                Ok(c) => break c,
                Err(e) => {
                    warn!(error = %e, "Failed to reconnect to stagger");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };
    }
}
