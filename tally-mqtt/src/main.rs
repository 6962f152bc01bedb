//! MQTT topic frequency counter daemon.
//!
//! Subscribes to the configured topic filters, counts messages per topic and
//! exports the counts and charts on the configured cadences. On shutdown the
//! lifetime counts and all charts are written one last time.

mod signals;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tally::config::{Settings, first_non_empty};
use tally::counter::Outputs;
use tally::error::ConfigError;
use tally::registry::CounterRegistry;
use tally::schedule::Scheduler;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::signals::SnapshotRequests;
use crate::transport::{BrokerOptions, Transport};

/// tally-mqtt: count MQTT messages per topic.
#[derive(Parser)]
#[command(name = "tally-mqtt", version, about)]
struct Cli {
    /// Path to the settings file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL, e.g. mqtt://broker.lan:1883. Overrides the settings file.
    #[arg(long, default_value = "")]
    url: String,

    /// Broker user. Overrides the settings file.
    #[arg(long, default_value = "")]
    user: String,

    /// Broker password. Overrides the settings file.
    #[arg(long, default_value = "")]
    passwd: String,

    /// Output directory for statistics and charts. Overrides the settings file.
    #[arg(long, default_value = "")]
    path: String,

    /// Export statistics and charts of all counters on SIGUSR1.
    #[arg(long)]
    graph: bool,

    /// Export the charts of all counters every MINUTES. Implies --graph.
    #[arg(long, value_name = "MINUTES")]
    grm: Option<u64>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        tracing::error!("tally-mqtt failed: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load_or_default(cli.config.as_deref())?;
    let url = first_non_empty(&cli.url, &settings.url)
        .ok_or(ConfigError::MissingSetting { field: "url" })?;
    let broker = BrokerOptions {
        url: url.to_string(),
        user: first_non_empty(&cli.user, &settings.user)
            .unwrap_or_default()
            .to_string(),
        password: first_non_empty(&cli.passwd, &settings.password)
            .unwrap_or_default()
            .to_string(),
        client_id: settings.client_id.clone(),
    };
    let output_dir = first_non_empty(&cli.path, &settings.path).unwrap_or_default();
    let timeout = settings.export_timeout();

    let outputs = Outputs::directory(output_dir);
    let registry = Arc::new(CounterRegistry::from_topics(&settings.topics, &outputs));
    if registry.is_empty() {
        tracing::warn!("no counters configured");
    }

    let scheduler = Scheduler::new(timeout);
    let jobs = registry.schedule_all(&scheduler)?;
    tracing::info!(jobs, "counter jobs scheduled");

    if let Some(minutes) = cli.grm {
        let period = Duration::from_secs(minutes.max(1) * 60);
        let charts = Arc::clone(&registry);
        scheduler.schedule_every("all charts", period, move || {
            let charts = Arc::clone(&charts);
            async move {
                charts.export_all_charts_bounded(timeout).await;
            }
        })?;
    }
    let mut snapshots = SnapshotRequests::install(cli.graph || cli.grm.is_some())?;

    let cancel = CancellationToken::new();
    let transport = Transport::new(&broker, Arc::clone(&registry))?;
    let mut transport_task = tokio::spawn(transport.run(cancel.clone()));

    let shutdown = signals::shutdown_requested();
    tokio::pin!(shutdown);

    let finished = loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("shutdown requested");
                break None;
            }
            joined = &mut transport_task => break Some(joined),
            () = snapshots.recv() => {
                tracing::info!("snapshot requested");
                registry.snapshot_now(timeout).await;
            }
        }
    };

    scheduler.shutdown().await;
    let transport_result = match finished {
        Some(joined) => joined,
        None => {
            cancel.cancel();
            transport_task.await
        }
    };

    let mut failures = registry.flush_all_bounded(true, timeout).await;
    failures.extend(registry.export_all_charts_bounded(timeout).await);
    if failures.is_empty() {
        tracing::info!("final export written");
    } else {
        tracing::warn!(failures = failures.len(), "final export incomplete");
    }

    transport_result??;
    tracing::info!("stopped");
    Ok(())
}
