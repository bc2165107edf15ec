use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use facilitator::config::Config;
use facilitator::events::SystemEventService;
use facilitator::hardware::{HardwareRecorder, HttpHardwareSource};
use facilitator::health::HealthChecker;
use facilitator::ingest::{HttpFeedSource, ReceiptIngestor};
use facilitator::logging;
use facilitator::metrics::MetricsCollector;
use facilitator::prometheus_metrics::PrometheusMetrics;
use facilitator::registry::{HttpRegistrySource, RegistrySource, SyncPolicy};
use facilitator::scheduler::Scheduler;
use facilitator::server::HealthServer;
use facilitator::store::{MemoryStore, Store};
use facilitator::sync::RegistrySync;
use facilitator::transport::{ChannelLayer, LocalChannelLayer};

#[derive(Parser)]
#[command(name = "facilitator", about = "Receipt ingestion and validator membership sync")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the periodic jobs and the health server.
    Run,
    /// Sync validators and miners from the registry once.
    Sync,
    /// Record the compute subnet's hardware once.
    Hardware,
    /// Ingest one miner's receipt feed once.
    Ingest {
        /// Miner hotkey the receipts must belong to.
        #[arg(long)]
        hotkey: String,
        #[arg(long)]
        ip: String,
        #[arg(long)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env()?;
    config.validate()?;
    logging::init(config.log_format(), &config.log_level)?;

    let metrics = Arc::new(MetricsCollector::new());
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let channels: Arc<dyn ChannelLayer> = Arc::new(LocalChannelLayer::new());
    let registry: Arc<dyn RegistrySource> =
        Arc::new(HttpRegistrySource::new(&config.registry_url, config.get_feed_timeout())?);
    let feed = Arc::new(HttpFeedSource::new(config.get_feed_timeout())?.with_max_body_bytes(config.max_feed_bytes));

    let sync = RegistrySync::new(Arc::clone(&store), channels).with_stale_after(config.get_channel_stale_after());
    let ingestor = ReceiptIngestor::new(Arc::clone(&store), feed)
        .with_cutoff_tolerance(config.get_receipts_cutoff_tolerance())
        .with_metrics(Arc::clone(&metrics));

    match cli.command {
        Command::Sync => {
            let policy = SyncPolicy::from_env()?;
            let report = sync.sync_from_registry(registry.as_ref(), &policy).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Hardware => {
            let url = config
                .hardware_specs_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("HARDWARE_SPECS_URL is not set"))?;
            let source = HttpHardwareSource::new(url, config.get_feed_timeout())?;
            let report = HardwareRecorder::new(Arc::clone(&store), Arc::new(source)).record().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Ingest { hotkey, ip, port } => {
            let report = ingestor.ingest(&hotkey, &ip, port).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Run => {
            let prometheus = Arc::new(PrometheusMetrics::new());
            if config.metrics_enabled {
                let checker = HealthChecker::new(Arc::clone(&metrics), config.clone())
                    .with_prometheus(Arc::clone(&prometheus));
                let events = SystemEventService::new(Arc::clone(&store));
                let server = HealthServer::new(Arc::new(checker), config.health_port).with_events(Arc::new(events));
                tokio::spawn(async move {
                    if let Err(e) = server.start().await {
                        error!(error = %e, "health server stopped");
                    }
                });
            }

            let mut scheduler = Scheduler::new(registry, sync, Arc::new(ingestor), metrics, &config)
                .with_prometheus(prometheus);
            if let Some(url) = &config.hardware_specs_url {
                let source = HttpHardwareSource::new(url, config.get_feed_timeout())?;
                let recorder = HardwareRecorder::new(Arc::clone(&store), Arc::new(source));
                scheduler = scheduler.with_hardware(Arc::new(recorder));
            }
            scheduler
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!(error = %e, "cannot listen for shutdown signal");
                    }
                })
                .await;
            info!("facilitator stopped");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ingest_requires_peer_address() {
        assert!(Cli::try_parse_from(["facilitator", "ingest", "--hotkey", "5X"]).is_err());
        let cli = Cli::try_parse_from(["facilitator", "ingest", "--hotkey", "5X", "--ip", "1.2.3.4", "--port", "8000"])
            .unwrap();
        assert!(matches!(cli.command, Command::Ingest { port: 8000, .. }));
    }
}
