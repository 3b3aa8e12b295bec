use anyhow::Result;
use grid_peak_balancer::{config, controller, hardware, repo, telemetry};
use config::Config;
use controller::{Environment, LoggingMetricsSink, SiteController, SystemClock};
use hardware::LoggingCommandChannel;
use repo::{InMemoryStateStore, JsonFileStateStore, StateStore};
use std::sync::Arc;
use telemetry::init_tracing;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cfg = Config::load()?;
    init_tracing(&cfg.controller.log_filter)?;

    let timezone = cfg.controller.timezone()?;

    let store: Arc<dyn StateStore> = match &cfg.controller.state_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "persisting entity state to disk");
            Arc::new(JsonFileStateStore::new(dir.clone()))
        }
        None => {
            warn!("no state_dir configured, entity state is lost on restart");
            Arc::new(InMemoryStateStore::new())
        }
    };

    let env = Environment {
        clock: Arc::new(SystemClock),
        commands: Arc::new(LoggingCommandChannel),
        store,
        metrics: Arc::new(LoggingMetricsSink),
        timezone,
    };

    let mut site = SiteController::new(&cfg, env)?;
    site.restore().await;

    let cancel = CancellationToken::new();
    let handle = site.spawn(cancel.clone());
    info!(%timezone, "grid peak balancer running");

    let input = hardware::ingest::forward_json_lines(BufReader::new(tokio::io::stdin()), &handle);
    tokio::select! {
        result = input => match result {
            Ok(forwarded) => {
                // stdin closed: keep balancing on the last known readings
                info!(forwarded, "telemetry input closed");
                telemetry::shutdown_signal().await;
            }
            Err(e) => warn!(error = %e, "telemetry input failed"),
        },
        _ = telemetry::shutdown_signal() => {}
    }

    handle.shutdown().await;
    warn!("shutdown complete");
    Ok(())
}
