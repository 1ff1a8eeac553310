//! FCR daemon.
//!
//! Wires the command-runner core together: vendor profiles, the device
//! inventory refresher, the session registry with its idle sweeper, and the
//! dispatcher the RPC transport binds to. Handles SIGTERM/SIGINT with a
//! drain-then-force-close shutdown.
//!
//! ```bash
//! fcrd --device-vendors vendors.json --device-db devices.json
//! RUST_LOG=fcr=debug fcrd --lb-threshold 50
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use fcr::config::ServiceConfig;
use fcr::counters::Counters;
use fcr::device::db::{DeviceDb, DeviceSource, JsonFileSource, StaticDeviceSource};
use fcr::dispatch::Dispatcher;
use fcr::session::registry::SessionRegistry;
use fcr::transport::SshTransportFactory;
use fcr::vendor::VendorRegistry;

/// How often the idle sweeper runs.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Fleet command runner daemon
#[derive(Parser, Debug)]
#[command(name = "fcrd", version, about)]
struct Args {
    /// TCP port for the RPC transport
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Device count above which bulk_run shards to peer instances
    #[arg(long, default_value_t = 100)]
    lb_threshold: usize,

    /// Seconds subtracted from forwarded bulk timeouts
    #[arg(long, default_value_t = 20)]
    remote_call_overhead: u64,

    /// Max seconds to wait for sessions to drain on shutdown
    #[arg(long, default_value_t = 300)]
    exit_max_wait: u64,

    /// Device inventory refresh interval, seconds
    #[arg(long, default_value_t = 1800)]
    device_db_update_interval: u64,

    /// Restrict the inventory to hostnames containing this string
    #[arg(long)]
    device_name_filter: Option<String>,

    /// Bound on the blocking-call worker pool
    #[arg(long, default_value_t = 4)]
    max_default_executor_threads: usize,

    /// Default log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Session count above which bulk_run_local sheds load
    #[arg(long, default_value_t = 200)]
    bulk_session_limit: usize,

    /// JSON vendor profile document merged over the builtins
    #[arg(long)]
    device_vendors: Option<String>,

    /// JSON device inventory file
    #[arg(long)]
    device_db: Option<String>,
}

impl Args {
    fn into_config(self) -> (ServiceConfig, Option<String>) {
        let config = ServiceConfig {
            port: self.port,
            lb_threshold: self.lb_threshold,
            remote_call_overhead: self.remote_call_overhead,
            exit_max_wait: self.exit_max_wait,
            device_db_update_interval: self.device_db_update_interval,
            device_name_filter: self.device_name_filter,
            max_default_executor_threads: self.max_default_executor_threads,
            log_level: self.log_level,
            bulk_session_limit: self.bulk_session_limit,
            device_vendors: self.device_vendors,
            ..ServiceConfig::default()
        };
        (config, self.device_db)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (config, device_db_path) = Args::parse().into_config();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.clone()),
    )
    .init();

    // Blocking work (inventory fetches) runs on a bounded pool; everything
    // else is non-blocking on the event loop.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.max_default_executor_threads)
        .build()?;

    runtime.block_on(run(config, device_db_path))
}

async fn run(
    config: ServiceConfig,
    device_db_path: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("fcrd starting on port {}", config.port);

    let vendors = match &config.device_vendors {
        Some(path) => {
            let json = tokio::fs::read_to_string(path).await?;
            info!("loaded vendor config from {path}");
            Arc::new(VendorRegistry::with_config(&json)?)
        }
        None => Arc::new(VendorRegistry::builtin()?),
    };

    let source: Arc<dyn DeviceSource> = match device_db_path {
        Some(path) => Arc::new(JsonFileSource::new(path)),
        None => Arc::new(StaticDeviceSource::new(Vec::new())),
    };
    let device_db = Arc::new(DeviceDb::new(source, config.device_name_filter.clone()));
    if let Err(e) = device_db.refresh().await {
        error!("initial device db fetch failed: {e}");
    }
    let refresher = device_db.spawn_refresher(config.device_db_update_interval());

    let counters = Arc::new(Counters::new());
    let registry = Arc::new(SessionRegistry::new(counters.clone()));
    let sweeper = registry.spawn_idle_sweeper(IDLE_SWEEP_INTERVAL);

    let dispatcher = Arc::new(Dispatcher::new(
        vendors,
        device_db,
        registry.clone(),
        counters,
        Arc::new(SshTransportFactory),
        config.clone(),
    ));

    // The RPC transport is deployment-specific; it binds `dispatcher` to
    // the configured port. The core stays up until a shutdown signal.
    info!("dispatcher ready on port {}", config.port);

    wait_for_shutdown_signal().await?;

    info!("shutdown signal received");
    refresher.abort();
    sweeper.abort();
    registry.shutdown(config.exit_max_wait()).await;
    drop(dispatcher);

    info!("fcrd stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}
