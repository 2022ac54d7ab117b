//! # Port-Relay Server
//!
//! Main entry point for the port-relay service.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use port_relay_core::{
    default_worker_count, distribute, Config, RelayInstance, RouteTable, Worker,
};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Load configuration
    let (config, config_path) = load_config()?;

    // Initialize logging
    let _log_guard = init_logging(&config.logging.level, config.logging.file.as_deref())?;

    info!("Starting port-relay v{}", env!("CARGO_PKG_VERSION"));
    match config_path {
        Some(path) => info!("Loaded configuration from {}", path),
        None => info!("No config file found, using defaults"),
    }

    let routes = load_routes(&config.server.routes)?;
    let bind_ip = config.server.bind_ip()?;

    let mut instances = Vec::with_capacity(routes.len());
    for route in routes.routes() {
        info!("Starting relay {} ({})", route, route.alias);
        match RelayInstance::from_route(route, bind_ip) {
            Ok(instance) => instances.push(instance),
            Err(e) => error!("Failed to start relay {}: {}", route, e),
        }
    }
    if instances.is_empty() {
        return Err(anyhow::anyhow!("No relay could be started"));
    }

    let workers = default_worker_count(instances.len());
    info!(
        "Port-relay is running {} relay(s) on {} worker(s)",
        instances.len(),
        workers
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(workers)
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    let pool = distribute(instances, workers);
    runtime.block_on(supervise(pool));

    // Relay workers only return on failure; don't wait for the rest.
    runtime.shutdown_background();
    info!("Port-relay shutting down");
    Ok(())
}

/// Run every worker on the blocking pool until all stop or Ctrl-C.
async fn supervise(pool: Vec<Worker>) {
    let mut running = JoinSet::new();
    for worker in pool {
        running.spawn_blocking(move || {
            let id = worker.id();
            worker.run();
            id
        });
    }

    loop {
        tokio::select! {
            joined = running.join_next() => match joined {
                Some(Ok(id)) => warn!("Worker {} stopped", id),
                Some(Err(e)) => error!("Worker failed: {}", e),
                None => {
                    error!("All relays have stopped");
                    return;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                return;
            }
        }
    }
}

/// Load configuration from file or use defaults.
/// Returns (Config, Option<config_path>)
fn load_config() -> Result<(Config, Option<String>)> {
    let config_paths = ["config.toml", "/etc/port-relay/config.toml"];

    for path in config_paths {
        if Path::new(path).exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path))?;
            let config = Config::from_toml(&content)
                .with_context(|| format!("Failed to parse config file: {}", path))?;
            return Ok((config, Some(path.to_string())));
        }
    }

    Ok((Config::default(), None))
}

/// Load the route file and report every rejected line.
fn load_routes(path: &Path) -> Result<RouteTable> {
    let routes = RouteTable::load(path)
        .with_context(|| format!("Failed to read route file: {}", path.display()))?;

    if !routes.diagnostics().is_empty() {
        warn!("Route file parsing results:");
        for diagnostic in routes.diagnostics() {
            warn!("{}", diagnostic);
        }
    }
    if routes.is_empty() {
        return Err(anyhow::anyhow!("No valid route in {}", path.display()));
    }

    info!("Loaded {} route(s) from {}", routes.len(), path.display());
    Ok(routes)
}

/// Initialize logging with the specified level, to stdout or to `file`.
fn init_logging(level: &str, file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let Some(file) = file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .init();
        return Ok(None);
    };

    let directory = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = file
        .file_name()
        .with_context(|| format!("Invalid log file path: {}", file.display()))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(false)
        .init();
    Ok(Some(guard))
}
