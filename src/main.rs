pub mod models {
    pub mod payload;
}

pub mod cli;
pub mod config;
pub mod db {
    pub mod models;
}
pub mod schema;
pub mod services {
    pub mod commands;
    pub mod fake_data;
    pub mod ingest;
    pub mod realtime;
    pub mod retention;
    pub mod stats;
    pub mod topic;
}
pub mod store;
pub mod transport;

use crate::cli::{Invocation, Mode};
use crate::config::Config;
use crate::services::commands::CommandPublisher;
use crate::services::ingest::Reconciler;
use crate::services::realtime::Broadcaster;
use crate::services::stats::IngestStats;
use crate::services::{fake_data, retention};
use crate::store::pg::PgStore;
use crate::store::{Store, StoreError};
use crate::transport::{LineTransport, WorkerPool};
use chrono::Utc;
use log::{error, info};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
    applied: usize,
}

fn load_env(explicit: Option<&PathBuf>) -> Result<Option<LoadedEnvFile>, String> {
    let (path, explicit) = match explicit {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("env file not found: {}", path.display()));
            }
            (path.clone(), true)
        }
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let path = cwd.join(".env");
            if !path.is_file() {
                return Ok(None);
            }
            (path, false)
        }
    };
    let applied = config::load_env_file(&path)?;
    Ok(Some(LoadedEnvFile {
        path,
        explicit,
        applied,
    }))
}

pub fn run(invocation: Invocation) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (namespace={}, workers={}, pool={}, db_timeout={}ms, retention={}d, stale_after={})",
        cfg.namespace,
        cfg.workers,
        cfg.pool_size,
        cfg.db_timeout.as_millis(),
        cfg.retention_days,
        cfg.stale_after
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "-".to_string())
    );

    // 2) Connect DB and apply pending migrations
    let store = Arc::new(
        PgStore::connect(&cfg.database_url, cfg.pool_size, cfg.db_timeout)
            .map_err(|e| format!("DB connection failed: {}", e))?,
    );
    info!("Connected to database");
    store.apply_migrations()?;

    let stats = Arc::new(IngestStats::default());
    let broadcaster = Arc::new(Broadcaster::new(cfg.broadcast_queue));
    let reconciler = Arc::new(Reconciler::new(store.clone(), broadcaster, stats.clone()));

    // 3) Dispatch
    match invocation.mode {
        Mode::Ingest => {
            info!("Reading `<topic> <payload>` lines from stdin");
            let pool = WorkerPool::start(reconciler, cfg.workers)?;
            let pumped = transport::pump_lines(io::stdin().lock(), &pool, cfg.stats_every, |_| {
                info!("Ingest stats: {}", stats.snapshot())
            });
            // Drain whatever is already queued even when reading failed.
            pool.shutdown()?;
            let dispatched = pumped?;
            info!("Input closed after {} message(s); final stats: {}", dispatched, stats.snapshot());
        }
        Mode::Prune { days } => {
            retention::run_once(
                &*store,
                Utc::now(),
                days.unwrap_or(cfg.retention_days),
                &cfg.retention,
            )?;
        }
        Mode::Expire => {
            let stale_after = cfg
                .stale_after
                .ok_or_else(|| "STALE_AFTER_SECS must be set to expire stale devices".to_string())?;
            let window = chrono::Duration::from_std(stale_after)
                .map_err(|e| format!("STALE_AFTER_SECS out of range: {}", e))?;
            reconciler
                .expire_stale(Utc::now() - window)
                .map_err(|e| format!("expire failed: {}", e))?;
        }
        Mode::Simulate { rounds } => {
            fake_data::run(&*reconciler, &cfg.namespace, rounds, fake_data::DEFAULT_SEED)?;
        }
        Mode::Command {
            gateway_code,
            command,
            params,
        } => {
            let gateway = store
                .transaction(|tx| tx.lookup_gateway_by_code(&gateway_code))
                .map_err(|e| format!("gateway lookup failed: {}", e))?
                .ok_or_else(|| format!("unknown gateway {}", gateway_code))?;
            let publisher = stdout_publisher(&cfg);
            publisher
                .publish_gateway_command(&gateway, &command, params)
                .map_err(|e| format!("publish failed: {}", e))?;
        }
        Mode::Configure { gateway_code, node_id } => {
            let (gateway, node) = store
                .transaction(|tx| {
                    let Some(gateway) = tx.lookup_gateway_by_code(&gateway_code)? else {
                        return Err(StoreError::NotFound(format!("gateway {}", gateway_code)));
                    };
                    let node = tx
                        .find_node(gateway.id, node_id)?
                        .ok_or_else(|| StoreError::NotFound(format!("node {} on gateway {}", node_id, gateway_code)))?;
                    Ok((gateway, node))
                })
                .map_err(|e| format!("node lookup failed: {}", e))?;
            let publisher = stdout_publisher(&cfg);
            publisher
                .publish_node_config(&gateway, &node)
                .map_err(|e| format!("publish failed: {}", e))?;
        }
    }

    Ok(())
}

fn stdout_publisher(cfg: &Config) -> CommandPublisher<LineTransport<io::Stdout>> {
    let transport = LineTransport::new(io::stdout());
    transport.connect();
    CommandPublisher::new(transport, cfg.namespace.clone())
}

fn main() {
    let invocation = match cli::parse_args(std::env::args().skip(1)) {
        Ok(invocation) => invocation,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(2);
        }
    };
    let loaded_env = match load_env(invocation.env_file.as_ref()) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!(
            "Environment loaded from {} .env file: {} ({} variable(s) applied)",
            origin,
            info.path.display(),
            info.applied
        );
    }

    info!(
        "apru40-ingest {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(invocation) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
