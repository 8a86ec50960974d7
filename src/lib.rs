pub mod cache;
pub mod cli;
pub mod config;
pub mod discover;
pub mod logging;
pub mod proxy;
pub mod revalidate;
pub mod rules;
pub mod stats;
pub mod util;
pub mod warmup;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{DiskCache, RamCache};
use crate::config::Config;
use crate::logging::RateLimitedLog;
use crate::proxy::AppContext;
use crate::proxy::origin::OriginClient;
use crate::revalidate::Revalidator;
use crate::stats::StatsCollector;

const OVERFLOW_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// The assembled proxy: both cache tiers, the origin client, the
/// revalidator, and all background tasks. Construction wires everything and
/// spawns the stats, warmup, and discovery loops; the HTTP side is exposed
/// as an axum router so tests can drive it without a listener.
pub struct Service {
    app: Arc<AppContext>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Service {
    /// Must be called from within a tokio runtime: background tasks and the
    /// disk writer are spawned here. Every start wipes the disk store so a
    /// restarted process presents an empty logical cache.
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let ram = Arc::new(RamCache::new(config.ram_max));
        let disk = Arc::new(DiskCache::open(&config.disk_path, config.disk_max, true)?);
        let origin = OriginClient::new(config.origin.clone())?;
        let overflow_log = Arc::new(RateLimitedLog::new(OVERFLOW_LOG_INTERVAL));
        let revalidator = Arc::new(Revalidator::new(
            origin.clone(),
            ram.clone(),
            disk.clone(),
            overflow_log.clone(),
        ));
        let stats = config
            .logging
            .log_stats_every
            .map(|_| Arc::new(StatsCollector::new()));

        let (stop, stop_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        if let (Some(every), Some(stats)) = (config.logging.log_stats_every, stats.clone()) {
            tasks.push(stats::spawn_stats_loop(
                every,
                ram.clone(),
                disk.clone(),
                stats,
                stop_rx.clone(),
            ));
        }

        for rule in config.rules.rules() {
            if rule.warmup.is_some() {
                tasks.push(warmup::spawn(
                    rule.clone(),
                    ram.clone(),
                    disk.clone(),
                    revalidator.clone(),
                    config.logging.log_warmup,
                    stop_rx.clone(),
                ));
            }
        }

        if let Some(discover_config) = config.discover.clone() {
            tasks.push(discover::spawn(
                discover_config,
                origin.clone(),
                config.clone(),
                ram.clone(),
                disk.clone(),
                stop_rx,
            ));
        }

        let app = Arc::new(AppContext {
            config,
            ram,
            disk,
            origin,
            revalidator,
            stats,
            overflow_log,
        });

        Ok(Self { app, stop, tasks })
    }

    pub fn context(&self) -> Arc<AppContext> {
        self.app.clone()
    }

    pub fn router(&self) -> axum::Router {
        proxy::router(self.app.clone())
    }

    /// Stops background tasks and drains the disk writer.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
        self.app.disk.close().await;
    }
}

/// Binds the listener, serves until SIGINT/SIGTERM, then shuts the service
/// down gracefully.
pub async fn run(config: Config) -> Result<()> {
    let service = Service::new(config)?;
    let app = service.context();

    proxy::serve(app, shutdown_signal()).await?;

    info!("shutting down");
    service.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
