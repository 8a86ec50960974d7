pub mod handler;
pub mod headers;
pub mod origin;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tracing::info;

use crate::cache::{DiskCache, RamCache};
use crate::config::Config;
use crate::logging::RateLimitedLog;
use crate::revalidate::Revalidator;
use crate::stats::StatsCollector;
use origin::OriginClient;

/// Everything the request handler needs, passed explicitly instead of
/// living in globals.
pub struct AppContext {
    pub config: Arc<Config>,
    pub ram: Arc<RamCache>,
    pub disk: Arc<DiskCache>,
    pub origin: OriginClient,
    pub revalidator: Arc<Revalidator>,
    pub stats: Option<Arc<StatsCollector>>,
    pub overflow_log: Arc<RateLimitedLog>,
}

/// Every path goes through the one SWR handler; routing policy lives in the
/// rule engine, not the router.
pub fn router(app: Arc<AppContext>) -> Router {
    Router::new().fallback(handler::handle).with_state(app)
}

pub async fn serve(
    app: Arc<AppContext>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], app.config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    info!(address = %addr, origin = %app.origin.origin(), "wait0 listening");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")
}
