//! team-sync binary entrypoint.
//! Loads the sync config, wires sources, orchestrator and scheduler, and serves
//! the control surface over Axum.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use team_sync::{
    config,
    metrics::Metrics,
    orchestrator::{SyncContext, SyncOrchestrator},
    repository::MemoryRepository,
    router,
    scheduler::SyncScheduler,
    upstream::build_sources,
};

const DEFAULT_BIND: &str = "0.0.0.0:8080";

/// Compact logs by default; `SYNC_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("team_sync=info,warn"));
    let json = std::env::var("SYNC_LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; API keys for sources usually live there.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = config::load_default().context("loading sync config")?;
    let metrics = Metrics::install()?;

    let sources = build_sources(&cfg).context("building upstream sources")?;
    let repo = Arc::new(MemoryRepository::new());
    let ctx = SyncContext::new();
    let enabled = cfg.scheduler.enabled;
    let orchestrator = SyncOrchestrator::new(ctx, cfg, sources, repo)
        .context("initialising sync orchestrator")?;
    let scheduler = SyncScheduler::new(Arc::new(orchestrator));
    if enabled {
        scheduler.start();
    }

    let bind = std::env::var("SYNC_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid SYNC_BIND '{bind}'"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "team-sync listening");

    let app = router(Arc::clone(&scheduler), Some(&metrics));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving control surface")?;

    scheduler.stop();
    Ok(())
}
