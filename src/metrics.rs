use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "sync_runs_total",
            "Finished sync runs by resource class and status."
        );
        describe_counter!(
            "sync_entities_total",
            "Entities handled by sync runs, by class and outcome (updated/failed/skipped)."
        );
        describe_counter!(
            "sync_rate_limited_total",
            "Upstream calls retried after a rate-limit rejection."
        );
        describe_counter!(
            "sync_ticks_skipped_total",
            "Scheduler ticks skipped because the previous pass was still running."
        );
        describe_counter!(
            "sync_records_rejected_total",
            "Upstream records rejected at ingestion, by source."
        );
        describe_histogram!("sync_run_duration_ms", "Sync run wall time in milliseconds.");
        describe_histogram!(
            "rate_limiter_wait_ms",
            "Time callers waited for an endpoint budget slot, in milliseconds."
        );
        describe_gauge!("sync_last_run_ts", "Unix ts when a class last finished a run.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder. Only one recorder can exist per process.
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// `/metrics` in the Prometheus text format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route("/metrics", get(move || std::future::ready(handle.render())))
    }
}
