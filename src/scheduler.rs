// src/scheduler.rs
//! Operator control surface: periodic passes plus start/stop/restart/trigger.
//!
//! A pass runs the event cadence every tick, drains the results backlog when
//! it is non-empty, and runs riders once their interval has elapsed. A tick
//! that fires while the previous pass is still running is skipped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::lock::ResourceClass;
use crate::orchestrator::{RunOptions, RunStatus, SyncOrchestrator, SyncRunSummary};
use crate::rate_limiter::BudgetStatus;

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// Periodic loop active.
    pub enabled: bool,
    pub interval_minutes: u64,
    /// When the last scheduled pass started.
    pub last_run: Option<DateTime<Utc>>,
    /// Any class currently syncing (scheduled or manual).
    pub is_running: bool,
    /// A scheduled pass is in progress.
    pub pass_in_flight: bool,
    pub budgets: BTreeMap<String, BudgetStatus>,
    pub last_runs: BTreeMap<ResourceClass, SyncRunSummary>,
    pub tracked_events: usize,
    pub results_backlog: usize,
}

struct LoopHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    looping: Option<LoopHandle>,
    last_run: Option<DateTime<Utc>>,
    last_riders: Option<Instant>,
}

pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    state: Mutex<State>,
    pass_in_flight: AtomicBool,
}

/// Clears the in-flight flag on every exit path of a pass.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            state: Mutex::new(State::default()),
            pass_in_flight: AtomicBool::new(false),
        })
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("scheduler state mutex poisoned")
    }

    fn tick_period(&self) -> Duration {
        let minutes = self.orchestrator.config().scheduler.tick_minutes.max(1);
        Duration::from_secs(minutes * 60)
    }

    pub fn is_enabled(&self) -> bool {
        self.state()
            .looping
            .as_ref()
            .map(|l| !l.task.is_finished())
            .unwrap_or(false)
    }

    /// Start the periodic loop. Every Near event is forced onto the next
    /// tick's due list. Returns false if already started.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut st = self.state();
        if st.looping.as_ref().is_some_and(|l| !l.task.is_finished()) {
            return false;
        }
        let forced = self
            .orchestrator
            .context()
            .cadence
            .lock()
            .expect("cadence mutex poisoned")
            .force_near_resync();

        let period = self.tick_period();
        let (tx, mut rx) = watch::channel(false);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pass = Arc::clone(&this);
                        // Detached: stop() ends the loop, not the pass.
                        tokio::spawn(async move {
                            pass.tick_once().await;
                        });
                    }
                    _ = rx.changed() => break,
                }
            }
            tracing::info!(target: "scheduler", "scheduler loop stopped");
        });
        st.looping = Some(LoopHandle { shutdown: tx, task });
        tracing::info!(
            target: "scheduler",
            tick_secs = period.as_secs(),
            forced_near = forced,
            "scheduler started"
        );
        true
    }

    /// Stop future ticks. A pass already running finishes on its own.
    pub fn stop(&self) -> bool {
        match self.state().looping.take() {
            Some(l) => {
                let _ = l.shutdown.send(true);
                tracing::info!(target: "scheduler", "scheduler stop requested");
                true
            }
            None => false,
        }
    }

    /// Apply `config`, then stop and start again. An invalid config is
    /// rejected before anything stops: the loop keeps its old settings.
    pub fn restart(self: &Arc<Self>, config: SyncConfig) -> SyncResult<()> {
        let enabled = config.scheduler.enabled;
        self.orchestrator.reconfigure(config)?;
        self.stop();
        if enabled {
            self.start();
        }
        Ok(())
    }

    /// Run `class` now, outside the periodic loop.
    pub async fn trigger_now(&self, class: ResourceClass) -> SyncRunSummary {
        self.orchestrator.run(class, RunOptions::manual()).await
    }

    /// One scheduled pass. `None` when skipped because a pass is in flight.
    pub async fn tick_once(&self) -> Option<Vec<SyncRunSummary>> {
        if self
            .pass_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            counter!("sync_ticks_skipped_total").increment(1);
            tracing::warn!(target: "scheduler", "previous pass still running, tick skipped");
            return None;
        }
        let _guard = PassGuard(&self.pass_in_flight);

        let riders_due = {
            let mut st = self.state();
            st.last_run = Some(Utc::now());
            let every = Duration::from_secs(
                self.orchestrator.config().riders.interval_minutes.max(1) * 60,
            );
            st.last_riders.map(|t| t.elapsed() >= every).unwrap_or(true)
        };

        let mut out = Vec::new();
        out.push(
            self.orchestrator
                .run(ResourceClass::Events, RunOptions::default())
                .await,
        );
        if self.orchestrator.context().backlog_len() > 0 {
            out.push(
                self.orchestrator
                    .run(ResourceClass::Results, RunOptions::default())
                    .await,
            );
        }
        if riders_due {
            let started = Instant::now();
            let summary = self
                .orchestrator
                .run(ResourceClass::Riders, RunOptions::default())
                .await;
            // A conflict did no work; try again next tick.
            if summary.status != RunStatus::SkippedConflict {
                self.state().last_riders = Some(started);
            }
            out.push(summary);
        }
        tracing::debug!(target: "scheduler", runs = out.len(), "scheduled pass finished");
        Some(out)
    }

    pub fn status(&self) -> SchedulerStatus {
        let ctx = self.orchestrator.context();
        let last_run = self.state().last_run;
        SchedulerStatus {
            enabled: self.is_enabled(),
            interval_minutes: self.orchestrator.config().scheduler.tick_minutes,
            last_run,
            is_running: ResourceClass::ALL.iter().any(|c| ctx.locks.is_locked(*c)),
            pass_in_flight: self.pass_in_flight.load(Ordering::SeqCst),
            budgets: ctx.rate_limiter.snapshot(),
            last_runs: self.orchestrator.last_runs(),
            tracked_events: ctx.cadence.lock().expect("cadence mutex poisoned").len(),
            results_backlog: ctx.backlog_len(),
        }
    }
}
