//! # Rate Limiter
//! Sliding-window call budgets per named endpoint.
//!
//! Each endpoint keeps the instants of its recent calls in a queue. A call may
//! proceed when fewer than `max_calls` instants fall inside the trailing
//! window; otherwise the caller sleeps until the oldest one leaves the window.
//! Callers on the same endpoint queue up behind an async mutex, so there is no
//! check-then-call race that could burst past the budget.
//!
//! Time comes from `tokio::time::Instant`, which lets tests pause the clock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::histogram;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{SyncError, SyncResult};

/// Observability view of one endpoint budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetStatus {
    pub calls_in_window: usize,
    pub max_calls: usize,
    pub can_call: bool,
    pub wait_time_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_calls: usize,
    window: Duration,
    /// Extra wait once the window is full.
    penalty: Duration,
}

#[derive(Debug)]
struct EndpointBudget {
    limits: Mutex<Limits>,
    calls: Mutex<VecDeque<Instant>>,
    /// FIFO turn-taking for callers of this endpoint.
    turn: tokio::sync::Mutex<()>,
}

impl EndpointBudget {
    fn new(limits: Limits) -> Self {
        Self {
            limits: Mutex::new(limits),
            calls: Mutex::new(VecDeque::new()),
            turn: tokio::sync::Mutex::new(()),
        }
    }

    fn limits(&self) -> Limits {
        *self.limits.lock().expect("budget limits mutex poisoned")
    }

    /// Drop instants that left the window. Called lazily on every call.
    fn prune(&self, now: Instant) {
        let window = self.limits().window;
        let mut calls = self.calls.lock().expect("budget calls mutex poisoned");
        while let Some(&t) = calls.front() {
            if now.saturating_duration_since(t) >= window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&self, at: Instant) {
        self.calls
            .lock()
            .expect("budget calls mutex poisoned")
            .push_back(at);
        self.prune(at);
    }

    /// Pure: never mutates the queue.
    fn status_at(&self, now: Instant) -> BudgetStatus {
        let limits = self.limits();
        let calls = self.calls.lock().expect("budget calls mutex poisoned");
        let in_window: Vec<Instant> = calls
            .iter()
            .copied()
            .filter(|t| now.saturating_duration_since(*t) < limits.window)
            .collect();

        let wait = if in_window.len() < limits.max_calls {
            Duration::ZERO
        } else {
            // Oldest instant that must leave before a slot frees up.
            let idx = in_window.len() - limits.max_calls;
            let frees_at = in_window[idx] + limits.window + limits.penalty;
            frees_at.saturating_duration_since(now)
        };

        BudgetStatus {
            calls_in_window: in_window.len(),
            max_calls: limits.max_calls,
            can_call: wait.is_zero(),
            // Rounded up so a sub-millisecond remainder never reads as "no wait".
            wait_time_ms: wait.as_nanos().div_ceil(1_000_000) as u64,
        }
    }
}

/// Registry of endpoint budgets. One per process, shared by `Arc`.
#[derive(Debug, Default)]
pub struct RateLimiter {
    budgets: Mutex<HashMap<String, Arc<EndpointBudget>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent. Re-registering replaces the limits but keeps call history.
    pub fn register(&self, endpoint: &str, max_calls: usize, window: Duration) {
        self.register_with_penalty(endpoint, max_calls, window, Duration::ZERO);
    }

    pub fn register_with_penalty(
        &self,
        endpoint: &str,
        max_calls: usize,
        window: Duration,
        penalty: Duration,
    ) {
        let limits = Limits {
            max_calls: max_calls.max(1),
            window,
            penalty,
        };
        let mut budgets = self.budgets.lock().expect("rate limiter mutex poisoned");
        match budgets.get(endpoint) {
            Some(existing) => {
                *existing.limits.lock().expect("budget limits mutex poisoned") = limits;
            }
            None => {
                budgets.insert(endpoint.to_string(), Arc::new(EndpointBudget::new(limits)));
            }
        }
        tracing::debug!(
            target: "rate_limiter",
            endpoint,
            max_calls = limits.max_calls,
            window_ms = window.as_millis() as u64,
            "budget registered"
        );
    }

    pub fn is_registered(&self, endpoint: &str) -> bool {
        self.budgets
            .lock()
            .expect("rate limiter mutex poisoned")
            .contains_key(endpoint)
    }

    /// Forget the call history of `endpoint` (limits stay registered).
    pub fn clear(&self, endpoint: &str) {
        if let Some(b) = self.budget(endpoint) {
            b.calls.lock().expect("budget calls mutex poisoned").clear();
        }
    }

    fn budget(&self, endpoint: &str) -> Option<Arc<EndpointBudget>> {
        self.budgets
            .lock()
            .expect("rate limiter mutex poisoned")
            .get(endpoint)
            .cloned()
    }

    /// Non-blocking status; `None` for an unknown endpoint.
    pub fn status(&self, endpoint: &str) -> Option<BudgetStatus> {
        self.budget(endpoint).map(|b| b.status_at(Instant::now()))
    }

    /// Milliseconds until `endpoint` could be called. Unknown endpoints report 0.
    pub fn wait_time(&self, endpoint: &str) -> Duration {
        self.status(endpoint)
            .map(|s| Duration::from_millis(s.wait_time_ms))
            .unwrap_or(Duration::ZERO)
    }

    /// Status of every registered endpoint, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<String, BudgetStatus> {
        let now = Instant::now();
        let budgets = self.budgets.lock().expect("rate limiter mutex poisoned");
        budgets
            .iter()
            .map(|(name, b)| (name.clone(), b.status_at(now)))
            .collect()
    }

    /// Wait for a slot on `endpoint`, run `operation`, record the call.
    ///
    /// The call is recorded whether `operation` succeeds or fails, so a failing
    /// upstream still consumes budget.
    pub async fn execute_with_limit<T, F, Fut>(
        &self,
        endpoint: &str,
        operation: F,
    ) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let budget = self
            .budget(endpoint)
            .ok_or_else(|| SyncError::Config(format!("no budget registered for {endpoint}")))?;

        let _turn = budget.turn.lock().await;

        let started = Instant::now();
        loop {
            let now = Instant::now();
            budget.prune(now);
            let status = budget.status_at(now);
            if status.can_call {
                break;
            }
            tracing::info!(
                target: "rate_limiter",
                endpoint,
                wait_ms = status.wait_time_ms,
                calls_in_window = status.calls_in_window,
                max_calls = status.max_calls,
                "budget exhausted, waiting for slot"
            );
            tokio::time::sleep(Duration::from_millis(status.wait_time_ms)).await;
        }
        let waited = started.elapsed();
        if !waited.is_zero() {
            histogram!("rate_limiter_wait_ms").record(waited.as_secs_f64() * 1_000.0);
        }

        let result = operation().await;
        budget.record(Instant::now());
        result
    }
}
