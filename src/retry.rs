//! # Retry Policy
//! One retry primitive for every upstream call site: per error kind, how many
//! extra attempts are allowed and how long to back off before each.
//!
//! The default upstream policy retries a rate-limit rejection once after a
//! fixed backoff and retries transient failures with exponential backoff.
//! Everything else fails immediately.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use backoff::backoff::{Backoff as _, Constant};
use backoff::ExponentialBackoffBuilder;

use crate::error::{ErrorKind, SyncResult};

/// Backoff shape of one retry rule. Delays come from the `backoff` crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(retry-1)`, capped at `max`, no jitter.
    Exponential { base: Duration, max: Duration },
}

type Schedule = Box<dyn backoff::backoff::Backoff + Send>;

impl Backoff {
    /// Fresh delay generator; each `next_backoff` is the wait before the next retry.
    pub fn schedule(&self) -> Schedule {
        match self {
            Backoff::Fixed(d) => Box::new(Constant::new(*d)),
            Backoff::Exponential { base, max } => Box::new(
                ExponentialBackoffBuilder::new()
                    .with_initial_interval(*base)
                    .with_multiplier(2.0)
                    .with_randomization_factor(0.0)
                    .with_max_interval(*max)
                    .with_max_elapsed_time(None)
                    .build(),
            ),
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let mut schedule = self.schedule();
        let mut delay = Duration::ZERO;
        for _ in 0..retry.max(1) {
            delay = schedule.next_backoff().unwrap_or(delay);
        }
        delay
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRule {
    pub max_retries: u32,
    pub backoff: Backoff,
}

/// Attempts spent per error kind during one `run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub retries: BTreeMap<ErrorKind, u32>,
}

impl RetryStats {
    pub fn count(&self, kind: ErrorKind) -> u32 {
        self.retries.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    rules: BTreeMap<ErrorKind, RetryRule>,
}

impl RetryPolicy {
    /// Never retries.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, kind: ErrorKind, max_retries: u32, backoff: Backoff) -> Self {
        self.rules.insert(
            kind,
            RetryRule {
                max_retries,
                backoff,
            },
        );
        self
    }

    /// Policy used for upstream calls: one retry after `rate_limit_backoff` on
    /// 429, up to `transient_retries` exponential retries on transient errors.
    pub fn upstream(
        rate_limit_backoff: Duration,
        transient_retries: u32,
        transient_base: Duration,
    ) -> Self {
        Self::none()
            .with_rule(ErrorKind::RateLimited, 1, Backoff::Fixed(rate_limit_backoff))
            .with_rule(
                ErrorKind::Transient,
                transient_retries,
                Backoff::Exponential {
                    base: transient_base,
                    max: transient_base.saturating_mul(8),
                },
            )
    }

    pub fn rule(&self, kind: ErrorKind) -> Option<&RetryRule> {
        self.rules.get(&kind)
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.rules
            .get(&kind)
            .map(|r| r.max_retries > 0)
            .unwrap_or(false)
    }

    /// Run `op` until it succeeds, fails with a non-retryable kind, or the
    /// retries for the failing kind are used up. `op` receives the attempt
    /// number starting at 1.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> (SyncResult<T>, RetryStats)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut stats = RetryStats::default();
        let mut schedules: HashMap<ErrorKind, Schedule> = HashMap::new();
        let mut attempt = 1u32;
        loop {
            let err = match op(attempt).await {
                Ok(v) => return (Ok(v), stats),
                Err(e) => e,
            };
            let kind = err.kind();
            let used = stats.count(kind);
            let Some(rule) = self.rules.get(&kind) else {
                return (Err(err), stats);
            };
            if used >= rule.max_retries {
                return (Err(err), stats);
            }
            let delay = schedules
                .entry(kind)
                .or_insert_with(|| rule.backoff.schedule())
                .next_backoff()
                .unwrap_or(Duration::ZERO);
            tracing::debug!(
                target: "sync",
                ?kind,
                retry = used + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying upstream call"
            );
            stats.retries.insert(kind, used + 1);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
