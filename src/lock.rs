//! # Resource Locks
//! Per resource class mutual exclusion. A scheduled sync and a manually
//! triggered sync of the same class must never run together: upstream budgets
//! are tight enough that both would burn the same window.
//!
//! Callers take a [`ResourceGuard`] via [`ResourceLocks::try_lock`]; the guard
//! releases the class when dropped, which also covers early returns, panics and
//! cancelled futures.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A category of sync work scheduled and locked independently of the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Riders,
    Events,
    Results,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 3] = [
        ResourceClass::Riders,
        ResourceClass::Events,
        ResourceClass::Results,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Riders => "riders",
            ResourceClass::Events => "events",
            ResourceClass::Results => "results",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "riders" | "rider" => Ok(ResourceClass::Riders),
            "events" | "event" => Ok(ResourceClass::Events),
            "results" | "result" => Ok(ResourceClass::Results),
            other => Err(format!("unknown resource class '{other}'")),
        }
    }
}

/// Process-wide lock table, shared through the sync context.
#[derive(Debug, Default)]
pub struct ResourceLocks {
    held: Mutex<HashMap<ResourceClass, DateTime<Utc>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, class: ResourceClass) -> bool {
        self.held
            .lock()
            .expect("resource lock mutex poisoned")
            .contains_key(&class)
    }

    /// When the current holder acquired `class`, if held.
    pub fn acquired_at(&self, class: ResourceClass) -> Option<DateTime<Utc>> {
        self.held
            .lock()
            .expect("resource lock mutex poisoned")
            .get(&class)
            .copied()
    }

    /// Raw acquire. Returns false if already held.
    pub fn acquire(&self, class: ResourceClass) -> bool {
        let mut held = self.held.lock().expect("resource lock mutex poisoned");
        if held.contains_key(&class) {
            return false;
        }
        held.insert(class, Utc::now());
        true
    }

    pub fn release(&self, class: ResourceClass) {
        self.held
            .lock()
            .expect("resource lock mutex poisoned")
            .remove(&class);
    }

    /// Scoped acquire: `None` if the class is already held.
    pub fn try_lock(self: &Arc<Self>, class: ResourceClass) -> Option<ResourceGuard> {
        if !self.acquire(class) {
            return None;
        }
        tracing::debug!(target: "sync", class = %class, "resource lock acquired");
        Some(ResourceGuard {
            locks: Arc::clone(self),
            class,
        })
    }
}

/// Holds a resource class until dropped.
#[derive(Debug)]
pub struct ResourceGuard {
    locks: Arc<ResourceLocks>,
    class: ResourceClass,
}

impl ResourceGuard {
    pub fn class(&self) -> ResourceClass {
        self.class
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.locks.release(self.class);
        tracing::debug!(target: "sync", class = %self.class, "resource lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let locks = ResourceLocks::new();
        assert!(locks.acquire(ResourceClass::Riders));
        assert!(!locks.acquire(ResourceClass::Riders));
        assert!(locks.acquire(ResourceClass::Events));
        locks.release(ResourceClass::Riders);
        assert!(!locks.is_locked(ResourceClass::Riders));
        assert!(locks.acquire(ResourceClass::Riders));
    }

    #[test]
    fn guard_releases_on_drop() {
        let locks = Arc::new(ResourceLocks::new());
        {
            let guard = locks.try_lock(ResourceClass::Events).expect("free");
            assert_eq!(guard.class(), ResourceClass::Events);
            assert!(locks.is_locked(ResourceClass::Events));
            assert!(locks.try_lock(ResourceClass::Events).is_none());
        }
        assert!(!locks.is_locked(ResourceClass::Events));
    }

    #[test]
    fn guard_releases_on_panic() {
        let locks = Arc::new(ResourceLocks::new());
        let inner = Arc::clone(&locks);
        let res = std::panic::catch_unwind(move || {
            let _guard = inner.try_lock(ResourceClass::Results).expect("free");
            panic!("boom");
        });
        assert!(res.is_err());
        assert!(!locks.is_locked(ResourceClass::Results));
    }

    #[tokio::test]
    async fn guard_releases_when_future_is_cancelled() {
        let locks = Arc::new(ResourceLocks::new());
        let inner = Arc::clone(&locks);
        let fut = async move {
            let _guard = inner.try_lock(ResourceClass::Riders).expect("free");
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        };
        let timed = tokio::time::timeout(std::time::Duration::from_millis(10), fut).await;
        assert!(timed.is_err());
        assert!(!locks.is_locked(ResourceClass::Riders));
    }

    #[test]
    fn class_parses_case_insensitive() {
        assert_eq!("Riders".parse::<ResourceClass>(), Ok(ResourceClass::Riders));
        assert_eq!("event".parse::<ResourceClass>(), Ok(ResourceClass::Events));
        assert!("teams".parse::<ResourceClass>().is_err());
    }
}
