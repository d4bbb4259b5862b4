//! # Event Cadence
//! Classifies upcoming events into cadence buckets and decides which are due
//! for a resync on each scheduler tick.
//!
//! ```text
//! Far --(start - now <= near threshold)--> Near --(start passed)--> Expired
//!  \_____________(dropped from upcoming list)_____________________/
//! ```
//!
//! - Far events resync every `far_interval`, Near events every `near_interval`,
//!   both measured from `last_synced_at`.
//! - The tick on which an event flips Far -> Near forces a resync.
//! - Expired events (started, or gone from the authoritative list) are removed.
//!
//! All methods take `now` explicitly; nothing here reads the clock.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bucket {
    Far,
    Near,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadenceConfig {
    pub near_threshold: Duration,
    pub far_interval: Duration,
    pub near_interval: Duration,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            near_threshold: Duration::minutes(60),
            far_interval: Duration::minutes(60),
            near_interval: Duration::minutes(10),
        }
    }
}

/// Entry of the authoritative upcoming list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpcomingEvent {
    pub id: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedEvent {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub bucket: Bucket,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Resync on the next tick regardless of elapsed time.
    pub forced: bool,
}

/// Why an event is in the due list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DueReason {
    NeverSynced,
    BecameNear,
    Forced,
    Interval,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueEvent {
    pub id: String,
    pub bucket: Bucket,
    pub reason: DueReason,
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CadenceTick {
    /// Due events, nearest start first.
    pub due: Vec<DueEvent>,
    /// Ids that flipped Far -> Near on this tick.
    pub transitioned: Vec<String>,
    /// Ids removed from tracking on this tick.
    pub expired: Vec<String>,
    pub tracked: usize,
}

pub fn classify(start_time: DateTime<Utc>, now: DateTime<Utc>, cfg: &CadenceConfig) -> Bucket {
    if start_time <= now {
        Bucket::Expired
    } else if start_time - now <= cfg.near_threshold {
        Bucket::Near
    } else {
        Bucket::Far
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventCadence {
    cfg: CadenceConfig,
    events: BTreeMap<String, TrackedEvent>,
}

impl EventCadence {
    pub fn new(cfg: CadenceConfig) -> Self {
        Self {
            cfg,
            events: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.cfg
    }

    /// Swap thresholds without dropping tracked state.
    pub fn set_config(&mut self, cfg: CadenceConfig) {
        self.cfg = cfg;
    }

    pub fn get(&self, id: &str) -> Option<&TrackedEvent> {
        self.events.get(id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn tracked(&self) -> impl Iterator<Item = &TrackedEvent> {
        self.events.values()
    }

    /// Recompute buckets against the latest upcoming list and collect due events.
    pub fn tick(&mut self, now: DateTime<Utc>, upcoming: &[UpcomingEvent]) -> CadenceTick {
        let mut out = CadenceTick::default();
        let listed: HashSet<&str> = upcoming.iter().map(|e| e.id.as_str()).collect();

        // Drop events that vanished from the authoritative list.
        let gone: Vec<String> = self
            .events
            .keys()
            .filter(|id| !listed.contains(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            self.events.remove(&id);
            out.expired.push(id);
        }

        for ev in upcoming {
            let bucket = classify(ev.start_time, now, &self.cfg);
            if bucket == Bucket::Expired {
                if self.events.remove(&ev.id).is_some() {
                    out.expired.push(ev.id.clone());
                }
                continue;
            }

            let entry = self
                .events
                .entry(ev.id.clone())
                .or_insert_with(|| TrackedEvent {
                    id: ev.id.clone(),
                    start_time: ev.start_time,
                    bucket,
                    last_synced_at: None,
                    forced: false,
                });
            let previous = entry.bucket;
            entry.start_time = ev.start_time;
            entry.bucket = bucket;

            let became_near = previous == Bucket::Far && bucket == Bucket::Near;
            if became_near {
                // Stays due until a successful sync clears it.
                entry.forced = true;
                out.transitioned.push(ev.id.clone());
            }

            let reason = match entry.last_synced_at {
                None => Some(DueReason::NeverSynced),
                Some(_) if became_near => Some(DueReason::BecameNear),
                Some(_) if entry.forced => Some(DueReason::Forced),
                Some(last) => {
                    let every = match bucket {
                        Bucket::Near => self.cfg.near_interval,
                        _ => self.cfg.far_interval,
                    };
                    (now - last >= every).then_some(DueReason::Interval)
                }
            };
            if let Some(reason) = reason {
                out.due.push(DueEvent {
                    id: ev.id.clone(),
                    bucket,
                    reason,
                });
            }
        }

        out.due.sort_by(|a, b| {
            let sa = self.events.get(&a.id).map(|e| e.start_time);
            let sb = self.events.get(&b.id).map(|e| e.start_time);
            sa.cmp(&sb).then_with(|| a.id.cmp(&b.id))
        });
        out.expired.sort();
        out.expired.dedup();
        out.tracked = self.events.len();

        tracing::debug!(
            target: "cadence",
            tracked = out.tracked,
            due = out.due.len(),
            transitioned = out.transitioned.len(),
            expired = out.expired.len(),
            "cadence tick"
        );
        out
    }

    pub fn mark_synced(&mut self, id: &str, now: DateTime<Utc>) {
        if let Some(ev) = self.events.get_mut(id) {
            ev.last_synced_at = Some(now);
            ev.forced = false;
        }
    }

    /// Force every Near event onto the next due list. Used when the scheduler
    /// (re)starts so nothing close to its start runs on stale data.
    pub fn force_near_resync(&mut self) -> usize {
        let mut n = 0;
        for ev in self.events.values_mut() {
            if ev.bucket == Bucket::Near {
                ev.forced = true;
                n += 1;
            }
        }
        n
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
