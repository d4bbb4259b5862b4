// src/config.rs
//! Sync configuration: scheduler cadence, sources, budgets, field priority and
//! ingestion mapping. Loaded from TOML or JSON.
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cadence::CadenceConfig;
use crate::error::{SyncError, SyncResult};
use crate::ingest::SourceMapping;
use crate::lock::ResourceClass;
use crate::rate_limiter::RateLimiter;
use crate::reconcile::{FieldPriority, SourceId};
use crate::retry::RetryPolicy;
use crate::upstream::{budget_name, Endpoint};

pub const ENV_PATH: &str = "SYNC_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_minutes: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RidersConfig {
    /// Minutes between scheduled rider passes.
    pub interval_minutes: u64,
    /// At or above this many ids the bulk endpoint is preferred.
    pub bulk_threshold: usize,
    pub bulk_batch_size: usize,
}

impl Default for RidersConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            bulk_threshold: 10,
            bulk_batch_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub near_threshold_minutes: i64,
    pub far_interval_minutes: i64,
    pub near_interval_minutes: i64,
    pub lookahead_hours: i64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            near_threshold_minutes: 60,
            far_interval_minutes: 60,
            near_interval_minutes: 10,
            lookahead_hours: 48,
        }
    }
}

impl EventsConfig {
    pub fn cadence(&self) -> CadenceConfig {
        CadenceConfig {
            near_threshold: chrono::Duration::minutes(self.near_threshold_minutes),
            far_interval: chrono::Duration::minutes(self.far_interval_minutes),
            near_interval: chrono::Duration::minutes(self.near_interval_minutes),
        }
    }

    pub fn lookahead(&self) -> chrono::Duration {
        chrono::Duration::hours(self.lookahead_hours)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub rate_limit_backoff_secs: u64,
    pub transient_retries: u32,
    pub transient_base_ms: u64,
    pub call_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rate_limit_backoff_secs: 60,
            transient_retries: 2,
            transient_base_ms: 1_000,
            call_timeout_secs: 30,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::upstream(
            Duration::from_secs(self.rate_limit_backoff_secs),
            self.transient_retries,
            Duration::from_millis(self.transient_base_ms),
        )
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    /// The primary source owns the roster and the upcoming event list.
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub base_url: String,
    /// Name of the env var holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Endpoint name -> path template. Only listed endpoints are served.
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
    /// Serve this source from JSON files instead of HTTP.
    #[serde(default)]
    pub fixture_dir: Option<PathBuf>,
}

impl SourceConfig {
    /// Path templates keyed by endpoint; unknown endpoint names are an error.
    pub fn endpoint_paths(&self) -> SyncResult<BTreeMap<Endpoint, String>> {
        self.paths
            .iter()
            .map(|(name, path)| {
                let endpoint = name
                    .parse::<Endpoint>()
                    .map_err(|e| SyncError::Config(format!("source '{}': {e}", self.id)))?;
                Ok((endpoint, path.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub max_calls: usize,
    pub window_secs: u64,
    #[serde(default)]
    pub penalty_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub riders: FieldPriority,
    pub events: FieldPriority,
    pub results: FieldPriority,
}

impl PriorityConfig {
    pub fn for_class(&self, class: ResourceClass) -> &FieldPriority {
        match class {
            ResourceClass::Riders => &self.riders,
            ResourceClass::Events => &self.events,
            ResourceClass::Results => &self.results,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub scheduler: SchedulerConfig,
    pub riders: RidersConfig,
    pub events: EventsConfig,
    pub retry: RetryConfig,
    pub sources: Vec<SourceConfig>,
    /// Budget name (`"{source}/{endpoint}"`) -> limits.
    pub budgets: BTreeMap<String, BudgetConfig>,
    pub priority: PriorityConfig,
    pub canonical_order: Vec<SourceId>,
    pub mapping: BTreeMap<SourceId, SourceMapping>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl SyncConfig {
    pub fn primary(&self) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.primary)
    }

    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Configured source order, then any remaining sources by id.
    pub fn canonical_order(&self) -> Vec<SourceId> {
        let mut out = self.canonical_order.clone();
        let mut rest: Vec<SourceId> = self
            .sources
            .iter()
            .map(|s| s.id.clone())
            .filter(|id| !out.contains(id))
            .collect();
        rest.sort();
        out.extend(rest);
        out
    }

    /// Register every configured budget. Existing history is kept.
    pub fn register_budgets(&self, limiter: &RateLimiter) {
        for (name, b) in &self.budgets {
            limiter.register_with_penalty(
                name,
                b.max_calls,
                Duration::from_secs(b.window_secs),
                Duration::from_secs(b.penalty_secs),
            );
        }
    }

    pub fn validate(&self) -> ValidationReport {
        let mut r = ValidationReport::default();

        if self.scheduler.tick_minutes == 0 {
            r.errors.push("scheduler.tick_minutes must be > 0".into());
        }
        let ev = &self.events;
        if ev.near_interval_minutes <= 0 || ev.far_interval_minutes <= 0 {
            r.errors.push("event sync intervals must be > 0".into());
        }
        if ev.near_interval_minutes >= ev.far_interval_minutes {
            r.errors.push(format!(
                "events.near_interval_minutes ({}) must be below far_interval_minutes ({})",
                ev.near_interval_minutes, ev.far_interval_minutes
            ));
        }
        if ev.lookahead_hours * 60 < ev.near_threshold_minutes {
            r.errors.push(format!(
                "events.lookahead_hours ({}h) must cover near_threshold_minutes ({}m)",
                ev.lookahead_hours, ev.near_threshold_minutes
            ));
        }
        if self.riders.bulk_batch_size == 0 {
            r.errors.push("riders.bulk_batch_size must be > 0".into());
        }
        if self.riders.interval_minutes < 60 {
            r.warnings.push(format!(
                "riders.interval_minutes = {} may hit upstream limits with large rosters (60 recommended)",
                self.riders.interval_minutes
            ));
        }

        let primaries = self.sources.iter().filter(|s| s.primary).count();
        if primaries != 1 {
            r.errors.push(format!("exactly one primary source required, found {primaries}"));
        }
        let mut seen = BTreeSet::new();
        for s in &self.sources {
            if !seen.insert(s.id.as_str()) {
                r.errors.push(format!("duplicate source id '{}'", s.id));
            }
            if s.fixture_dir.is_none() && s.base_url.trim().is_empty() {
                r.errors.push(format!("source '{}' needs base_url or fixture_dir", s.id));
            }
            for key in s.paths.keys() {
                let Ok(endpoint) = key.parse::<Endpoint>() else {
                    r.errors.push(format!("source '{}' has unknown endpoint '{key}'", s.id));
                    continue;
                };
                let name = budget_name(&s.id, endpoint);
                if !self.budgets.contains_key(&name) {
                    r.errors.push(format!("no budget configured for {name}"));
                }
                if !self.has_mapping(&s.id, endpoint) {
                    r.errors.push(format!("no ingestion mapping for {name}"));
                }
            }
        }

        // Scheduled bulk passes must not outpace the bulk window.
        for s in &self.sources {
            let name = budget_name(&s.id, Endpoint::RiderBulk);
            if let Some(b) = self.budgets.get(&name) {
                let min_gap_secs = b.window_secs / b.max_calls.max(1) as u64;
                if self.riders.interval_minutes * 60 < min_gap_secs {
                    r.errors.push(format!(
                        "riders.interval_minutes ({}) is shorter than the {name} window allows ({}s per call)",
                        self.riders.interval_minutes, min_gap_secs
                    ));
                }
            }
        }

        for (name, b) in &self.budgets {
            if b.max_calls == 0 || b.window_secs == 0 {
                r.errors.push(format!("budget {name} needs max_calls > 0 and window_secs > 0"));
            }
        }

        for class in ResourceClass::ALL {
            for (field, list) in self.priority.for_class(class).iter() {
                for src in list {
                    if !seen.contains(src.as_str()) {
                        r.errors.push(format!(
                            "priority.{class}.{field} names unknown source '{src}'"
                        ));
                    }
                }
            }
        }
        for src in &self.canonical_order {
            if !seen.contains(src.as_str()) {
                r.warnings.push(format!("canonical_order names unknown source '{src}'"));
            }
        }

        r
    }

    fn has_mapping(&self, source: &str, endpoint: Endpoint) -> bool {
        let Some(m) = self.mapping.get(source) else {
            return false;
        };
        match endpoint {
            Endpoint::Roster => m.roster.is_some(),
            Endpoint::RiderItem | Endpoint::RiderBulk => m.rider.is_some(),
            Endpoint::EventsUpcoming => m.upcoming.is_some(),
            Endpoint::EventDetail => m.event.is_some(),
            Endpoint::EventSignups => m.signup.is_some(),
            Endpoint::EventResults => m.result.is_some(),
        }
    }

    /// Validate, log warnings, and turn errors into a config error.
    pub fn check(&self) -> SyncResult<()> {
        let report = self.validate();
        for w in &report.warnings {
            tracing::warn!(target: "sync", warning = %w, "sync config warning");
        }
        if report.is_valid() {
            Ok(())
        } else {
            Err(SyncError::Config(report.errors.join("; ")))
        }
    }
}

/// Load config from an explicit path. Supports TOML or JSON formats.
pub fn load_from(path: &Path) -> Result<SyncConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading sync config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let cfg = parse(&content, ext.as_str())
        .with_context(|| format!("parsing sync config {}", path.display()))?;
    cfg.check()?;
    Ok(cfg)
}

/// Load config using env var + fallbacks:
/// 1) $SYNC_CONFIG_PATH
/// 2) config/sync.toml
/// 3) config/sync.json
/// 4) built-in defaults (no sources; fails validation)
pub fn load_default() -> Result<SyncConfig> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_from(&pb);
        } else {
            return Err(anyhow!("SYNC_CONFIG_PATH points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/sync.toml");
    if toml_p.exists() {
        return load_from(&toml_p);
    }
    let json_p = PathBuf::from("config/sync.json");
    if json_p.exists() {
        return load_from(&json_p);
    }
    let cfg = SyncConfig::default();
    cfg.check()
        .context("no config file found and built-in defaults define no sources")?;
    Ok(cfg)
}

fn parse(s: &str, hint_ext: &str) -> Result<SyncConfig> {
    if hint_ext == "json" {
        return serde_json::from_str(s).context("invalid JSON");
    }
    match toml::from_str(s) {
        Ok(cfg) => Ok(cfg),
        Err(toml_err) if hint_ext != "toml" => {
            serde_json::from_str(s).map_err(|_| anyhow!("unsupported config format: {toml_err}"))
        }
        Err(e) => Err(e).context("invalid TOML"),
    }
}
