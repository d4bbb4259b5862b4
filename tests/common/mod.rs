// tests/common/mod.rs
// Shared harness: a valid two-source config plus scripted fixture sources.
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};

use team_sync::config::SyncConfig;
use team_sync::orchestrator::{SyncContext, SyncOrchestrator};
use team_sync::repository::MemoryRepository;
use team_sync::scheduler::SyncScheduler;
use team_sync::upstream::{Endpoint, FixtureSource, UpstreamClient};

pub const CONFIG: &str = r#"
canonical_order = ["zr", "zp"]

[riders]
interval_minutes = 60
bulk_threshold = 50

[retry]
rate_limit_backoff_secs = 60
transient_retries = 2
transient_base_ms = 100
call_timeout_secs = 30

[[sources]]
id = "zr"
primary = true
base_url = "http://localhost"
[sources.paths]
roster = "/clubs/1"
rider_item = "/riders/{id}"
rider_bulk = "/riders"
events_upcoming = "/events/upcoming"
event_detail = "/events/{id}"
event_signups = "/events/{id}/signups"
event_results = "/results/{id}"

[[sources]]
id = "zp"
base_url = "http://localhost"
[sources.paths]
rider_item = "/zp/riders/{id}"
event_detail = "/zp/events/{id}"
event_results = "/zp/{id}/results"

[budgets."zr/roster"]
max_calls = 10
window_secs = 3600
[budgets."zr/rider_item"]
max_calls = 100
window_secs = 60
[budgets."zr/rider_bulk"]
max_calls = 1
window_secs = 900
[budgets."zr/events_upcoming"]
max_calls = 100
window_secs = 60
[budgets."zr/event_detail"]
max_calls = 100
window_secs = 60
[budgets."zr/event_signups"]
max_calls = 100
window_secs = 60
[budgets."zr/event_results"]
max_calls = 100
window_secs = 60
[budgets."zp/rider_item"]
max_calls = 100
window_secs = 60
[budgets."zp/event_detail"]
max_calls = 100
window_secs = 60
[budgets."zp/event_results"]
max_calls = 100
window_secs = 60

[priority.riders]
ftp = ["zp", "zr"]
[priority.events]
laps = ["zp"]
[priority.results]
avg_watts = ["zp"]

[mapping.zr.roster]
list = "/riders"
id = "/riderId"
[mapping.zr.rider]
id = "/riderId"
fields = { name = "/name", ftp = "/ftp" }
[mapping.zr.upcoming]
id = "/eventId"
start_time = "/start"
[mapping.zr.event]
id = "/eventId"
fields = { title = "/title", laps = "/laps" }
[mapping.zr.signup]
list = "/signups"
id = "/riderId"
fields = { category = "/pen" }
[mapping.zr.result]
list = "/results"
id = "/riderId"
fields = { rank = "/position" }

[mapping.zp.rider]
item = "/data/0"
id = "/zwid"
fields = { ftp = "/ftp" }
[mapping.zp.event]
id = "/id"
fields = { title = "/name", laps = "/laps" }
[mapping.zp.result]
list = "/data"
id = "/zwid"
fields = { rank = "/pos", avg_watts = "/avg_power" }
"#;

pub fn config() -> SyncConfig {
    toml::from_str(CONFIG).expect("test config parses")
}

/// A fixture source serving exactly the endpoints `cfg` lists for `id`.
pub fn source_for(cfg: &SyncConfig, id: &str) -> FixtureSource {
    let src = FixtureSource::new(id);
    let paths = cfg
        .source(id)
        .expect("source in config")
        .endpoint_paths()
        .expect("valid paths");
    for endpoint in paths.into_keys() {
        src.enable(endpoint);
    }
    src
}

pub fn rider(id: u32) -> Value {
    json!({ "riderId": id, "name": format!("Rider {id}"), "ftp": 250 + id })
}

pub struct Harness {
    pub zr: Arc<FixtureSource>,
    pub zp: Arc<FixtureSource>,
    pub repo: Arc<MemoryRepository>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(config(), |zr, zp| (zr, zp))
    }

    /// Build from `cfg`; `wrap` may replace the sources first (e.g. add a delay).
    pub fn with(
        cfg: SyncConfig,
        wrap: impl FnOnce(FixtureSource, FixtureSource) -> (FixtureSource, FixtureSource),
    ) -> Self {
        let (zr, zp) = wrap(source_for(&cfg, "zr"), source_for(&cfg, "zp"));
        let zr = Arc::new(zr);
        let zp = Arc::new(zp);
        let repo = Arc::new(MemoryRepository::new());
        let sources: Vec<Arc<dyn UpstreamClient>> = vec![zp.clone(), zr.clone()];
        let orchestrator =
            SyncOrchestrator::new(SyncContext::new(), cfg, sources, repo.clone()).expect("valid config");
        Self {
            zr,
            zp,
            repo,
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn scheduler(&self) -> Arc<SyncScheduler> {
        SyncScheduler::new(Arc::clone(&self.orchestrator))
    }

    pub fn seed_riders(&self, ids: impl IntoIterator<Item = u32>) {
        for id in ids {
            self.zr
                .respond(Endpoint::RiderItem, Some(&id.to_string()), rider(id));
        }
    }
}
