// src/upstream/fixture.rs
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::upstream::{Endpoint, UpstreamClient, UpstreamRequest};

type Key = (Endpoint, Option<String>);

#[derive(Default)]
struct Script {
    supported: BTreeSet<Endpoint>,
    fixed: HashMap<Key, SyncResult<Value>>,
    queued: HashMap<Key, VecDeque<SyncResult<Value>>>,
    calls: Vec<UpstreamRequest>,
}

/// In-memory scripted source for tests and offline runs.
///
/// Responses are keyed by endpoint and id. One-shot responses queued with
/// [`FixtureSource::push`] are served before the fixed ones. A missing
/// fixture answers `NotFound`. Without an explicit bulk fixture, a bulk
/// request is answered with the array of the requested riders' item fixtures.
pub struct FixtureSource {
    id: String,
    delay: Option<Duration>,
    script: Mutex<Script>,
}

impl FixtureSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            delay: None,
            script: Mutex::new(Script::default()),
        }
    }

    /// Every call sleeps `delay` (on the tokio clock) before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Load `{endpoint}.json` and `{endpoint}/{id}.json` files from `dir`.
    pub fn from_dir(id: impl Into<String>, dir: &Path) -> SyncResult<Self> {
        let src = Self::new(id);
        for endpoint in Endpoint::ALL {
            let flat = dir.join(format!("{}.json", endpoint.as_str()));
            if flat.is_file() {
                src.respond(endpoint, None, read_json(&flat)?);
            }
            let nested = dir.join(endpoint.as_str());
            if nested.is_dir() {
                let entries = std::fs::read_dir(&nested)
                    .map_err(|e| SyncError::Config(format!("{}: {e}", nested.display())))?;
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        src.respond(endpoint, Some(stem), read_json(&path)?);
                    }
                }
            }
        }
        Ok(src)
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().expect("fixture script mutex poisoned")
    }

    /// Mark `endpoint` as served even without fixtures.
    pub fn enable(&self, endpoint: Endpoint) -> &Self {
        self.script().supported.insert(endpoint);
        self
    }

    pub fn disable(&self, endpoint: Endpoint) -> &Self {
        self.script().supported.remove(&endpoint);
        self
    }

    pub fn respond(&self, endpoint: Endpoint, id: Option<&str>, body: Value) -> &Self {
        let mut s = self.script();
        s.supported.insert(endpoint);
        s.fixed.insert((endpoint, id.map(str::to_string)), Ok(body));
        drop(s);
        self
    }

    /// Persistent failure for `endpoint`/`id`.
    pub fn fail(&self, endpoint: Endpoint, id: Option<&str>, err: SyncError) -> &Self {
        let mut s = self.script();
        s.supported.insert(endpoint);
        s.fixed.insert((endpoint, id.map(str::to_string)), Err(err));
        drop(s);
        self
    }

    /// One-shot answer, consumed by the next matching call.
    pub fn push(&self, endpoint: Endpoint, id: Option<&str>, answer: SyncResult<Value>) -> &Self {
        let mut s = self.script();
        s.supported.insert(endpoint);
        s.queued
            .entry((endpoint, id.map(str::to_string)))
            .or_default()
            .push_back(answer);
        drop(s);
        self
    }

    pub fn calls(&self) -> Vec<UpstreamRequest> {
        self.script().calls.clone()
    }

    pub fn call_count(&self, endpoint: Endpoint) -> usize {
        self.script()
            .calls
            .iter()
            .filter(|r| r.endpoint() == endpoint)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.script().calls.len()
    }

    fn answer(&self, request: &UpstreamRequest) -> SyncResult<Value> {
        let mut s = self.script();
        s.calls.push(request.clone());
        let endpoint = request.endpoint();
        let key = (endpoint, request.id().map(str::to_string));

        if let Some(answer) = s.queued.get_mut(&key).and_then(VecDeque::pop_front) {
            return answer;
        }
        if let Some(answer) = s.fixed.get(&key) {
            return answer.clone();
        }
        if let UpstreamRequest::RidersBulk(ids) = request {
            let rows: Vec<Value> = ids
                .iter()
                .filter_map(|id| match s.fixed.get(&(Endpoint::RiderItem, Some(id.clone()))) {
                    Some(Ok(v)) => Some(v.clone()),
                    _ => None,
                })
                .collect();
            return Ok(Value::Array(rows));
        }
        Err(SyncError::NotFound(match request.id() {
            Some(id) => format!("{}/{endpoint}/{id}", self.id),
            None => format!("{}/{endpoint}", self.id),
        }))
    }
}

fn read_json(path: &Path) -> SyncResult<Value> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| SyncError::malformed(path.display().to_string(), e.to_string()))
}

#[async_trait]
impl UpstreamClient for FixtureSource {
    fn source(&self) -> &str {
        &self.id
    }

    fn supports(&self, endpoint: Endpoint) -> bool {
        self.script().supported.contains(&endpoint)
    }

    async fn call(&self, request: &UpstreamRequest) -> SyncResult<Value> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.answer(request)
    }
}
