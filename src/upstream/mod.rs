// src/upstream/mod.rs
//! Upstream source abstraction. Every source exposes the same request set;
//! a source may leave some endpoints unsupported.
pub mod fixture;
pub mod http;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SyncConfig;
use crate::error::SyncResult;

pub use fixture::FixtureSource;
pub use http::HttpSource;

/// Upstream endpoint kinds. Each (source, endpoint) pair has its own budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Roster,
    RiderItem,
    RiderBulk,
    EventsUpcoming,
    EventDetail,
    EventSignups,
    EventResults,
}

impl Endpoint {
    pub const ALL: [Endpoint; 7] = [
        Endpoint::Roster,
        Endpoint::RiderItem,
        Endpoint::RiderBulk,
        Endpoint::EventsUpcoming,
        Endpoint::EventDetail,
        Endpoint::EventSignups,
        Endpoint::EventResults,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Roster => "roster",
            Endpoint::RiderItem => "rider_item",
            Endpoint::RiderBulk => "rider_bulk",
            Endpoint::EventsUpcoming => "events_upcoming",
            Endpoint::EventDetail => "event_detail",
            Endpoint::EventSignups => "event_signups",
            Endpoint::EventResults => "event_results",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| format!("unknown endpoint '{s}'"))
    }
}

/// Rate limiter budget key: `"{source}/{endpoint}"`.
pub fn budget_name(source: &str, endpoint: Endpoint) -> String {
    format!("{source}/{}", endpoint.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamRequest {
    Roster,
    Rider(String),
    RidersBulk(Vec<String>),
    UpcomingEvents,
    EventDetail(String),
    EventSignups(String),
    EventResults(String),
}

impl UpstreamRequest {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            UpstreamRequest::Roster => Endpoint::Roster,
            UpstreamRequest::Rider(_) => Endpoint::RiderItem,
            UpstreamRequest::RidersBulk(_) => Endpoint::RiderBulk,
            UpstreamRequest::UpcomingEvents => Endpoint::EventsUpcoming,
            UpstreamRequest::EventDetail(_) => Endpoint::EventDetail,
            UpstreamRequest::EventSignups(_) => Endpoint::EventSignups,
            UpstreamRequest::EventResults(_) => Endpoint::EventResults,
        }
    }

    /// Single id carried by the request, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            UpstreamRequest::Rider(id)
            | UpstreamRequest::EventDetail(id)
            | UpstreamRequest::EventSignups(id)
            | UpstreamRequest::EventResults(id) => Some(id),
            _ => None,
        }
    }
}

/// One upstream data source. Implementations do no rate limiting or retrying
/// of their own; the orchestrator wraps every `call`.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    fn source(&self) -> &str;
    fn supports(&self, endpoint: Endpoint) -> bool;
    async fn call(&self, request: &UpstreamRequest) -> SyncResult<Value>;
}

/// One client per configured source: fixture-backed when `fixture_dir` is
/// set, HTTP otherwise.
pub fn build_sources(config: &SyncConfig) -> SyncResult<Vec<Arc<dyn UpstreamClient>>> {
    let timeout = config.retry.call_timeout();
    config
        .sources
        .iter()
        .map(|s| -> SyncResult<Arc<dyn UpstreamClient>> {
            match &s.fixture_dir {
                Some(dir) => {
                    let src = FixtureSource::from_dir(s.id.clone(), dir)?;
                    for endpoint in s.endpoint_paths()?.into_keys() {
                        src.enable(endpoint);
                    }
                    Ok(Arc::new(src))
                }
                None => Ok(Arc::new(HttpSource::from_config(s, timeout)?)),
            }
        })
        .collect()
}
