// src/ingest/mod.rs
//! Ingestion boundary: raw upstream JSON -> validated [`SourceSnapshot`]s.
//!
//! Nothing downstream of this module sees a `serde_json::Value`. Each source
//! gets a [`SourceMapping`] in config that says, with JSON pointers, where
//! ids, start times and fields live in its payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cadence::UpcomingEvent;
use crate::error::{SyncError, SyncResult};
use crate::lock::ResourceClass;
use crate::reconcile::{FieldValue, SourceId, SourceSnapshot};

/// Where records of one kind live in a source's payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMapping {
    /// Pointer to the record array in list/bulk responses ("" = root).
    #[serde(default)]
    pub list: String,
    /// Pointer to the record object in single-item responses ("" = root).
    #[serde(default)]
    pub item: String,
    /// Pointer to the id inside a record.
    pub id: String,
    /// Output field name -> pointer inside a record.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpcomingMapping {
    #[serde(default)]
    pub list: String,
    pub id: String,
    /// RFC 3339 string or unix seconds.
    pub start_time: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMapping {
    /// Roster response: only `list` and `id` are read.
    #[serde(default)]
    pub roster: Option<RecordMapping>,
    #[serde(default)]
    pub rider: Option<RecordMapping>,
    #[serde(default)]
    pub upcoming: Option<UpcomingMapping>,
    #[serde(default)]
    pub event: Option<RecordMapping>,
    /// Result records; `id` points at the rider id within one result row.
    #[serde(default)]
    pub result: Option<RecordMapping>,
    /// Signup records of one event; `id` points at the rider id.
    #[serde(default)]
    pub signup: Option<RecordMapping>,
}

impl SourceMapping {
    pub fn record(&self, class: ResourceClass) -> Option<&RecordMapping> {
        match class {
            ResourceClass::Riders => self.rider.as_ref(),
            ResourceClass::Events => self.event.as_ref(),
            ResourceClass::Results => self.result.as_ref(),
        }
    }
}

/// A list record that could not be turned into a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    /// Entity id when it could still be read.
    pub entity_id: Option<String>,
    pub error: SyncError,
}

/// Per-record outcome of a list payload.
pub type MappedRecord = Result<SourceSnapshot, RejectedRecord>;

/// Composite key of a per-event rider row (results, signups).
pub fn result_id(event_id: &str, rider_id: &str) -> String {
    format!("{event_id}:{rider_id}")
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotMapper {
    sources: BTreeMap<SourceId, SourceMapping>,
}

impl SnapshotMapper {
    pub fn new(sources: BTreeMap<SourceId, SourceMapping>) -> Self {
        Self { sources }
    }

    pub fn mapping(&self, source: &str) -> SyncResult<&SourceMapping> {
        self.sources
            .get(source)
            .ok_or_else(|| SyncError::Config(format!("no ingestion mapping for source '{source}'")))
    }

    fn record_mapping(&self, source: &str, class: ResourceClass) -> SyncResult<&RecordMapping> {
        self.mapping(source)?.record(class).ok_or_else(|| {
            SyncError::Config(format!("no {} mapping for source '{source}'", class.as_str()))
        })
    }

    /// Ids listed in a roster response.
    pub fn roster_ids(&self, source: &str, payload: &Value) -> SyncResult<Vec<String>> {
        let m = self
            .mapping(source)?
            .roster
            .as_ref()
            .ok_or_else(|| SyncError::Config(format!("no roster mapping for source '{source}'")))?;
        let rows = array_at(source, payload, &m.list)?;
        rows.iter()
            .map(|row| read_id(source, row, &m.id))
            .collect()
    }

    /// Authoritative upcoming list. One bad row rejects the whole list: a
    /// partial list would expire events that are still scheduled.
    pub fn upcoming(&self, source: &str, payload: &Value) -> SyncResult<Vec<UpcomingEvent>> {
        let m = self
            .mapping(source)?
            .upcoming
            .as_ref()
            .ok_or_else(|| SyncError::Config(format!("no upcoming mapping for source '{source}'")))?;
        let rows = array_at(source, payload, &m.list)?;
        rows.iter()
            .map(|row| {
                Ok(UpcomingEvent {
                    id: read_id(source, row, &m.id)?,
                    start_time: read_time(source, row, &m.start_time)?,
                })
            })
            .collect()
    }

    /// Single-record response (rider item, event detail).
    pub fn snapshot(
        &self,
        source: &str,
        class: ResourceClass,
        payload: &Value,
        fetched_at: DateTime<Utc>,
    ) -> SyncResult<SourceSnapshot> {
        let m = self.record_mapping(source, class)?;
        let record = payload
            .pointer(&m.item)
            .ok_or_else(|| SyncError::malformed(source, format!("missing record at '{}'", m.item)))?;
        let id = read_id(source, record, &m.id)?;
        build(source, id, record, m, fetched_at)
    }

    /// List response (rider bulk). Each row succeeds or fails on its own.
    pub fn snapshots(
        &self,
        source: &str,
        class: ResourceClass,
        payload: &Value,
        fetched_at: DateTime<Utc>,
    ) -> SyncResult<Vec<MappedRecord>> {
        let m = self.record_mapping(source, class)?;
        let rows = array_at(source, payload, &m.list)?;
        Ok(rows
            .iter()
            .map(|row| map_row(source, row, m, fetched_at, |id| id))
            .collect())
    }

    /// Result rows of one event, keyed `event:rider`.
    pub fn results(
        &self,
        source: &str,
        event_id: &str,
        payload: &Value,
        fetched_at: DateTime<Utc>,
    ) -> SyncResult<Vec<MappedRecord>> {
        let m = self.record_mapping(source, ResourceClass::Results)?;
        event_rows(source, event_id, payload, m, fetched_at)
    }

    /// Signup rows of one event, keyed `event:rider` like results.
    pub fn signups(
        &self,
        source: &str,
        event_id: &str,
        payload: &Value,
        fetched_at: DateTime<Utc>,
    ) -> SyncResult<Vec<MappedRecord>> {
        let m = self
            .mapping(source)?
            .signup
            .as_ref()
            .ok_or_else(|| SyncError::Config(format!("no signup mapping for source '{source}'")))?;
        event_rows(source, event_id, payload, m, fetched_at)
    }
}

fn event_rows(
    source: &str,
    event_id: &str,
    payload: &Value,
    m: &RecordMapping,
    fetched_at: DateTime<Utc>,
) -> SyncResult<Vec<MappedRecord>> {
    let rows = array_at(source, payload, &m.list)?;
    Ok(rows
        .iter()
        .map(|row| map_row(source, row, m, fetched_at, |rider| result_id(event_id, &rider)))
        .collect())
}

fn map_row(
    source: &str,
    row: &Value,
    m: &RecordMapping,
    fetched_at: DateTime<Utc>,
    key: impl FnOnce(String) -> String,
) -> MappedRecord {
    let id = read_id(source, row, &m.id).map_err(|error| reject(source, None, error))?;
    let id = key(id);
    build(source, id.clone(), row, m, fetched_at).map_err(|error| reject(source, Some(id), error))
}

fn reject(source: &str, entity_id: Option<String>, error: SyncError) -> RejectedRecord {
    counter!("sync_records_rejected_total", "source" => source.to_string()).increment(1);
    tracing::debug!(target: "sync", source, ?entity_id, %error, "record rejected at ingestion");
    RejectedRecord { entity_id, error }
}

fn build(
    source: &str,
    id: String,
    record: &Value,
    m: &RecordMapping,
    fetched_at: DateTime<Utc>,
) -> SyncResult<SourceSnapshot> {
    if !record.is_object() {
        return Err(SyncError::malformed(source, format!("record {id} is not an object")));
    }
    let mut snap = SourceSnapshot::new(source, id, fetched_at);
    for (name, ptr) in &m.fields {
        snap = match record.pointer(ptr) {
            None | Some(Value::Null) => snap.with_absent(name),
            Some(v) => snap.with_field(name, scalar(source, name, v)?),
        };
    }
    Ok(snap)
}

fn array_at<'a>(source: &str, payload: &'a Value, ptr: &str) -> SyncResult<&'a Vec<Value>> {
    payload
        .pointer(ptr)
        .and_then(Value::as_array)
        .ok_or_else(|| SyncError::malformed(source, format!("expected array at '{ptr}'")))
}

fn read_id(source: &str, record: &Value, ptr: &str) -> SyncResult<String> {
    match record.pointer(ptr) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        _ => Err(SyncError::malformed(source, format!("missing or invalid id at '{ptr}'"))),
    }
}

fn read_time(source: &str, record: &Value, ptr: &str) -> SyncResult<DateTime<Utc>> {
    let bad = || SyncError::malformed(source, format!("missing or invalid time at '{ptr}'"));
    match record.pointer(ptr) {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| bad()),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(bad),
        _ => Err(bad()),
    }
}

fn scalar(source: &str, field: &str, v: &Value) -> SyncResult<FieldValue> {
    match v {
        Value::Bool(b) => Ok(FieldValue::Bool(*b)),
        Value::String(s) => Ok(FieldValue::Text(s.clone())),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(FieldValue::Integer(i)),
            None => n
                .as_f64()
                .map(FieldValue::Number)
                .ok_or_else(|| SyncError::malformed(source, format!("{field}: number out of range"))),
        },
        _ => Err(SyncError::malformed(
            source,
            format!("{field}: expected scalar, got {}", kind_of(v)),
        )),
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
    }
}
