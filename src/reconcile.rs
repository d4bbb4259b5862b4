//! # Multi-Source Reconciler
//! Folds snapshots of one entity from several upstream sources into a single
//! record, field by field, following a per-field source priority list.
//!
//! - Input order never matters: snapshots are sorted by canonical source rank,
//!   then `fetched_at` descending, then contents before anything is read.
//! - Per field the first source (in that field's priority list) holding a value
//!   wins. Sources missing from the list are not consulted for that field.
//! - Fields without a priority entry fall back to the canonical source order.
//! - Within one source the newest snapshot is read first. Across sources
//!   priority always beats recency.
//!
//! Output maps are `BTreeMap`s, so serializing the same inputs in any order
//! produces identical bytes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream source identifier as used in config (`"zwiftracing"`, `"zwiftpower"`, ...).
pub type SourceId = String;

/// Scalar field value with a total order so ties resolve the same way every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl FieldValue {
    fn rank(&self) -> u8 {
        match self {
            FieldValue::Bool(_) => 0,
            FieldValue::Integer(_) => 1,
            FieldValue::Number(_) => 2,
            FieldValue::Text(_) => 3,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl Ord for FieldValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a.cmp(b),
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a.cmp(b),
            (FieldValue::Number(a), FieldValue::Number(b)) => a.total_cmp(b),
            (FieldValue::Text(a), FieldValue::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for FieldValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FieldValue {}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Integer(i)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// One source's view of one entity at one fetch. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SourceSnapshot {
    source: SourceId,
    entity_id: String,
    fetched_at: DateTime<Utc>,
    /// `None` marks a field the source reported as explicitly absent.
    fields: BTreeMap<String, Option<FieldValue>>,
}

impl SourceSnapshot {
    pub fn new(
        source: impl Into<SourceId>,
        entity_id: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            entity_id: entity_id.into(),
            fetched_at,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), Some(value.into()));
        self
    }

    pub fn with_absent(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), None);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field).and_then(Option::as_ref)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.values().all(Option::is_none)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completeness {
    Complete,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciledEntity {
    pub entity_id: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Field name -> source that supplied the value.
    pub provenance: BTreeMap<String, SourceId>,
    pub completeness: Completeness,
}

impl ReconciledEntity {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn sources(&self) -> BTreeSet<&str> {
        self.provenance.values().map(String::as_str).collect()
    }
}

/// Field name -> ordered source ids consulted for that field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPriority(BTreeMap<String, Vec<SourceId>>);

impl FieldPriority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, sources: &[&str]) -> Self {
        self.0.insert(
            field.into(),
            sources.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub fn for_field(&self, field: &str) -> Option<&[SourceId]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<SourceId>)> {
        self.0.iter()
    }
}

impl From<BTreeMap<String, Vec<SourceId>>> for FieldPriority {
    fn from(map: BTreeMap<String, Vec<SourceId>>) -> Self {
        Self(map)
    }
}

/// First candidate in `order` for which `lookup` yields a value.
pub fn first_present<K, V, I, F>(order: I, mut lookup: F) -> Option<(K, V)>
where
    I: IntoIterator<Item = K>,
    F: FnMut(&K) -> Option<V>,
{
    order
        .into_iter()
        .find_map(|k| lookup(&k).map(|v| (k, v)))
}

fn source_rank<'a>(canonical: &[SourceId], source: &'a str) -> (usize, &'a str) {
    let idx = canonical
        .iter()
        .position(|s| s == source)
        .unwrap_or(canonical.len());
    (idx, source)
}

/// Merge `snapshots` of `entity_id` into one record.
pub fn reconcile(
    entity_id: &str,
    snapshots: &[SourceSnapshot],
    priority: &FieldPriority,
    canonical: &[SourceId],
) -> ReconciledEntity {
    let mut sorted: Vec<&SourceSnapshot> = snapshots.iter().collect();
    sorted.sort_by(|a, b| {
        source_rank(canonical, &a.source)
            .cmp(&source_rank(canonical, &b.source))
            .then_with(|| b.fetched_at.cmp(&a.fetched_at))
            .then_with(|| a.fields.cmp(&b.fields))
    });

    // Distinct sources, canonical order (inherited from the sort).
    let mut default_order: Vec<&str> = Vec::new();
    for snap in &sorted {
        if !default_order.contains(&snap.source.as_str()) {
            default_order.push(&snap.source);
        }
    }

    let mut wanted: BTreeSet<&str> = priority.fields().collect();
    for snap in &sorted {
        wanted.extend(snap.field_names());
    }

    let mut fields = BTreeMap::new();
    let mut provenance = BTreeMap::new();
    for field in wanted {
        let order: Vec<&str> = match priority.for_field(field) {
            Some(list) => list.iter().map(String::as_str).collect(),
            None => default_order.clone(),
        };
        let hit = first_present(order, |source| {
            sorted
                .iter()
                .filter(|s| s.source == *source)
                .find_map(|s| s.get(field))
        });
        if let Some((source, value)) = hit {
            fields.insert(field.to_string(), value.clone());
            provenance.insert(field.to_string(), source.to_string());
        }
    }

    let contributing: BTreeSet<&String> = provenance.values().collect();
    let completeness = if contributing.len() >= 2 {
        Completeness::Complete
    } else {
        Completeness::Partial
    };

    ReconciledEntity {
        entity_id: entity_id.to_string(),
        fields,
        provenance,
        completeness,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 3, 12, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn canonical() -> Vec<SourceId> {
        vec!["zwiftracing".into(), "zwiftpower".into(), "zwift".into()]
    }

    #[test]
    fn falls_back_to_next_source_when_absent() {
        let a = SourceSnapshot::new("a", "150437", at(0)).with_absent("name");
        let b = SourceSnapshot::new("b", "150437", at(0)).with_field("name", "B");
        let prio = FieldPriority::new().with("name", &["a", "b"]);

        let out = reconcile("150437", &[a, b], &prio, &[]);
        assert_eq!(out.get("name"), Some(&FieldValue::from("B")));
        assert_eq!(out.provenance["name"], "b");
        assert_eq!(out.completeness, Completeness::Partial);
    }

    #[test]
    fn identical_output_for_every_input_order() {
        let snaps = [
            SourceSnapshot::new("zwiftracing", "7", at(0))
                .with_field("ftp", 280i64)
                .with_absent("weight"),
            SourceSnapshot::new("zwiftpower", "7", at(5))
                .with_field("ftp", 285i64)
                .with_field("weight", 72.5),
            SourceSnapshot::new("zwift", "7", at(10))
                .with_field("name", "J. Doe")
                .with_field("weight", 73.0),
        ];
        let prio = FieldPriority::new()
            .with("ftp", &["zwiftpower", "zwiftracing"])
            .with("weight", &["zwift", "zwiftpower"]);
        let perms = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        let mut rendered = BTreeSet::new();
        for p in perms {
            let input: Vec<SourceSnapshot> = p.iter().map(|&i| snaps[i].clone()).collect();
            let out = reconcile("7", &input, &prio, &canonical());
            rendered.insert(serde_json::to_string(&out).unwrap());
        }
        assert_eq!(rendered.len(), 1);

        let out = reconcile("7", &snaps, &prio, &canonical());
        assert_eq!(out.get("ftp"), Some(&FieldValue::Integer(285)));
        assert_eq!(out.provenance["weight"], "zwift");
        assert_eq!(out.provenance["name"], "zwift");
        assert_eq!(out.completeness, Completeness::Complete);
    }

    #[test]
    fn unlisted_source_is_not_consulted() {
        let a = SourceSnapshot::new("zwiftracing", "1", at(0)).with_field("category", "B");
        let b = SourceSnapshot::new("zwift", "1", at(0)).with_field("category", "A");
        let prio = FieldPriority::new().with("category", &["zwiftpower", "zwiftracing"]);

        let out = reconcile("1", &[b.clone()], &prio, &canonical());
        assert!(out.get("category").is_none());

        let out = reconcile("1", &[a, b], &prio, &canonical());
        assert_eq!(out.provenance["category"], "zwiftracing");
    }

    #[test]
    fn unprioritised_field_uses_canonical_order() {
        let late = SourceSnapshot::new("zwift", "1", at(30)).with_field("country", "nl");
        let early = SourceSnapshot::new("zwiftracing", "1", at(0)).with_field("country", "be");
        let out = reconcile("1", &[late, early], &FieldPriority::new(), &canonical());
        assert_eq!(out.get("country"), Some(&FieldValue::from("be")));
    }

    #[test]
    fn newest_snapshot_wins_within_one_source_only() {
        let old = SourceSnapshot::new("zwiftpower", "1", at(0)).with_field("ftp", 250i64);
        let new = SourceSnapshot::new("zwiftpower", "1", at(60)).with_field("ftp", 260i64);
        let other = SourceSnapshot::new("zwiftracing", "1", at(120)).with_field("ftp", 300i64);
        let prio = FieldPriority::new().with("ftp", &["zwiftpower", "zwiftracing"]);

        let out = reconcile("1", &[old, other, new], &prio, &canonical());
        assert_eq!(out.get("ftp"), Some(&FieldValue::Integer(260)));
        assert_eq!(out.provenance["ftp"], "zwiftpower");
    }

    #[test]
    fn fields_without_value_are_omitted() {
        let a = SourceSnapshot::new("zwiftracing", "1", at(0))
            .with_field("name", "x")
            .with_absent("weight");
        let prio = FieldPriority::new().with("ftp", &["zwiftracing"]);
        let out = reconcile("1", &[a], &prio, &canonical());
        assert_eq!(out.fields.len(), 1);
        assert!(!out.provenance.contains_key("weight"));
        assert!(!out.provenance.contains_key("ftp"));
    }

    #[test]
    fn numbers_have_total_order() {
        let mut v = vec![
            FieldValue::Number(2.5),
            FieldValue::Text("a".into()),
            FieldValue::Integer(3),
            FieldValue::Bool(true),
            FieldValue::Number(-1.0),
        ];
        v.sort();
        assert_eq!(v[0], FieldValue::Bool(true));
        assert_eq!(v[2], FieldValue::Number(-1.0));
        assert_eq!(v[4], FieldValue::Text("a".into()));
    }

    #[test]
    fn first_present_skips_misses() {
        let hit = first_present(["a", "b", "c"], |k| (*k != "a").then(|| k.len()));
        assert_eq!(hit, Some(("b", 1)));
        assert_eq!(first_present(Vec::<u8>::new(), |_| Some(())), None);
    }
}
