// tests/sync_events.rs
mod common;

use chrono::{Duration, Utc};
use serde_json::{json, Value};

use common::Harness;
use team_sync::cadence::Bucket;
use team_sync::orchestrator::{RunOptions, RunStatus};
use team_sync::reconcile::Completeness;
use team_sync::upstream::Endpoint;
use team_sync::{ResourceClass, SyncError};

fn upcoming(events: &[(&str, i64)]) -> Value {
    let now = Utc::now();
    Value::Array(
        events
            .iter()
            .map(|(id, minutes)| {
                json!({ "eventId": id, "start": (now + Duration::minutes(*minutes)).to_rfc3339() })
            })
            .collect(),
    )
}

fn seed_details(h: &Harness, ids: &[&str]) {
    for id in ids {
        h.zr.respond(
            Endpoint::EventDetail,
            Some(id),
            json!({ "eventId": id, "title": format!("ZR {id}"), "laps": null }),
        );
        h.zp.respond(
            Endpoint::EventDetail,
            Some(id),
            json!({ "id": id, "name": format!("ZP {id}"), "laps": 3 }),
        );
    }
}

#[tokio::test]
async fn upcoming_events_sync_from_both_sources() {
    let h = Harness::new();
    // 30 min: near, 3 h: far, 72 h: beyond the 48 h lookahead.
    h.zr.respond(
        Endpoint::EventsUpcoming,
        None,
        upcoming(&[("e1", 30), ("e2", 180), ("e3", 72 * 60)]),
    );
    seed_details(&h, &["e1", "e2", "e3"]);

    let s = h
        .orchestrator
        .run(ResourceClass::Events, RunOptions::default())
        .await;
    assert_eq!(s.status, RunStatus::Success);
    assert_eq!((s.processed, s.updated), (2, 2));

    let e1 = h.repo.get(ResourceClass::Events, "e1").unwrap();
    assert_eq!(e1.get("title").and_then(|v| v.as_str()), Some("ZR e1"));
    assert_eq!(e1.get("laps").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(e1.provenance["laps"], "zp");
    assert_eq!(e1.completeness, Completeness::Complete);
    assert!(h.repo.get(ResourceClass::Events, "e3").is_none());

    let ctx = h.orchestrator.context();
    {
        let cadence = ctx.cadence.lock().unwrap();
        assert_eq!(cadence.len(), 2);
        assert_eq!(cadence.get("e1").unwrap().bucket, Bucket::Near);
        assert_eq!(cadence.get("e2").unwrap().bucket, Bucket::Far);
        assert!(cadence.get("e1").unwrap().last_synced_at.is_some());
    }

    // Nothing is due again right away.
    let s = h
        .orchestrator
        .run(ResourceClass::Events, RunOptions::default())
        .await;
    assert_eq!(s.processed, 0);
    assert_eq!(h.zr.call_count(Endpoint::EventDetail), 2);
}

#[tokio::test]
async fn unsynced_event_stays_due() {
    let h = Harness::new();
    h.zr.respond(Endpoint::EventsUpcoming, None, upcoming(&[("e1", 30)]));
    h.zr.fail(
        Endpoint::EventDetail,
        Some("e1"),
        SyncError::malformed("zr", "bad detail"),
    );

    let s = h
        .orchestrator
        .run(ResourceClass::Events, RunOptions::default())
        .await;
    assert_eq!((s.processed, s.failed), (1, 1));

    let s = h
        .orchestrator
        .run(ResourceClass::Events, RunOptions::default())
        .await;
    assert_eq!(s.processed, 1);
    assert_eq!(h.zr.call_count(Endpoint::EventDetail), 2);
}

#[tokio::test]
async fn vanished_event_is_queued_for_results() {
    let h = Harness::new();
    h.zr.respond(
        Endpoint::EventsUpcoming,
        None,
        upcoming(&[("e1", 30), ("e2", 180)]),
    );
    seed_details(&h, &["e1", "e2"]);
    h.orchestrator
        .run(ResourceClass::Events, RunOptions::default())
        .await;

    h.zr.respond(Endpoint::EventsUpcoming, None, upcoming(&[("e2", 170)]));
    let s = h
        .orchestrator
        .run(ResourceClass::Events, RunOptions::default())
        .await;
    assert_eq!(s.status, RunStatus::Success);

    let ctx = h.orchestrator.context();
    assert_eq!(ctx.backlog_len(), 1);
    assert!(ctx.results_backlog.lock().unwrap().contains("e1"));
    assert!(ctx.cadence.lock().unwrap().get("e1").is_none());
}

#[tokio::test]
async fn malformed_upcoming_list_fails_without_expiring_anything() {
    let h = Harness::new();
    h.zr.respond(Endpoint::EventsUpcoming, None, upcoming(&[("e1", 30)]));
    seed_details(&h, &["e1"]);
    h.orchestrator
        .run(ResourceClass::Events, RunOptions::default())
        .await;

    h.zr.respond(
        Endpoint::EventsUpcoming,
        None,
        json!([{ "eventId": "e1", "start": "soon" }]),
    );
    let s = h
        .orchestrator
        .run(ResourceClass::Events, RunOptions::default())
        .await;

    assert_eq!(s.status, RunStatus::Failed);
    assert_eq!(h.orchestrator.context().backlog_len(), 0);
    assert!(h.orchestrator.context().cadence.lock().unwrap().get("e1").is_some());
}

#[tokio::test]
async fn signups_sync_with_the_event_and_keep_it_due_on_failure() {
    let h = Harness::new();
    h.zr.respond(Endpoint::EventsUpcoming, None, upcoming(&[("e1", 30)]));
    seed_details(&h, &["e1"]);
    h.zr.respond(
        Endpoint::EventSignups,
        Some("e1"),
        json!({ "signups": [
            { "riderId": 1, "pen": "A" },
            { "riderId": 2, "pen": "B" },
            { "pen": "C" }
        ] }),
    );
    h.zr.push(
        Endpoint::EventSignups,
        Some("e1"),
        Err(SyncError::malformed("zr", "bad signups")),
    );

    // Detail stored, signups failed: the event is not marked synced.
    let s = h
        .orchestrator
        .run(ResourceClass::Events, RunOptions::default())
        .await;
    assert_eq!((s.processed, s.updated), (1, 1));
    assert!(h.repo.signups("e1").is_empty());
    assert!(h
        .orchestrator
        .context()
        .cadence
        .lock()
        .unwrap()
        .get("e1")
        .unwrap()
        .last_synced_at
        .is_none());

    let s = h
        .orchestrator
        .run(ResourceClass::Events, RunOptions::default())
        .await;
    assert_eq!(s.processed, 1);
    let signups = h.repo.signups("e1");
    let ids: Vec<_> = signups.iter().map(|r| r.entity_id.as_str()).collect();
    assert_eq!(ids, vec!["e1:1", "e1:2"]);
    assert_eq!(signups[1].get("category").and_then(|v| v.as_str()), Some("B"));
    assert_eq!(h.repo.count(ResourceClass::Events), 1);

    let s = h
        .orchestrator
        .run(ResourceClass::Events, RunOptions::default())
        .await;
    assert_eq!(s.processed, 0);
    assert_eq!(h.zr.call_count(Endpoint::EventSignups), 2);

    // A rider who left the pen disappears on the next sync.
    h.zr.respond(
        Endpoint::EventSignups,
        Some("e1"),
        json!({ "signups": [{ "riderId": 2, "pen": "B" }] }),
    );
    h.orchestrator
        .run(ResourceClass::Events, RunOptions::manual().with_ids(["e1"]))
        .await;
    let ids: Vec<_> = h
        .repo
        .signups("e1")
        .into_iter()
        .map(|r| r.entity_id)
        .collect();
    assert_eq!(ids, vec!["e1:2"]);
}
