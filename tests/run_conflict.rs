// tests/run_conflict.rs
mod common;

use std::time::Duration;

use common::{config, Harness};
use team_sync::orchestrator::{RunOptions, RunStatus};
use team_sync::upstream::Endpoint;
use team_sync::ResourceClass;

fn slow_harness() -> Harness {
    let h = Harness::with(config(), |zr, zp| {
        (
            zr.with_delay(Duration::from_millis(500)),
            zp.with_delay(Duration::from_millis(500)),
        )
    });
    h.seed_riders([1]);
    h
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_on_one_class_do_the_work_once() {
    let h = slow_harness();
    let opts = RunOptions::manual().with_ids(["1"]);

    let (a, b) = tokio::join!(
        h.orchestrator.run(ResourceClass::Riders, opts.clone()),
        h.orchestrator.run(ResourceClass::Riders, opts.clone()),
    );

    let (done, skipped) = if a.status == RunStatus::SkippedConflict {
        (b, a)
    } else {
        (a, b)
    };
    assert_eq!(done.status, RunStatus::Success);
    assert_eq!(skipped.status, RunStatus::SkippedConflict);
    assert_eq!(skipped.processed, 0);
    assert!(skipped.error.as_deref().unwrap().contains("already running"));
    assert_eq!(h.zr.call_count(Endpoint::RiderItem), 1);
    assert_eq!(h.zp.call_count(Endpoint::RiderItem), 1);

    // Conflicts are not recorded as the class's last run.
    assert_eq!(
        h.orchestrator.last_runs()[&ResourceClass::Riders].status,
        RunStatus::Success
    );
}

#[tokio::test(start_paused = true)]
async fn different_classes_run_side_by_side() {
    let h = slow_harness();
    h.zr.respond(Endpoint::EventsUpcoming, None, serde_json::json!([]));

    let (riders, events) = tokio::join!(
        h.orchestrator
            .run(ResourceClass::Riders, RunOptions::manual().with_ids(["1"])),
        h.orchestrator.run(ResourceClass::Events, RunOptions::manual()),
    );

    assert_eq!(riders.status, RunStatus::Success);
    assert_eq!(events.status, RunStatus::Success);
}

#[tokio::test]
async fn held_lock_blocks_a_run_without_upstream_calls() {
    let h = Harness::new();
    h.seed_riders([1]);
    let guard = h
        .orchestrator
        .context()
        .locks
        .try_lock(ResourceClass::Riders)
        .unwrap();

    let s = h
        .orchestrator
        .run(ResourceClass::Riders, RunOptions::manual().with_ids(["1"]))
        .await;
    assert_eq!(s.status, RunStatus::SkippedConflict);
    assert_eq!(h.zr.total_calls(), 0);

    drop(guard);
    let s = h
        .orchestrator
        .run(ResourceClass::Riders, RunOptions::manual().with_ids(["1"]))
        .await;
    assert_eq!(s.status, RunStatus::Success);
}
