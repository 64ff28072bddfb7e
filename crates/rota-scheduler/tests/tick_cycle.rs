// End-to-end ticks against a file-backed database shared by several
// connections, the way separate processor replicas would share it.

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use rota_core::config::SchedulerConfig;
use rota_core::Frequency;
use rota_rotations::{Rotation, RotationEngine, RotationKey, SqliteRotationStore};
use rota_scheduler::{plan_events, RotationTickProcessor, ScheduleIndex};
use rusqlite::Connection;
use tokio_util::sync::CancellationToken;

fn open(path: &Path) -> Connection {
    let conn = Connection::open(path).unwrap();
    conn.busy_timeout(std::time::Duration::from_secs(5)).unwrap();
    conn.execute_batch("PRAGMA journal_mode=WAL;").unwrap();
    conn
}

/// One replica: its own connections, engine and index over the shared file.
fn replica(path: &Path) -> (Arc<RotationEngine>, Arc<RotationTickProcessor>) {
    let rconn = open(path);
    rota_rotations::db::init_db(&rconn).unwrap();
    let iconn = open(path);
    rota_scheduler::db::init_db(&iconn).unwrap();

    let rotations = Arc::new(RotationEngine::new(Arc::new(SqliteRotationStore::new(rconn))));
    let index = Arc::new(ScheduleIndex::new(iconn));
    let config = SchedulerConfig::default();
    let processor = RotationTickProcessor::new(rotations.clone(), index, config, None);
    (rotations, Arc::new(processor))
}

fn seed(path: &Path) -> Rotation {
    let (rotations, _) = replica(path);
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    let r = Rotation::new(
        RotationKey::new("T1", "primary"),
        vec!["alice".into(), "bob".into(), "carol".into()],
        Frequency::Weekly,
        start,
    );
    let r = rotations.upsert_rotation(r, &CancellationToken::new()).unwrap();

    let index = ScheduleIndex::new(open(path));
    for e in plan_events(&r, "C1", Duration::hours(24), Duration::hours(48)) {
        index.add_event(&e).unwrap();
    }
    r
}

#[tokio::test]
async fn planned_handovers_drive_the_rotation_around() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rota.db");
    let r = seed(&path);
    let (rotations, processor) = replica(&path);
    let cancel = CancellationToken::new();

    let mut owners = Vec::new();
    for _ in 0..3 {
        let due = rotations.get_rotation(&r.key()).unwrap().next_rotation_date;
        let report = processor
            .process_tick_at("", due + Duration::minutes(1), &cancel)
            .await
            .unwrap();
        assert_eq!(report.handovers, 1, "bucket {}", report.bucket);
        owners.push(rotations.get_rotation(&r.key()).unwrap().current_owner);
    }
    assert_eq!(owners, ["bob", "carol", "alice"]);
    assert_eq!(rotations.get_rotation(&r.key()).unwrap().version, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_replicas_hand_over_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rota.db");
    let r = seed(&path);
    let (rotations, a) = replica(&path);
    let (_, b) = replica(&path);
    let at = r.next_rotation_date + Duration::minutes(5);

    let run = |p: Arc<RotationTickProcessor>| {
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            p.process_tick_at("", at, &cancel).await.unwrap()
        })
    };
    let (ra, rb) = tokio::join!(run(a), run(b));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.handovers + rb.handovers, 1);
    assert_eq!(ra.already_applied + rb.already_applied, 1);
    assert_eq!(ra.failures + rb.failures, 0);

    let stored = rotations.get_rotation(&r.key()).unwrap();
    assert_eq!(stored.current_owner, "bob");
    assert_eq!(stored.version, 2);
}
