use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rota_core::config::SchedulerConfig;
use rota_rotations::{Rotation, RotationEngine, RotationError, RotationKey};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SchedulerError};
use crate::index::ScheduleIndex;
use crate::types::{
    hour_bucket, hour_start, plan_events, EventAction, Notification, ScheduleEvent, TickReport,
};

const CATCH_UP_PAGE_SIZE: usize = 50;

/// One pass over the events due in the current hour.
#[async_trait]
pub trait TickProcessor: Send + Sync {
    /// Process the current hour bucket.
    ///
    /// An empty `team_id` processes every team, otherwise only that team's
    /// events and rotations are touched. The bucket's events are followed by
    /// a catch-up over overdue rotations in the same scope. Cancellation is
    /// honoured between events and before every write.
    async fn process_tick(
        &self,
        team_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TickReport>;
}

enum Advance {
    Done(Rotation),
    AlreadyApplied,
    Failed,
    Cancelled,
}

/// Drives reminders and handovers from the [`ScheduleIndex`] into the
/// [`RotationEngine`].
///
/// Handovers are idempotent per hour: a rotation whose `last_rotation_date`
/// already falls in or after the event's hour is left alone, so repeated
/// ticks and concurrent processors advance it once. Reminders carry no such
/// guard and may be re-sent by a repeated tick.
pub struct RotationTickProcessor {
    rotations: Arc<RotationEngine>,
    index: Arc<ScheduleIndex>,
    config: SchedulerConfig,
    /// If set, every notification is forwarded here (`try_send`, never blocks).
    notify_tx: Option<mpsc::Sender<Notification>>,
}

impl RotationTickProcessor {
    pub fn new(
        rotations: Arc<RotationEngine>,
        index: Arc<ScheduleIndex>,
        config: SchedulerConfig,
        notify_tx: Option<mpsc::Sender<Notification>>,
    ) -> Self {
        Self {
            rotations,
            index,
            config,
            notify_tx,
        }
    }

    /// [`TickProcessor::process_tick`] with an explicit clock.
    #[instrument(skip(self, cancel), fields(bucket = %hour_bucket(now)))]
    pub async fn process_tick_at(
        &self,
        team_id: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<TickReport> {
        let bucket = hour_bucket(now);
        let mut report = TickReport {
            bucket: bucket.clone(),
            ..TickReport::default()
        };
        let mut handled: HashSet<String> = HashSet::new();
        let mut processed = 0usize;

        for event in self.index.get_events_by_hour(&bucket)? {
            tokio::task::yield_now().await;
            if cancel.is_cancelled() {
                return Err(cancelled(processed));
            }
            if !team_id.is_empty() && !belongs_to(&event.rotation_id, team_id) {
                continue;
            }
            if event.is_expired(now) {
                debug!(event_id = %event.event_id, "skipping expired event");
                report.skipped_expired += 1;
                continue;
            }
            match event.action {
                EventAction::Reminder => {
                    self.notify(Notification {
                        rotation_id: event.rotation_id.clone(),
                        action: EventAction::Reminder,
                        target_channel: event.target_channel.clone(),
                        owner: event.next_owner.clone(),
                        event_id: Some(event.event_id.clone()),
                        fired_at: now,
                    });
                    report.reminders += 1;
                }
                EventAction::Handover => {
                    self.handover(&event, now, cancel, processed, &mut report)?;
                    handled.insert(event.rotation_id.clone());
                }
            }
            processed += 1;
        }

        // A bucket nobody ticked leaves its rotations overdue; pick them up here.
        self.catch_up(team_id, now, cancel, &handled, &mut processed, &mut report)
            .await?;

        info!(
            team_id,
            reminders = report.reminders,
            handovers = report.handovers,
            caught_up = report.caught_up,
            failures = report.failures,
            "tick complete"
        );
        Ok(report)
    }

    fn handover(
        &self,
        event: &ScheduleEvent,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        processed: usize,
        report: &mut TickReport,
    ) -> Result<()> {
        let key = match RotationKey::parse(&event.rotation_id) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    event_id = %event.event_id,
                    error = %e,
                    "handover event has a malformed rotation id"
                );
                report.failures += 1;
                return Ok(());
            }
        };
        match self.advance_guarded(&key, hour_start(event.event_time), now, cancel)? {
            Advance::Done(rotation) => {
                report.handovers += 1;
                self.notify(Notification {
                    rotation_id: event.rotation_id.clone(),
                    action: EventAction::Handover,
                    target_channel: event.target_channel.clone(),
                    owner: rotation.current_owner.clone(),
                    event_id: Some(event.event_id.clone()),
                    fired_at: now,
                });
                self.plan_follow_up(&rotation, &event.target_channel, report)?;
            }
            Advance::AlreadyApplied => report.already_applied += 1,
            Advance::Failed => report.failures += 1,
            Advance::Cancelled => return Err(cancelled(processed)),
        }
        Ok(())
    }

    /// Advance every rotation in scope whose `next_rotation_date` has passed
    /// and that no event of this tick already handled.
    async fn catch_up(
        &self,
        team_id: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        handled: &HashSet<String>,
        processed: &mut usize,
        report: &mut TickReport,
    ) -> Result<()> {
        let channel = self.config.default_channel.clone().unwrap_or_default();
        let mut cursor: Option<String> = None;
        loop {
            let page = if team_id.is_empty() {
                self.rotations
                    .scan_rotations(CATCH_UP_PAGE_SIZE, cursor.as_deref())?
            } else {
                self.rotations
                    .list_rotations(team_id, CATCH_UP_PAGE_SIZE, cursor.as_deref())?
            };
            for rotation in page.items {
                tokio::task::yield_now().await;
                if cancel.is_cancelled() {
                    return Err(cancelled(*processed));
                }
                let key = rotation.key();
                if rotation.next_rotation_date > now || handled.contains(&key.format()) {
                    continue;
                }
                match self.advance_guarded(&key, rotation.next_rotation_date, now, cancel)? {
                    Advance::Done(advanced) => {
                        info!(rotation = %key, "overdue rotation caught up");
                        report.caught_up += 1;
                        self.notify(Notification {
                            rotation_id: key.format(),
                            action: EventAction::Handover,
                            target_channel: channel.clone(),
                            owner: advanced.current_owner.clone(),
                            event_id: None,
                            fired_at: now,
                        });
                        self.plan_follow_up(&advanced, &channel, report)?;
                    }
                    Advance::AlreadyApplied => report.already_applied += 1,
                    Advance::Failed => report.failures += 1,
                    Advance::Cancelled => return Err(cancelled(*processed)),
                }
                *processed += 1;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    /// Advance `key` unless it has already advanced at or after `since`.
    ///
    /// Version conflicts are retried up to `max_conflict_retries` times,
    /// re-checking the guard each round so a rival's advance is not repeated.
    /// Only store outages propagate; other failures are logged.
    fn advance_guarded(
        &self,
        key: &RotationKey,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Advance> {
        let max = self.config.max_conflict_retries;
        let mut attempt = 0u32;
        loop {
            let current = match self.rotations.get_rotation(key) {
                Ok(r) => r,
                Err(e @ RotationError::Database(_)) => return Err(e.into()),
                Err(e) => {
                    warn!(rotation = %key, error = %e, "cannot hand over");
                    return Ok(Advance::Failed);
                }
            };
            if current.last_rotation_date >= since {
                debug!(rotation = %key, "handover already applied");
                return Ok(Advance::AlreadyApplied);
            }
            match self.rotations.advance_rotation_at(key, now, cancel) {
                Ok(rotation) => return Ok(Advance::Done(rotation)),
                Err(RotationError::Cancelled) => return Ok(Advance::Cancelled),
                Err(e) if e.is_conflict() && attempt < max => {
                    attempt += 1;
                    debug!(rotation = %key, attempt, "version conflict, retrying");
                }
                Err(e @ RotationError::Database(_)) => return Err(e.into()),
                Err(e) => {
                    warn!(rotation = %key, error = %e, code = e.code(), "handover failed");
                    return Ok(Advance::Failed);
                }
            }
        }
    }

    fn plan_follow_up(
        &self,
        rotation: &Rotation,
        channel: &str,
        report: &mut TickReport,
    ) -> Result<()> {
        if !self.config.plan_follow_up {
            return Ok(());
        }
        let channel = match (channel.is_empty(), &self.config.default_channel) {
            (true, Some(default)) => default.as_str(),
            _ => channel,
        };
        let events = plan_events(
            rotation,
            channel,
            Duration::hours(self.config.reminder_lead_hours),
            Duration::hours(self.config.event_ttl_hours),
        );
        for event in events {
            match self.index.add_event(&event) {
                Ok(()) => report.planned += 1,
                Err(SchedulerError::DuplicateEvent { .. }) => {
                    debug!(event_id = %event.event_id, "follow-up already planned");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        info!(
            rotation_id = %notification.rotation_id,
            action = %notification.action,
            owner = %notification.owner,
            channel = %notification.target_channel,
            "notification"
        );
        if let Some(ref tx) = self.notify_tx {
            if tx.try_send(notification).is_err() {
                warn!("notification channel full or closed, notification dropped");
            }
        }
    }
}

#[async_trait]
impl TickProcessor for RotationTickProcessor {
    async fn process_tick(
        &self,
        team_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TickReport> {
        self.process_tick_at(team_id, Utc::now(), cancel).await
    }
}

fn cancelled(processed: usize) -> SchedulerError {
    warn!(processed, "tick cancelled");
    SchedulerError::Cancelled { processed }
}

fn belongs_to(rotation_id: &str, team_id: &str) -> bool {
    RotationKey::parse(rotation_id)
        .map(|key| key.team_id == team_id)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use chrono::TimeZone;
    use rota_core::Frequency;
    use rota_rotations::{Page, RotationStore, SqliteRotationStore};
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `conflicts` writes with a version conflict.
    struct ContendedStore {
        inner: SqliteRotationStore,
        conflicts: AtomicU32,
    }

    impl RotationStore for ContendedStore {
        fn get(&self, key: &RotationKey) -> rota_rotations::Result<Option<Rotation>> {
            self.inner.get(key)
        }

        fn conditional_put(
            &self,
            rotation: &Rotation,
            expected_version: u64,
            cancel: &CancellationToken,
        ) -> rota_rotations::Result<Rotation> {
            if expected_version > 0 && self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                return Err(RotationError::VersionConflict {
                    key: rotation.key(),
                    expected: expected_version,
                });
            }
            self.inner.conditional_put(rotation, expected_version, cancel)
        }

        fn query_by_partition(
            &self,
            team_id: &str,
            page_size: usize,
            cursor: Option<&str>,
        ) -> rota_rotations::Result<Page<Rotation>> {
            self.inner.query_by_partition(team_id, page_size, cursor)
        }

        fn scan(
            &self,
            page_size: usize,
            cursor: Option<&str>,
        ) -> rota_rotations::Result<Page<Rotation>> {
            self.inner.scan(page_size, cursor)
        }
    }

    struct Fixture {
        processor: RotationTickProcessor,
        rotations: Arc<RotationEngine>,
        index: Arc<ScheduleIndex>,
        rx: mpsc::Receiver<Notification>,
    }

    fn fixture_with(conflicts: u32, config: SchedulerConfig) -> Fixture {
        let rconn = Connection::open_in_memory().unwrap();
        rota_rotations::db::init_db(&rconn).unwrap();
        let store = ContendedStore {
            inner: SqliteRotationStore::new(rconn),
            conflicts: AtomicU32::new(conflicts),
        };
        let rotations = Arc::new(RotationEngine::new(Arc::new(store)));

        let iconn = Connection::open_in_memory().unwrap();
        init_db(&iconn).unwrap();
        let index = Arc::new(ScheduleIndex::new(iconn));

        let (tx, rx) = mpsc::channel(16);
        let processor =
            RotationTickProcessor::new(rotations.clone(), index.clone(), config, Some(tx));
        Fixture {
            processor,
            rotations,
            index,
            rx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(0, SchedulerConfig::default())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    fn seed(
        f: &Fixture,
        team: &str,
        label: &str,
        frequency: Frequency,
        start: DateTime<Utc>,
    ) -> Rotation {
        let r = Rotation::new(
            RotationKey::new(team, label),
            vec!["alice".into(), "bob".into(), "carol".into()],
            frequency,
            start,
        );
        f.rotations.upsert_rotation(r, &CancellationToken::new()).unwrap()
    }

    fn schedule(f: &Fixture, rotation: &Rotation) {
        for e in plan_events(rotation, "C1", Duration::hours(24), Duration::hours(48)) {
            f.index.add_event(&e).unwrap();
        }
    }

    #[tokio::test]
    async fn reminder_then_handover_then_follow_up() {
        let mut f = fixture();
        let r = seed(&f, "T1", "primary", Frequency::Weekly, t0());
        schedule(&f, &r);
        let cancel = CancellationToken::new();

        let reminder_tick = Utc.with_ymd_and_hms(2024, 1, 7, 9, 5, 0).unwrap();
        let report = f.processor.process_tick_at("", reminder_tick, &cancel).await.unwrap();
        assert_eq!(report.bucket, "2024-01-07T09");
        assert_eq!(report.reminders, 1);
        assert_eq!(report.handovers, 0);
        let n = f.rx.try_recv().unwrap();
        assert_eq!(n.action, EventAction::Reminder);
        assert_eq!(n.owner, "bob");
        assert_eq!(f.rotations.get_rotation(&r.key()).unwrap().current_owner, "alice");

        let handover_tick = Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 30).unwrap();
        let report = f.processor.process_tick_at("", handover_tick, &cancel).await.unwrap();
        assert_eq!(report.handovers, 1);
        assert_eq!(report.planned, 2);
        let n = f.rx.try_recv().unwrap();
        assert_eq!(n.action, EventAction::Handover);
        assert_eq!(n.owner, "bob");

        let advanced = f.rotations.get_rotation(&r.key()).unwrap();
        assert_eq!(advanced.current_owner, "bob");
        assert_eq!(advanced.last_rotation_date, handover_tick);

        let next = f.index.get_events_by_hour("2024-01-15T09").unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].action, EventAction::Handover);
        assert_eq!(next[0].next_owner, "carol");
        assert_eq!(next[0].target_channel, "C1");
    }

    #[tokio::test]
    async fn repeated_tick_in_same_hour_does_not_advance_twice() {
        let f = fixture();
        let r = seed(&f, "T1", "primary", Frequency::Weekly, t0());
        schedule(&f, &r);
        let cancel = CancellationToken::new();

        let first = Utc.with_ymd_and_hms(2024, 1, 8, 9, 1, 0).unwrap();
        f.processor.process_tick_at("", first, &cancel).await.unwrap();
        let version = f.rotations.get_rotation(&r.key()).unwrap().version;

        let again = Utc.with_ymd_and_hms(2024, 1, 8, 9, 40, 0).unwrap();
        let report = f.processor.process_tick_at("", again, &cancel).await.unwrap();
        assert_eq!(report.handovers, 0);
        assert_eq!(report.already_applied, 1);
        let after = f.rotations.get_rotation(&r.key()).unwrap();
        assert_eq!(after.current_owner, "bob");
        assert_eq!(after.version, version);
    }

    #[tokio::test]
    async fn expired_events_are_skipped() {
        let f = fixture();
        // Not yet due, so only the stray event could move it.
        let r = seed(&f, "T1", "primary", Frequency::Weekly, t0());
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();
        let ttl = Duration::minutes(10);
        let short = ScheduleEvent::new(&r.key(), EventAction::Handover, "C1", "bob", at, ttl);
        f.index.add_event(&short).unwrap();

        let late = Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap();
        let report = f
            .processor
            .process_tick_at("", late, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.skipped_expired, 1);
        assert_eq!(report.handovers, 0);
        assert_eq!(f.rotations.get_rotation(&r.key()).unwrap().current_owner, "alice");
    }

    #[tokio::test]
    async fn team_scope_filters_events_and_catches_up_overdue() {
        let f = fixture();
        let now = Utc.with_ymd_and_hms(2024, 1, 8, 9, 15, 0).unwrap();
        let primary = seed(&f, "T1", "primary", Frequency::Weekly, t0());
        let other_team = seed(&f, "T2", "primary", Frequency::Weekly, t0());
        schedule(&f, &primary);
        schedule(&f, &other_team);
        // Overdue with no event in the index.
        let overdue = seed(&f, "T1", "secondary", Frequency::Daily, now - Duration::days(3));

        let report = f
            .processor
            .process_tick_at("T1", now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.handovers, 1);
        assert_eq!(report.caught_up, 1);
        assert_eq!(report.failures, 0);

        assert_eq!(f.rotations.get_rotation(&primary.key()).unwrap().current_owner, "bob");
        assert_eq!(f.rotations.get_rotation(&overdue.key()).unwrap().current_owner, "bob");
        let untouched = f.rotations.get_rotation(&other_team.key()).unwrap();
        assert_eq!(untouched.current_owner, "alice");
        assert_eq!(untouched.version, 1);
    }

    #[tokio::test]
    async fn cancelled_tick_writes_nothing() {
        let f = fixture();
        let r = seed(&f, "T1", "primary", Frequency::Weekly, t0());
        schedule(&f, &r);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let at = Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap();
        let err = f.processor.process_tick_at("", at, &cancel).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Cancelled { processed: 0 }));
        assert_eq!(err.code(), "CANCELLED");
        assert_eq!(f.rotations.get_rotation(&r.key()).unwrap().version, 1);
    }

    #[tokio::test]
    async fn conflicts_are_retried_within_budget() {
        let f = fixture_with(2, SchedulerConfig::default());
        let r = seed(&f, "T1", "primary", Frequency::Weekly, t0());
        schedule(&f, &r);

        let at = Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap();
        let report = f
            .processor
            .process_tick_at("", at, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.handovers, 1);
        assert_eq!(f.rotations.get_rotation(&r.key()).unwrap().current_owner, "bob");
    }

    #[tokio::test]
    async fn exhausted_retries_count_as_failure() {
        let config = SchedulerConfig {
            max_conflict_retries: 1,
            ..SchedulerConfig::default()
        };
        let f = fixture_with(5, config);
        let r = seed(&f, "T1", "primary", Frequency::Weekly, t0());
        schedule(&f, &r);

        let at = Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap();
        let report = f
            .processor
            .process_tick_at("", at, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.handovers, 0);
        assert_eq!(report.failures, 1);
        assert_eq!(f.rotations.get_rotation(&r.key()).unwrap().current_owner, "alice");
    }

    #[tokio::test]
    async fn handover_for_unknown_rotation_is_counted_not_fatal() {
        let f = fixture();
        let at = Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap();
        let ghost = ScheduleEvent::new(
            &RotationKey::new("T1", "ghost"),
            EventAction::Handover,
            "C1",
            "bob",
            at,
            Duration::hours(48),
        );
        f.index.add_event(&ghost).unwrap();

        let report = f
            .processor
            .process_tick_at("", at, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failures, 1);
        assert_eq!(report.planned, 0);
    }

    #[tokio::test]
    async fn missed_handover_bucket_is_recovered_by_a_later_tick() {
        let f = fixture();
        let r = Rotation::new(
            RotationKey::new("T1", "primary"),
            vec!["a".into(), "b".into()],
            Frequency::Daily,
            t0(),
        );
        let r = f.rotations.upsert_rotation(r, &CancellationToken::new()).unwrap();
        schedule(&f, &r);
        assert_eq!(f.index.get_events_by_hour("2024-01-02T09").unwrap().len(), 1);
        let cancel = CancellationToken::new();

        // Nothing ticked during 2024-01-02T09.
        let late = Utc.with_ymd_and_hms(2024, 1, 2, 10, 5, 0).unwrap();
        let report = f.processor.process_tick_at("", late, &cancel).await.unwrap();
        assert_eq!(report.bucket, "2024-01-02T10");
        assert_eq!(report.handovers, 0);
        assert_eq!(report.caught_up, 1);
        assert_eq!(report.planned, 2);

        let recovered = f.rotations.get_rotation(&r.key()).unwrap();
        assert_eq!(recovered.current_owner, "b");
        assert_eq!(recovered.last_rotation_date, late);
        assert_eq!(recovered.next_rotation_date, late + Duration::days(1));

        // Running the same hour again leaves it alone.
        let again = Utc.with_ymd_and_hms(2024, 1, 2, 10, 40, 0).unwrap();
        let report = f.processor.process_tick_at("", again, &cancel).await.unwrap();
        assert_eq!(report.caught_up, 0);
        assert_eq!(f.rotations.get_rotation(&r.key()).unwrap().version, recovered.version);

        // The re-planned handover keeps the rotation moving.
        let next = Utc.with_ymd_and_hms(2024, 1, 3, 10, 6, 0).unwrap();
        let report = f.processor.process_tick_at("", next, &cancel).await.unwrap();
        assert_eq!(report.handovers, 1);
        assert_eq!(report.caught_up, 0);
        assert_eq!(f.rotations.get_rotation(&r.key()).unwrap().current_owner, "a");
    }

    #[tokio::test]
    async fn all_teams_catch_up_spans_partitions() {
        let f = fixture();
        let now = Utc.with_ymd_and_hms(2024, 1, 8, 9, 15, 0).unwrap();
        let stale = now - Duration::days(3);
        let first = seed(&f, "T1", "primary", Frequency::Daily, stale);
        let second = seed(&f, "T2", "primary", Frequency::Daily, stale);
        let fresh = seed(&f, "T3", "primary", Frequency::Weekly, now);

        let report = f
            .processor
            .process_tick_at("", now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.caught_up, 2);
        assert_eq!(f.rotations.get_rotation(&first.key()).unwrap().current_owner, "bob");
        assert_eq!(f.rotations.get_rotation(&second.key()).unwrap().current_owner, "bob");
        assert_eq!(f.rotations.get_rotation(&fresh.key()).unwrap().version, 1);
    }
}
