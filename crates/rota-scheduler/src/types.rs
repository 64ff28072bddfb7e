use chrono::{DateTime, Duration, DurationRound, Utc};
use rota_core::time::format_ts;
use rota_rotations::{Rotation, RotationKey};
use serde::{Deserialize, Serialize};

/// What a scheduled event does when its hour comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    /// Tell the upcoming owner their shift is near.
    Reminder,
    /// Advance the rotation to the next owner.
    Handover,
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventAction::Reminder => "reminder",
            EventAction::Handover => "handover",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EventAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reminder" => Ok(EventAction::Reminder),
            "handover" => Ok(EventAction::Handover),
            other => Err(format!("unknown event action: {other}")),
        }
    }
}

/// Partition key for the hour an instant falls in, e.g. `2024-01-01T15`.
///
/// Lexicographic order of buckets equals chronological order.
pub fn hour_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H").to_string()
}

/// Start of the hour containing `at`.
pub fn hour_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::hours(1)).unwrap_or(at)
}

/// A persisted, append-only schedule entry.
///
/// Keyed by `(scheduled_hour, event_id)`. The event id has the form
/// `{rotation_id}#{action}#{event_time}` so events of one bucket sort by
/// rotation, then action, then time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEvent {
    /// Hour bucket; partition key.
    pub scheduled_hour: String,
    /// Sort key within the bucket.
    pub event_id: String,
    /// `RotationKey` in its canonical `{team_id}:{label}` form.
    pub rotation_id: String,
    pub action: EventAction,
    /// Where notifications for this event should go.
    #[serde(alias = "slack_channel_id")]
    pub target_channel: String,
    /// Owner who takes over (handover) or is about to (reminder).
    pub next_owner: String,
    pub event_time: DateTime<Utc>,
    /// Unix seconds after which the event is dead and may be deleted.
    pub expires_at: i64,
}

impl ScheduleEvent {
    /// Build an event for `rotation` firing at `event_time`, live for `ttl`
    /// past it. Bucket and id are derived from the other fields.
    pub fn new(
        rotation: &RotationKey,
        action: EventAction,
        target_channel: impl Into<String>,
        next_owner: impl Into<String>,
        event_time: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let rotation_id = rotation.format();
        Self {
            scheduled_hour: hour_bucket(event_time),
            event_id: format!("{rotation_id}#{action}#{}", format_ts(event_time)),
            rotation_id,
            action,
            target_channel: target_channel.into(),
            next_owner: next_owner.into(),
            event_time,
            expires_at: (event_time + ttl).timestamp(),
        }
    }

    /// True once `expires_at` has been reached.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now.timestamp()
    }
}

/// The reminder and handover for a rotation's upcoming cycle.
///
/// The reminder fires `lead` before `next_rotation_date` and is omitted when
/// `lead` is not positive. Returns nothing for an empty roster.
pub fn plan_events(
    rotation: &Rotation,
    target_channel: &str,
    lead: Duration,
    ttl: Duration,
) -> Vec<ScheduleEvent> {
    let Some(next_owner) = rotation.upcoming_owner() else {
        return Vec::new();
    };
    let key = rotation.key();
    let handover_at = rotation.next_rotation_date;

    let mut events = Vec::with_capacity(2);
    if lead > Duration::zero() {
        events.push(ScheduleEvent::new(
            &key,
            EventAction::Reminder,
            target_channel,
            next_owner,
            handover_at - lead,
            ttl,
        ));
    }
    events.push(ScheduleEvent::new(
        &key,
        EventAction::Handover,
        target_channel,
        next_owner,
        handover_at,
        ttl,
    ));
    events
}

/// Outbound notice produced by a tick; delivery is someone else's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub rotation_id: String,
    pub action: EventAction,
    pub target_channel: String,
    /// Upcoming owner for reminders, new owner for handovers.
    pub owner: String,
    /// Originating event; `None` for catch-up handovers.
    pub event_id: Option<String>,
    pub fired_at: DateTime<Utc>,
}

/// Per-outcome counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub bucket: String,
    pub reminders: usize,
    pub handovers: usize,
    /// Catch-up advances of overdue rotations that had no event this tick.
    pub caught_up: usize,
    pub skipped_expired: usize,
    /// Handovers whose rotation had already advanced this hour.
    pub already_applied: usize,
    /// Follow-up events appended to the index.
    pub planned: usize,
    pub failures: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rota_core::Frequency;

    #[test]
    fn bucket_is_hour_prefix() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 15, 42, 7).unwrap();
        assert_eq!(hour_bucket(t), "2024-01-01T15");
        assert_eq!(hour_start(t), Utc.with_ymd_and_hms(2024, 1, 1, 15, 0, 0).unwrap());
    }

    #[test]
    fn event_id_encodes_rotation_action_time() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 15, 30, 0).unwrap();
        let e = ScheduleEvent::new(
            &RotationKey::new("T1", "primary"),
            EventAction::Handover,
            "C1",
            "bob",
            t,
            Duration::hours(48),
        );
        assert_eq!(e.scheduled_hour, "2024-01-01T15");
        assert_eq!(e.event_id, "T1:primary#handover#2024-01-01T15:30:00.000000Z");
        assert_eq!(e.rotation_id, "T1:primary");
        assert_eq!(e.expires_at, t.timestamp() + 48 * 3600);
        assert!(!e.is_expired(t));
        assert!(e.is_expired(t + Duration::hours(48)));
    }

    #[test]
    fn plan_targets_upcoming_owner() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let r = Rotation::new(
            RotationKey::new("T1", "primary"),
            vec!["alice".into(), "bob".into()],
            Frequency::Weekly,
            start,
        );
        let events = plan_events(&r, "C1", Duration::hours(24), Duration::hours(48));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, EventAction::Reminder);
        assert_eq!(events[0].event_time, r.next_rotation_date - Duration::hours(24));
        assert_eq!(events[1].action, EventAction::Handover);
        assert_eq!(events[1].event_time, r.next_rotation_date);
        assert!(events.iter().all(|e| e.next_owner == "bob"));

        let no_reminder = plan_events(&r, "C1", Duration::zero(), Duration::hours(48));
        assert_eq!(no_reminder.len(), 1);
    }

    #[test]
    fn accepts_legacy_channel_attribute() {
        let json = r#"{
            "scheduled_hour": "2024-01-01T15",
            "event_id": "T1:p#reminder#x",
            "rotation_id": "T1:p",
            "action": "reminder",
            "slack_channel_id": "C9",
            "next_owner": "bob",
            "event_time": "2024-01-01T15:00:00Z",
            "expires_at": 0
        }"#;
        let e: ScheduleEvent = serde_json::from_str(json).unwrap();
        assert_eq!(e.target_channel, "C9");
    }
}
