use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Approval state of an override.
///
/// `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideStatus {
    Pending,
    Approved,
    Rejected,
}

impl OverrideStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OverrideStatus::Pending)
    }
}

impl std::fmt::Display for OverrideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OverrideStatus::Pending => "pending",
            OverrideStatus::Approved => "approved",
            OverrideStatus::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OverrideStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OverrideStatus::Pending),
            "approved" => Ok(OverrideStatus::Approved),
            "rejected" => Ok(OverrideStatus::Rejected),
            other => Err(format!("unknown override status: {other}")),
        }
    }
}

/// The outcome an actor records on a pending override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    /// Status the override lands in after this decision.
    pub fn status(&self) -> OverrideStatus {
        match self {
            Decision::Approve => OverrideStatus::Approved,
            Decision::Reject => OverrideStatus::Rejected,
        }
    }
}

/// A persisted coverage override request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    /// UUIDv7 primary key, time-sortable.
    pub override_id: String,
    pub requested_by: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub status: OverrideStatus,
    /// Actor who approved or rejected the override; `None` while pending.
    ///
    /// Serialised as `approved_by` for both outcomes, matching the stored
    /// record shape.
    #[serde(rename = "approved_by", default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Override {
    /// The decision taken on this override, if any.
    pub fn decision(&self) -> Option<Decision> {
        match self.status {
            OverrideStatus::Pending => None,
            OverrideStatus::Approved => Some(Decision::Approve),
            OverrideStatus::Rejected => Some(Decision::Reject),
        }
    }

    /// The `approved_by` attribute as stored: approver, or rejecter on rejection.
    pub fn approved_by(&self) -> Option<&str> {
        self.decided_by.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_roundtrip() {
        for status in [
            OverrideStatus::Pending,
            OverrideStatus::Approved,
            OverrideStatus::Rejected,
        ] {
            assert_eq!(status.to_string().parse::<OverrideStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<OverrideStatus>().is_err());
    }

    #[test]
    fn rejecter_is_serialised_as_approved_by() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let o = Override {
            override_id: "o-1".into(),
            requested_by: "alice".into(),
            start_date: ts,
            end_date: ts,
            status: OverrideStatus::Rejected,
            decided_by: Some("bob".into()),
            created_at: ts,
            updated_at: ts,
        };
        let json = serde_json::to_value(&o).unwrap();
        assert_eq!(json["approved_by"], "bob");
        assert_eq!(json["status"], "rejected");
        assert_eq!(o.decision(), Some(Decision::Reject));
    }
}
