//! Sync job model and intake validation
//!
//! The typed unit of work: which dataset to synchronize, how, and since when.
//! Structural validation runs synchronously at intake: a malformed request is
//! rejected before any job row exists.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// How the extraction predicate is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// First full load of a dataset.
    InitialSync,
    /// Window-bounded scan over the partition column.
    IncrementalSync,
    /// Destructive clear of the target followed by a full reload.
    FullRefresh,
    /// Operator-triggered window-bounded scan.
    ManualSync,
    /// Reload of the last `days` days.
    PartialRefresh,
    /// Backfill of explicit primary-key ranges.
    MissingSync,
    /// Tail scan strictly after a known primary key.
    NewRecordsSync,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::InitialSync => "initial_sync",
            SyncAction::IncrementalSync => "incremental_sync",
            SyncAction::FullRefresh => "full_refresh",
            SyncAction::ManualSync => "manual_sync",
            SyncAction::PartialRefresh => "partial_refresh",
            SyncAction::MissingSync => "missing_sync",
            SyncAction::NewRecordsSync => "new_records_sync",
        }
    }
}

impl std::str::FromStr for SyncAction {
    type Err = JobValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial_sync" => Ok(SyncAction::InitialSync),
            "incremental_sync" => Ok(SyncAction::IncrementalSync),
            "full_refresh" => Ok(SyncAction::FullRefresh),
            "manual_sync" => Ok(SyncAction::ManualSync),
            "partial_refresh" => Ok(SyncAction::PartialRefresh),
            "missing_sync" => Ok(SyncAction::MissingSync),
            "new_records_sync" => Ok(SyncAction::NewRecordsSync),
            other => Err(JobValidationError::UnknownAction(other.to_string())),
        }
    }
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An explicit primary-key range to backfill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: i64,
    pub end: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_count: Option<i64>,
}

/// A sync request as submitted by an external trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub dataset_id: String,
    pub action: SyncAction,
    /// Actor reference for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<Uuid>,
    /// Window size for `partial_refresh`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<u32>,
    /// Primary-key ranges for `missing_sync`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Vec<KeyRange>>,
    /// Primary-key column override for range-based actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk_column: Option<String>,
    /// Exclusive lower bound for `new_records_sync`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_id: Option<i64>,
    /// Caps total rows extracted, for diagnostic bounded runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl SyncRequest {
    pub fn new(dataset_id: impl Into<String>, action: SyncAction) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            action,
            triggered_by: None,
            days: None,
            ranges: None,
            pk_column: None,
            after_id: None,
            limit: None,
        }
    }

    /// Enforce the action/field matrix: each action's required field must be
    /// present and fields belonging to other actions must be absent. `limit`
    /// is a diagnostic bound allowed everywhere; `pk_column` only accompanies
    /// the range-based actions.
    pub fn validate(&self) -> Result<(), JobValidationError> {
        if self.dataset_id.trim().is_empty() {
            return Err(JobValidationError::MissingDataset);
        }

        match self.action {
            SyncAction::PartialRefresh => {
                let days = self.days.ok_or(JobValidationError::MissingField {
                    action: self.action,
                    field: "days",
                })?;
                if days == 0 {
                    return Err(JobValidationError::InvalidField {
                        action: self.action,
                        field: "days",
                        reason: "must be greater than 0",
                    });
                }
                self.reject_fields(&[
                    ("ranges", self.ranges.is_some()),
                    ("after_id", self.after_id.is_some()),
                    ("pk_column", self.pk_column.is_some()),
                ])
            }
            SyncAction::MissingSync => {
                let ranges = self
                    .ranges
                    .as_ref()
                    .ok_or(JobValidationError::MissingField {
                        action: self.action,
                        field: "ranges",
                    })?;
                if ranges.is_empty() {
                    return Err(JobValidationError::InvalidField {
                        action: self.action,
                        field: "ranges",
                        reason: "must not be empty",
                    });
                }
                if ranges.iter().any(|r| r.end < r.start) {
                    return Err(JobValidationError::InvalidField {
                        action: self.action,
                        field: "ranges",
                        reason: "each range needs start <= end",
                    });
                }
                self.reject_fields(&[
                    ("days", self.days.is_some()),
                    ("after_id", self.after_id.is_some()),
                ])
            }
            SyncAction::NewRecordsSync => {
                self.after_id.ok_or(JobValidationError::MissingField {
                    action: self.action,
                    field: "after_id",
                })?;
                self.reject_fields(&[
                    ("days", self.days.is_some()),
                    ("ranges", self.ranges.is_some()),
                ])
            }
            SyncAction::InitialSync
            | SyncAction::IncrementalSync
            | SyncAction::FullRefresh
            | SyncAction::ManualSync => self.reject_fields(&[
                ("days", self.days.is_some()),
                ("ranges", self.ranges.is_some()),
                ("after_id", self.after_id.is_some()),
                ("pk_column", self.pk_column.is_some()),
            ]),
        }
    }

    fn reject_fields(
        &self,
        fields: &[(&'static str, bool)],
    ) -> Result<(), JobValidationError> {
        for (field, present) in fields {
            if *present {
                return Err(JobValidationError::ForeignField {
                    action: self.action,
                    field,
                });
            }
        }
        Ok(())
    }
}

/// Structural rejection of a sync request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobValidationError {
    #[error("dataset_id is required")]
    MissingDataset,

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("{action} requires {field}")]
    MissingField {
        action: SyncAction,
        field: &'static str,
    },

    #[error("{action} rejects {field}: {reason}")]
    InvalidField {
        action: SyncAction,
        field: &'static str,
        reason: &'static str,
    },

    #[error("{field} is not meaningful for {action}")]
    ForeignField {
        action: SyncAction,
        field: &'static str,
    },
}

/// Lifecycle state of a persisted job. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::str::FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(anyhow::anyhow!("unknown job state: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_actions_validate_bare() {
        for action in [
            SyncAction::InitialSync,
            SyncAction::IncrementalSync,
            SyncAction::FullRefresh,
            SyncAction::ManualSync,
        ] {
            assert!(SyncRequest::new("sales", action).validate().is_ok());
        }
    }

    #[test]
    fn test_partial_refresh_requires_days() {
        let mut request = SyncRequest::new("sales", SyncAction::PartialRefresh);
        assert_eq!(
            request.validate(),
            Err(JobValidationError::MissingField {
                action: SyncAction::PartialRefresh,
                field: "days"
            })
        );

        request.days = Some(7);
        assert!(request.validate().is_ok());

        request.days = Some(0);
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_missing_sync_requires_ranges() {
        let mut request = SyncRequest::new("sales", SyncAction::MissingSync);
        assert!(request.validate().is_err());

        request.ranges = Some(vec![]);
        assert!(request.validate().is_err());

        request.ranges = Some(vec![KeyRange {
            start: 100,
            end: 200,
            missing_count: Some(17),
        }]);
        assert!(request.validate().is_ok());

        request.ranges = Some(vec![KeyRange {
            start: 200,
            end: 100,
            missing_count: None,
        }]);
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_new_records_sync_requires_after_id() {
        let mut request = SyncRequest::new("sales", SyncAction::NewRecordsSync);
        assert!(request.validate().is_err());

        request.after_id = Some(500);
        request.limit = Some(2000);
        request.pk_column = Some("id".into());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_foreign_fields_rejected() {
        let mut request = SyncRequest::new("sales", SyncAction::IncrementalSync);
        request.days = Some(7);
        assert_eq!(
            request.validate(),
            Err(JobValidationError::ForeignField {
                action: SyncAction::IncrementalSync,
                field: "days"
            })
        );

        let mut request = SyncRequest::new("sales", SyncAction::NewRecordsSync);
        request.after_id = Some(1);
        request.ranges = Some(vec![KeyRange {
            start: 1,
            end: 2,
            missing_count: None,
        }]);
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_limit_is_allowed_everywhere() {
        let mut request = SyncRequest::new("sales", SyncAction::InitialSync);
        request.limit = Some(1000);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_empty_dataset_rejected() {
        let request = SyncRequest::new("  ", SyncAction::InitialSync);
        assert_eq!(request.validate(), Err(JobValidationError::MissingDataset));
    }

    #[test]
    fn test_action_round_trip() {
        for action in [
            SyncAction::InitialSync,
            SyncAction::IncrementalSync,
            SyncAction::FullRefresh,
            SyncAction::ManualSync,
            SyncAction::PartialRefresh,
            SyncAction::MissingSync,
            SyncAction::NewRecordsSync,
        ] {
            assert_eq!(action.as_str().parse::<SyncAction>().unwrap(), action);
        }
        assert!("resync_all".parse::<SyncAction>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }
}
