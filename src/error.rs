use serde::Serialize;
use thiserror::Error;

use crate::maintenance::Step;
use crate::probe::ProbeId;

/// Failure class of a single diagnostic probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    ConnectionFailure,
    Timeout,
    PermissionDenied,
    MalformedResult,
}

impl ProbeErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeErrorKind::ConnectionFailure => "connection_failure",
            ProbeErrorKind::Timeout => "timeout",
            ProbeErrorKind::PermissionDenied => "permission_denied",
            ProbeErrorKind::MalformedResult => "malformed_result",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("probe {} failed ({}): {detail}", probe.as_str(), kind.as_str())]
pub struct ProbeError {
    pub probe: ProbeId,
    pub kind: ProbeErrorKind,
    pub detail: String,
}

impl ProbeError {
    pub fn new(probe: ProbeId, kind: ProbeErrorKind, detail: impl Into<String>) -> Self {
        Self {
            probe,
            kind,
            detail: detail.into(),
        }
    }
}

/// Input rejected before any mutation was attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("invalid identifier {0:?}: expected [A-Za-z_][A-Za-z0-9_]* of at most 63 characters")]
    InvalidIdentifier(String),
    #[error("invalid role {0:?}: expected Admin, Moderator or User")]
    InvalidRole(String),
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("host {0:?} is not in the restart allow-list")]
    UnknownHost(String),
    #[error("user {0} does not exist")]
    UnknownUser(i64),
}

/// How much of a maintenance job reached the target before it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Applied {
    Nothing,
    Complete,
    Unknown,
}

#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaintenanceError {
    #[error("another maintenance job is already running on {target}")]
    Busy { target: String },
    #[error("step `{}` failed: {detail}", step.as_str())]
    StepFailed {
        step: Step,
        detail: String,
        applied: Applied,
    },
    #[error("remote restart on {host} failed: {detail}")]
    RemoteExec {
        host: String,
        detail: String,
        output: String,
        applied: Applied,
    },
    #[error("no restore plan registered for {target}; pass retention_days explicitly")]
    NoRestorePlan { target: String },
}

impl MaintenanceError {
    pub fn applied(&self) -> Applied {
        match self {
            MaintenanceError::Busy { .. } | MaintenanceError::NoRestorePlan { .. } => {
                Applied::Nothing
            }
            MaintenanceError::StepFailed { applied, .. }
            | MaintenanceError::RemoteExec { applied, .. } => *applied,
        }
    }

    /// True when the target is known to be untouched.
    pub fn is_safe_to_retry(&self) -> bool {
        self.applied() == Applied::Nothing
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("access denied: {reason}")]
pub struct PolicyError {
    pub reason: String,
}

/// Errors returned by the role store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("role store query failed: {0}")]
    Database(String),
    #[error("user {0} does not exist")]
    NotFound(i64),
    #[error("refusing to remove the last Admin")]
    LastAdmin,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// Error surface of the inbound core operations.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Maintenance(#[from] MaintenanceError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => CoreError::Validation(ValidationError::UnknownUser(id)),
            StoreError::LastAdmin => CoreError::Policy(PolicyError {
                reason: "the last Admin cannot be demoted or removed".into(),
            }),
            other => CoreError::Store(other),
        }
    }
}

impl CoreError {
    pub fn is_safe_to_retry(&self) -> bool {
        match self {
            CoreError::Maintenance(err) => err.is_safe_to_retry(),
            CoreError::Validation(_) | CoreError::Policy(_) | CoreError::Store(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_application_is_not_safe_to_retry() {
        let err = MaintenanceError::StepFailed {
            step: Step::Commit,
            detail: "timed out".into(),
            applied: Applied::Unknown,
        };
        assert!(!err.is_safe_to_retry());
        assert!(CoreError::from(err).to_string().contains("commit"));
    }

    #[test]
    fn last_admin_store_error_surfaces_as_policy() {
        let err = CoreError::from(StoreError::LastAdmin);
        assert!(matches!(err, CoreError::Policy(_)));
        assert!(err.is_safe_to_retry());
    }
}
