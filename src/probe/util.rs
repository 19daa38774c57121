use sqlx::error::DatabaseError;

use crate::error::{ProbeError, ProbeErrorKind};
use crate::probe::ProbeId;

pub fn is_missing_relation(error: &dyn DatabaseError) -> bool {
    matches!(error.code().as_deref(), Some("42P01") | Some("42704"))
}

pub fn is_missing_column(error: &dyn DatabaseError) -> bool {
    matches!(error.code().as_deref(), Some("42703"))
}

pub fn is_missing_function(error: &dyn DatabaseError) -> bool {
    matches!(error.code().as_deref(), Some("42883"))
}

pub fn is_permission_denied(error: &dyn DatabaseError) -> bool {
    matches!(
        error.code().as_deref(),
        Some("42501") | Some("28000") | Some("28P01")
    )
}

pub fn is_statement_timeout(error: &dyn DatabaseError) -> bool {
    // 57014 query_canceled (statement_timeout), 55P03 lock_not_available (lock_timeout)
    matches!(error.code().as_deref(), Some("57014") | Some("55P03"))
}

pub fn is_connection_class(error: &dyn DatabaseError) -> bool {
    error
        .code()
        .map(|code| code.starts_with("08") || code.starts_with("57P"))
        .unwrap_or(false)
}

/// Map a driver error onto the probe failure taxonomy.
pub fn classify(probe: ProbeId, error: sqlx::Error) -> ProbeError {
    if let sqlx::Error::Database(db_err) = &error {
        let db_err = db_err.as_ref();
        if is_missing_relation(db_err) || is_missing_column(db_err) || is_missing_function(db_err)
        {
            // e.g. pg_stat_statements not installed or collector tables absent
            return ProbeError::new(
                probe,
                ProbeErrorKind::MalformedResult,
                format!("required catalog object missing: {}", db_err.message()),
            );
        }
    }

    let kind = match &error {
        sqlx::Error::Database(db_err) => {
            let db_err = db_err.as_ref();
            if is_permission_denied(db_err) {
                ProbeErrorKind::PermissionDenied
            } else if is_statement_timeout(db_err) {
                ProbeErrorKind::Timeout
            } else if is_connection_class(db_err) {
                ProbeErrorKind::ConnectionFailure
            } else {
                ProbeErrorKind::MalformedResult
            }
        }
        sqlx::Error::PoolTimedOut => ProbeErrorKind::Timeout,
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::RowNotFound => ProbeErrorKind::MalformedResult,
        _ => ProbeErrorKind::ConnectionFailure,
    };

    ProbeError::new(probe, kind, error.to_string())
}
