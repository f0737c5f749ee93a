use thiserror::Error;

/// Outcomes callers are expected to branch on.
///
/// These travel inside `anyhow::Error`; use [`StoreError::find`] to recover
/// them at the edges (HTTP status mapping, CLI exit codes).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Invalid(String),
}

impl StoreError {
    /// Look through an error chain for a `StoreError`.
    #[must_use]
    pub fn find(err: &anyhow::Error) -> Option<&StoreError> {
        err.chain().find_map(|cause| cause.downcast_ref::<StoreError>())
    }
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

pub(crate) fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}
