//! Translation of diesel failures into the crate error taxonomy.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use failure::Error as FailureError;

use errors::Error;

/// Postgres reports 55P03 when a NOWAIT lock cannot be granted.
fn is_lock_not_available(err: &DieselError) -> bool {
    match *err {
        DieselError::DatabaseError(_, ref info) => info.message().contains("could not obtain lock"),
        _ => false,
    }
}

/// Maps NOWAIT contention to `Conflict`; anything else passes through
/// untouched.
pub fn lock_contention_error(err: DieselError, subject: &str) -> FailureError {
    if is_lock_not_available(&err) {
        Error::Conflict(format!("{} is locked by another request", subject)).into()
    } else {
        FailureError::from(err)
    }
}

/// Maps a unique-index violation to `Conflict`; everything else passes
/// through untouched.
pub fn unique_violation_error(err: DieselError, subject: &str) -> FailureError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            Error::Conflict(format!("{} already exists", subject)).into()
        }
        e => FailureError::from(e),
    }
}
