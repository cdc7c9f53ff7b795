use failure::{Error as FailureError, Fail};
use validator::ValidationErrors;

/// Kinds of failure the coupon engine distinguishes. Every error chain
/// produced by the service layer bottoms out in one of these; anything
/// without a recognizable kind is treated as `Internal` by the caller.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "Not found")]
    NotFound,
    #[fail(display = "Validation error: {}", _0)]
    Validate(ValidationErrors),
    #[fail(display = "Conflict: {}", _0)]
    Conflict(String),
    #[fail(display = "Business rule violation: {}", _0)]
    Business(String),
    #[fail(display = "Internal error")]
    Internal,
}

/// Walks the cause chain and returns the innermost recognized kind.
pub fn kind_of(err: &FailureError) -> Option<&Error> {
    err.iter_chain().filter_map(|f| f.downcast_ref::<Error>()).next()
}
