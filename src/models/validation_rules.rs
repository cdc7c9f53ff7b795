use std::borrow::Cow;
use std::collections::HashMap;

use regex::Regex;
use validator::{ValidationError, ValidationErrors};

use models::NewCouponBook;

/// Codes are stored uppercase; the grammar below is checked after
/// normalization.
pub const CODE_MIN_LENGTH: usize = 6;
pub const CODE_MAX_LENGTH: usize = 32;

lazy_static! {
    static ref CODE_VALIDATION_RE: Regex =
        Regex::new(&format!("^[A-Z0-9_-]{{{},{}}}$", CODE_MIN_LENGTH, CODE_MAX_LENGTH)).unwrap();
}

pub fn is_valid_code(code: &str) -> bool {
    CODE_VALIDATION_RE.is_match(code)
}

fn book_error(message: &'static str) -> ValidationError {
    ValidationError {
        code: Cow::from("coupon_book"),
        message: Some(Cow::from(message)),
        params: HashMap::new(),
    }
}

/// Struct-level rules for a new coupon book: a non-empty validity
/// interval, positive counters, and a code cap wherever a generation
/// pattern is set.
pub fn validate_book_window(book: &NewCouponBook) -> Result<(), ValidationError> {
    if book.valid_from >= book.valid_until {
        return Err(book_error("valid_from must precede valid_until."));
    }
    if book.code_pattern.is_some() && book.max_codes.is_none() {
        return Err(book_error("max_codes is required when code_pattern is set."));
    }
    let counters = [
        book.max_redemptions_per_user,
        book.max_assignments_per_user,
        book.max_codes,
    ];
    if counters.iter().any(|counter| counter.map(|value| value < 1).unwrap_or(false)) {
        return Err(book_error("Limits must be positive when present."));
    }
    Ok(())
}

/// Builds a one-field `ValidationErrors` for checks that live outside
/// the derive-driven payload validation.
pub fn validation_error(field: &'static str, message: &'static str) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    errors.add(
        field,
        ValidationError {
            code: Cow::from(field),
            message: Some(Cow::from(message)),
            params: HashMap::new(),
        },
    );
    errors
}
