//! Model coupon books
use std::fmt;
use std::io::Write;
use std::time::SystemTime;

use diesel::deserialize::{self, FromSql};
use diesel::pg::Pg;
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Uuid as SqlUuid;
use serde_json;
use uuid::Uuid;
use validator::Validate;

use models::validation_rules::*;
use schema::coupon_books;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, FromSqlRow, AsExpression)]
#[sql_type = "SqlUuid"]
pub struct CouponBookId(pub Uuid);

impl CouponBookId {
    pub fn new() -> Self {
        CouponBookId(Uuid::new_v4())
    }
}

impl fmt::Display for CouponBookId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromSql<SqlUuid, Pg> for CouponBookId {
    fn from_sql(bytes: Option<&[u8]>) -> deserialize::Result<Self> {
        FromSql::<SqlUuid, Pg>::from_sql(bytes).map(CouponBookId)
    }
}

impl ToSql<SqlUuid, Pg> for CouponBookId {
    fn to_sql<W: Write>(&self, out: &mut Output<W, Pg>) -> serialize::Result {
        ToSql::<SqlUuid, Pg>::to_sql(&self.0, out)
    }
}

/// DB presenting by coupon book
#[derive(Debug, Serialize, Deserialize, Queryable, Clone, Identifiable)]
#[table_name = "coupon_books"]
pub struct CouponBook {
    pub id: CouponBookId,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub valid_from: SystemTime,
    pub valid_until: SystemTime,
    pub max_redemptions_per_user: Option<i32>,
    pub max_assignments_per_user: Option<i32>,
    pub code_pattern: Option<String>,
    pub max_codes: Option<i32>,
    pub total_codes: i32,
    pub metadata: serde_json::Value,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl CouponBook {
    /// Whether `now` falls inside the book validity window.
    pub fn is_within_window(&self, now: SystemTime) -> bool {
        self.valid_from <= now && now <= self.valid_until
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now > self.valid_until
    }
}

/// Payload for creating coupon book
#[derive(Serialize, Deserialize, Insertable, Clone, Validate, Debug)]
#[table_name = "coupon_books"]
#[validate(schema(function = "validate_book_window", skip_on_field_errors = "true"))]
pub struct NewCouponBook {
    #[validate(length(min = "1", max = "255", message = "Name must not be empty"))]
    pub name: String,
    pub description: Option<String>,
    pub valid_from: SystemTime,
    pub valid_until: SystemTime,
    pub max_redemptions_per_user: Option<i32>,
    pub max_assignments_per_user: Option<i32>,
    pub code_pattern: Option<String>,
    pub max_codes: Option<i32>,
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
}

fn default_metadata() -> serde_json::Value {
    json!({})
}

/// Per-status coupon counters reported with a book.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct CouponBookStatistics {
    pub available: i64,
    pub assigned: i64,
    pub locked: i64,
    pub redeemed: i64,
}

#[derive(Debug, Serialize, Clone)]
pub struct CouponBookWithStatistics {
    pub book: CouponBook,
    pub statistics: CouponBookStatistics,
}

/// Result of a bulk code upload or generation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CodeUploadSummary {
    pub uploaded: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub new_total: i32,
    pub max_codes: Option<i32>,
}
