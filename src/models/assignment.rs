//! Model coupon assignments
use std::fmt;
use std::io::Write;
use std::time::SystemTime;

use diesel::deserialize::{self, FromSql};
use diesel::pg::Pg;
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::{Uuid as SqlUuid, Varchar};
use serde_json;
use uuid::Uuid;
use validator::Validate;

use models::{CouponCode, CouponId, CouponStatus};
use schema::coupon_assignments;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, FromSqlRow, AsExpression)]
#[sql_type = "SqlUuid"]
pub struct AssignmentId(pub Uuid);

impl AssignmentId {
    pub fn new() -> Self {
        AssignmentId(Uuid::new_v4())
    }
}

impl fmt::Display for AssignmentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromSql<SqlUuid, Pg> for AssignmentId {
    fn from_sql(bytes: Option<&[u8]>) -> deserialize::Result<Self> {
        FromSql::<SqlUuid, Pg>::from_sql(bytes).map(AssignmentId)
    }
}

impl ToSql<SqlUuid, Pg> for AssignmentId {
    fn to_sql<W: Write>(&self, out: &mut Output<W, Pg>) -> serialize::Result {
        ToSql::<SqlUuid, Pg>::to_sql(&self.0, out)
    }
}

/// Opaque identifier of the already-authenticated subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, FromSqlRow, AsExpression)]
#[sql_type = "Varchar"]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for UserId {
    fn from(v: String) -> Self {
        UserId(v)
    }
}

impl FromSql<Varchar, Pg> for UserId {
    fn from_sql(bytes: Option<&[u8]>) -> deserialize::Result<Self> {
        FromSql::<Varchar, Pg>::from_sql(bytes).map(UserId)
    }
}

impl ToSql<Varchar, Pg> for UserId {
    fn to_sql<W: Write>(&self, out: &mut Output<W, Pg>) -> serialize::Result {
        ToSql::<Varchar, Pg>::to_sql(&self.0, out)
    }
}

/// DB presenting by assignment of a coupon to a user
#[derive(Debug, Serialize, Deserialize, Queryable, Clone, Identifiable)]
#[table_name = "coupon_assignments"]
pub struct CouponAssignment {
    pub id: AssignmentId,
    pub coupon_id: CouponId,
    pub user_id: UserId,
    pub assigned_at: SystemTime,
    pub locked_at: Option<SystemTime>,
    pub lock_expires_at: Option<SystemTime>,
    pub redeemed_at: Option<SystemTime>,
    pub redemption_count: i32,
    pub metadata: serde_json::Value,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

/// Payload for binding a coupon to a user
#[derive(Serialize, Deserialize, Insertable, Clone, Debug)]
#[table_name = "coupon_assignments"]
pub struct NewCouponAssignment {
    pub coupon_id: CouponId,
    pub user_id: UserId,
    pub assigned_at: SystemTime,
}

impl NewCouponAssignment {
    pub fn now(coupon_id: CouponId, user_id: UserId) -> Self {
        NewCouponAssignment {
            coupon_id,
            user_id,
            assigned_at: SystemTime::now(),
        }
    }
}

/// Checkout reservation request. Bounds per the lock protocol; the
/// default is applied when the field is absent.
#[derive(Serialize, Deserialize, Validate, Clone, Debug, Default)]
pub struct LockPayload {
    #[validate(range(min = "30", max = "600", message = "Lock duration must be between 30 and 600 seconds"))]
    pub duration: Option<i64>,
}

impl LockPayload {
    pub const DEFAULT_DURATION_SECS: i64 = 300;

    pub fn duration_secs(&self) -> i64 {
        self.duration.unwrap_or(Self::DEFAULT_DURATION_SECS)
    }
}

/// Redemption request carrying an optional metadata bag to merge into
/// the assignment row.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RedeemPayload {
    pub metadata: Option<serde_json::Value>,
}

/// Outcome of binding a coupon to a user.
#[derive(Debug, Serialize, Clone)]
pub struct AssignedCoupon {
    pub code: CouponCode,
    pub coupon_id: CouponId,
    pub assignment_id: AssignmentId,
    pub assigned_at: SystemTime,
}

/// Outcome of taking a checkout reservation.
#[derive(Debug, Serialize, Clone)]
pub struct LockOutcome {
    pub code: CouponCode,
    pub status: CouponStatus,
    pub locked_at: SystemTime,
    pub lock_expires_at: SystemTime,
}

/// Outcome of releasing a checkout reservation.
#[derive(Debug, Serialize, Clone)]
pub struct UnlockOutcome {
    pub code: CouponCode,
    pub status: CouponStatus,
}

/// Outcome of a successful redemption.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct RedemptionOutcome {
    pub code: CouponCode,
    pub redeemed_at: SystemTime,
    pub redemption_count: i32,
    pub remaining: Option<i32>,
    pub fully_redeemed: bool,
}

/// Read-only projection answering "what is this coupon to this caller".
#[derive(Debug, Serialize, Clone)]
pub struct CouponStatusView {
    pub code: CouponCode,
    pub status: CouponStatus,
    pub owned_by_caller: bool,
    pub locked: bool,
    pub lock_expires_at: Option<SystemTime>,
    pub redemption_count: i32,
    pub max_redemptions_per_user: Option<i32>,
    pub valid_until: SystemTime,
}

/// One row of the caller's coupon listing.
#[derive(Debug, Serialize, Clone)]
pub struct UserCoupon {
    pub code: CouponCode,
    pub status: CouponStatus,
    pub assigned_at: SystemTime,
    pub redeemed_at: Option<SystemTime>,
    pub redemption_count: i32,
}
