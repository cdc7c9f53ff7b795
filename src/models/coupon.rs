//! Model coupons
use std::fmt;
use std::io::Write;
use std::time::SystemTime;

use diesel::deserialize::{self, FromSql};
use diesel::pg::Pg;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::{Uuid as SqlUuid, Varchar};
use uuid::Uuid;

use models::CouponBookId;
use schema::coupons;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, FromSqlRow, AsExpression)]
#[sql_type = "SqlUuid"]
pub struct CouponId(pub Uuid);

impl CouponId {
    pub fn new() -> Self {
        CouponId(Uuid::new_v4())
    }
}

impl fmt::Display for CouponId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromSql<SqlUuid, Pg> for CouponId {
    fn from_sql(bytes: Option<&[u8]>) -> deserialize::Result<Self> {
        FromSql::<SqlUuid, Pg>::from_sql(bytes).map(CouponId)
    }
}

impl ToSql<SqlUuid, Pg> for CouponId {
    fn to_sql<W: Write>(&self, out: &mut Output<W, Pg>) -> serialize::Result {
        ToSql::<SqlUuid, Pg>::to_sql(&self.0, out)
    }
}

/// Coupon code, stored uppercase and unique across all books.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, FromSqlRow, AsExpression)]
#[sql_type = "Varchar"]
pub struct CouponCode(pub String);

impl CouponCode {
    pub fn normalized(code: &str) -> Self {
        CouponCode(code.trim().to_uppercase())
    }
}

impl fmt::Display for CouponCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CouponCode {
    fn from(v: String) -> Self {
        CouponCode(v)
    }
}

impl FromSql<Varchar, Pg> for CouponCode {
    fn from_sql(bytes: Option<&[u8]>) -> deserialize::Result<Self> {
        FromSql::<Varchar, Pg>::from_sql(bytes).map(CouponCode)
    }
}

impl ToSql<Varchar, Pg> for CouponCode {
    fn to_sql<W: Write>(&self, out: &mut Output<W, Pg>) -> serialize::Result {
        ToSql::<Varchar, Pg>::to_sql(&self.0, out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromSqlRow, AsExpression)]
#[sql_type = "Varchar"]
pub enum CouponStatus {
    Available,
    Assigned,
    Locked,
    Redeemed,
    Expired,
}

impl CouponStatus {
    pub fn as_str(&self) -> &'static str {
        match *self {
            CouponStatus::Available => "AVAILABLE",
            CouponStatus::Assigned => "ASSIGNED",
            CouponStatus::Locked => "LOCKED",
            CouponStatus::Redeemed => "REDEEMED",
            CouponStatus::Expired => "EXPIRED",
        }
    }

    /// Statuses from which a redeem or checkout lock may proceed.
    pub fn is_held(&self) -> bool {
        *self == CouponStatus::Assigned || *self == CouponStatus::Locked
    }
}

impl fmt::Display for CouponStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromSql<Varchar, Pg> for CouponStatus {
    fn from_sql(bytes: Option<&[u8]>) -> deserialize::Result<Self> {
        match not_none!(bytes) {
            b"AVAILABLE" => Ok(CouponStatus::Available),
            b"ASSIGNED" => Ok(CouponStatus::Assigned),
            b"LOCKED" => Ok(CouponStatus::Locked),
            b"REDEEMED" => Ok(CouponStatus::Redeemed),
            b"EXPIRED" => Ok(CouponStatus::Expired),
            v => Err(format!("Unrecognized coupon status: {:?}", v).into()),
        }
    }
}

impl ToSql<Varchar, Pg> for CouponStatus {
    fn to_sql<W: Write>(&self, out: &mut Output<W, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())
            .map(|_| IsNull::No)
            .map_err(Into::into)
    }
}

/// DB presenting by coupon
#[derive(Debug, Serialize, Deserialize, Queryable, Clone, Identifiable)]
#[table_name = "coupons"]
pub struct Coupon {
    pub id: CouponId,
    pub coupon_book_id: CouponBookId,
    pub code: CouponCode,
    pub status: CouponStatus,
    pub version: i32,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

/// Payload for bulk-inserting coupons
#[derive(Serialize, Deserialize, Insertable, Clone, Debug)]
#[table_name = "coupons"]
pub struct NewCoupon {
    pub coupon_book_id: CouponBookId,
    pub code: CouponCode,
    pub status: CouponStatus,
}

impl NewCoupon {
    pub fn available(coupon_book_id: CouponBookId, code: CouponCode) -> Self {
        NewCoupon {
            coupon_book_id,
            code,
            status: CouponStatus::Available,
        }
    }
}

/// `(code, status)` projection used by the book coupon listing.
#[derive(Debug, Serialize, Queryable, Clone, PartialEq)]
pub struct CouponPreview {
    pub code: CouponCode,
    pub status: CouponStatus,
}
