//! Repo for coupon assignments
use std::time::SystemTime;

use diesel;
use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::query_dsl::RunQueryDsl;
use diesel::Connection;
use failure::Error as FailureError;
use serde_json;

use models::*;
use repos::error::{lock_contention_error, unique_violation_error};
use repos::types::RepoResult;
use schema::coupon_assignments::dsl as Assignments;
use schema::coupons::dsl as Coupons;

/// Assignments repository, responsible for user bindings of coupons
pub struct CouponAssignmentsRepoImpl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> {
    pub db_conn: &'a T,
}

pub trait CouponAssignmentsRepo {
    /// Binds a coupon to a user. A duplicate binding surfaces as
    /// `Conflict` via the unique (coupon, user) index.
    fn create(&self, payload: NewCouponAssignment) -> RepoResult<CouponAssignment>;

    /// The user's binding of a coupon, if any
    fn find_for_user(&self, coupon_id_arg: CouponId, user_id_arg: &UserId) -> RepoResult<Option<CouponAssignment>>;

    /// Same lookup, taking the row lock without waiting
    fn find_for_user_for_update(
        &self,
        coupon_id_arg: CouponId,
        user_id_arg: &UserId,
    ) -> RepoResult<Option<CouponAssignment>>;

    /// Historical binding count of a user inside one book. Rows are
    /// never deleted, so this counts all bindings ever made.
    fn count_for_user_in_book(&self, book_id_arg: CouponBookId, user_id_arg: &UserId) -> RepoResult<i64>;

    /// Stamps the checkout reservation window onto a locked row
    fn set_lock(&self, id_arg: AssignmentId, expires_at: SystemTime) -> RepoResult<CouponAssignment>;

    /// Clears the checkout reservation from a locked row
    fn clear_lock(&self, id_arg: AssignmentId) -> RepoResult<CouponAssignment>;

    /// Writes the outcome of a redemption: counter, timestamp, merged
    /// metadata; drops any reservation fields.
    fn record_redemption(
        &self,
        id_arg: AssignmentId,
        new_count: i32,
        redeemed_at: SystemTime,
        metadata: serde_json::Value,
    ) -> RepoResult<CouponAssignment>;

    /// Page of the user's bindings with their coupons, newest first
    fn list_for_user(&self, user_id_arg: &UserId, offset: i64, limit: i64) -> RepoResult<Vec<(CouponAssignment, Coupon)>>;
}

impl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> CouponAssignmentsRepoImpl<'a, T> {
    pub fn new(db_conn: &'a T) -> Self {
        Self { db_conn }
    }
}

impl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> CouponAssignmentsRepo
    for CouponAssignmentsRepoImpl<'a, T>
{
    fn create(&self, payload: NewCouponAssignment) -> RepoResult<CouponAssignment> {
        debug!("Create new assignment {:?}.", payload);
        diesel::insert_into(Assignments::coupon_assignments)
            .values(&payload)
            .get_result::<CouponAssignment>(self.db_conn)
            .map_err(|e| unique_violation_error(e, "coupon assignment"))
            .map_err(|e: FailureError| e.context(format!("Creates new assignment: {:?} error occurred", payload)).into())
    }

    fn find_for_user(&self, coupon_id_arg: CouponId, user_id_arg: &UserId) -> RepoResult<Option<CouponAssignment>> {
        debug!("Find assignment of coupon {} for user {}.", coupon_id_arg, user_id_arg);
        Assignments::coupon_assignments
            .filter(Assignments::coupon_id.eq(coupon_id_arg))
            .filter(Assignments::user_id.eq(user_id_arg))
            .get_result(self.db_conn)
            .optional()
            .map_err(From::from)
            .map_err(|e: FailureError| {
                e.context(format!(
                    "Find assignment of coupon: {} for user: {} error occurred",
                    coupon_id_arg, user_id_arg
                )).into()
            })
    }

    fn find_for_user_for_update(
        &self,
        coupon_id_arg: CouponId,
        user_id_arg: &UserId,
    ) -> RepoResult<Option<CouponAssignment>> {
        debug!("Find and lock assignment of coupon {} for user {}.", coupon_id_arg, user_id_arg);
        Assignments::coupon_assignments
            .filter(Assignments::coupon_id.eq(coupon_id_arg))
            .filter(Assignments::user_id.eq(user_id_arg))
            .for_update()
            .no_wait()
            .get_result(self.db_conn)
            .optional()
            .map_err(|e| lock_contention_error(e, &format!("Assignment of coupon {}", coupon_id_arg)))
            .map_err(|e: FailureError| {
                e.context(format!(
                    "Find and lock assignment of coupon: {} for user: {} error occurred",
                    coupon_id_arg, user_id_arg
                )).into()
            })
    }

    fn count_for_user_in_book(&self, book_id_arg: CouponBookId, user_id_arg: &UserId) -> RepoResult<i64> {
        debug!("Count assignments of user {} in book {}.", user_id_arg, book_id_arg);
        Assignments::coupon_assignments
            .inner_join(Coupons::coupons)
            .filter(Coupons::coupon_book_id.eq(book_id_arg))
            .filter(Assignments::user_id.eq(user_id_arg))
            .count()
            .get_result(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| {
                e.context(format!(
                    "Count assignments of user: {} in book: {} error occurred",
                    user_id_arg, book_id_arg
                )).into()
            })
    }

    fn set_lock(&self, id_arg: AssignmentId, expires_at: SystemTime) -> RepoResult<CouponAssignment> {
        debug!("Set reservation on assignment {}.", id_arg);
        let now = SystemTime::now();
        let filtered = Assignments::coupon_assignments.filter(Assignments::id.eq(&id_arg));
        diesel::update(filtered)
            .set((
                Assignments::locked_at.eq(Some(now)),
                Assignments::lock_expires_at.eq(Some(expires_at)),
                Assignments::updated_at.eq(now),
            ))
            .get_result::<CouponAssignment>(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| e.context(format!("Set reservation on assignment: {} error occurred", id_arg)).into())
    }

    fn clear_lock(&self, id_arg: AssignmentId) -> RepoResult<CouponAssignment> {
        debug!("Clear reservation on assignment {}.", id_arg);
        let filtered = Assignments::coupon_assignments.filter(Assignments::id.eq(&id_arg));
        diesel::update(filtered)
            .set((
                Assignments::locked_at.eq(None::<SystemTime>),
                Assignments::lock_expires_at.eq(None::<SystemTime>),
                Assignments::updated_at.eq(SystemTime::now()),
            ))
            .get_result::<CouponAssignment>(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| e.context(format!("Clear reservation on assignment: {} error occurred", id_arg)).into())
    }

    fn record_redemption(
        &self,
        id_arg: AssignmentId,
        new_count: i32,
        redeemed_at: SystemTime,
        metadata: serde_json::Value,
    ) -> RepoResult<CouponAssignment> {
        debug!("Record redemption {} on assignment {}.", new_count, id_arg);
        let filtered = Assignments::coupon_assignments.filter(Assignments::id.eq(&id_arg));
        diesel::update(filtered)
            .set((
                Assignments::redemption_count.eq(new_count),
                Assignments::redeemed_at.eq(Some(redeemed_at)),
                Assignments::locked_at.eq(None::<SystemTime>),
                Assignments::lock_expires_at.eq(None::<SystemTime>),
                Assignments::metadata.eq(metadata),
                Assignments::updated_at.eq(redeemed_at),
            ))
            .get_result::<CouponAssignment>(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| e.context(format!("Record redemption on assignment: {} error occurred", id_arg)).into())
    }

    fn list_for_user(&self, user_id_arg: &UserId, offset: i64, limit: i64) -> RepoResult<Vec<(CouponAssignment, Coupon)>> {
        debug!("List assignments of user {} with offset {} and limit {}.", user_id_arg, offset, limit);
        Assignments::coupon_assignments
            .inner_join(Coupons::coupons)
            .filter(Assignments::user_id.eq(user_id_arg))
            .order(Assignments::assigned_at.desc())
            .offset(offset)
            .limit(limit)
            .get_results(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| {
                e.context(format!("List assignments of user: {} error occurred", user_id_arg))
                    .into()
            })
    }
}
