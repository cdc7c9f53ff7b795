//! Repo for coupons
use std::time::SystemTime;

use diesel;
use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::query_dsl::RunQueryDsl;
use diesel::Connection;
use failure::Error as FailureError;

use models::*;
use repos::error::lock_contention_error;
use repos::types::RepoResult;
use schema::coupons::dsl as Coupons;

no_arg_sql_function!(RANDOM, (), "Represents the sql RANDOM() function");

/// Rows per INSERT statement during bulk materialization.
pub const INSERT_BATCH_SIZE: usize = 5000;

/// Coupons repository, responsible for handling individual codes
pub struct CouponsRepoImpl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> {
    pub db_conn: &'a T,
}

pub trait CouponsRepo {
    /// Inserts a batch of coupons, silently skipping codes that already
    /// exist anywhere in the catalog. Returns the number inserted.
    fn create_many(&self, payloads: &[NewCoupon]) -> RepoResult<usize>;

    /// Get coupon by code
    fn find_by_code(&self, code_arg: &CouponCode) -> RepoResult<Option<Coupon>>;

    /// Get coupon by code, taking its row lock without waiting.
    /// Contention surfaces as `Conflict` instead of queueing.
    fn find_by_code_for_update(&self, code_arg: &CouponCode) -> RepoResult<Option<Coupon>>;

    /// Picks one AVAILABLE coupon of the book at random, taking its row
    /// lock and skipping rows other transactions already hold.
    fn pick_available(&self, book_id_arg: CouponBookId) -> RepoResult<Option<Coupon>>;

    /// Rewrites the status of a row the caller has locked, bumping the
    /// version counter.
    fn set_status(&self, id_arg: CouponId, status_arg: CouponStatus) -> RepoResult<Coupon>;

    /// Compare-and-set status update. `None` means another writer won
    /// the version race.
    fn set_status_versioned(
        &self,
        id_arg: CouponId,
        expected_version: i32,
        status_arg: CouponStatus,
    ) -> RepoResult<Option<Coupon>>;

    /// Page of `(code, status)` pairs of a book, newest first
    fn list_by_book(&self, book_id_arg: CouponBookId, offset: i64, limit: i64) -> RepoResult<Vec<CouponPreview>>;
}

impl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> CouponsRepoImpl<'a, T> {
    pub fn new(db_conn: &'a T) -> Self {
        Self { db_conn }
    }
}

impl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> CouponsRepo
    for CouponsRepoImpl<'a, T>
{
    fn create_many(&self, payloads: &[NewCoupon]) -> RepoResult<usize> {
        debug!("Create {} new coupons.", payloads.len());
        let mut inserted = 0;
        for batch in payloads.chunks(INSERT_BATCH_SIZE) {
            inserted += diesel::insert_into(Coupons::coupons)
                .values(batch)
                .on_conflict_do_nothing()
                .execute(self.db_conn)
                .map_err(FailureError::from)
                .map_err(|e| e.context("Bulk insert of coupons error occurred"))?;
        }
        Ok(inserted)
    }

    /// Get coupon by code
    fn find_by_code(&self, code_arg: &CouponCode) -> RepoResult<Option<Coupon>> {
        debug!("Find in coupon with code {}.", code_arg);
        Coupons::coupons
            .filter(Coupons::code.eq(code_arg))
            .get_result(self.db_conn)
            .optional()
            .map_err(From::from)
            .map_err(|e: FailureError| e.context(format!("Find coupon by code: {} error occurred", code_arg)).into())
    }

    fn find_by_code_for_update(&self, code_arg: &CouponCode) -> RepoResult<Option<Coupon>> {
        debug!("Find and lock coupon with code {}.", code_arg);
        Coupons::coupons
            .filter(Coupons::code.eq(code_arg))
            .for_update()
            .no_wait()
            .get_result(self.db_conn)
            .optional()
            .map_err(|e| lock_contention_error(e, &format!("Coupon {}", code_arg)))
            .map_err(|e: FailureError| {
                e.context(format!("Find and lock coupon by code: {} error occurred", code_arg))
                    .into()
            })
    }

    fn pick_available(&self, book_id_arg: CouponBookId) -> RepoResult<Option<Coupon>> {
        debug!("Pick random available coupon of book {}.", book_id_arg);
        Coupons::coupons
            .filter(Coupons::coupon_book_id.eq(book_id_arg))
            .filter(Coupons::status.eq(CouponStatus::Available))
            .order(RANDOM)
            .limit(1)
            .for_update()
            .skip_locked()
            .get_result(self.db_conn)
            .optional()
            .map_err(From::from)
            .map_err(|e: FailureError| {
                e.context(format!("Pick available coupon of book: {} error occurred", book_id_arg))
                    .into()
            })
    }

    fn set_status(&self, id_arg: CouponId, status_arg: CouponStatus) -> RepoResult<Coupon> {
        debug!("Set status of coupon {} to {}.", id_arg, status_arg);
        let filtered = Coupons::coupons.filter(Coupons::id.eq(&id_arg));
        diesel::update(filtered)
            .set((
                Coupons::status.eq(status_arg),
                Coupons::version.eq(Coupons::version + 1),
                Coupons::updated_at.eq(SystemTime::now()),
            ))
            .get_result::<Coupon>(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| {
                e.context(format!("Set status of coupon: {} to {} error occurred", id_arg, status_arg))
                    .into()
            })
    }

    fn set_status_versioned(
        &self,
        id_arg: CouponId,
        expected_version: i32,
        status_arg: CouponStatus,
    ) -> RepoResult<Option<Coupon>> {
        debug!(
            "Set status of coupon {} to {} expecting version {}.",
            id_arg, status_arg, expected_version
        );
        let filtered = Coupons::coupons
            .filter(Coupons::id.eq(&id_arg))
            .filter(Coupons::version.eq(expected_version));
        diesel::update(filtered)
            .set((
                Coupons::status.eq(status_arg),
                Coupons::version.eq(expected_version + 1),
                Coupons::updated_at.eq(SystemTime::now()),
            ))
            .get_result::<Coupon>(self.db_conn)
            .optional()
            .map_err(From::from)
            .map_err(|e: FailureError| {
                e.context(format!(
                    "Versioned status update of coupon: {} to {} error occurred",
                    id_arg, status_arg
                )).into()
            })
    }

    /// Page of `(code, status)` pairs of a book, newest first
    fn list_by_book(&self, book_id_arg: CouponBookId, offset: i64, limit: i64) -> RepoResult<Vec<CouponPreview>> {
        debug!("List coupons of book {} with offset {} and limit {}.", book_id_arg, offset, limit);
        Coupons::coupons
            .filter(Coupons::coupon_book_id.eq(book_id_arg))
            .order(Coupons::created_at.desc())
            .offset(offset)
            .limit(limit)
            .select((Coupons::code, Coupons::status))
            .get_results(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| {
                e.context(format!("List coupons of book: {} error occurred", book_id_arg))
                    .into()
            })
    }
}
