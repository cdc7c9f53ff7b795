//! Repo for coupon books
use std::time::SystemTime;

use diesel;
use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::query_dsl::RunQueryDsl;
use diesel::Connection;
use failure::Error as FailureError;

use models::*;
use repos::error::unique_violation_error;
use repos::types::RepoResult;
use schema::coupon_books::dsl as CouponBooks;
use schema::coupons::dsl as Coupons;

/// Coupon books repository, responsible for the book catalog
pub struct CouponBooksRepoImpl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> {
    pub db_conn: &'a T,
}

pub trait CouponBooksRepo {
    /// Creates new coupon book
    fn create(&self, payload: NewCouponBook) -> RepoResult<CouponBook>;

    /// Get coupon book
    fn find(&self, id_arg: CouponBookId) -> RepoResult<Option<CouponBook>>;

    /// Get coupon book, holding its row lock for the rest of the
    /// transaction. Serializes concurrent bulk inserts on one book.
    fn find_for_update(&self, id_arg: CouponBookId) -> RepoResult<Option<CouponBook>>;

    /// Exact-match lookup on the (name, description) uniqueness key
    fn find_by_name_description(&self, name: &str, description: Option<&str>) -> RepoResult<Option<CouponBook>>;

    /// Page of books, newest first
    fn list(&self, offset: i64, limit: i64) -> RepoResult<Vec<CouponBook>>;

    /// Soft-deactivates a book
    fn deactivate(&self, id_arg: CouponBookId) -> RepoResult<CouponBook>;

    /// Bumps the materialized-codes counter inside the caller's transaction
    fn increment_total_codes(&self, id_arg: CouponBookId, delta: i32) -> RepoResult<CouponBook>;

    /// Per-status coupon counters of a book
    fn statistics(&self, id_arg: CouponBookId) -> RepoResult<CouponBookStatistics>;
}

impl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> CouponBooksRepoImpl<'a, T> {
    pub fn new(db_conn: &'a T) -> Self {
        Self { db_conn }
    }

    fn count_status(&self, id_arg: CouponBookId, status_arg: CouponStatus) -> RepoResult<i64> {
        Coupons::coupons
            .filter(Coupons::coupon_book_id.eq(id_arg))
            .filter(Coupons::status.eq(status_arg))
            .count()
            .get_result(self.db_conn)
            .map_err(From::from)
    }
}

impl<'a, T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> CouponBooksRepo
    for CouponBooksRepoImpl<'a, T>
{
    /// Creates new coupon book
    fn create(&self, payload: NewCouponBook) -> RepoResult<CouponBook> {
        debug!("Create new coupon book {:?}.", payload);
        let query = diesel::insert_into(CouponBooks::coupon_books).values(&payload);
        query
            .get_result::<CouponBook>(self.db_conn)
            .map_err(|e| unique_violation_error(e, "coupon book"))
            .map_err(|e: FailureError| e.context(format!("Creates new coupon book: {:?} error occurred", payload)).into())
    }

    /// Get coupon book
    fn find(&self, id_arg: CouponBookId) -> RepoResult<Option<CouponBook>> {
        debug!("Find in coupon book with id {}.", id_arg);
        CouponBooks::coupon_books
            .filter(CouponBooks::id.eq(&id_arg))
            .get_result(self.db_conn)
            .optional()
            .map_err(From::from)
            .map_err(|e: FailureError| e.context(format!("Find coupon book by id: {} error occurred", id_arg)).into())
    }

    fn find_for_update(&self, id_arg: CouponBookId) -> RepoResult<Option<CouponBook>> {
        debug!("Find and lock coupon book with id {}.", id_arg);
        CouponBooks::coupon_books
            .filter(CouponBooks::id.eq(&id_arg))
            .for_update()
            .get_result(self.db_conn)
            .optional()
            .map_err(From::from)
            .map_err(|e: FailureError| e.context(format!("Find and lock coupon book by id: {} error occurred", id_arg)).into())
    }

    /// Exact-match lookup on the (name, description) uniqueness key
    fn find_by_name_description(&self, name: &str, description: Option<&str>) -> RepoResult<Option<CouponBook>> {
        debug!("Find coupon book by name {} and description {:?}.", name, description);
        let query = CouponBooks::coupon_books.filter(CouponBooks::name.eq(name));
        let result = match description {
            Some(desc) => query
                .filter(CouponBooks::description.eq(desc))
                .get_result(self.db_conn)
                .optional(),
            None => query
                .filter(CouponBooks::description.is_null())
                .get_result(self.db_conn)
                .optional(),
        };
        result
            .map_err(From::from)
            .map_err(|e: FailureError| {
                e.context(format!("Find coupon book by name: {} error occurred", name)).into()
            })
    }

    /// Page of books, newest first
    fn list(&self, offset: i64, limit: i64) -> RepoResult<Vec<CouponBook>> {
        debug!("List coupon books with offset {} and limit {}.", offset, limit);
        CouponBooks::coupon_books
            .order(CouponBooks::created_at.desc())
            .offset(offset)
            .limit(limit)
            .get_results(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| e.context("List coupon books error occurred").into())
    }

    /// Soft-deactivates a book
    fn deactivate(&self, id_arg: CouponBookId) -> RepoResult<CouponBook> {
        debug!("Deactivate coupon book with id {}.", id_arg);
        let filtered = CouponBooks::coupon_books.filter(CouponBooks::id.eq(&id_arg));
        diesel::update(filtered)
            .set((
                CouponBooks::is_active.eq(false),
                CouponBooks::updated_at.eq(SystemTime::now()),
            ))
            .get_result::<CouponBook>(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| e.context(format!("Deactivate coupon book: {} error occurred", id_arg)).into())
    }

    /// Bumps the materialized-codes counter inside the caller's transaction
    fn increment_total_codes(&self, id_arg: CouponBookId, delta: i32) -> RepoResult<CouponBook> {
        debug!("Increment total codes of coupon book {} by {}.", id_arg, delta);
        let filtered = CouponBooks::coupon_books.filter(CouponBooks::id.eq(&id_arg));
        diesel::update(filtered)
            .set((
                CouponBooks::total_codes.eq(CouponBooks::total_codes + delta),
                CouponBooks::updated_at.eq(SystemTime::now()),
            ))
            .get_result::<CouponBook>(self.db_conn)
            .map_err(From::from)
            .map_err(|e: FailureError| {
                e.context(format!("Increment total codes of coupon book: {} error occurred", id_arg))
                    .into()
            })
    }

    /// Per-status coupon counters of a book
    fn statistics(&self, id_arg: CouponBookId) -> RepoResult<CouponBookStatistics> {
        debug!("Collect statistics of coupon book {}.", id_arg);
        let result = CouponBookStatistics {
            available: self.count_status(id_arg, CouponStatus::Available)?,
            assigned: self.count_status(id_arg, CouponStatus::Assigned)?,
            locked: self.count_status(id_arg, CouponStatus::Locked)?,
            redeemed: self.count_status(id_arg, CouponStatus::Redeemed)?,
        };
        Ok(result)
    }
}
