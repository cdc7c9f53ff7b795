//! Coupon books Services, presents catalog operations and bulk code materialization

use std::collections::HashSet;

use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::Connection;
use failure::Error as FailureError;
use r2d2::ManageConnection;
use validator::Validate;

use errors::Error;
use models::*;
use repos::{CouponBooksRepo, CouponsRepo, ReposFactory};
use services::types::{pagination, ServiceFuture};
use services::Service;

/// Upper bound of codes accepted by one upload call.
pub const MAX_UPLOAD_CODES: usize = 10_000;

pub trait CouponBooksService {
    /// Creates new coupon book
    fn create_book(&self, payload: NewCouponBook) -> ServiceFuture<CouponBook>;
    /// Returns coupon book with coupon statistics
    fn get_book(&self, id_arg: CouponBookId) -> ServiceFuture<CouponBookWithStatistics>;
    /// Page of coupon books
    fn list_books(&self, page: i64, limit: i64) -> ServiceFuture<Vec<CouponBook>>;
    /// Page of `(code, status)` pairs of a book
    fn list_coupons(&self, book_id_arg: CouponBookId, page: i64, limit: i64) -> ServiceFuture<Vec<CouponPreview>>;
    /// Soft-deactivates a book
    fn deactivate_book(&self, id_arg: CouponBookId) -> ServiceFuture<CouponBook>;
    /// Inserts caller-provided codes into a book
    fn upload_codes(&self, book_id_arg: CouponBookId, codes: Vec<String>) -> ServiceFuture<CodeUploadSummary>;
    /// Materializes codes from the book pattern
    fn generate_codes(&self, book_id_arg: CouponBookId, count: usize) -> ServiceFuture<CodeUploadSummary>;
}

impl<
        T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
        M: ManageConnection<Connection = T>,
        F: ReposFactory<T>,
    > CouponBooksService for Service<T, M, F>
{
    /// Creates new coupon book
    fn create_book(&self, payload: NewCouponBook) -> ServiceFuture<CouponBook> {
        let repo_factory = self.static_context.repo_factory.clone();

        self.spawn_on_pool(move |conn| {
            {
                payload.validate().map_err(Error::Validate)?;
                if let Some(ref raw_pattern) = payload.code_pattern {
                    Pattern::parse(raw_pattern)?;
                }

                let books_repo = repo_factory.create_coupon_books_repo(&*conn);
                let duplicate =
                    books_repo.find_by_name_description(&payload.name, payload.description.as_ref().map(|d| d.as_str()))?;
                if duplicate.is_some() {
                    return Err(Error::Conflict(format!("Coupon book {} already exists", payload.name)).into());
                }

                books_repo.create(payload)
            }.map_err(|e: FailureError| e.context("Service CouponBooks, create_book endpoint error occurred.").into())
        })
    }

    /// Returns coupon book with coupon statistics
    fn get_book(&self, id_arg: CouponBookId) -> ServiceFuture<CouponBookWithStatistics> {
        let repo_factory = self.static_context.repo_factory.clone();

        self.spawn_on_pool(move |conn| {
            {
                let books_repo = repo_factory.create_coupon_books_repo(&*conn);
                let book = books_repo.find(id_arg)?.ok_or(Error::NotFound)?;
                let statistics = books_repo.statistics(id_arg)?;
                Ok(CouponBookWithStatistics { book, statistics })
            }.map_err(|e: FailureError| e.context("Service CouponBooks, get_book endpoint error occurred.").into())
        })
    }

    /// Page of coupon books
    fn list_books(&self, page: i64, limit: i64) -> ServiceFuture<Vec<CouponBook>> {
        let repo_factory = self.static_context.repo_factory.clone();
        let (offset, limit) = pagination(page, limit);

        self.spawn_on_pool(move |conn| {
            let books_repo = repo_factory.create_coupon_books_repo(&*conn);
            books_repo
                .list(offset, limit)
                .map_err(|e| e.context("Service CouponBooks, list_books endpoint error occurred.").into())
        })
    }

    /// Page of `(code, status)` pairs of a book
    fn list_coupons(&self, book_id_arg: CouponBookId, page: i64, limit: i64) -> ServiceFuture<Vec<CouponPreview>> {
        let repo_factory = self.static_context.repo_factory.clone();
        let (offset, limit) = pagination(page, limit);

        self.spawn_on_pool(move |conn| {
            {
                let books_repo = repo_factory.create_coupon_books_repo(&*conn);
                books_repo.find(book_id_arg)?.ok_or(Error::NotFound)?;

                let coupons_repo = repo_factory.create_coupons_repo(&*conn);
                coupons_repo.list_by_book(book_id_arg, offset, limit)
            }.map_err(|e: FailureError| e.context("Service CouponBooks, list_coupons endpoint error occurred.").into())
        })
    }

    /// Soft-deactivates a book
    fn deactivate_book(&self, id_arg: CouponBookId) -> ServiceFuture<CouponBook> {
        let repo_factory = self.static_context.repo_factory.clone();

        self.spawn_on_pool(move |conn| {
            {
                let books_repo = repo_factory.create_coupon_books_repo(&*conn);
                let book = books_repo.find(id_arg)?.ok_or(Error::NotFound)?;
                if !book.is_active {
                    return Err(Error::Conflict(format!("Coupon book {} is already inactive", id_arg)).into());
                }
                books_repo.deactivate(id_arg)
            }.map_err(|e: FailureError| e.context("Service CouponBooks, deactivate_book endpoint error occurred.").into())
        })
    }

    /// Inserts caller-provided codes into a book
    fn upload_codes(&self, book_id_arg: CouponBookId, codes: Vec<String>) -> ServiceFuture<CodeUploadSummary> {
        let repo_factory = self.static_context.repo_factory.clone();

        self.spawn_on_pool(move |conn| {
            {
                if codes.len() > MAX_UPLOAD_CODES {
                    return Err(Error::Validate(validation_error(
                        "codes",
                        "Too many codes in one upload.",
                    )).into());
                }

                let mut invalid = 0;
                let mut duplicates = 0;
                let mut seen: HashSet<String> = HashSet::with_capacity(codes.len());
                let mut normalized: Vec<CouponCode> = Vec::with_capacity(codes.len());
                for raw_code in &codes {
                    let code = CouponCode::normalized(raw_code);
                    if !is_valid_code(&code.0) {
                        invalid += 1;
                    } else if !seen.insert(code.0.clone()) {
                        duplicates += 1;
                    } else {
                        normalized.push(code);
                    }
                }

                conn.transaction::<CodeUploadSummary, FailureError, _>(|| {
                    let books_repo = repo_factory.create_coupon_books_repo(&*conn);
                    let book = books_repo.find_for_update(book_id_arg)?.ok_or(Error::NotFound)?;
                    if !book.is_active {
                        return Err(Error::Business(format!("Coupon book {} is not active", book_id_arg)).into());
                    }
                    if book.code_pattern.is_some() {
                        return Err(Error::Business(format!(
                            "Coupon book {} generates its own codes",
                            book_id_arg
                        )).into());
                    }

                    let payloads: Vec<NewCoupon> = normalized
                        .into_iter()
                        .map(|code| NewCoupon::available(book_id_arg, code))
                        .collect();

                    let coupons_repo = repo_factory.create_coupons_repo(&*conn);
                    let uploaded = coupons_repo.create_many(&payloads)?;
                    let duplicates = duplicates + (payloads.len() - uploaded);

                    let book = books_repo.increment_total_codes(book_id_arg, uploaded as i32)?;
                    info!(
                        "Uploaded {} codes to coupon book {} ({} duplicates, {} invalid).",
                        uploaded, book_id_arg, duplicates, invalid
                    );
                    Ok(CodeUploadSummary {
                        uploaded,
                        duplicates,
                        invalid,
                        new_total: book.total_codes,
                        max_codes: book.max_codes,
                    })
                })
            }.map_err(|e: FailureError| e.context("Service CouponBooks, upload_codes endpoint error occurred.").into())
        })
    }

    /// Materializes codes from the book pattern
    fn generate_codes(&self, book_id_arg: CouponBookId, count: usize) -> ServiceFuture<CodeUploadSummary> {
        let repo_factory = self.static_context.repo_factory.clone();

        self.spawn_on_pool(move |conn| {
            {
                if count == 0 {
                    return Err(Error::Validate(validation_error("count", "Count must be positive.")).into());
                }

                conn.transaction::<CodeUploadSummary, FailureError, _>(|| {
                    let books_repo = repo_factory.create_coupon_books_repo(&*conn);
                    let book = books_repo.find_for_update(book_id_arg)?.ok_or(Error::NotFound)?;
                    if !book.is_active {
                        return Err(Error::Business(format!("Coupon book {} is not active", book_id_arg)).into());
                    }
                    let raw_pattern = book.code_pattern.as_ref().ok_or_else(|| {
                        Error::Business(format!("Coupon book {} has no code pattern", book_id_arg))
                    })?;
                    let max_codes = book.max_codes.ok_or_else(|| {
                        Error::Business(format!("Coupon book {} has no code cap", book_id_arg))
                    })?;
                    if book.total_codes >= max_codes {
                        return Err(Error::Business(format!(
                            "Coupon book {} already holds its maximum of {} codes",
                            book_id_arg, max_codes
                        )).into());
                    }

                    let remaining = (max_codes - book.total_codes) as usize;
                    let target = if count < remaining { count } else { remaining };

                    let pattern = Pattern::parse(raw_pattern)?;
                    if !pattern.within_capacity_share(target) {
                        return Err(Error::Validate(validation_error(
                            "count",
                            "Requested count exceeds the generatable share of the pattern.",
                        )).into());
                    }

                    let payloads: Vec<NewCoupon> = pattern
                        .generate(target)?
                        .into_iter()
                        .map(|code| NewCoupon::available(book_id_arg, CouponCode(code)))
                        .collect();

                    let coupons_repo = repo_factory.create_coupons_repo(&*conn);
                    let uploaded = coupons_repo.create_many(&payloads)?;
                    let duplicates = payloads.len() - uploaded;

                    let book = books_repo.increment_total_codes(book_id_arg, uploaded as i32)?;
                    info!(
                        "Generated {} codes into coupon book {} ({} collided with existing codes).",
                        uploaded, book_id_arg, duplicates
                    );
                    Ok(CodeUploadSummary {
                        uploaded,
                        duplicates,
                        invalid: 0,
                        new_total: book.total_codes,
                        max_codes: book.max_codes,
                    })
                })
            }.map_err(|e: FailureError| e.context("Service CouponBooks, generate_codes endpoint error occurred.").into())
        })
    }
}
