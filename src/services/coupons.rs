//! Coupons Services, presents assignment, reservation and redemption of
//! individual coupons under concurrent access.
//!
//! Redemption stacks four defenses: a dedup flag against double-submits,
//! a distributed cache lock against simultaneous distinct requests, a
//! NOWAIT row lock serializing transactions, and a version compare-and-set
//! that rejects writers racing through relaxed isolation. The database is
//! authoritative; both cache layers only shed load.

use std::time::{Duration, SystemTime};

use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::Connection;
use failure::Error as FailureError;
use futures::future;
use r2d2::ManageConnection;
use serde_json;
use validator::Validate;

use cache::{DEDUP_TTL, FEATURE_COUPON_LOCK, FEATURE_COUPON_REDEEM, REDEEM_LOCK_TTL};
use errors::Error;
use models::*;
use repos::{CouponAssignmentsRepo, CouponBooksRepo, CouponsRepo, ReposFactory};
use services::types::{pagination, ServiceFuture};
use services::Service;

pub trait CouponsService {
    /// Binds a random available coupon of the book to the caller
    fn assign_random(&self, book_id_arg: CouponBookId) -> ServiceFuture<AssignedCoupon>;
    /// Binds a specific available coupon to the caller
    fn assign_specific(&self, code_arg: CouponCode) -> ServiceFuture<AssignedCoupon>;
    /// Takes a short-lived checkout reservation on the caller's coupon
    fn lock_coupon(&self, code_arg: CouponCode, payload: LockPayload) -> ServiceFuture<LockOutcome>;
    /// Releases a checkout reservation
    fn unlock_coupon(&self, code_arg: CouponCode) -> ServiceFuture<UnlockOutcome>;
    /// Redeems the caller's coupon once
    fn redeem(&self, code_arg: CouponCode, payload: RedeemPayload) -> ServiceFuture<RedemptionOutcome>;
    /// Reports the coupon state as seen by the caller
    fn get_status(&self, code_arg: CouponCode) -> ServiceFuture<CouponStatusView>;
    /// Page of the caller's coupons, newest binding first
    fn get_user_coupons(&self, page: i64, limit: i64) -> ServiceFuture<Vec<UserCoupon>>;
}

impl<T, M, F> Service<T, M, F>
where
    T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
    M: ManageConnection<Connection = T>,
    F: ReposFactory<T>,
{
    fn current_user(&self) -> Result<UserId, FailureError> {
        self.dynamic_context
            .user_id
            .clone()
            .ok_or_else(|| Error::Validate(validation_error("user", "User identifier is required.")).into())
    }
}

/// A book accepts assignments only while active and inside its window.
fn validate_book_for_assignment(book: &CouponBook, now: SystemTime) -> Result<(), FailureError> {
    if !book.is_active {
        return Err(Error::Business(format!("Coupon book {} is not active", book.id)).into());
    }
    if !book.is_within_window(now) {
        return Err(Error::Business(format!("Coupon book {} is outside its validity window", book.id)).into());
    }
    Ok(())
}

/// Shallow merge of the redemption metadata bag into the stored one.
fn merge_metadata(existing: serde_json::Value, incoming: Option<serde_json::Value>) -> serde_json::Value {
    match incoming {
        None => existing,
        Some(incoming) => match (existing, incoming) {
            (serde_json::Value::Object(mut base), serde_json::Value::Object(extra)) => {
                for (key, value) in extra {
                    base.insert(key, value);
                }
                serde_json::Value::Object(base)
            }
            (_, incoming) => incoming,
        },
    }
}

impl<
        T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
        M: ManageConnection<Connection = T>,
        F: ReposFactory<T>,
    > CouponsService for Service<T, M, F>
{
    /// Binds a random available coupon of the book to the caller
    fn assign_random(&self, book_id_arg: CouponBookId) -> ServiceFuture<AssignedCoupon> {
        let user_id = match self.current_user() {
            Ok(user_id) => user_id,
            Err(e) => return Box::new(future::err(e)),
        };
        let repo_factory = self.static_context.repo_factory.clone();

        self.spawn_on_pool(move |conn| {
            {
                let books_repo = repo_factory.create_coupon_books_repo(&*conn);
                let book = books_repo.find(book_id_arg)?.ok_or_else(|| {
                    Error::Business(format!("Coupon book {} is not available", book_id_arg))
                })?;
                validate_book_for_assignment(&book, SystemTime::now())?;

                let assignments_repo = repo_factory.create_coupon_assignments_repo(&*conn);
                if let Some(max_assignments) = book.max_assignments_per_user {
                    let bound = assignments_repo.count_for_user_in_book(book_id_arg, &user_id)?;
                    if bound >= i64::from(max_assignments) {
                        return Err(Error::Business(format!(
                            "Assignment limit of coupon book {} reached",
                            book_id_arg
                        )).into());
                    }
                }

                conn.transaction::<AssignedCoupon, FailureError, _>(|| {
                    let coupons_repo = repo_factory.create_coupons_repo(&*conn);
                    let assignments_repo = repo_factory.create_coupon_assignments_repo(&*conn);

                    let coupon = coupons_repo.pick_available(book_id_arg)?.ok_or_else(|| {
                        Error::Business(format!("No available coupons in book {}", book_id_arg))
                    })?;
                    let coupon = coupons_repo.set_status(coupon.id, CouponStatus::Assigned)?;
                    let assignment = assignments_repo.create(NewCouponAssignment::now(coupon.id, user_id.clone()))?;
                    Ok(AssignedCoupon {
                        code: coupon.code,
                        coupon_id: coupon.id,
                        assignment_id: assignment.id,
                        assigned_at: assignment.assigned_at,
                    })
                })
            }.map_err(|e: FailureError| e.context("Service Coupons, assign_random endpoint error occurred.").into())
        })
    }

    /// Binds a specific available coupon to the caller
    fn assign_specific(&self, code_arg: CouponCode) -> ServiceFuture<AssignedCoupon> {
        let user_id = match self.current_user() {
            Ok(user_id) => user_id,
            Err(e) => return Box::new(future::err(e)),
        };
        let repo_factory = self.static_context.repo_factory.clone();
        let code_arg = CouponCode::normalized(&code_arg.0);

        self.spawn_on_pool(move |conn| {
            {
                let coupons_repo = repo_factory.create_coupons_repo(&*conn);
                let coupon = coupons_repo.find_by_code(&code_arg)?.ok_or(Error::NotFound)?;

                let books_repo = repo_factory.create_coupon_books_repo(&*conn);
                let book = books_repo.find(coupon.coupon_book_id)?.ok_or(Error::NotFound)?;
                validate_book_for_assignment(&book, SystemTime::now())?;

                let assignments_repo = repo_factory.create_coupon_assignments_repo(&*conn);
                if let Some(max_assignments) = book.max_assignments_per_user {
                    let bound = assignments_repo.count_for_user_in_book(book.id, &user_id)?;
                    if bound >= i64::from(max_assignments) {
                        return Err(Error::Business(format!("Assignment limit of coupon book {} reached", book.id)).into());
                    }
                }

                conn.transaction::<AssignedCoupon, FailureError, _>(|| {
                    let coupons_repo = repo_factory.create_coupons_repo(&*conn);
                    let assignments_repo = repo_factory.create_coupon_assignments_repo(&*conn);

                    let coupon = coupons_repo.find_by_code_for_update(&code_arg)?.ok_or(Error::NotFound)?;
                    if coupon.status != CouponStatus::Available {
                        return Err(Error::Business(format!("Coupon {} is not available", code_arg)).into());
                    }
                    let coupon = coupons_repo.set_status(coupon.id, CouponStatus::Assigned)?;
                    let assignment = assignments_repo.create(NewCouponAssignment::now(coupon.id, user_id.clone()))?;
                    Ok(AssignedCoupon {
                        code: coupon.code,
                        coupon_id: coupon.id,
                        assignment_id: assignment.id,
                        assigned_at: assignment.assigned_at,
                    })
                })
            }.map_err(|e: FailureError| e.context("Service Coupons, assign_specific endpoint error occurred.").into())
        })
    }

    /// Takes a short-lived checkout reservation on the caller's coupon
    fn lock_coupon(&self, code_arg: CouponCode, payload: LockPayload) -> ServiceFuture<LockOutcome> {
        let user_id = match self.current_user() {
            Ok(user_id) => user_id,
            Err(e) => return Box::new(future::err(e)),
        };
        if let Err(e) = payload.validate() {
            return Box::new(future::err(Error::Validate(e).into()));
        }
        let repo_factory = self.static_context.repo_factory.clone();
        let cache = self.static_context.cache.clone();
        let code_arg = CouponCode::normalized(&code_arg.0);
        let ttl = Duration::from_secs(payload.duration_secs() as u64);

        self.spawn_on_pool(move |conn| {
            {
                let acquired = cache
                    .acquire_lock(FEATURE_COUPON_LOCK, &code_arg.0, ttl)
                    .unwrap_or_else(|e| {
                        warn!("Cache lock acquisition failed for coupon {}: {}", code_arg, e);
                        false
                    });
                if !acquired {
                    return Err(Error::Conflict(format!("Coupon {} is currently locked", code_arg)).into());
                }

                let result = conn.transaction::<LockOutcome, FailureError, _>(|| {
                    let coupons_repo = repo_factory.create_coupons_repo(&*conn);
                    let assignments_repo = repo_factory.create_coupon_assignments_repo(&*conn);

                    let coupon = coupons_repo.find_by_code_for_update(&code_arg)?.ok_or(Error::NotFound)?;
                    let assignment = assignments_repo
                        .find_for_user_for_update(coupon.id, &user_id)?
                        .ok_or(Error::NotFound)?;
                    if !coupon.status.is_held() {
                        return Err(Error::Business(format!(
                            "Coupon {} cannot be locked in status {}",
                            code_arg, coupon.status
                        )).into());
                    }
                    let now = SystemTime::now();
                    let expires_at = now + ttl;
                    let coupon = coupons_repo.set_status(coupon.id, CouponStatus::Locked)?;
                    let assignment = assignments_repo.set_lock(assignment.id, expires_at)?;
                    Ok(LockOutcome {
                        code: coupon.code,
                        status: coupon.status,
                        locked_at: assignment.locked_at.unwrap_or(now),
                        lock_expires_at: expires_at,
                    })
                });

                // The row-side expiry is authoritative from here on.
                cache.release_lock(FEATURE_COUPON_LOCK, &code_arg.0);
                result
            }.map_err(|e: FailureError| e.context("Service Coupons, lock_coupon endpoint error occurred.").into())
        })
    }

    /// Releases a checkout reservation
    fn unlock_coupon(&self, code_arg: CouponCode) -> ServiceFuture<UnlockOutcome> {
        let user_id = match self.current_user() {
            Ok(user_id) => user_id,
            Err(e) => return Box::new(future::err(e)),
        };
        let repo_factory = self.static_context.repo_factory.clone();
        let code_arg = CouponCode::normalized(&code_arg.0);

        self.spawn_on_pool(move |conn| {
            {
                conn.transaction::<UnlockOutcome, FailureError, _>(|| {
                    let coupons_repo = repo_factory.create_coupons_repo(&*conn);
                    let assignments_repo = repo_factory.create_coupon_assignments_repo(&*conn);

                    let coupon = coupons_repo.find_by_code_for_update(&code_arg)?.ok_or(Error::NotFound)?;
                    let assignment = assignments_repo
                        .find_for_user_for_update(coupon.id, &user_id)?
                        .ok_or(Error::NotFound)?;
                    if coupon.status != CouponStatus::Locked {
                        return Err(Error::Business(format!("Coupon {} is not locked", code_arg)).into());
                    }
                    let coupon = coupons_repo.set_status(coupon.id, CouponStatus::Assigned)?;
                    assignments_repo.clear_lock(assignment.id)?;
                    Ok(UnlockOutcome {
                        code: coupon.code,
                        status: coupon.status,
                    })
                })
            }.map_err(|e: FailureError| e.context("Service Coupons, unlock_coupon endpoint error occurred.").into())
        })
    }

    /// Redeems the caller's coupon once
    fn redeem(&self, code_arg: CouponCode, payload: RedeemPayload) -> ServiceFuture<RedemptionOutcome> {
        let user_id = match self.current_user() {
            Ok(user_id) => user_id,
            Err(e) => return Box::new(future::err(e)),
        };
        let repo_factory = self.static_context.repo_factory.clone();
        let cache = self.static_context.cache.clone();
        let code_arg = CouponCode::normalized(&code_arg.0);

        self.spawn_on_pool(move |conn| {
            let resource = format!("{}:{}", code_arg, user_id);

            // Layer A: suppress double-submits of the same logical action.
            let fresh = cache
                .set_dedup(FEATURE_COUPON_REDEEM, &resource, DEDUP_TTL)
                .unwrap_or_else(|e| {
                    warn!("Cache dedup set failed for {}: {}", resource, e);
                    false
                });
            if !fresh {
                let conflict = FailureError::from(Error::Conflict(format!(
                    "Redemption of coupon {} is already in progress",
                    code_arg
                )));
                return Err(conflict.context("Service Coupons, redeem endpoint error occurred.").into());
            }

            let result = (|| -> Result<RedemptionOutcome, FailureError> {
                // Layer B: one redeemer per (code, user) across the fleet.
                let acquired = cache
                    .acquire_lock(FEATURE_COUPON_REDEEM, &resource, REDEEM_LOCK_TTL)
                    .unwrap_or_else(|e| {
                        warn!("Cache lock acquisition failed for {}: {}", resource, e);
                        false
                    });
                if !acquired {
                    return Err(Error::Conflict(format!(
                        "Redemption of coupon {} is in flight elsewhere",
                        code_arg
                    )).into());
                }

                let outcome = conn.transaction::<RedemptionOutcome, FailureError, _>(|| {
                    let coupons_repo = repo_factory.create_coupons_repo(&*conn);
                    let assignments_repo = repo_factory.create_coupon_assignments_repo(&*conn);
                    let books_repo = repo_factory.create_coupon_books_repo(&*conn);

                    // Layer C: row locks, no waiting.
                    let coupon = coupons_repo.find_by_code_for_update(&code_arg)?.ok_or(Error::NotFound)?;
                    let assignment = assignments_repo
                        .find_for_user_for_update(coupon.id, &user_id)?
                        .ok_or(Error::NotFound)?;
                    if !coupon.status.is_held() {
                        return Err(Error::Business(format!(
                            "Coupon {} is not redeemable in status {}",
                            code_arg, coupon.status
                        )).into());
                    }
                    let book = books_repo.find(coupon.coupon_book_id)?.ok_or(Error::NotFound)?;
                    let now = SystemTime::now();
                    if book.is_expired(now) {
                        return Err(Error::Business(format!("Coupon book {} has expired", book.id)).into());
                    }

                    // Layer D: version compare-and-set is the final arbiter.
                    let max_redemptions = book.max_redemptions_per_user;
                    let new_count = assignment.redemption_count + 1;
                    if let Some(max) = max_redemptions {
                        if new_count > max {
                            return Err(Error::Business(format!(
                                "Redemption limit of coupon {} reached",
                                code_arg
                            )).into());
                        }
                    }
                    let fully_redeemed = max_redemptions.map(|max| new_count == max).unwrap_or(false);
                    let new_status = if fully_redeemed {
                        CouponStatus::Redeemed
                    } else {
                        CouponStatus::Assigned
                    };
                    let coupon = coupons_repo
                        .set_status_versioned(coupon.id, coupon.version, new_status)?
                        .ok_or_else(|| {
                            Error::Conflict(format!("Coupon {} changed concurrently, retry", code_arg))
                        })?;

                    let metadata = merge_metadata(assignment.metadata.clone(), payload.metadata.clone());
                    let assignment = assignments_repo.record_redemption(assignment.id, new_count, now, metadata)?;
                    Ok(RedemptionOutcome {
                        code: coupon.code,
                        redeemed_at: now,
                        redemption_count: assignment.redemption_count,
                        remaining: max_redemptions.map(|max| max - assignment.redemption_count),
                        fully_redeemed,
                    })
                });

                cache.release_lock(FEATURE_COUPON_REDEEM, &resource);
                outcome
            })();

            cache.clear_dedup(FEATURE_COUPON_REDEEM, &resource);
            result.map_err(|e: FailureError| e.context("Service Coupons, redeem endpoint error occurred.").into())
        })
    }

    /// Reports the coupon state as seen by the caller
    fn get_status(&self, code_arg: CouponCode) -> ServiceFuture<CouponStatusView> {
        let user_id = match self.current_user() {
            Ok(user_id) => user_id,
            Err(e) => return Box::new(future::err(e)),
        };
        let repo_factory = self.static_context.repo_factory.clone();
        let code_arg = CouponCode::normalized(&code_arg.0);

        self.spawn_on_pool(move |conn| {
            {
                let coupons_repo = repo_factory.create_coupons_repo(&*conn);
                let coupon = coupons_repo.find_by_code(&code_arg)?.ok_or(Error::NotFound)?;

                let books_repo = repo_factory.create_coupon_books_repo(&*conn);
                let book = books_repo.find(coupon.coupon_book_id)?.ok_or(Error::NotFound)?;

                let assignments_repo = repo_factory.create_coupon_assignments_repo(&*conn);
                let assignment = assignments_repo.find_for_user(coupon.id, &user_id)?;

                let now = SystemTime::now();
                let status = if book.is_expired(now) {
                    CouponStatus::Expired
                } else {
                    coupon.status
                };
                let lock_expires_at = assignment.as_ref().and_then(|a| a.lock_expires_at);
                let locked = status == CouponStatus::Locked
                    && lock_expires_at.map(|deadline| deadline > now).unwrap_or(false);
                Ok(CouponStatusView {
                    code: coupon.code,
                    status,
                    owned_by_caller: assignment.is_some(),
                    locked,
                    lock_expires_at,
                    redemption_count: assignment.as_ref().map(|a| a.redemption_count).unwrap_or(0),
                    max_redemptions_per_user: book.max_redemptions_per_user,
                    valid_until: book.valid_until,
                })
            }.map_err(|e: FailureError| e.context("Service Coupons, get_status endpoint error occurred.").into())
        })
    }

    /// Page of the caller's coupons, newest binding first
    fn get_user_coupons(&self, page: i64, limit: i64) -> ServiceFuture<Vec<UserCoupon>> {
        let user_id = match self.current_user() {
            Ok(user_id) => user_id,
            Err(e) => return Box::new(future::err(e)),
        };
        let repo_factory = self.static_context.repo_factory.clone();
        let (offset, limit) = pagination(page, limit);

        self.spawn_on_pool(move |conn| {
            let assignments_repo = repo_factory.create_coupon_assignments_repo(&*conn);
            assignments_repo
                .list_for_user(&user_id, offset, limit)
                .map(|rows| {
                    rows.into_iter()
                        .map(|(assignment, coupon)| UserCoupon {
                            code: coupon.code,
                            status: coupon.status,
                            assigned_at: assignment.assigned_at,
                            redeemed_at: assignment.redeemed_at,
                            redemption_count: assignment.redemption_count,
                        })
                        .collect()
                })
                .map_err(|e| e.context("Service Coupons, get_user_coupons endpoint error occurred.").into())
        })
    }
}
