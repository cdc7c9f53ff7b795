//! Factory assembling repos over a borrowed connection.
use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::Connection;

use repos::assignments::{CouponAssignmentsRepo, CouponAssignmentsRepoImpl};
use repos::coupon_books::{CouponBooksRepo, CouponBooksRepoImpl};
use repos::coupons::{CouponsRepo, CouponsRepoImpl};

pub trait ReposFactory<C: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static>:
    Clone + Send + Sync + 'static
{
    fn create_coupon_books_repo<'a>(&self, db_conn: &'a C) -> Box<CouponBooksRepo + 'a>;
    fn create_coupons_repo<'a>(&self, db_conn: &'a C) -> Box<CouponsRepo + 'a>;
    fn create_coupon_assignments_repo<'a>(&self, db_conn: &'a C) -> Box<CouponAssignmentsRepo + 'a>;
}

#[derive(Default, Copy, Clone)]
pub struct ReposFactoryImpl;

impl<C: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static> ReposFactory<C>
    for ReposFactoryImpl
{
    fn create_coupon_books_repo<'a>(&self, db_conn: &'a C) -> Box<CouponBooksRepo + 'a> {
        Box::new(CouponBooksRepoImpl::new(db_conn)) as Box<CouponBooksRepo>
    }

    fn create_coupons_repo<'a>(&self, db_conn: &'a C) -> Box<CouponsRepo + 'a> {
        Box::new(CouponsRepoImpl::new(db_conn)) as Box<CouponsRepo>
    }

    fn create_coupon_assignments_repo<'a>(&self, db_conn: &'a C) -> Box<CouponAssignmentsRepo + 'a> {
        Box::new(CouponAssignmentsRepoImpl::new(db_conn)) as Box<CouponAssignmentsRepo>
    }
}

#[cfg(test)]
pub mod tests {
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use diesel::connection::{AnsiTransactionManager, SimpleConnection};
    use diesel::deserialize::QueryableByName;
    use diesel::pg::Pg;
    use diesel::query_builder::{AsQuery, QueryFragment, QueryId};
    use diesel::sql_types::HasSqlType;
    use diesel::Queryable;
    use diesel::{Connection, ConnectionResult, QueryResult};
    use futures_cpupool::CpuPool;
    use r2d2;
    use r2d2::ManageConnection;
    use serde_json;
    use uuid::Uuid;

    use super::*;
    use cache::{CachePlane, EphemeralCacheImpl};
    use errors::Error;
    use models::*;
    use repos::types::RepoResult;
    use services::types::{DynamicContext, Service, StaticContext};

    pub const MOCK_USER: &str = "user-1";
    pub const OTHER_USER: &str = "user-2";

    pub const CODE_AVAILABLE: &str = "SUMMER-AVAIL1";
    pub const CODE_ASSIGNED: &str = "SUMMER-ASSGN1";
    pub const CODE_LOCKED: &str = "SUMMER-LOCKD1";
    pub const CODE_REDEEMED: &str = "SUMMER-REDMD1";
    pub const CODE_DUPLICATE: &str = "SUMMER-DUPLC1";
    pub const CODE_FOREIGN: &str = "SUMMER-OTHER1";
    pub const CODE_EXPIRED_BOOK: &str = "EXPIRD-CODE01";
    pub const CODE_MULTI: &str = "MULTI-CODE001";
    pub const CODE_CAS_RACE: &str = "MULTI-RACER01";

    const ALL_CODES: &[&str] = &[
        CODE_AVAILABLE,
        CODE_ASSIGNED,
        CODE_LOCKED,
        CODE_REDEEMED,
        CODE_DUPLICATE,
        CODE_FOREIGN,
        CODE_EXPIRED_BOOK,
        CODE_MULTI,
        CODE_CAS_RACE,
    ];

    const WINDOW_START: u64 = 1_000_000_000;
    const WINDOW_END: u64 = 4_000_000_000;
    const PAST_END: u64 = 1_100_000_000;

    fn ts(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn book_uuid(n: u32) -> CouponBookId {
        CouponBookId(Uuid::parse_str(&format!("00000001-0000-4000-8000-{:012x}", n)).unwrap())
    }

    fn coupon_uuid(n: u32) -> CouponId {
        CouponId(Uuid::parse_str(&format!("00000002-0000-4000-8000-{:012x}", n)).unwrap())
    }

    fn assignment_uuid(n: u32) -> AssignmentId {
        AssignmentId(Uuid::parse_str(&format!("00000003-0000-4000-8000-{:012x}", n)).unwrap())
    }

    pub fn active_book_id() -> CouponBookId {
        book_uuid(1)
    }
    pub fn multi_book_id() -> CouponBookId {
        book_uuid(2)
    }
    pub fn expired_book_id() -> CouponBookId {
        book_uuid(3)
    }
    pub fn inactive_book_id() -> CouponBookId {
        book_uuid(4)
    }
    pub fn pattern_book_id() -> CouponBookId {
        book_uuid(5)
    }
    pub fn wide_pattern_book_id() -> CouponBookId {
        book_uuid(6)
    }
    pub fn near_full_pattern_book_id() -> CouponBookId {
        book_uuid(7)
    }
    pub fn full_pattern_book_id() -> CouponBookId {
        book_uuid(8)
    }
    pub fn limited_book_id() -> CouponBookId {
        book_uuid(9)
    }
    pub fn empty_book_id() -> CouponBookId {
        book_uuid(10)
    }
    pub fn missing_book_id() -> CouponBookId {
        book_uuid(99)
    }

    fn base_book(id: CouponBookId, name: &str) -> CouponBook {
        CouponBook {
            id,
            name: name.to_string(),
            description: None,
            is_active: true,
            valid_from: ts(WINDOW_START),
            valid_until: ts(WINDOW_END),
            max_redemptions_per_user: Some(1),
            max_assignments_per_user: Some(5),
            code_pattern: None,
            max_codes: None,
            total_codes: 5,
            metadata: json!({}),
            created_at: ts(WINDOW_START),
            updated_at: ts(WINDOW_START),
        }
    }

    pub fn mock_book(id: CouponBookId) -> Option<CouponBook> {
        if id == active_book_id() {
            let mut book = base_book(id, "Summer promo");
            book.description = Some("Seasonal discounts".to_string());
            Some(book)
        } else if id == multi_book_id() {
            let mut book = base_book(id, "Loyalty promo");
            book.max_redemptions_per_user = Some(3);
            Some(book)
        } else if id == expired_book_id() {
            let mut book = base_book(id, "Archive promo");
            book.valid_until = ts(PAST_END);
            Some(book)
        } else if id == inactive_book_id() {
            let mut book = base_book(id, "Paused promo");
            book.is_active = false;
            Some(book)
        } else if id == pattern_book_id() {
            let mut book = base_book(id, "Letter promo");
            book.code_pattern = Some("P{X}".to_string());
            book.max_codes = Some(30);
            book.total_codes = 0;
            Some(book)
        } else if id == wide_pattern_book_id() {
            let mut book = base_book(id, "Wide promo");
            book.code_pattern = Some("T{XXXX}".to_string());
            book.max_codes = Some(10);
            book.total_codes = 0;
            Some(book)
        } else if id == near_full_pattern_book_id() {
            let mut book = base_book(id, "Near promo");
            book.code_pattern = Some("T{XXXX}".to_string());
            book.max_codes = Some(10);
            book.total_codes = 8;
            Some(book)
        } else if id == full_pattern_book_id() {
            let mut book = base_book(id, "Full promo");
            book.code_pattern = Some("T{XXXX}".to_string());
            book.max_codes = Some(5);
            book.total_codes = 5;
            Some(book)
        } else if id == limited_book_id() {
            let mut book = base_book(id, "Single promo");
            book.max_assignments_per_user = Some(1);
            Some(book)
        } else if id == empty_book_id() {
            let mut book = base_book(id, "Empty promo");
            book.total_codes = 0;
            Some(book)
        } else {
            None
        }
    }

    pub fn mock_coupon_for_code(code: &str) -> Option<Coupon> {
        let (n, book_id, status) = match code {
            c if c == CODE_AVAILABLE => (1, active_book_id(), CouponStatus::Available),
            c if c == CODE_ASSIGNED => (2, active_book_id(), CouponStatus::Assigned),
            c if c == CODE_LOCKED => (3, active_book_id(), CouponStatus::Locked),
            c if c == CODE_REDEEMED => (4, active_book_id(), CouponStatus::Redeemed),
            c if c == CODE_DUPLICATE => (5, active_book_id(), CouponStatus::Available),
            c if c == CODE_FOREIGN => (6, active_book_id(), CouponStatus::Assigned),
            c if c == CODE_EXPIRED_BOOK => (7, expired_book_id(), CouponStatus::Assigned),
            c if c == CODE_MULTI => (8, multi_book_id(), CouponStatus::Assigned),
            c if c == CODE_CAS_RACE => (9, multi_book_id(), CouponStatus::Assigned),
            _ => return None,
        };
        Some(Coupon {
            id: coupon_uuid(n),
            coupon_book_id: book_id,
            code: CouponCode(code.to_string()),
            status,
            version: 1,
            created_at: ts(WINDOW_START),
            updated_at: ts(WINDOW_START),
        })
    }

    fn mock_coupon_by_id(id: CouponId) -> Option<Coupon> {
        ALL_CODES
            .iter()
            .filter_map(|code| mock_coupon_for_code(code))
            .find(|coupon| coupon.id == id)
    }

    fn base_assignment(n: u32, coupon_id: CouponId, user: &str) -> CouponAssignment {
        CouponAssignment {
            id: assignment_uuid(n),
            coupon_id,
            user_id: UserId(user.to_string()),
            assigned_at: ts(WINDOW_START),
            locked_at: None,
            lock_expires_at: None,
            redeemed_at: None,
            redemption_count: 0,
            metadata: json!({}),
            created_at: ts(WINDOW_START),
            updated_at: ts(WINDOW_START),
        }
    }

    pub fn mock_assignment(coupon_id: CouponId, user_id: &UserId) -> Option<CouponAssignment> {
        let coupon = mock_coupon_by_id(coupon_id)?;
        let code: &str = &coupon.code.0;
        let user: &str = &user_id.0;
        match (code, user) {
            (c, u) if c == CODE_ASSIGNED && u == MOCK_USER => Some(base_assignment(1, coupon_id, u)),
            (c, u) if c == CODE_LOCKED && u == MOCK_USER => {
                let mut assignment = base_assignment(2, coupon_id, u);
                assignment.locked_at = Some(ts(WINDOW_START));
                assignment.lock_expires_at = Some(ts(WINDOW_END));
                Some(assignment)
            }
            (c, u) if c == CODE_REDEEMED && u == MOCK_USER => {
                let mut assignment = base_assignment(3, coupon_id, u);
                assignment.redemption_count = 1;
                assignment.redeemed_at = Some(ts(WINDOW_START));
                Some(assignment)
            }
            (c, u) if c == CODE_FOREIGN && u == OTHER_USER => Some(base_assignment(4, coupon_id, u)),
            (c, u) if c == CODE_EXPIRED_BOOK && u == MOCK_USER => Some(base_assignment(5, coupon_id, u)),
            (c, u) if c == CODE_MULTI && u == MOCK_USER => {
                let mut assignment = base_assignment(6, coupon_id, u);
                assignment.redemption_count = 1;
                assignment.redeemed_at = Some(ts(WINDOW_START));
                Some(assignment)
            }
            (c, u) if c == CODE_CAS_RACE && u == MOCK_USER => Some(base_assignment(7, coupon_id, u)),
            _ => None,
        }
    }

    fn mock_assignment_by_id(id: AssignmentId) -> Option<CouponAssignment> {
        let pairs: &[(&str, &str)] = &[
            (CODE_ASSIGNED, MOCK_USER),
            (CODE_LOCKED, MOCK_USER),
            (CODE_REDEEMED, MOCK_USER),
            (CODE_FOREIGN, OTHER_USER),
            (CODE_EXPIRED_BOOK, MOCK_USER),
            (CODE_MULTI, MOCK_USER),
            (CODE_CAS_RACE, MOCK_USER),
        ];
        pairs.iter().filter_map(|&(code, user)| {
            let coupon = mock_coupon_for_code(code)?;
            mock_assignment(coupon.id, &UserId(user.to_string()))
        }).find(|assignment| assignment.id == id)
    }

    #[derive(Clone, Default)]
    pub struct CouponBooksRepoMock;

    impl CouponBooksRepo for CouponBooksRepoMock {
        fn create(&self, payload: NewCouponBook) -> RepoResult<CouponBook> {
            let now = SystemTime::now();
            Ok(CouponBook {
                id: book_uuid(100),
                name: payload.name,
                description: payload.description,
                is_active: true,
                valid_from: payload.valid_from,
                valid_until: payload.valid_until,
                max_redemptions_per_user: payload.max_redemptions_per_user,
                max_assignments_per_user: payload.max_assignments_per_user,
                code_pattern: payload.code_pattern,
                max_codes: payload.max_codes,
                total_codes: 0,
                metadata: payload.metadata,
                created_at: now,
                updated_at: now,
            })
        }

        fn find(&self, id_arg: CouponBookId) -> RepoResult<Option<CouponBook>> {
            Ok(mock_book(id_arg))
        }

        fn find_for_update(&self, id_arg: CouponBookId) -> RepoResult<Option<CouponBook>> {
            Ok(mock_book(id_arg))
        }

        fn find_by_name_description(&self, name: &str, description: Option<&str>) -> RepoResult<Option<CouponBook>> {
            if name == "Summer promo" && description == Some("Seasonal discounts") {
                Ok(mock_book(active_book_id()))
            } else {
                Ok(None)
            }
        }

        fn list(&self, offset: i64, limit: i64) -> RepoResult<Vec<CouponBook>> {
            let books: Vec<CouponBook> = vec![
                mock_book(active_book_id()).unwrap(),
                mock_book(multi_book_id()).unwrap(),
                mock_book(pattern_book_id()).unwrap(),
            ];
            Ok(books.into_iter().skip(offset as usize).take(limit as usize).collect())
        }

        fn deactivate(&self, id_arg: CouponBookId) -> RepoResult<CouponBook> {
            let mut book = mock_book(id_arg).ok_or(Error::NotFound)?;
            book.is_active = false;
            Ok(book)
        }

        fn increment_total_codes(&self, id_arg: CouponBookId, delta: i32) -> RepoResult<CouponBook> {
            let mut book = mock_book(id_arg).ok_or(Error::NotFound)?;
            book.total_codes += delta;
            Ok(book)
        }

        fn statistics(&self, _id_arg: CouponBookId) -> RepoResult<CouponBookStatistics> {
            Ok(CouponBookStatistics {
                available: 2,
                assigned: 1,
                locked: 1,
                redeemed: 1,
            })
        }
    }

    #[derive(Clone, Default)]
    pub struct CouponsRepoMock;

    impl CouponsRepo for CouponsRepoMock {
        fn create_many(&self, payloads: &[NewCoupon]) -> RepoResult<usize> {
            Ok(payloads
                .iter()
                .filter(|payload| mock_coupon_for_code(&payload.code.0).is_none())
                .count())
        }

        fn find_by_code(&self, code_arg: &CouponCode) -> RepoResult<Option<Coupon>> {
            Ok(mock_coupon_for_code(&code_arg.0))
        }

        fn find_by_code_for_update(&self, code_arg: &CouponCode) -> RepoResult<Option<Coupon>> {
            Ok(mock_coupon_for_code(&code_arg.0))
        }

        fn pick_available(&self, book_id_arg: CouponBookId) -> RepoResult<Option<Coupon>> {
            if book_id_arg == active_book_id() {
                Ok(mock_coupon_for_code(CODE_AVAILABLE))
            } else {
                Ok(None)
            }
        }

        fn set_status(&self, id_arg: CouponId, status_arg: CouponStatus) -> RepoResult<Coupon> {
            let mut coupon = mock_coupon_by_id(id_arg).ok_or(Error::NotFound)?;
            coupon.status = status_arg;
            coupon.version += 1;
            Ok(coupon)
        }

        fn set_status_versioned(
            &self,
            id_arg: CouponId,
            expected_version: i32,
            status_arg: CouponStatus,
        ) -> RepoResult<Option<Coupon>> {
            let mut coupon = mock_coupon_by_id(id_arg).ok_or(Error::NotFound)?;
            if coupon.code.0 == CODE_CAS_RACE || coupon.version != expected_version {
                return Ok(None);
            }
            coupon.status = status_arg;
            coupon.version += 1;
            Ok(Some(coupon))
        }

        fn list_by_book(&self, book_id_arg: CouponBookId, offset: i64, limit: i64) -> RepoResult<Vec<CouponPreview>> {
            if book_id_arg != active_book_id() {
                return Ok(vec![]);
            }
            let previews: Vec<CouponPreview> = [CODE_AVAILABLE, CODE_ASSIGNED, CODE_LOCKED, CODE_REDEEMED]
                .iter()
                .filter_map(|code| mock_coupon_for_code(code))
                .map(|coupon| CouponPreview {
                    code: coupon.code,
                    status: coupon.status,
                })
                .collect();
            Ok(previews.into_iter().skip(offset as usize).take(limit as usize).collect())
        }
    }

    #[derive(Clone, Default)]
    pub struct CouponAssignmentsRepoMock;

    impl CouponAssignmentsRepo for CouponAssignmentsRepoMock {
        fn create(&self, payload: NewCouponAssignment) -> RepoResult<CouponAssignment> {
            let duplicate = mock_coupon_for_code(CODE_DUPLICATE).unwrap();
            if payload.coupon_id == duplicate.id {
                return Err(Error::Conflict("coupon assignment already exists".to_string()).into());
            }
            let now = SystemTime::now();
            Ok(CouponAssignment {
                id: assignment_uuid(100),
                coupon_id: payload.coupon_id,
                user_id: payload.user_id,
                assigned_at: payload.assigned_at,
                locked_at: None,
                lock_expires_at: None,
                redeemed_at: None,
                redemption_count: 0,
                metadata: json!({}),
                created_at: now,
                updated_at: now,
            })
        }

        fn find_for_user(&self, coupon_id_arg: CouponId, user_id_arg: &UserId) -> RepoResult<Option<CouponAssignment>> {
            Ok(mock_assignment(coupon_id_arg, user_id_arg))
        }

        fn find_for_user_for_update(
            &self,
            coupon_id_arg: CouponId,
            user_id_arg: &UserId,
        ) -> RepoResult<Option<CouponAssignment>> {
            Ok(mock_assignment(coupon_id_arg, user_id_arg))
        }

        fn count_for_user_in_book(&self, book_id_arg: CouponBookId, user_id_arg: &UserId) -> RepoResult<i64> {
            if book_id_arg == limited_book_id() && user_id_arg.0 == MOCK_USER {
                Ok(1)
            } else {
                Ok(0)
            }
        }

        fn set_lock(&self, id_arg: AssignmentId, expires_at: SystemTime) -> RepoResult<CouponAssignment> {
            let mut assignment = mock_assignment_by_id(id_arg).ok_or(Error::NotFound)?;
            assignment.locked_at = Some(SystemTime::now());
            assignment.lock_expires_at = Some(expires_at);
            Ok(assignment)
        }

        fn clear_lock(&self, id_arg: AssignmentId) -> RepoResult<CouponAssignment> {
            let mut assignment = mock_assignment_by_id(id_arg).ok_or(Error::NotFound)?;
            assignment.locked_at = None;
            assignment.lock_expires_at = None;
            Ok(assignment)
        }

        fn record_redemption(
            &self,
            id_arg: AssignmentId,
            new_count: i32,
            redeemed_at: SystemTime,
            metadata: serde_json::Value,
        ) -> RepoResult<CouponAssignment> {
            let mut assignment = mock_assignment_by_id(id_arg).ok_or(Error::NotFound)?;
            assignment.redemption_count = new_count;
            assignment.redeemed_at = Some(redeemed_at);
            assignment.locked_at = None;
            assignment.lock_expires_at = None;
            assignment.metadata = metadata;
            Ok(assignment)
        }

        fn list_for_user(&self, user_id_arg: &UserId, offset: i64, limit: i64) -> RepoResult<Vec<(CouponAssignment, Coupon)>> {
            if user_id_arg.0 != MOCK_USER {
                return Ok(vec![]);
            }
            let rows: Vec<(CouponAssignment, Coupon)> = [CODE_ASSIGNED, CODE_REDEEMED]
                .iter()
                .filter_map(|code| {
                    let coupon = mock_coupon_for_code(code)?;
                    let assignment = mock_assignment(coupon.id, user_id_arg)?;
                    Some((assignment, coupon))
                })
                .collect();
            Ok(rows.into_iter().skip(offset as usize).take(limit as usize).collect())
        }
    }

    #[derive(Default, Copy, Clone)]
    pub struct ReposFactoryMock;

    impl ReposFactory<MockConnection> for ReposFactoryMock {
        fn create_coupon_books_repo<'a>(&self, _db_conn: &'a MockConnection) -> Box<CouponBooksRepo + 'a> {
            Box::new(CouponBooksRepoMock::default())
        }

        fn create_coupons_repo<'a>(&self, _db_conn: &'a MockConnection) -> Box<CouponsRepo + 'a> {
            Box::new(CouponsRepoMock::default())
        }

        fn create_coupon_assignments_repo<'a>(&self, _db_conn: &'a MockConnection) -> Box<CouponAssignmentsRepo + 'a> {
            Box::new(CouponAssignmentsRepoMock::default())
        }
    }

    pub struct MockConnection {
        tm: AnsiTransactionManager,
    }

    impl Connection for MockConnection {
        type Backend = Pg;
        type TransactionManager = AnsiTransactionManager;

        fn establish(_database_url: &str) -> ConnectionResult<MockConnection> {
            Ok(MockConnection {
                tm: AnsiTransactionManager::new(),
            })
        }

        fn execute(&self, _query: &str) -> QueryResult<usize> {
            unimplemented!()
        }

        fn query_by_index<T, U>(&self, _source: T) -> QueryResult<Vec<U>>
        where
            T: AsQuery,
            T::Query: QueryFragment<Pg> + QueryId,
            Pg: HasSqlType<T::SqlType>,
            U: Queryable<T::SqlType, Pg>,
        {
            unimplemented!()
        }

        fn query_by_name<T, U>(&self, _source: &T) -> QueryResult<Vec<U>>
        where
            T: QueryFragment<Pg> + QueryId,
            U: QueryableByName<Pg>,
        {
            unimplemented!()
        }

        fn execute_returning_count<T>(&self, _source: &T) -> QueryResult<usize>
        where
            T: QueryFragment<Pg> + QueryId,
        {
            unimplemented!()
        }

        fn transaction_manager(&self) -> &Self::TransactionManager {
            &self.tm
        }
    }

    impl SimpleConnection for MockConnection {
        fn batch_execute(&self, _query: &str) -> QueryResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockConnectionManager;

    impl ManageConnection for MockConnectionManager {
        type Connection = MockConnection;
        type Error = MockError;

        fn connect(&self) -> Result<MockConnection, MockError> {
            MockConnection::establish("mock").map_err(|_| MockError)
        }

        fn is_valid(&self, _conn: &mut MockConnection) -> Result<(), MockError> {
            Ok(())
        }

        fn has_broken(&self, _conn: &mut MockConnection) -> bool {
            false
        }
    }

    #[derive(Debug)]
    pub struct MockError;

    impl ::std::fmt::Display for MockError {
        fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
            write!(f, "mock connection error")
        }
    }

    impl ::std::error::Error for MockError {
        fn description(&self) -> &str {
            "mock connection error"
        }
    }

    pub fn create_service(
        user_id: Option<UserId>,
    ) -> Service<MockConnection, MockConnectionManager, ReposFactoryMock> {
        let manager = MockConnectionManager::default();
        let db_pool = r2d2::Pool::builder()
            .max_size(1)
            .build(manager)
            .expect("Failed to create mock connection pool");
        let cpu_pool = CpuPool::new(1);
        let cache: Arc<CachePlane> = Arc::new(EphemeralCacheImpl::new());
        let static_context = StaticContext::new(db_pool, cpu_pool, ReposFactoryMock::default(), cache);
        let dynamic_context = DynamicContext::new(user_id);
        Service::new(static_context, dynamic_context)
    }

    pub fn mock_user() -> UserId {
        UserId(MOCK_USER.to_string())
    }
}
