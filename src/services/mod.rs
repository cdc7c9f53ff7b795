//! Services is a core layer for the app business logic like
//! validation, state transitions and concurrency control.

pub mod books;
pub mod coupons;
pub mod types;

pub use self::books::*;
pub use self::coupons::*;
pub use self::types::*;
