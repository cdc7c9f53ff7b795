//! Repos is a module responsible for interacting with postgres db

pub mod assignments;
pub mod coupon_books;
pub mod coupons;
pub mod error;
pub mod repo_factory;
pub mod types;

pub use self::assignments::*;
pub use self::coupon_books::*;
pub use self::coupons::*;
pub use self::repo_factory::*;
pub use self::types::*;
