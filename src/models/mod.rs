//! Models contains all structures that are used in different
//! modules of the app

pub mod assignment;
pub mod book;
pub mod code_generator;
pub mod coupon;
pub mod validation_rules;

pub use self::assignment::*;
pub use self::book::*;
pub use self::code_generator::*;
pub use self::coupon::*;
pub use self::validation_rules::*;
