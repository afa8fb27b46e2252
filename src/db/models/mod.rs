//! Database models split into separate files.

pub mod member;
pub mod project;
pub mod push_token;

pub use self::member::*;
pub use self::project::*;
pub use self::push_token::*;
