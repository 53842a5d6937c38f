//! HTTP request handlers.

pub mod health;
pub mod imports;
pub mod quota;

pub use health::*;
pub use imports::*;
pub use quota::*;
