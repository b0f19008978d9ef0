//! Database models split into domain-specific modules.

pub mod integration;
pub mod organization;
pub mod repository;

pub use integration::*;
pub use organization::*;
pub use repository::*;
