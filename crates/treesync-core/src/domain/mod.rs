//! Domain types
//!
//! - Newtypes for validated relative paths and hash pairs
//! - Domain-specific error types

pub mod errors;
pub mod newtypes;

pub use errors::DomainError;
pub use newtypes::*;
