//! TreeSync Conflict - Divergence detection and conflict naming
//!
//! Provides:
//! - Three-way comparison of current and last-known hashes
//! - Unique, timestamped names for conflict copies

pub mod detector;
pub mod namer;

pub use detector::Divergence;
pub use namer::ConflictNamer;
