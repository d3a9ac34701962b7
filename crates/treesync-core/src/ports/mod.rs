//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the interfaces the sync engine depends on, but whose
//! implementations live elsewhere.
//!
//! ## Ports Overview
//!
//! - [`Container`] - Remote object store: metadata, download, upload, delete
//! - [`ErrorReporter`] - User-facing error display, one message per failure category

pub mod container;
pub mod error_reporter;

pub use container::{Container, ContainerError, ContainerResult, RemoteFile, RemoteInfo};
pub use error_reporter::{ErrorCategory, ErrorReporter, TracingReporter};
