//! TreeSync Core - Domain types, configuration and ports
//!
//! This crate contains the pieces shared by every other TreeSync crate:
//! - **Domain types** - `RelPath`, `HashPair`, `DomainError`
//! - **Configuration** - YAML-backed [`config::Config`] with validation and a builder
//! - **Port definitions** - Traits for adapters: `Container`, `ErrorReporter`
//!
//! # Architecture
//!
//! The domain module is pure data with no I/O. Ports define the trait
//! interfaces the sync engine depends on; their implementations live in
//! `treesync-sync` (local side) or in the embedding application (remote side).

pub mod config;
pub mod domain;
pub mod ports;
