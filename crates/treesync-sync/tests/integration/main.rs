//! Integration tests for treesync-sync
//!
//! Drives tasks through a running scheduler against an in-memory container
//! and a temporary local replica, then checks both sides and the index.

mod common;

mod test_flows;
mod test_move_collisions;
mod test_scenarios;
