//! # clustermeta
//!
//! Cluster membership and placement metadata for a distributed store:
//! - Logical rooms grouping physical rooms (data centers)
//! - Storage instances with capacity, resource tag and liveness
//! - Rolling and least-loaded placement of new replicas
//! - Every change ordered through a Raft log and applied on all replicas
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Cluster Manager                 │
//! │  (Raft-ordered membership changes)      │
//! │   - Leader: accepts changes, liveness   │
//! │   - Followers: apply committed entries  │
//! └───────────┬─────────────────────────────┘
//!             │ HTTP heartbeats
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───▼──────────┐
//! │ Store 1    │   │ Store 2    │   │ Store 3      │
//! │ (room A)   │   │ (room A)   │   │ (room B)     │
//! └────────────┘   └────────────┘   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a cluster manager
//! ```bash
//! clustermeta-server serve \
//!   --id meta-1 \
//!   --bind 0.0.0.0:8010 \
//!   --db ./meta-data
//! ```
//!
//! ### Use the CLI
//! ```bash
//! clustermeta add-logical bj
//! clustermeta add-physical bj bj-1
//! clustermeta add-instance 10.0.0.1:8010 --capacity 1000 --room bj-1
//! clustermeta select --tag ssd
//! clustermeta status
//! ```

pub mod common;
pub mod meta;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use meta::{ClusterManager, MetaServer};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
