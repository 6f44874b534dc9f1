//! Cluster manager with Raft-ordered membership changes
//!
//! The cluster manager is responsible for:
//! - Topology (logical rooms → physical rooms)
//! - Instance registry and liveness
//! - Placement decisions (rolling and least-loaded)
//! - Snapshots of the replicated state

pub mod client;
pub mod gateway;
pub mod health;
pub mod http;
pub mod manager;
pub mod metadata;
pub mod model;
pub mod placement;
pub mod raft_node;
pub mod registry;
pub mod server;
pub mod snapshot;
pub mod topology;

pub use client::AdminClient;
pub use manager::ClusterManager;
pub use model::{Instance, InstanceSpec, InstanceStatus, LogicalRoom, Mutation, StoreHeartbeat};
pub use placement::PlacementManager;
pub use raft_node::{ConsensusLog, LogEntry, RaftNode};
pub use registry::InstanceRegistry;
pub use server::{LocalNode, MetaServer};
pub use snapshot::{MemorySnapshotStore, RecordBatch, SnapshotStore};
pub use topology::TopologyRegistry;
