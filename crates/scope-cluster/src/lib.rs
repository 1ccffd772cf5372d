//! Scopeway cluster — the cross-node contract used by websocket transports.
//!
//! A [`ClusterContext`] gives each node a shared session directory
//! ("which sessions are open on which path, on which node") and asynchronous
//! messaging to sessions owned by other nodes. [`MemoryCluster`] implements
//! it in-process for tests and single-host multi-node setups.

pub mod cluster;
pub mod error;
pub mod memory;

pub use cluster::{ClusterContext, ClusterMessage, ClusterSessionListener, SendFuture, SessionId, UserProperties};
pub use error::ClusterError;
pub use memory::{MemoryCluster, MemoryClusterNode};
