//! Moving parts of the redsentry failover coordinator: per-instance health
//! probes, the coordination-store client, the reconciling coordinator, and
//! the failover-aware request router.

pub mod client;
pub mod config;
pub mod coordination;
pub mod manager;
pub mod node;
pub mod test_support;

pub use client::{FailoverClient, Ring};
pub use config::{generate_node_id, ManagerConfig};
pub use coordination::{
    CoordinationClient, MemoryCoordination, RedisCoordination, RedisCoordinationConfig,
};
pub use manager::{ClusterListener, ClusterView, ManagerState, NodeManager};
pub use node::{Node, NodeListener};
