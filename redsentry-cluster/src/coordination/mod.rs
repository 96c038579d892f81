//! Coordination-service client
//!
//! The coordinators agree on the cluster picture through a small shared
//! store: per-coordinator node reports, the current cluster status, a
//! manual-failover request slot, and a leader lease. [`CoordinationClient`]
//! is the contract; [`RedisCoordination`] backs it with a Redis instance and
//! [`MemoryCoordination`] keeps everything in-process for single-node
//! deployments and tests.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use redsentry_core::{ClusterStatus, HostConfig, ReportMap, Result};

mod memory;
mod redis;

pub use memory::MemoryCoordination;
pub use self::redis::{RedisCoordination, RedisCoordinationConfig};

/// Client contract for the shared coordination store.
///
/// Reports are ephemeral: an implementation must stop returning a
/// coordinator's report once that coordinator has been silent for its TTL.
/// The cluster status is persistent and survives every coordinator dying.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Publish this coordinator's view of every configured instance.
    async fn publish_node_states(
        &self,
        node_id: &str,
        states: &std::collections::HashMap<HostConfig, redsentry_core::NodeState>,
    ) -> Result<()>;

    /// All live coordinators' reports, keyed by coordinator id.
    async fn node_reports(&self) -> Result<ReportMap>;

    /// The last published cluster status, or an empty one if none exists.
    async fn cluster_status(&self) -> Result<ClusterStatus>;

    /// Publish a new cluster status. Rejects a status without a primary:
    /// a coordinator never records that the cluster has no write target.
    async fn publish_cluster_status(&self, status: &ClusterStatus) -> Result<()>;

    /// The pending manual-failover target, if an operator requested one.
    async fn manual_failover_target(&self) -> Result<Option<HostConfig>>;

    /// Ask the leader to promote the given instance on its next pass.
    async fn request_manual_failover(&self, target: &HostConfig) -> Result<()>;

    /// Consume the pending manual-failover request.
    async fn clear_manual_failover(&self) -> Result<()>;

    /// Try to become (or remain) leader, waiting at most `wait` for the
    /// lease to free up. Returns whether this coordinator holds the lease.
    async fn wait_for_leadership(&self, wait: Duration) -> Result<bool>;

    /// Whether this coordinator currently holds the leader lease.
    fn is_leader(&self) -> bool;

    /// Subscribe to cluster-status updates observed by this client.
    fn subscribe(&self) -> broadcast::Receiver<ClusterStatus>;

    /// Release the lease, stop background tasks, drop the connection.
    async fn close(&self) -> Result<()>;
}
