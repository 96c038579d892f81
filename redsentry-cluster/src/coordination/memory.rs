//! In-process coordination backend
//!
//! Single-node deployments have nothing to coordinate with, so the whole
//! store lives behind one lock and this coordinator is always the leader.
//! Integration tests run against this backend too.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use redsentry_core::{ClusterStatus, Error, HostConfig, NodeState, ReportMap, Result};

use super::CoordinationClient;

#[derive(Default)]
struct Store {
    reports: ReportMap,
    status: ClusterStatus,
    manual_failover: Option<HostConfig>,
}

pub struct MemoryCoordination {
    store: Mutex<Store>,
    updates: broadcast::Sender<ClusterStatus>,
}

impl MemoryCoordination {
    #[must_use]
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            store: Mutex::new(Store::default()),
            updates,
        }
    }
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordination {
    async fn publish_node_states(
        &self,
        node_id: &str,
        states: &HashMap<HostConfig, NodeState>,
    ) -> Result<()> {
        self.store
            .lock()
            .reports
            .insert(node_id.to_string(), states.clone());
        Ok(())
    }

    async fn node_reports(&self) -> Result<ReportMap> {
        Ok(self.store.lock().reports.clone())
    }

    async fn cluster_status(&self) -> Result<ClusterStatus> {
        Ok(self.store.lock().status.clone())
    }

    async fn publish_cluster_status(&self, status: &ClusterStatus) -> Result<()> {
        if !status.has_primary() {
            return Err(Error::InvalidState(
                "refusing to publish a cluster status without a primary".to_string(),
            ));
        }
        self.store.lock().status = status.clone();
        // No receivers is fine, nobody subscribed yet
        let _ = self.updates.send(status.clone());
        Ok(())
    }

    async fn manual_failover_target(&self) -> Result<Option<HostConfig>> {
        Ok(self.store.lock().manual_failover.clone())
    }

    async fn request_manual_failover(&self, target: &HostConfig) -> Result<()> {
        self.store.lock().manual_failover = Some(target.clone());
        Ok(())
    }

    async fn clear_manual_failover(&self) -> Result<()> {
        self.store.lock().manual_failover = None;
        Ok(())
    }

    async fn wait_for_leadership(&self, _wait: Duration) -> Result<bool> {
        Ok(true)
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterStatus> {
        self.updates.subscribe()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn rejects_status_without_primary() {
        let coordination = MemoryCoordination::new();
        let status = ClusterStatus::new(
            None,
            HashSet::new(),
            HashSet::from([HostConfig::new("redis-1", 6379)]),
        );

        let err = coordination.publish_cluster_status(&status).await;
        assert!(matches!(err, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn broadcasts_published_statuses() {
        let coordination = MemoryCoordination::new();
        let mut updates = coordination.subscribe();

        let status = ClusterStatus::new(
            Some(HostConfig::new("redis-1", 6379)),
            HashSet::from([HostConfig::new("redis-2", 6380)]),
            HashSet::new(),
        );
        coordination.publish_cluster_status(&status).await.unwrap();

        let seen = updates.recv().await.unwrap();
        assert_eq!(seen, status);
    }

    #[tokio::test]
    async fn manual_failover_round_trip() {
        let coordination = MemoryCoordination::new();
        assert_eq!(coordination.manual_failover_target().await.unwrap(), None);

        let target = HostConfig::new("redis-2", 6380);
        coordination.request_manual_failover(&target).await.unwrap();
        assert_eq!(
            coordination.manual_failover_target().await.unwrap(),
            Some(target)
        );

        coordination.clear_manual_failover().await.unwrap();
        assert_eq!(coordination.manual_failover_target().await.unwrap(), None);
    }
}
