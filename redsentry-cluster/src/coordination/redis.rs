//! Redis-backed coordination store
//!
//! Layout under a configurable namespace:
//!
//! - `{ns}:cluster_status` — persistent JSON cluster status
//! - `{ns}:reports:{node_id}` — per-coordinator node states, SETEX with a
//!   TTL so a dead coordinator's report ages out on its own
//! - `{ns}:manual_failover` — pending operator request, `host:port`
//! - `{ns}:leader` — leader lease, SET NX PX plus Lua compare-and-extend
//!
//! A watch task polls the cluster status and broadcasts changes; a refresh
//! task keeps the lease alive while this coordinator is leader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use redsentry_core::codec;
use redsentry_core::{ClusterStatus, Error, HostConfig, NodeState, ReportMap, Result};

use super::CoordinationClient;

/// Extend the lease TTL only if we still own it.
const EXTEND_LEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Delete the lease only if we still own it.
const RELEASE_LEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Debug, Clone)]
pub struct RedisCoordinationConfig {
    /// Redis URL of the coordination store, e.g. `redis://127.0.0.1:6400/0`.
    pub url: String,
    /// Key namespace prefix.
    pub namespace: String,
    /// This coordinator's id, used as report key suffix and lease value.
    pub node_id: String,
    /// TTL on per-coordinator reports.
    pub report_ttl: Duration,
    /// Leader lease lifetime; refreshed at a third of this.
    pub lease_ttl: Duration,
    /// Poll interval of the cluster-status watch.
    pub watch_interval: Duration,
    /// Per-command timeout.
    pub op_timeout: Duration,
}

impl RedisCoordinationConfig {
    #[must_use]
    pub fn new(url: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: "redsentry".to_string(),
            node_id: node_id.into(),
            report_ttl: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(10),
            watch_interval: Duration::from_secs(5),
            op_timeout: Duration::from_secs(5),
        }
    }
}

pub struct RedisCoordination {
    client: redis::Client,
    config: RedisCoordinationConfig,
    leader: AtomicBool,
    updates: broadcast::Sender<ClusterStatus>,
    cancel: CancellationToken,
}

impl RedisCoordination {
    /// Connect to the coordination store and start the watch and lease
    /// refresh tasks.
    pub fn connect(config: RedisCoordinationConfig) -> Result<Arc<Self>> {
        let client = redis::Client::open(config.url.clone())
            .map_err(|e| Error::Configuration(format!("invalid coordination url: {e}")))?;
        let (updates, _) = broadcast::channel(16);

        let coordination = Arc::new(Self {
            client,
            config,
            leader: AtomicBool::new(false),
            updates,
            cancel: CancellationToken::new(),
        });

        coordination.clone().spawn_watch();
        coordination.clone().spawn_lease_refresh();

        Ok(coordination)
    }

    fn status_key(&self) -> String {
        format!("{}:cluster_status", self.config.namespace)
    }

    fn report_key(&self, node_id: &str) -> String {
        format!("{}:reports:{node_id}", self.config.namespace)
    }

    fn report_pattern(&self) -> String {
        format!("{}:reports:*", self.config.namespace)
    }

    fn manual_key(&self) -> String {
        format!("{}:manual_failover", self.config.namespace)
    }

    fn leader_key(&self) -> String {
        format!("{}:leader", self.config.namespace)
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        timeout(
            self.config.op_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::Timeout("coordination connect timed out".to_string()))?
        .map_err(|e| Error::Coordination(format!("coordination connect failed: {e}")))
    }

    async fn run<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut conn = self.conn().await?;
        timeout(self.config.op_timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| Error::Timeout("coordination command timed out".to_string()))?
            .map_err(|e| Error::Coordination(format!("coordination command failed: {e}")))
    }

    async fn scan_report_keys(&self) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = self.report_pattern();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = timeout(
                self.config.op_timeout,
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn),
            )
            .await
            .map_err(|_| Error::Timeout("coordination SCAN timed out".to_string()))?
            .map_err(|e| Error::Coordination(format!("coordination SCAN failed: {e}")))?;

            cursor = next;
            keys.extend(batch);

            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }

    /// One lease grab. SET NX PX wins a free lease; an already-held lease
    /// is re-extended through the compare-and-extend script.
    async fn try_acquire_lease(&self) -> Result<bool> {
        #[allow(clippy::cast_possible_truncation)]
        let ttl_ms = self.config.lease_ttl.as_millis() as u64;

        let acquired: Option<String> = self
            .run(
                redis::cmd("SET")
                    .arg(self.leader_key())
                    .arg(&self.config.node_id)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms),
            )
            .await?;

        if acquired.is_some() {
            return Ok(true);
        }

        self.extend_lease().await
    }

    async fn extend_lease(&self) -> Result<bool> {
        #[allow(clippy::cast_possible_truncation)]
        let ttl_ms = self.config.lease_ttl.as_millis() as u64;

        let mut conn = self.conn().await?;
        let script = redis::Script::new(EXTEND_LEASE);
        let extended: i64 = timeout(
            self.config.op_timeout,
            script
                .key(self.leader_key())
                .arg(&self.config.node_id)
                .arg(ttl_ms)
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("lease extension timed out".to_string()))?
        .map_err(|e| Error::Coordination(format!("lease extension failed: {e}")))?;

        Ok(extended == 1)
    }

    async fn release_lease(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(RELEASE_LEASE);
        let _released: i64 = timeout(
            self.config.op_timeout,
            script
                .key(self.leader_key())
                .arg(&self.config.node_id)
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("lease release timed out".to_string()))?
        .map_err(|e| Error::Coordination(format!("lease release failed: {e}")))?;

        Ok(())
    }

    fn spawn_watch(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut last: Option<ClusterStatus> = None;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.watch_interval) => {}
                }

                match self.cluster_status().await {
                    Ok(status) => {
                        if last.as_ref() != Some(&status) {
                            last = Some(status.clone());
                            let _ = self.updates.send(status);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "cluster status watch poll failed");
                    }
                }
            }
        });
    }

    fn spawn_lease_refresh(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        let refresh_interval = self.config.lease_ttl / 3;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(refresh_interval) => {}
                }

                if !self.leader.load(Ordering::SeqCst) {
                    continue;
                }

                match self.extend_lease().await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(
                            node_id = %self.config.node_id,
                            "leader lease lost to another coordinator"
                        );
                        self.leader.store(false, Ordering::SeqCst);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "leader lease refresh failed");
                    }
                }
            }
        });
    }
}

#[async_trait]
impl CoordinationClient for RedisCoordination {
    async fn publish_node_states(
        &self,
        node_id: &str,
        states: &HashMap<HostConfig, NodeState>,
    ) -> Result<()> {
        let value = codec::encode_node_states(states)?;
        let () = self
            .run(
                redis::cmd("SETEX")
                    .arg(self.report_key(node_id))
                    .arg(self.config.report_ttl.as_secs())
                    .arg(&value),
            )
            .await?;
        Ok(())
    }

    async fn node_reports(&self) -> Result<ReportMap> {
        let keys = self.scan_report_keys().await?;
        let prefix = format!("{}:reports:", self.config.namespace);
        let mut reports = ReportMap::new();

        for key in keys {
            let Some(node_id) = key.strip_prefix(&prefix) else {
                continue;
            };
            let value: Option<String> = self.run(redis::cmd("GET").arg(&key)).await?;
            // A report can expire between SCAN and GET
            let Some(value) = value else { continue };

            match codec::decode_node_states(&value) {
                Ok(states) => {
                    reports.insert(node_id.to_string(), states);
                }
                Err(e) => {
                    tracing::warn!(node_id, error = %e, "discarding malformed node report");
                }
            }
        }

        Ok(reports)
    }

    async fn cluster_status(&self) -> Result<ClusterStatus> {
        let value: Option<String> = self.run(redis::cmd("GET").arg(self.status_key())).await?;
        match value {
            Some(value) => codec::decode_cluster_status(&value),
            None => Ok(ClusterStatus::empty()),
        }
    }

    async fn publish_cluster_status(&self, status: &ClusterStatus) -> Result<()> {
        // The lease refresh task can drop leadership mid-pass; a deposed
        // leader must not overwrite the new leader's topology.
        if !self.leader.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "refusing to publish a cluster status without the leader lease".to_string(),
            ));
        }
        if !status.has_primary() {
            return Err(Error::InvalidState(
                "refusing to publish a cluster status without a primary".to_string(),
            ));
        }

        let value = codec::encode_cluster_status(status)?;
        let () = self
            .run(redis::cmd("SET").arg(self.status_key()).arg(&value))
            .await?;

        // Leaders observe their own writes immediately, without waiting for
        // the watch poll.
        let _ = self.updates.send(status.clone());
        Ok(())
    }

    async fn manual_failover_target(&self) -> Result<Option<HostConfig>> {
        let value: Option<String> = self.run(redis::cmd("GET").arg(self.manual_key())).await?;
        let Some(value) = value else { return Ok(None) };

        match HostConfig::parse(&value) {
            Ok(host) => Ok(Some(host)),
            Err(e) => {
                tracing::warn!(value, error = %e, "deleting malformed manual failover request");
                self.clear_manual_failover().await?;
                Ok(None)
            }
        }
    }

    async fn request_manual_failover(&self, target: &HostConfig) -> Result<()> {
        let () = self
            .run(
                redis::cmd("SET")
                    .arg(self.manual_key())
                    .arg(target.address()),
            )
            .await?;
        Ok(())
    }

    async fn clear_manual_failover(&self) -> Result<()> {
        let _deleted: u64 = self.run(redis::cmd("DEL").arg(self.manual_key())).await?;
        Ok(())
    }

    async fn wait_for_leadership(&self, wait: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if self.try_acquire_lease().await? {
                self.leader.store(true, Ordering::SeqCst);
                return Ok(true);
            }
            self.leader.store(false, Ordering::SeqCst);

            let retry = Duration::from_millis(500);
            if tokio::time::Instant::now() + retry > deadline {
                return Ok(false);
            }
            tokio::time::sleep(retry).await;
        }
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterStatus> {
        self.updates.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        if self.leader.swap(false, Ordering::SeqCst) {
            self.release_lease().await?;
        }
        Ok(())
    }
}
