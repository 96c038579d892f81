//! Per-instance health probe
//!
//! One `Node` owns one connection to one managed Redis instance. Its probe
//! loop pings the instance, measures latency, and reports online/offline
//! transitions to listeners. The same serialized connection carries the
//! control calls (INFO role inspection, REPLICAOF) used during bootstrap
//! election and role reconciliation.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use redsentry_core::conn::{info_keys, parse_info, ConnectionFactory, RedisActions};
use redsentry_core::{Error, HostConfig, NodeState, Result};

/// Observer of one probe's state transitions. Callbacks run concurrently
/// with reconciliation and must treat events as asynchronous notifications.
#[async_trait]
pub trait NodeListener: Send + Sync {
    async fn node_online(&self, host: &HostConfig, latency_ms: u64) -> Result<()>;
    async fn node_offline(&self, host: &HostConfig, error: &Error) -> Result<()>;
}

/// Health probe for a single instance.
pub struct Node {
    host: HostConfig,
    factory: Arc<dyn ConnectionFactory>,
    probe_interval: Duration,
    max_errors: u32,
    listeners: RwLock<Vec<Arc<dyn NodeListener>>>,
    /// One probe, one connection, no concurrent use
    conn: Mutex<Option<Box<dyn RedisActions>>>,
    state: RwLock<Option<NodeState>>,
    error_count: AtomicU32,
    cancel: CancellationToken,
}

type ConnOp<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

impl Node {
    pub fn new(
        host: HostConfig,
        factory: Arc<dyn ConnectionFactory>,
        probe_interval: Duration,
        max_errors: u32,
    ) -> Self {
        Self {
            host,
            factory,
            probe_interval,
            max_errors,
            listeners: RwLock::new(Vec::new()),
            conn: Mutex::new(None),
            state: RwLock::new(None),
            error_count: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn host(&self) -> &HostConfig {
        &self.host
    }

    /// The last state this probe observed; `None` until the first cycle
    /// completes.
    #[must_use]
    pub fn current_state(&self) -> Option<NodeState> {
        *self.state.read()
    }

    pub fn add_listener(&self, listener: Arc<dyn NodeListener>) {
        self.listeners.write().push(listener);
    }

    /// Probe loop. Runs until [`Node::stop`] is called; a failure to
    /// reconnect is reported through the error counter and retried next
    /// cycle, never fatal to the loop.
    pub async fn run(self: Arc<Self>) {
        info!(host = %self.host, "starting health probe");

        while !self.cancel.is_cancelled() {
            let started = Instant::now();

            match self.with_conn(|conn| Box::pin(conn.ping())).await {
                Ok(()) => {
                    #[allow(clippy::cast_possible_truncation)]
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.error_count.store(0, Ordering::Relaxed);

                    let new_state = NodeState::online(latency_ms);
                    let changed = {
                        let mut state = self.state.write();
                        if *state == Some(new_state) {
                            false
                        } else {
                            *state = Some(new_state);
                            true
                        }
                    };

                    if changed {
                        self.fire_online(latency_ms).await;
                    }
                }
                Err(error) => {
                    // Counted and (past the threshold) reported by with_conn
                    debug!(host = %self.host, %error, "probe cycle failed");
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.probe_interval) => {}
            }
        }

        info!(host = %self.host, "health probe stopped");
    }

    /// Stop the probe loop. Idempotent; the loop observes the flag within
    /// one sleep interval.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.listeners.write().clear();
        *self.state.write() = Some(NodeState::OFFLINE);
    }

    /// Whether the instance currently reports itself as the writable
    /// primary.
    pub async fn is_primary(&self) -> Result<bool> {
        let info = self.info().await?;
        Ok(info.get(info_keys::ROLE).map(String::as_str) == Some(info_keys::ROLE_PRIMARY))
    }

    /// The primary this instance replicates, if it is a replica.
    pub async fn primary_address(&self) -> Result<Option<HostConfig>> {
        let info = self.info().await?;

        let (Some(host), Some(port)) = (
            info.get(info_keys::PRIMARY_HOST),
            info.get(info_keys::PRIMARY_PORT),
        ) else {
            return Ok(None);
        };

        let port: u16 = port.parse().map_err(|_| {
            Error::Connection(format!("{} reported invalid primary port {port:?}", self.host))
        })?;

        Ok(Some(HostConfig::new(host.clone(), port)))
    }

    pub async fn make_replica_of(&self, host: &str, port: u16) -> Result<()> {
        let host = host.to_string();
        self.with_conn(move |conn| {
            Box::pin(async move { conn.replica_of(&host, port).await })
        })
        .await
    }

    pub async fn become_primary(&self) -> Result<()> {
        self.with_conn(|conn| Box::pin(conn.promote_to_primary()))
            .await
    }

    async fn info(&self) -> Result<std::collections::HashMap<String, String>> {
        let raw = self.with_conn(|conn| Box::pin(conn.info())).await?;
        Ok(parse_info(&raw))
    }

    /// Run one command on the (lazily reconnected) connection. Any failure
    /// discards the connection so the next attempt reconnects, and feeds
    /// the consecutive-error counter.
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut dyn RedisActions) -> ConnOp<'a, T>,
    {
        let mut guard = self.conn.lock().await;

        if guard.is_none() {
            match self.factory.create(&self.host).await {
                Ok(conn) => *guard = Some(conn),
                Err(error) => {
                    drop(guard);
                    return Err(self.register_error(error).await);
                }
            }
        }

        let result = match guard.as_mut() {
            Some(conn) => op(conn.as_mut()).await,
            None => return Err(Error::Connection(format!("no connection to {}", self.host))),
        };

        match result {
            Ok(value) => {
                drop(guard);
                Ok(value)
            }
            Err(error) => {
                *guard = None;
                drop(guard);
                Err(self.register_error(error).await)
            }
        }
    }

    async fn register_error(&self, error: Error) -> Error {
        let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            host = %self.host,
            consecutive_errors = count,
            %error,
            "command to instance failed"
        );

        if count > self.max_errors {
            let transitioned = {
                let mut state = self.state.write();
                if *state == Some(NodeState::OFFLINE) {
                    false
                } else {
                    *state = Some(NodeState::OFFLINE);
                    true
                }
            };

            if transitioned {
                self.fire_offline(&error).await;
            }
        }

        error
    }

    async fn fire_online(&self, latency_ms: u64) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if let Err(error) = listener.node_online(&self.host, latency_ms).await {
                warn!(host = %self.host, %error, "online listener failed");
            }
        }
    }

    async fn fire_offline(&self, cause: &Error) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if let Err(error) = listener.node_offline(&self.host, cause).await {
                warn!(host = %self.host, %error, "offline listener failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeFactory, FakeRedis};
    use parking_lot::Mutex as SyncMutex;

    struct RecordingListener {
        events: SyncMutex<Vec<String>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: SyncMutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    #[async_trait]
    impl NodeListener for RecordingListener {
        async fn node_online(&self, host: &HostConfig, _latency_ms: u64) -> Result<()> {
            self.events.lock().push(format!("online:{host}"));
            Ok(())
        }

        async fn node_offline(&self, host: &HostConfig, _error: &Error) -> Result<()> {
            self.events.lock().push(format!("offline:{host}"));
            Ok(())
        }
    }

    fn probe(instance: &Arc<FakeRedis>) -> (Arc<Node>, Arc<RecordingListener>) {
        let factory = FakeFactory::new();
        factory.register(instance.clone());

        let node = Arc::new(Node::new(
            instance.host().clone(),
            Arc::new(factory),
            Duration::from_millis(5),
            2,
        ));

        let listener = RecordingListener::new();
        node.add_listener(listener.clone());
        (node, listener)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_probe_reports_online() {
        let instance = FakeRedis::primary("redis-1", 6379);
        let (node, listener) = probe(&instance);

        let handle = tokio::spawn(node.clone().run());
        wait_for(|| !listener.events().is_empty()).await;

        assert!(listener.events()[0].starts_with("online:"));
        assert!(matches!(
            node.current_state(),
            Some(state) if !state.offline
        ));

        node.stop();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_probe_goes_offline_after_error_threshold() {
        let instance = FakeRedis::primary("redis-1", 6379);
        let (node, listener) = probe(&instance);

        let handle = tokio::spawn(node.clone().run());
        wait_for(|| !listener.events().is_empty()).await;

        instance.fail(true);
        wait_for(|| listener.events().iter().any(|e| e.starts_with("offline:"))).await;

        assert_eq!(node.current_state(), Some(NodeState::OFFLINE));
        // Threshold is 2, so the offline event fires exactly once
        let offline = listener
            .events()
            .iter()
            .filter(|e| e.starts_with("offline:"))
            .count();
        assert_eq!(offline, 1);

        node.stop();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_probe_recovers_after_failure() {
        let instance = FakeRedis::primary("redis-1", 6379);
        let (node, listener) = probe(&instance);

        let handle = tokio::spawn(node.clone().run());
        wait_for(|| !listener.events().is_empty()).await;

        instance.fail(true);
        wait_for(|| listener.events().iter().any(|e| e.starts_with("offline:"))).await;

        instance.fail(false);
        wait_for(|| {
            listener
                .events()
                .last()
                .is_some_and(|e| e.starts_with("online:"))
        })
        .await;

        node.stop();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_role_inspection() {
        let primary = FakeRedis::primary("redis-1", 6379);
        let (node, _listener) = probe(&primary);
        assert!(node.is_primary().await.unwrap());
        assert_eq!(node.primary_address().await.unwrap(), None);

        let replica = FakeRedis::replica_of("redis-2", 6380, "redis-1", 6379);
        let (node, _listener) = probe(&replica);
        assert!(!node.is_primary().await.unwrap());
        assert_eq!(
            node.primary_address().await.unwrap(),
            Some(HostConfig::new("redis-1", 6379))
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let instance = FakeRedis::primary("redis-1", 6379);
        let (node, _listener) = probe(&instance);

        let handle = tokio::spawn(node.clone().run());
        node.stop();
        node.stop();
        let _ = handle.await;

        assert_eq!(node.current_state(), Some(NodeState::OFFLINE));
    }
}
