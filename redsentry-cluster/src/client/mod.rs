//! Failover-aware request router
//!
//! `FailoverClient` looks like one Redis connection but routes every
//! command by role: writes go to the current primary, reads round-robin
//! over the replicas (falling back to the primary when none exist). It
//! tracks the topology through a [`ClusterView`] and drops its cached
//! connections whenever the published topology moves underneath it.

mod ring;

pub use ring::Ring;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tracing::{debug, info};

use redsentry_core::conn::{ConnectionFactory, RedisActions};
use redsentry_core::{ClusterStatus, Error, HostConfig, Result};

use crate::manager::{ClusterListener, ClusterView};

type ConnOp<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

pub struct FailoverClient {
    view: Arc<dyn ClusterView>,
    factory: Arc<dyn ConnectionFactory>,
    primary_conn: Mutex<Option<Box<dyn RedisActions>>>,
    replica_conns: Mutex<HashMap<HostConfig, Box<dyn RedisActions>>>,
    ring: SyncMutex<Ring<HostConfig>>,
}

impl FailoverClient {
    pub fn new(view: Arc<dyn ClusterView>, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        let ring = Self::build_ring(&view.current_status());

        let client = Arc::new(Self {
            view: view.clone(),
            factory,
            primary_conn: Mutex::new(None),
            replica_conns: Mutex::new(HashMap::new()),
            ring: SyncMutex::new(ring),
        });

        view.add_listener(Arc::new(RoutingListener {
            client: Arc::downgrade(&client),
        }));

        client
    }

    fn build_ring(status: &ClusterStatus) -> Ring<HostConfig> {
        // Deterministic rotation order
        let mut replicas: Vec<HostConfig> = status.replicas().iter().cloned().collect();
        replicas.sort();
        Ring::new(replicas)
    }

    /// Shut down every cached connection. Close failures are logged, the
    /// router is done with the connection either way.
    pub async fn close(&self) {
        if let Some(mut conn) = self.primary_conn.lock().await.take() {
            if let Err(e) = conn.quit().await {
                debug!(error = %e, "closing primary connection failed");
            }
        }
        for (host, mut conn) in self.replica_conns.lock().await.drain() {
            if let Err(e) = conn.quit().await {
                debug!(host = %host, error = %e, "closing replica connection failed");
            }
        }
    }

    async fn with_primary<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut dyn RedisActions) -> ConnOp<'a, T>,
    {
        let Some(primary) = self.view.current_status().primary().cloned() else {
            return Err(Error::Connection(
                "no primary in the current topology".to_string(),
            ));
        };

        let mut guard = self.primary_conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.factory.create(&primary).await?);
        }

        let result = match guard.as_mut() {
            Some(conn) => op(conn.as_mut()).await,
            None => return Err(Error::Connection(format!("no connection to {primary}"))),
        };

        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn with_replica<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut dyn RedisActions) -> ConnOp<'a, T>,
    {
        let Some(replica) = self.ring.lock().next() else {
            // No replicas: reads go to the primary
            return self.with_primary(op).await;
        };

        let mut conns = self.replica_conns.lock().await;
        if !conns.contains_key(&replica) {
            let conn = self.factory.create(&replica).await?;
            conns.insert(replica.clone(), conn);
        }

        let result = match conns.get_mut(&replica) {
            Some(conn) => op(conn.as_mut()).await,
            None => return Err(Error::Connection(format!("no connection to {replica}"))),
        };

        if result.is_err() {
            conns.remove(&replica);
        }
        result
    }

    async fn drop_primary_conn(&self) {
        if let Some(mut conn) = self.primary_conn.lock().await.take() {
            if let Err(e) = conn.quit().await {
                debug!(error = %e, "closing stale primary connection failed");
            }
        }
    }

    async fn rebuild_replicas(&self) {
        *self.ring.lock() = Self::build_ring(&self.view.current_status());
        for (host, mut conn) in self.replica_conns.lock().await.drain() {
            if let Err(e) = conn.quit().await {
                debug!(host = %host, error = %e, "closing stale replica connection failed");
            }
        }
    }

    // Write surface, routed to the primary.

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_primary(move |c| Box::pin(async move { c.set(&key, &value).await }))
            .await
    }

    pub async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_primary(move |c| Box::pin(async move { c.set_ex(&key, &value, seconds).await }))
            .await
    }

    pub async fn del(&self, keys: &[&str]) -> Result<u64> {
        let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
        self.with_primary(move |c| {
            Box::pin(async move {
                let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                c.del(&refs).await
            })
        })
        .await
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        let key = key.to_string();
        self.with_primary(move |c| Box::pin(async move { c.incr(&key).await }))
            .await
    }

    pub async fn decr(&self, key: &str) -> Result<i64> {
        let key = key.to_string();
        self.with_primary(move |c| Box::pin(async move { c.decr(&key).await }))
            .await
    }

    pub async fn append(&self, key: &str, value: &str) -> Result<u64> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_primary(move |c| Box::pin(async move { c.append(&key, &value).await }))
            .await
    }

    pub async fn expire(&self, key: &str, seconds: i64) -> Result<bool> {
        let key = key.to_string();
        self.with_primary(move |c| Box::pin(async move { c.expire(&key, seconds).await }))
            .await
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let (key, field, value) = (key.to_string(), field.to_string(), value.to_string());
        self.with_primary(move |c| Box::pin(async move { c.hset(&key, &field, &value).await }))
            .await
    }

    pub async fn hdel(&self, key: &str, fields: &[&str]) -> Result<u64> {
        let key = key.to_string();
        let fields: Vec<String> = fields.iter().map(ToString::to_string).collect();
        self.with_primary(move |c| {
            Box::pin(async move {
                let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
                c.hdel(&key, &refs).await
            })
        })
        .await
    }

    pub async fn lpush(&self, key: &str, values: &[&str]) -> Result<u64> {
        let key = key.to_string();
        let values: Vec<String> = values.iter().map(ToString::to_string).collect();
        self.with_primary(move |c| {
            Box::pin(async move {
                let refs: Vec<&str> = values.iter().map(String::as_str).collect();
                c.lpush(&key, &refs).await
            })
        })
        .await
    }

    pub async fn rpush(&self, key: &str, values: &[&str]) -> Result<u64> {
        let key = key.to_string();
        let values: Vec<String> = values.iter().map(ToString::to_string).collect();
        self.with_primary(move |c| {
            Box::pin(async move {
                let refs: Vec<&str> = values.iter().map(String::as_str).collect();
                c.rpush(&key, &refs).await
            })
        })
        .await
    }

    pub async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_primary(move |c| Box::pin(async move { c.lpop(&key).await }))
            .await
    }

    pub async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_primary(move |c| Box::pin(async move { c.rpop(&key).await }))
            .await
    }

    pub async fn sadd(&self, key: &str, members: &[&str]) -> Result<u64> {
        let key = key.to_string();
        let members: Vec<String> = members.iter().map(ToString::to_string).collect();
        self.with_primary(move |c| {
            Box::pin(async move {
                let refs: Vec<&str> = members.iter().map(String::as_str).collect();
                c.sadd(&key, &refs).await
            })
        })
        .await
    }

    pub async fn srem(&self, key: &str, members: &[&str]) -> Result<u64> {
        let key = key.to_string();
        let members: Vec<String> = members.iter().map(ToString::to_string).collect();
        self.with_primary(move |c| {
            Box::pin(async move {
                let refs: Vec<&str> = members.iter().map(String::as_str).collect();
                c.srem(&key, &refs).await
            })
        })
        .await
    }

    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<u64> {
        let (key, member) = (key.to_string(), member.to_string());
        self.with_primary(move |c| Box::pin(async move { c.zadd(&key, score, &member).await }))
            .await
    }

    pub async fn zrem(&self, key: &str, members: &[&str]) -> Result<u64> {
        let key = key.to_string();
        let members: Vec<String> = members.iter().map(ToString::to_string).collect();
        self.with_primary(move |c| {
            Box::pin(async move {
                let refs: Vec<&str> = members.iter().map(String::as_str).collect();
                c.zrem(&key, &refs).await
            })
        })
        .await
    }

    pub async fn flushdb(&self) -> Result<()> {
        self.with_primary(|c| Box::pin(c.flushdb())).await
    }

    // Read surface, routed round-robin over the replicas.

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_replica(move |c| Box::pin(async move { c.get(&key).await }))
            .await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_replica(move |c| Box::pin(async move { c.exists(&key).await }))
            .await
    }

    pub async fn strlen(&self, key: &str) -> Result<u64> {
        let key = key.to_string();
        self.with_replica(move |c| Box::pin(async move { c.strlen(&key).await }))
            .await
    }

    pub async fn ttl(&self, key: &str) -> Result<i64> {
        let key = key.to_string();
        self.with_replica(move |c| Box::pin(async move { c.ttl(&key).await }))
            .await
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let (key, field) = (key.to_string(), field.to_string());
        self.with_replica(move |c| Box::pin(async move { c.hget(&key, &field).await }))
            .await
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let key = key.to_string();
        self.with_replica(move |c| Box::pin(async move { c.hgetall(&key).await }))
            .await
    }

    pub async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        let (key, field) = (key.to_string(), field.to_string());
        self.with_replica(move |c| Box::pin(async move { c.hexists(&key, &field).await }))
            .await
    }

    pub async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        let key = key.to_string();
        self.with_replica(move |c| Box::pin(async move { c.hkeys(&key).await }))
            .await
    }

    pub async fn hlen(&self, key: &str) -> Result<u64> {
        let key = key.to_string();
        self.with_replica(move |c| Box::pin(async move { c.hlen(&key).await }))
            .await
    }

    pub async fn llen(&self, key: &str) -> Result<u64> {
        let key = key.to_string();
        self.with_replica(move |c| Box::pin(async move { c.llen(&key).await }))
            .await
    }

    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let key = key.to_string();
        self.with_replica(move |c| Box::pin(async move { c.lrange(&key, start, stop).await }))
            .await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let key = key.to_string();
        self.with_replica(move |c| Box::pin(async move { c.smembers(&key).await }))
            .await
    }

    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let (key, member) = (key.to_string(), member.to_string());
        self.with_replica(move |c| Box::pin(async move { c.sismember(&key, &member).await }))
            .await
    }

    pub async fn scard(&self, key: &str) -> Result<u64> {
        let key = key.to_string();
        self.with_replica(move |c| Box::pin(async move { c.scard(&key).await }))
            .await
    }

    pub async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let (key, member) = (key.to_string(), member.to_string());
        self.with_replica(move |c| Box::pin(async move { c.zscore(&key, &member).await }))
            .await
    }

    pub async fn zcard(&self, key: &str) -> Result<u64> {
        let key = key.to_string();
        self.with_replica(move |c| Box::pin(async move { c.zcard(&key).await }))
            .await
    }

    pub async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let key = key.to_string();
        self.with_replica(move |c| Box::pin(async move { c.zrange(&key, start, stop).await }))
            .await
    }

    pub async fn dbsize(&self) -> Result<u64> {
        self.with_replica(|c| Box::pin(c.dbsize())).await
    }
}

/// Tears down cached connections when the topology moves.
struct RoutingListener {
    client: Weak<FailoverClient>,
}

#[async_trait]
impl ClusterListener for RoutingListener {
    async fn primary_changed(&self, primary: Option<&HostConfig>) -> Result<()> {
        if let Some(client) = self.client.upgrade() {
            info!(primary = ?primary.map(HostConfig::address), "router re-resolving primary");
            client.drop_primary_conn().await;
        }
        Ok(())
    }

    async fn replicas_changed(&self, _replicas: &std::collections::HashSet<HostConfig>) -> Result<()> {
        if let Some(client) = self.client.upgrade() {
            client.rebuild_replicas().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeFactory, FakeRedis};
    use mockall::mock;

    mock! {
        View {}
        impl ClusterView for View {
            fn current_status(&self) -> ClusterStatus;
            fn add_listener(&self, listener: Arc<dyn ClusterListener>);
        }
    }

    fn topology(primary: &Arc<FakeRedis>, replicas: &[&Arc<FakeRedis>]) -> ClusterStatus {
        ClusterStatus::new(
            Some(primary.host().clone()),
            replicas.iter().map(|r| r.host().clone()).collect::<Vec<_>>(),
            [],
        )
    }

    fn fixed_view(status: ClusterStatus) -> MockView {
        let mut view = MockView::new();
        view.expect_current_status()
            .returning(move || status.clone());
        view.expect_add_listener().return_const(());
        view
    }

    #[tokio::test]
    async fn test_writes_route_to_primary() {
        let primary = FakeRedis::primary("redis-1", 6379);
        let replica = FakeRedis::replica_of("redis-2", 6380, "redis-1", 6379);
        let factory = FakeFactory::new();
        factory.register(primary.clone());
        factory.register(replica.clone());

        let view = fixed_view(topology(&primary, &[&replica]));
        let client = FailoverClient::new(Arc::new(view), Arc::new(factory));

        client.set("color", "red").await.unwrap();

        assert_eq!(primary.value("color"), Some("red".to_string()));
        assert_eq!(replica.value("color"), None);
    }

    #[tokio::test]
    async fn test_reads_rotate_over_replicas() {
        let primary = FakeRedis::primary("redis-1", 6379);
        let first = FakeRedis::replica_of("redis-2", 6380, "redis-1", 6379);
        let second = FakeRedis::replica_of("redis-3", 6381, "redis-1", 6379);
        first.seed("color", "from-2");
        second.seed("color", "from-3");

        let factory = FakeFactory::new();
        factory.register(primary.clone());
        factory.register(first.clone());
        factory.register(second.clone());

        let view = fixed_view(topology(&primary, &[&first, &second]));
        let client = FailoverClient::new(Arc::new(view), Arc::new(factory));

        // Rotation order follows address sort
        assert_eq!(client.get("color").await.unwrap(), Some("from-2".to_string()));
        assert_eq!(client.get("color").await.unwrap(), Some("from-3".to_string()));
        assert_eq!(client.get("color").await.unwrap(), Some("from-2".to_string()));
    }

    #[tokio::test]
    async fn test_reads_fall_back_to_primary_without_replicas() {
        let primary = FakeRedis::primary("redis-1", 6379);
        primary.seed("color", "primary-copy");
        let factory = FakeFactory::new();
        factory.register(primary.clone());

        let view = fixed_view(topology(&primary, &[]));
        let client = FailoverClient::new(Arc::new(view), Arc::new(factory));

        assert_eq!(
            client.get("color").await.unwrap(),
            Some("primary-copy".to_string())
        );
    }

    #[tokio::test]
    async fn test_no_primary_is_a_connection_error() {
        let factory = FakeFactory::new();
        let view = fixed_view(ClusterStatus::empty());
        let client = FailoverClient::new(Arc::new(view), Arc::new(factory));

        assert!(matches!(
            client.set("color", "red").await,
            Err(Error::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_primary_change_re_resolves_connection() {
        let old_primary = FakeRedis::primary("redis-1", 6379);
        let new_primary = FakeRedis::primary("redis-2", 6380);
        let factory = FakeFactory::new();
        factory.register(old_primary.clone());
        factory.register(new_primary.clone());

        let status = Arc::new(SyncMutex::new(topology(&old_primary, &[])));
        let captured: Arc<SyncMutex<Option<Arc<dyn ClusterListener>>>> =
            Arc::new(SyncMutex::new(None));

        let mut view = MockView::new();
        {
            let status = status.clone();
            view.expect_current_status()
                .returning(move || status.lock().clone());
        }
        {
            let captured = captured.clone();
            view.expect_add_listener()
                .returning(move |listener| *captured.lock() = Some(listener));
        }

        let client = FailoverClient::new(Arc::new(view), Arc::new(factory));
        client.set("color", "red").await.unwrap();
        assert_eq!(old_primary.value("color"), Some("red".to_string()));

        // Topology moves; the registered listener tears down the cached
        // connection and the next write resolves the new primary.
        *status.lock() = topology(&new_primary, &[]);
        let listener = captured.lock().clone().unwrap();
        listener
            .primary_changed(Some(new_primary.host()))
            .await
            .unwrap();

        client.set("color", "blue").await.unwrap();
        assert_eq!(new_primary.value("color"), Some("blue".to_string()));
        assert_eq!(old_primary.value("color"), Some("red".to_string()));
    }
}
