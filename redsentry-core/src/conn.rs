//! Connections to the managed Redis instances
//!
//! `RedisActions` is the full command surface the failover machinery needs:
//! the control calls used by health probes and role reconciliation (PING,
//! INFO, REPLICAOF) plus the data commands the request router exposes.
//! `RedisConnection` implements it over one multiplexed async connection
//! with a per-command timeout taken from the host configuration.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::host::HostConfig;

/// Field names in the INFO replication section.
pub mod info_keys {
    pub const ROLE: &str = "role";
    /// Redis reports the writable role as "master".
    pub const ROLE_PRIMARY: &str = "master";
    pub const PRIMARY_HOST: &str = "master_host";
    pub const PRIMARY_PORT: &str = "master_port";
}

/// Commands against one Redis instance.
#[async_trait]
pub trait RedisActions: Send + Sync {
    // Control surface
    async fn ping(&mut self) -> Result<()>;
    /// Raw INFO output; parse with [`parse_info`].
    async fn info(&mut self) -> Result<String>;
    async fn replica_of(&mut self, host: &str, port: u16) -> Result<()>;
    async fn promote_to_primary(&mut self) -> Result<()>;
    async fn quit(&mut self) -> Result<()>;

    // Strings
    async fn get(&mut self, key: &str) -> Result<Option<String>>;
    async fn set(&mut self, key: &str, value: &str) -> Result<()>;
    async fn set_ex(&mut self, key: &str, value: &str, seconds: u64) -> Result<()>;
    async fn del(&mut self, keys: &[&str]) -> Result<u64>;
    async fn exists(&mut self, key: &str) -> Result<bool>;
    async fn incr(&mut self, key: &str) -> Result<i64>;
    async fn decr(&mut self, key: &str) -> Result<i64>;
    async fn append(&mut self, key: &str, value: &str) -> Result<u64>;
    async fn strlen(&mut self, key: &str) -> Result<u64>;
    async fn expire(&mut self, key: &str, seconds: i64) -> Result<bool>;
    async fn ttl(&mut self, key: &str) -> Result<i64>;

    // Hashes
    async fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<bool>;
    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hdel(&mut self, key: &str, fields: &[&str]) -> Result<u64>;
    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>>;
    async fn hexists(&mut self, key: &str, field: &str) -> Result<bool>;
    async fn hkeys(&mut self, key: &str) -> Result<Vec<String>>;
    async fn hlen(&mut self, key: &str) -> Result<u64>;

    // Lists
    async fn lpush(&mut self, key: &str, values: &[&str]) -> Result<u64>;
    async fn rpush(&mut self, key: &str, values: &[&str]) -> Result<u64>;
    async fn lpop(&mut self, key: &str) -> Result<Option<String>>;
    async fn rpop(&mut self, key: &str) -> Result<Option<String>>;
    async fn llen(&mut self, key: &str) -> Result<u64>;
    async fn lrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    // Sets
    async fn sadd(&mut self, key: &str, members: &[&str]) -> Result<u64>;
    async fn srem(&mut self, key: &str, members: &[&str]) -> Result<u64>;
    async fn smembers(&mut self, key: &str) -> Result<Vec<String>>;
    async fn sismember(&mut self, key: &str, member: &str) -> Result<bool>;
    async fn scard(&mut self, key: &str) -> Result<u64>;

    // Sorted sets
    async fn zadd(&mut self, key: &str, score: f64, member: &str) -> Result<u64>;
    async fn zrem(&mut self, key: &str, members: &[&str]) -> Result<u64>;
    async fn zscore(&mut self, key: &str, member: &str) -> Result<Option<f64>>;
    async fn zcard(&mut self, key: &str) -> Result<u64>;
    async fn zrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    // Administration
    async fn dbsize(&mut self) -> Result<u64>;
    async fn flushdb(&mut self) -> Result<()>;
}

/// Creates connections; injected wherever a connection is (re)built so
/// tests can substitute scripted fakes.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, host: &HostConfig) -> Result<Box<dyn RedisActions>>;
}

/// Parse INFO output into a key/value map. Section headers (`# ...`) and
/// malformed lines are skipped.
#[must_use]
pub fn parse_info(data: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();

    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.to_string(), value.trim().to_string());
        }
    }

    fields
}

/// A live connection to one Redis instance.
pub struct RedisConnection {
    host: HostConfig,
    conn: redis::aio::MultiplexedConnection,
    timeout: Duration,
}

impl RedisConnection {
    pub async fn connect(host: &HostConfig) -> Result<Self> {
        let client = redis::Client::open(host.url())
            .map_err(|e| Error::Configuration(format!("invalid redis url for {host}: {e}")))?;

        let conn = tokio::time::timeout(host.timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| Error::Timeout(format!("connect to {host} timed out")))?
            .map_err(|e| Error::Connection(format!("connect to {host} failed: {e}")))?;

        Ok(Self {
            host: host.clone(),
            conn,
            timeout: host.timeout,
        })
    }

    async fn run<T: redis::FromRedisValue>(&mut self, cmd: &redis::Cmd) -> Result<T> {
        tokio::time::timeout(self.timeout, cmd.query_async(&mut self.conn))
            .await
            .map_err(|_| Error::Timeout(format!("command to {} timed out", self.host)))?
            .map_err(Error::from)
    }
}

#[async_trait]
impl RedisActions for RedisConnection {
    async fn ping(&mut self) -> Result<()> {
        let _: String = self.run(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn info(&mut self) -> Result<String> {
        self.run(redis::cmd("INFO").arg("replication")).await
    }

    async fn replica_of(&mut self, host: &str, port: u16) -> Result<()> {
        self.run::<()>(redis::cmd("REPLICAOF").arg(host).arg(port))
            .await
    }

    async fn promote_to_primary(&mut self) -> Result<()> {
        self.run::<()>(redis::cmd("REPLICAOF").arg("NO").arg("ONE"))
            .await
    }

    async fn quit(&mut self) -> Result<()> {
        // Dropping the multiplexed connection closes it.
        Ok(())
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        self.run(redis::cmd("GET").arg(key)).await
    }

    async fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.run::<()>(redis::cmd("SET").arg(key).arg(value)).await
    }

    async fn set_ex(&mut self, key: &str, value: &str, seconds: u64) -> Result<()> {
        self.run::<()>(redis::cmd("SETEX").arg(key).arg(seconds).arg(value))
            .await
    }

    async fn del(&mut self, keys: &[&str]) -> Result<u64> {
        self.run(redis::cmd("DEL").arg(keys)).await
    }

    async fn exists(&mut self, key: &str) -> Result<bool> {
        self.run(redis::cmd("EXISTS").arg(key)).await
    }

    async fn incr(&mut self, key: &str) -> Result<i64> {
        self.run(redis::cmd("INCR").arg(key)).await
    }

    async fn decr(&mut self, key: &str) -> Result<i64> {
        self.run(redis::cmd("DECR").arg(key)).await
    }

    async fn append(&mut self, key: &str, value: &str) -> Result<u64> {
        self.run(redis::cmd("APPEND").arg(key).arg(value)).await
    }

    async fn strlen(&mut self, key: &str) -> Result<u64> {
        self.run(redis::cmd("STRLEN").arg(key)).await
    }

    async fn expire(&mut self, key: &str, seconds: i64) -> Result<bool> {
        self.run(redis::cmd("EXPIRE").arg(key).arg(seconds)).await
    }

    async fn ttl(&mut self, key: &str) -> Result<i64> {
        self.run(redis::cmd("TTL").arg(key)).await
    }

    async fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.run(redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        self.run(redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hdel(&mut self, key: &str, fields: &[&str]) -> Result<u64> {
        self.run(redis::cmd("HDEL").arg(key).arg(fields)).await
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>> {
        self.run(redis::cmd("HGETALL").arg(key)).await
    }

    async fn hexists(&mut self, key: &str, field: &str) -> Result<bool> {
        self.run(redis::cmd("HEXISTS").arg(key).arg(field)).await
    }

    async fn hkeys(&mut self, key: &str) -> Result<Vec<String>> {
        self.run(redis::cmd("HKEYS").arg(key)).await
    }

    async fn hlen(&mut self, key: &str) -> Result<u64> {
        self.run(redis::cmd("HLEN").arg(key)).await
    }

    async fn lpush(&mut self, key: &str, values: &[&str]) -> Result<u64> {
        self.run(redis::cmd("LPUSH").arg(key).arg(values)).await
    }

    async fn rpush(&mut self, key: &str, values: &[&str]) -> Result<u64> {
        self.run(redis::cmd("RPUSH").arg(key).arg(values)).await
    }

    async fn lpop(&mut self, key: &str) -> Result<Option<String>> {
        self.run(redis::cmd("LPOP").arg(key)).await
    }

    async fn rpop(&mut self, key: &str) -> Result<Option<String>> {
        self.run(redis::cmd("RPOP").arg(key)).await
    }

    async fn llen(&mut self, key: &str) -> Result<u64> {
        self.run(redis::cmd("LLEN").arg(key)).await
    }

    async fn lrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.run(redis::cmd("LRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn sadd(&mut self, key: &str, members: &[&str]) -> Result<u64> {
        self.run(redis::cmd("SADD").arg(key).arg(members)).await
    }

    async fn srem(&mut self, key: &str, members: &[&str]) -> Result<u64> {
        self.run(redis::cmd("SREM").arg(key).arg(members)).await
    }

    async fn smembers(&mut self, key: &str) -> Result<Vec<String>> {
        self.run(redis::cmd("SMEMBERS").arg(key)).await
    }

    async fn sismember(&mut self, key: &str, member: &str) -> Result<bool> {
        self.run(redis::cmd("SISMEMBER").arg(key).arg(member)).await
    }

    async fn scard(&mut self, key: &str) -> Result<u64> {
        self.run(redis::cmd("SCARD").arg(key)).await
    }

    async fn zadd(&mut self, key: &str, score: f64, member: &str) -> Result<u64> {
        self.run(redis::cmd("ZADD").arg(key).arg(score).arg(member))
            .await
    }

    async fn zrem(&mut self, key: &str, members: &[&str]) -> Result<u64> {
        self.run(redis::cmd("ZREM").arg(key).arg(members)).await
    }

    async fn zscore(&mut self, key: &str, member: &str) -> Result<Option<f64>> {
        self.run(redis::cmd("ZSCORE").arg(key).arg(member)).await
    }

    async fn zcard(&mut self, key: &str) -> Result<u64> {
        self.run(redis::cmd("ZCARD").arg(key)).await
    }

    async fn zrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.run(redis::cmd("ZRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn dbsize(&mut self) -> Result<u64> {
        self.run(&redis::cmd("DBSIZE")).await
    }

    async fn flushdb(&mut self) -> Result<()> {
        self.run::<()>(&redis::cmd("FLUSHDB")).await
    }
}

/// Default factory producing real connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisConnectionFactory;

#[async_trait]
impl ConnectionFactory for RedisConnectionFactory {
    async fn create(&self, host: &HostConfig) -> Result<Box<dyn RedisActions>> {
        Ok(Box::new(RedisConnection::connect(host).await?))
    }
}
