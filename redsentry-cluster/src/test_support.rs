//! Test doubles for exercising the failover machinery without real servers
//!
//! `FakeRedis` stands in for one managed instance: it tracks its replication
//! role, can be switched into a failing state, and backs a small in-memory
//! data store so router commands behave like the real thing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use redsentry_core::conn::{ConnectionFactory, RedisActions};
use redsentry_core::{Error, HostConfig, Result};

#[derive(Default)]
struct FakeState {
    role_primary: bool,
    primary: Option<(String, u16)>,
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    /// Control commands received, for assertions
    control_log: Vec<String>,
}

/// One scripted fake instance shared between the factory and the test.
pub struct FakeRedis {
    host: HostConfig,
    failing: AtomicBool,
    ping_delay_ms: AtomicU64,
    state: Mutex<FakeState>,
}

impl FakeRedis {
    pub fn primary(host: &str, port: u16) -> Arc<Self> {
        Arc::new(Self {
            host: HostConfig::new(host, port),
            failing: AtomicBool::new(false),
            ping_delay_ms: AtomicU64::new(0),
            state: Mutex::new(FakeState {
                role_primary: true,
                ..FakeState::default()
            }),
        })
    }

    pub fn replica_of(host: &str, port: u16, primary_host: &str, primary_port: u16) -> Arc<Self> {
        Arc::new(Self {
            host: HostConfig::new(host, port),
            failing: AtomicBool::new(false),
            ping_delay_ms: AtomicU64::new(0),
            state: Mutex::new(FakeState {
                role_primary: false,
                primary: Some((primary_host.to_string(), primary_port)),
                ..FakeState::default()
            }),
        })
    }

    #[must_use]
    pub fn host(&self) -> &HostConfig {
        &self.host
    }

    /// Make every command fail (or succeed again).
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Artificial ping delay, to shape measured latencies.
    pub fn set_ping_delay(&self, delay: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        self.ping_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_role_primary(&self) -> bool {
        self.state.lock().role_primary
    }

    #[must_use]
    pub fn replicates(&self) -> Option<(String, u16)> {
        self.state.lock().primary.clone()
    }

    #[must_use]
    pub fn control_log(&self) -> Vec<String> {
        self.state.lock().control_log.clone()
    }

    /// Seed a string key directly, bypassing routing.
    pub fn seed(&self, key: &str, value: &str) {
        self.state
            .lock()
            .strings
            .insert(key.to_string(), value.to_string());
    }

    /// Inspect a string key directly, bypassing routing.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<String> {
        self.state.lock().strings.get(key).cloned()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::Connection(format!("{} is not responding", self.host)))
        } else {
            Ok(())
        }
    }
}

/// A connection handed out by [`FakeFactory`].
pub struct FakeConnection {
    instance: Arc<FakeRedis>,
}

#[async_trait]
impl RedisActions for FakeConnection {
    async fn ping(&mut self) -> Result<()> {
        self.instance.check()?;
        let delay = self.instance.ping_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }

    async fn info(&mut self) -> Result<String> {
        self.instance.check()?;
        let state = self.instance.state.lock();
        if state.role_primary {
            Ok("# Replication\r\nrole:master\r\nconnected_slaves:0\r\n".to_string())
        } else {
            let (host, port) = state
                .primary
                .clone()
                .unwrap_or_else(|| ("?".to_string(), 0));
            Ok(format!(
                "# Replication\r\nrole:slave\r\nmaster_host:{host}\r\nmaster_port:{port}\r\n"
            ))
        }
    }

    async fn replica_of(&mut self, host: &str, port: u16) -> Result<()> {
        self.instance.check()?;
        let mut state = self.instance.state.lock();
        state.role_primary = false;
        state.primary = Some((host.to_string(), port));
        state.control_log.push(format!("replicaof {host}:{port}"));
        Ok(())
    }

    async fn promote_to_primary(&mut self) -> Result<()> {
        self.instance.check()?;
        let mut state = self.instance.state.lock();
        state.role_primary = true;
        state.primary = None;
        state.control_log.push("replicaof no one".to_string());
        Ok(())
    }

    async fn quit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        self.instance.check()?;
        Ok(self.instance.state.lock().strings.get(key).cloned())
    }

    async fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.instance.check()?;
        self.instance
            .state
            .lock()
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_ex(&mut self, key: &str, value: &str, _seconds: u64) -> Result<()> {
        self.set(key, value).await
    }

    async fn del(&mut self, keys: &[&str]) -> Result<u64> {
        self.instance.check()?;
        let mut state = self.instance.state.lock();
        let mut removed = 0;
        for key in keys {
            if state.strings.remove(*key).is_some()
                || state.hashes.remove(*key).is_some()
                || state.lists.remove(*key).is_some()
                || state.sets.remove(*key).is_some()
                || state.zsets.remove(*key).is_some()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&mut self, key: &str) -> Result<bool> {
        self.instance.check()?;
        Ok(self.instance.state.lock().strings.contains_key(key))
    }

    async fn incr(&mut self, key: &str) -> Result<i64> {
        self.instance.check()?;
        let mut state = self.instance.state.lock();
        let value = state
            .strings
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            + 1;
        state.strings.insert(key.to_string(), value.to_string());
        Ok(value)
    }

    async fn decr(&mut self, key: &str) -> Result<i64> {
        self.instance.check()?;
        let mut state = self.instance.state.lock();
        let value = state
            .strings
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            - 1;
        state.strings.insert(key.to_string(), value.to_string());
        Ok(value)
    }

    async fn append(&mut self, key: &str, value: &str) -> Result<u64> {
        self.instance.check()?;
        let mut state = self.instance.state.lock();
        let entry = state.strings.entry(key.to_string()).or_default();
        entry.push_str(value);
        Ok(entry.len() as u64)
    }

    async fn strlen(&mut self, key: &str) -> Result<u64> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .strings
            .get(key)
            .map_or(0, |v| v.len() as u64))
    }

    async fn expire(&mut self, key: &str, _seconds: i64) -> Result<bool> {
        self.instance.check()?;
        Ok(self.instance.state.lock().strings.contains_key(key))
    }

    async fn ttl(&mut self, key: &str) -> Result<i64> {
        self.instance.check()?;
        if self.instance.state.lock().strings.contains_key(key) {
            Ok(-1)
        } else {
            Ok(-2)
        }
    }

    async fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string())
            .is_none())
    }

    async fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hdel(&mut self, key: &str, fields: &[&str]) -> Result<u64> {
        self.instance.check()?;
        let mut state = self.instance.state.lock();
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(0);
        };
        Ok(fields.iter().filter(|f| hash.remove(**f).is_some()).count() as u64)
    }

    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn hexists(&mut self, key: &str, field: &str) -> Result<bool> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .hashes
            .get(key)
            .is_some_and(|h| h.contains_key(field)))
    }

    async fn hkeys(&mut self, key: &str) -> Result<Vec<String>> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .hashes
            .get(key)
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn hlen(&mut self, key: &str) -> Result<u64> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .hashes
            .get(key)
            .map_or(0, |h| h.len() as u64))
    }

    async fn lpush(&mut self, key: &str, values: &[&str]) -> Result<u64> {
        self.instance.check()?;
        let mut state = self.instance.state.lock();
        let list = state.lists.entry(key.to_string()).or_default();
        for value in values {
            list.push_front((*value).to_string());
        }
        Ok(list.len() as u64)
    }

    async fn rpush(&mut self, key: &str, values: &[&str]) -> Result<u64> {
        self.instance.check()?;
        let mut state = self.instance.state.lock();
        let list = state.lists.entry(key.to_string()).or_default();
        for value in values {
            list.push_back((*value).to_string());
        }
        Ok(list.len() as u64)
    }

    async fn lpop(&mut self, key: &str) -> Result<Option<String>> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .lists
            .get_mut(key)
            .and_then(VecDeque::pop_front))
    }

    async fn rpop(&mut self, key: &str) -> Result<Option<String>> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .lists
            .get_mut(key)
            .and_then(VecDeque::pop_back))
    }

    async fn llen(&mut self, key: &str) -> Result<u64> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .lists
            .get(key)
            .map_or(0, |l| l.len() as u64))
    }

    async fn lrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.instance.check()?;
        let state = self.instance.state.lock();
        let Some(list) = state.lists.get(key).filter(|l| !l.is_empty()) else {
            return Ok(Vec::new());
        };

        let len = list.len() as i64;
        let clamp = |index: i64| -> usize {
            let index = if index < 0 { len + index } else { index };
            index.clamp(0, len) as usize
        };
        let (start, stop) = (clamp(start), clamp(stop).min(len as usize - 1));

        if start > stop {
            return Ok(Vec::new());
        }

        Ok(list.iter().skip(start).take(stop - start + 1).cloned().collect())
    }

    async fn sadd(&mut self, key: &str, members: &[&str]) -> Result<u64> {
        self.instance.check()?;
        let mut state = self.instance.state.lock();
        let set = state.sets.entry(key.to_string()).or_default();
        Ok(members
            .iter()
            .filter(|m| set.insert((**m).to_string()))
            .count() as u64)
    }

    async fn srem(&mut self, key: &str, members: &[&str]) -> Result<u64> {
        self.instance.check()?;
        let mut state = self.instance.state.lock();
        let Some(set) = state.sets.get_mut(key) else {
            return Ok(0);
        };
        Ok(members.iter().filter(|m| set.remove(**m)).count() as u64)
    }

    async fn smembers(&mut self, key: &str) -> Result<Vec<String>> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&mut self, key: &str, member: &str) -> Result<bool> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .sets
            .get(key)
            .is_some_and(|s| s.contains(member)))
    }

    async fn scard(&mut self, key: &str) -> Result<u64> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .sets
            .get(key)
            .map_or(0, |s| s.len() as u64))
    }

    async fn zadd(&mut self, key: &str, score: f64, member: &str) -> Result<u64> {
        self.instance.check()?;
        let added = self
            .instance
            .state
            .lock()
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score)
            .is_none();
        Ok(u64::from(added))
    }

    async fn zrem(&mut self, key: &str, members: &[&str]) -> Result<u64> {
        self.instance.check()?;
        let mut state = self.instance.state.lock();
        let Some(zset) = state.zsets.get_mut(key) else {
            return Ok(0);
        };
        Ok(members.iter().filter(|m| zset.remove(**m).is_some()).count() as u64)
    }

    async fn zscore(&mut self, key: &str, member: &str) -> Result<Option<f64>> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .zsets
            .get(key)
            .and_then(|z| z.get(member))
            .copied())
    }

    async fn zcard(&mut self, key: &str) -> Result<u64> {
        self.instance.check()?;
        Ok(self
            .instance
            .state
            .lock()
            .zsets
            .get(key)
            .map_or(0, |z| z.len() as u64))
    }

    async fn zrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.instance.check()?;
        let state = self.instance.state.lock();
        let Some(zset) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };

        let mut members: Vec<(&String, &f64)> = zset.iter().collect();
        members.sort_by(|(ma, sa), (mb, sb)| sa.total_cmp(sb).then_with(|| ma.cmp(mb)));

        let len = members.len() as i64;
        let clamp = |index: i64| -> usize {
            let index = if index < 0 { len + index } else { index };
            index.clamp(0, len) as usize
        };
        let (start, stop) = (clamp(start), clamp(stop).min((len - 1).max(0) as usize));

        if members.is_empty() || start > stop {
            return Ok(Vec::new());
        }

        Ok(members[start..=stop].iter().map(|(m, _)| (*m).clone()).collect())
    }

    async fn dbsize(&mut self) -> Result<u64> {
        self.instance.check()?;
        let state = self.instance.state.lock();
        Ok((state.strings.len()
            + state.hashes.len()
            + state.lists.len()
            + state.sets.len()
            + state.zsets.len()) as u64)
    }

    async fn flushdb(&mut self) -> Result<()> {
        self.instance.check()?;
        let mut state = self.instance.state.lock();
        state.strings.clear();
        state.hashes.clear();
        state.lists.clear();
        state.sets.clear();
        state.zsets.clear();
        Ok(())
    }
}

/// Factory resolving hosts to registered fake instances.
#[derive(Default)]
pub struct FakeFactory {
    instances: Mutex<HashMap<HostConfig, Arc<FakeRedis>>>,
}

impl FakeFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance: Arc<FakeRedis>) {
        self.instances
            .lock()
            .insert(instance.host().clone(), instance);
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn create(&self, host: &HostConfig) -> Result<Box<dyn RedisActions>> {
        let instance = self
            .instances
            .lock()
            .get(host)
            .cloned()
            .ok_or_else(|| Error::Connection(format!("unknown instance {host}")))?;

        // Connecting to a failing instance fails like the real thing
        instance.check()?;

        Ok(Box::new(FakeConnection { instance }))
    }
}
