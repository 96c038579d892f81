//! Addresses of the managed Redis instances

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default per-command timeout when talking to a managed instance
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Address of one managed Redis instance.
///
/// Identity (equality, hashing, ordering) is determined by
/// (host, port, database) only; the command timeout is a connection
/// parameter, not part of the identity.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    /// Logical database index selected after connecting
    pub database: i64,
}

impl HostConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            database: 0,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_database(mut self, database: i64) -> Self {
        self.database = database;
        self
    }

    /// Render as `host:port`, the form used in all wire formats.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse a `host:port` address.
    ///
    /// Malformed values (no colon, empty host, non-numeric port) are
    /// rejected; callers treat them as absent, never as fatal.
    pub fn parse(address: &str) -> Result<Self> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| Error::Configuration(format!("address without port: {address:?}")))?;

        if host.trim().is_empty() {
            return Err(Error::Configuration(format!("empty host in address: {address:?}")));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| Error::Configuration(format!("invalid port in address: {address:?}")))?;

        Ok(Self::new(host, port))
    }

    /// The connection URL understood by the redis crate.
    #[must_use]
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.database)
    }
}

impl PartialEq for HostConfig {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.database == other.database
    }
}

impl Eq for HostConfig {}

impl Hash for HostConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.database.hash(state);
    }
}

impl PartialOrd for HostConfig {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HostConfig {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.host, self.port, self.database).cmp(&(&other.host, other.port, other.database))
    }
}

impl fmt::Display for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_ignores_timeout() {
        let a = HostConfig::new("redis-1", 6379);
        let b = HostConfig::new("redis-1", 6379).with_timeout(Duration::from_secs(30));

        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_database_is_identity_bearing() {
        let a = HostConfig::new("redis-1", 6379);
        let b = HostConfig::new("redis-1", 6379).with_database(2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_round_trip() {
        let host = HostConfig::parse("redis-1:6380").unwrap();
        assert_eq!(host.host, "redis-1");
        assert_eq!(host.port, 6380);
        assert_eq!(host.address(), "redis-1:6380");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(HostConfig::parse("redis-1").is_err());
        assert!(HostConfig::parse("redis-1:notaport").is_err());
        assert!(HostConfig::parse(":6379").is_err());
    }
}
