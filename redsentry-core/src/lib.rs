//! Core value types and pure logic for the redsentry failover coordinator:
//! instance addresses, topology snapshots, wire formats, the pluggable
//! detection/selection strategies, and the Redis command surface.

pub mod codec;
pub mod conn;
pub mod error;
pub mod host;
pub mod status;
pub mod strategy;

pub use conn::{ConnectionFactory, RedisActions, RedisConnection, RedisConnectionFactory};
pub use error::{Error, Result};
pub use host::HostConfig;
pub use status::{ClusterStatus, NodeState, ReportMap, StatusDifference};
pub use strategy::{
    FailoverSelectionStrategy, FailureDetectionStrategy, LowestMeanLatency, SimpleMajority,
};
