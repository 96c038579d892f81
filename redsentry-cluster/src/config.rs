//! Coordinator configuration

use std::time::Duration;

/// Settings for the coordinator and its health probes.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Unique identifier for this coordinator process
    pub node_id: String,
    /// Sleep between probe cycles
    pub probe_interval: Duration,
    /// Consecutive probe errors tolerated before an instance is declared
    /// offline
    pub max_probe_errors: u32,
    /// Bounded wait when trying to acquire cluster leadership
    pub leadership_wait: Duration,
    /// Sleep between reconciliation passes
    pub reconcile_interval: Duration,
    /// How long `start()` waits for every probe to report once
    pub startup_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            node_id: generate_node_id(),
            probe_interval: Duration::from_secs(5),
            max_probe_errors: 3,
            leadership_wait: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(60),
        }
    }
}

/// Generate a process-unique coordinator identity: hostname plus a random
/// suffix, stable for the coordinator's lifetime.
#[must_use]
pub fn generate_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{host}-{}", nanoid::nanoid!(10))
}
