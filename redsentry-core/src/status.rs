//! Cluster topology model
//!
//! `ClusterStatus` is an immutable snapshot replaced wholesale on every
//! decision; concurrent readers always see a consistent whole.

use std::collections::{HashMap, HashSet};

use crate::host::HostConfig;

/// One probe observation of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeState {
    pub latency_ms: u64,
    pub offline: bool,
}

impl NodeState {
    /// Sentinel for an unreachable instance; the latency value is unused.
    pub const OFFLINE: Self = Self {
        latency_ms: 0,
        offline: true,
    };

    #[must_use]
    pub const fn online(latency_ms: u64) -> Self {
        Self {
            latency_ms,
            offline: false,
        }
    }
}

/// The cross-coordinator observation matrix: coordinator id to that
/// coordinator's latest per-instance states. Recomputed on every
/// reconciliation pass, never persisted by the coordinator itself.
pub type ReportMap = HashMap<String, HashMap<HostConfig, NodeState>>;

/// Regroup a report map by instance, collecting every coordinator's
/// observation of each host.
#[must_use]
pub fn states_by_host(reports: &ReportMap) -> HashMap<HostConfig, Vec<NodeState>> {
    let mut by_host: HashMap<HostConfig, Vec<NodeState>> = HashMap::new();

    for states in reports.values() {
        for (host, state) in states {
            by_host.entry(host.clone()).or_default().push(*state);
        }
    }

    by_host
}

/// Classification of how two statuses differ. The unavailable set is
/// informational and never affects the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDifference {
    None,
    Primary,
    Replicas,
    Both,
}

/// Immutable topology snapshot: the writable primary, its replicas, and
/// the instances currently considered unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterStatus {
    primary: Option<HostConfig>,
    replicas: HashSet<HostConfig>,
    unavailable: HashSet<HostConfig>,
}

impl ClusterStatus {
    pub fn new(
        primary: Option<HostConfig>,
        replicas: impl IntoIterator<Item = HostConfig>,
        unavailable: impl IntoIterator<Item = HostConfig>,
    ) -> Self {
        let mut replicas: HashSet<HostConfig> = replicas.into_iter().collect();
        let mut unavailable: HashSet<HostConfig> = unavailable.into_iter().collect();

        // The three sets are pairwise disjoint; an instance named primary
        // or replica is not also unavailable.
        if let Some(ref primary) = primary {
            replicas.remove(primary);
            unavailable.remove(primary);
        }
        for replica in &replicas {
            unavailable.remove(replica);
        }

        Self {
            primary,
            replicas,
            unavailable,
        }
    }

    /// The "not yet initialized" state returned before any coordinator has
    /// published a topology.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.replicas.is_empty() && self.unavailable.is_empty()
    }

    #[must_use]
    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    #[must_use]
    pub fn primary(&self) -> Option<&HostConfig> {
        self.primary.as_ref()
    }

    #[must_use]
    pub fn replicas(&self) -> &HashSet<HostConfig> {
        &self.replicas
    }

    #[must_use]
    pub fn unavailable(&self) -> &HashSet<HostConfig> {
        &self.unavailable
    }

    /// Classify the change from `self` to `other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> StatusDifference {
        let primary_changed = self.primary != other.primary;
        let replicas_changed = self.replicas != other.replicas;

        match (primary_changed, replicas_changed) {
            (true, true) => StatusDifference::Both,
            (true, false) => StatusDifference::Primary,
            (false, true) => StatusDifference::Replicas,
            (false, false) => StatusDifference::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(port: u16) -> HostConfig {
        HostConfig::new("redis", port)
    }

    #[test]
    fn test_empty_status() {
        let status = ClusterStatus::empty();
        assert!(status.is_empty());
        assert!(!status.has_primary());
    }

    #[test]
    fn test_primary_removed_from_replicas() {
        let status = ClusterStatus::new(Some(host(1)), [host(1), host(2)], []);
        assert!(!status.replicas().contains(&host(1)));
        assert!(status.replicas().contains(&host(2)));
    }

    #[test]
    fn test_primary_and_replicas_removed_from_unavailable() {
        let status = ClusterStatus::new(
            Some(host(1)),
            [host(2)],
            [host(1), host(2), host(3)],
        );
        assert!(!status.unavailable().contains(&host(1)));
        assert!(!status.unavailable().contains(&host(2)));
        assert!(status.unavailable().contains(&host(3)));
    }

    #[test]
    fn test_difference_reflexive_none() {
        let status = ClusterStatus::new(Some(host(1)), [host(2), host(3)], [host(4)]);
        assert_eq!(status.difference(&status), StatusDifference::None);
    }

    #[test]
    fn test_difference_replicas_only() {
        let a = ClusterStatus::new(Some(host(1)), [host(2), host(3)], []);
        let b = ClusterStatus::new(Some(host(1)), [host(2)], [host(3)]);
        assert_eq!(a.difference(&b), StatusDifference::Replicas);
    }

    #[test]
    fn test_difference_primary_only() {
        let a = ClusterStatus::new(Some(host(1)), [host(2)], []);
        let b = ClusterStatus::new(Some(host(3)), [host(2)], []);
        assert_eq!(a.difference(&b), StatusDifference::Primary);
    }

    #[test]
    fn test_difference_both() {
        let a = ClusterStatus::new(Some(host(1)), [host(2)], []);
        let b = ClusterStatus::new(Some(host(2)), [host(1)], []);
        assert_eq!(a.difference(&b), StatusDifference::Both);
    }

    #[test]
    fn test_difference_gaining_a_primary_counts_as_primary_change() {
        let a = ClusterStatus::empty();
        let b = ClusterStatus::new(Some(host(1)), [], []);
        assert_eq!(a.difference(&b), StatusDifference::Primary);
    }

    #[test]
    fn test_unavailable_does_not_affect_difference() {
        let a = ClusterStatus::new(Some(host(1)), [host(2)], [host(3)]);
        let b = ClusterStatus::new(Some(host(1)), [host(2)], []);
        assert_eq!(a.difference(&b), StatusDifference::None);
    }

    #[test]
    fn test_states_by_host_groups_all_reports() {
        let mut reports = ReportMap::new();
        reports.insert(
            "c1".to_string(),
            HashMap::from([(host(1), NodeState::online(5)), (host(2), NodeState::OFFLINE)]),
        );
        reports.insert(
            "c2".to_string(),
            HashMap::from([(host(1), NodeState::online(7))]),
        );

        let by_host = states_by_host(&reports);
        assert_eq!(by_host[&host(1)].len(), 2);
        assert_eq!(by_host[&host(2)], vec![NodeState::OFFLINE]);
    }
}
