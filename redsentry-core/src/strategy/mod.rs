//! Pluggable failure-detection and failover-selection strategies
//!
//! Both strategies are pure functions over the cross-coordinator report
//! matrix; concrete implementations are injected into the coordinator at
//! construction, so alternative policies can replace them without touching
//! the reconciliation loop.

mod latency;
mod majority;

pub use latency::LowestMeanLatency;
pub use majority::SimpleMajority;

use std::collections::HashSet;

use crate::host::HostConfig;
use crate::status::{NodeState, ReportMap};

/// Decides whether an instance is available given every coordinator's most
/// recent observation of it.
pub trait FailureDetectionStrategy: Send + Sync {
    fn is_available(&self, host: &HostConfig, states: &[NodeState]) -> bool;
}

/// Picks the new primary among the available candidates when the current
/// primary has been declared unavailable.
pub trait FailoverSelectionStrategy: Send + Sync {
    /// Returns `None` when there is no usable candidate.
    fn select_primary(
        &self,
        candidates: &HashSet<HostConfig>,
        reports: &ReportMap,
    ) -> Option<HostConfig>;
}
