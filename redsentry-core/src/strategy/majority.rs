//! Quorum-majority failure detection

use super::FailureDetectionStrategy;
use crate::host::HostConfig;
use crate::status::NodeState;

/// Declares an instance unavailable when at least a majority of the
/// coordinators report it offline.
///
/// The offline count is compared against a threshold of `ceil(n/2)` for
/// odd report counts and `n/2` for even ones, so exactly half offline on
/// an even count already tips into unavailable. A lone report decides on
/// its own. Zero reports for a host means nobody has probed it yet; that
/// counts as unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleMajority;

impl SimpleMajority {
    fn majority(n: usize) -> usize {
        if n % 2 == 0 {
            n / 2
        } else {
            n / 2 + 1
        }
    }
}

impl FailureDetectionStrategy for SimpleMajority {
    fn is_available(&self, _host: &HostConfig, states: &[NodeState]) -> bool {
        let offline = states.iter().filter(|s| s.offline).count();
        offline < Self::majority(states.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostConfig {
        HostConfig::new("redis", 6379)
    }

    fn states(offline: usize, online: usize) -> Vec<NodeState> {
        let mut v = vec![NodeState::OFFLINE; offline];
        v.extend(std::iter::repeat_n(NodeState::online(1), online));
        v
    }

    #[test]
    fn test_odd_count_boundary() {
        let strategy = SimpleMajority;
        // 5 reports: threshold is 3
        assert!(strategy.is_available(&host(), &states(2, 3)));
        assert!(!strategy.is_available(&host(), &states(3, 2)));
    }

    #[test]
    fn test_even_count_boundary() {
        let strategy = SimpleMajority;
        // 4 reports: threshold is 2, so one offline is still available
        assert!(strategy.is_available(&host(), &states(1, 3)));
        assert!(!strategy.is_available(&host(), &states(2, 2)));
    }

    #[test]
    fn test_single_report_decides() {
        let strategy = SimpleMajority;
        assert!(strategy.is_available(&host(), &states(0, 1)));
        assert!(!strategy.is_available(&host(), &states(1, 0)));
    }

    #[test]
    fn test_no_reports_means_unavailable() {
        let strategy = SimpleMajority;
        assert!(!strategy.is_available(&host(), &[]));
    }
}
