//! Latency-based failover selection

use std::collections::HashSet;

use super::FailoverSelectionStrategy;
use crate::host::HostConfig;
use crate::status::ReportMap;

/// Picks the candidate with the lowest mean latency across every
/// coordinator's non-offline samples.
///
/// Candidates nobody has measured sort after every measured candidate;
/// ties break deterministically by address so identical report input
/// always yields the same choice.
#[derive(Debug, Default, Clone, Copy)]
pub struct LowestMeanLatency;

impl LowestMeanLatency {
    fn mean_latency(host: &HostConfig, reports: &ReportMap) -> Option<f64> {
        let mut sum = 0u64;
        let mut count = 0u64;

        for states in reports.values() {
            if let Some(state) = states.get(host) {
                if !state.offline {
                    sum += state.latency_ms;
                    count += 1;
                }
            }
        }

        if count == 0 {
            None
        } else {
            Some(sum as f64 / count as f64)
        }
    }
}

impl FailoverSelectionStrategy for LowestMeanLatency {
    fn select_primary(
        &self,
        candidates: &HashSet<HostConfig>,
        reports: &ReportMap,
    ) -> Option<HostConfig> {
        let mut measured: Vec<(f64, &HostConfig)> = candidates
            .iter()
            .filter_map(|host| Self::mean_latency(host, reports).map(|mean| (mean, host)))
            .collect();

        measured.sort_by(|(mean_a, host_a), (mean_b, host_b)| {
            mean_a
                .total_cmp(mean_b)
                .then_with(|| host_a.cmp(host_b))
        });

        measured.first().map(|(_, host)| (*host).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::NodeState;
    use std::collections::HashMap;

    fn host(name: &str) -> HostConfig {
        HostConfig::new(name, 6379)
    }

    fn report(entries: &[(&HostConfig, NodeState)]) -> HashMap<HostConfig, NodeState> {
        entries.iter().map(|(h, s)| ((*h).clone(), *s)).collect()
    }

    #[test]
    fn test_selects_lowest_mean() {
        let a = host("a");
        let b = host("b");
        let c = host("c");

        let mut reports = ReportMap::new();
        reports.insert(
            "c1".to_string(),
            report(&[
                (&a, NodeState::online(400)),
                (&b, NodeState::online(600)),
                (&c, NodeState::online(200)),
            ]),
        );
        reports.insert(
            "c2".to_string(),
            report(&[
                (&a, NodeState::online(600)),
                (&b, NodeState::online(400)),
                (&c, NodeState::online(300)),
            ]),
        );
        reports.insert(
            "c3".to_string(),
            report(&[
                (&a, NodeState::online(500)),
                (&b, NodeState::online(500)),
                (&c, NodeState::online(600)),
            ]),
        );

        let candidates = HashSet::from([a, b, c.clone()]);
        let strategy = LowestMeanLatency;

        // means: a = 500, b = 500, c ~= 366.7
        assert_eq!(strategy.select_primary(&candidates, &reports), Some(c));
    }

    #[test]
    fn test_offline_samples_are_ignored() {
        let a = host("a");
        let b = host("b");

        let mut reports = ReportMap::new();
        reports.insert(
            "c1".to_string(),
            report(&[(&a, NodeState::online(100)), (&b, NodeState::OFFLINE)]),
        );
        reports.insert(
            "c2".to_string(),
            report(&[(&a, NodeState::online(100)), (&b, NodeState::online(5))]),
        );

        let candidates = HashSet::from([a, b.clone()]);

        // b has a single 5ms sample, the offline report does not drag it up
        assert_eq!(
            LowestMeanLatency.select_primary(&candidates, &reports),
            Some(b)
        );
    }

    #[test]
    fn test_unmeasured_candidates_sort_last() {
        let a = host("a");
        let b = host("b");

        let mut reports = ReportMap::new();
        reports.insert(
            "c1".to_string(),
            report(&[(&a, NodeState::online(900)), (&b, NodeState::OFFLINE)]),
        );

        let candidates = HashSet::from([a.clone(), b]);

        assert_eq!(
            LowestMeanLatency.select_primary(&candidates, &reports),
            Some(a)
        );
    }

    #[test]
    fn test_no_usable_candidate() {
        let a = host("a");

        let mut reports = ReportMap::new();
        reports.insert("c1".to_string(), report(&[(&a, NodeState::OFFLINE)]));

        let candidates = HashSet::from([a]);
        assert_eq!(LowestMeanLatency.select_primary(&candidates, &reports), None);

        assert_eq!(
            LowestMeanLatency.select_primary(&HashSet::new(), &reports),
            None
        );
    }

    #[test]
    fn test_equal_means_break_ties_by_address() {
        let a = host("a");
        let b = host("b");

        let mut reports = ReportMap::new();
        reports.insert(
            "c1".to_string(),
            report(&[(&a, NodeState::online(500)), (&b, NodeState::online(500))]),
        );

        let candidates = HashSet::from([a.clone(), b]);

        assert_eq!(
            LowestMeanLatency.select_primary(&candidates, &reports),
            Some(a)
        );
    }
}
