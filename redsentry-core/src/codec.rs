//! JSON wire formats for the values stored in the coordination service
//!
//! Two fixed formats, both keyed by `host:port` strings:
//!
//! - cluster status: `{"master": "h:p", "slaves": [..], "unavailable": [..]}`
//!   with `master` omitted when there is no primary;
//! - node-state map: `{"available": {"h:p": latency_ms}, "unavailable": [..]}`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::host::HostConfig;
use crate::status::{ClusterStatus, NodeState};

#[derive(Serialize, Deserialize)]
struct ClusterStatusWire {
    #[serde(skip_serializing_if = "Option::is_none")]
    master: Option<String>,
    slaves: Vec<String>,
    unavailable: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct NodeStatesWire {
    available: HashMap<String, u64>,
    unavailable: Vec<String>,
}

pub fn encode_cluster_status(status: &ClusterStatus) -> Result<String> {
    let mut slaves: Vec<String> = status.replicas().iter().map(HostConfig::address).collect();
    let mut unavailable: Vec<String> =
        status.unavailable().iter().map(HostConfig::address).collect();
    // Stable output so equal statuses encode to byte-equal documents
    slaves.sort();
    unavailable.sort();

    let wire = ClusterStatusWire {
        master: status.primary().map(HostConfig::address),
        slaves,
        unavailable,
    };

    serde_json::to_string(&wire).map_err(|e| Error::Serialization(e.to_string()))
}

pub fn decode_cluster_status(data: &str) -> Result<ClusterStatus> {
    let wire: ClusterStatusWire =
        serde_json::from_str(data).map_err(|e| Error::Serialization(e.to_string()))?;

    let primary = wire.master.as_deref().map(HostConfig::parse).transpose()?;
    let replicas = wire
        .slaves
        .iter()
        .map(|s| HostConfig::parse(s))
        .collect::<Result<Vec<_>>>()?;
    let unavailable = wire
        .unavailable
        .iter()
        .map(|s| HostConfig::parse(s))
        .collect::<Result<Vec<_>>>()?;

    Ok(ClusterStatus::new(primary, replicas, unavailable))
}

/// Encode one coordinator's per-instance observations. Every known host
/// appears in exactly one of the two sections.
pub fn encode_node_states(states: &HashMap<HostConfig, NodeState>) -> Result<String> {
    let mut available = HashMap::new();
    let mut unavailable = Vec::new();

    for (host, state) in states {
        if state.offline {
            unavailable.push(host.address());
        } else {
            available.insert(host.address(), state.latency_ms);
        }
    }

    unavailable.sort();

    serde_json::to_string(&NodeStatesWire {
        available,
        unavailable,
    })
    .map_err(|e| Error::Serialization(e.to_string()))
}

pub fn decode_node_states(data: &str) -> Result<HashMap<HostConfig, NodeState>> {
    let wire: NodeStatesWire =
        serde_json::from_str(data).map_err(|e| Error::Serialization(e.to_string()))?;

    let mut states = HashMap::new();

    for (address, latency_ms) in &wire.available {
        states.insert(HostConfig::parse(address)?, NodeState::online(*latency_ms));
    }

    for address in &wire.unavailable {
        states.insert(HostConfig::parse(address)?, NodeState::OFFLINE);
    }

    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(port: u16) -> HostConfig {
        HostConfig::new("redis", port)
    }

    #[test]
    fn test_cluster_status_round_trip() {
        let status = ClusterStatus::new(
            Some(host(6379)),
            [host(6380), host(6381)],
            [host(6382)],
        );

        let encoded = encode_cluster_status(&status).unwrap();
        let decoded = decode_cluster_status(&encoded).unwrap();

        assert_eq!(status, decoded);
    }

    #[test]
    fn test_no_primary_omits_master_field() {
        let status = ClusterStatus::new(None, [host(6380)], []);

        let encoded = encode_cluster_status(&status).unwrap();
        assert!(!encoded.contains("master"));

        let decoded = decode_cluster_status(&encoded).unwrap();
        assert!(!decoded.has_primary());
        assert_eq!(status, decoded);
    }

    #[test]
    fn test_node_states_round_trip() {
        let states = HashMap::from([
            (host(6379), NodeState::online(12)),
            (host(6380), NodeState::online(3)),
            (host(6381), NodeState::OFFLINE),
        ]);

        let encoded = encode_node_states(&states).unwrap();
        let decoded = decode_node_states(&encoded).unwrap();

        assert_eq!(states, decoded);
    }

    #[test]
    fn test_decoded_overlapping_sets_are_made_disjoint() {
        let doc = r#"{"master":"redis:6379","slaves":["redis:6380"],"unavailable":["redis:6379","redis:6380","redis:6381"]}"#;

        let decoded = decode_cluster_status(doc).unwrap();

        assert_eq!(decoded.primary(), Some(&host(6379)));
        assert!(decoded.replicas().contains(&host(6380)));
        assert!(!decoded.unavailable().contains(&host(6379)));
        assert!(!decoded.unavailable().contains(&host(6380)));
        assert!(decoded.unavailable().contains(&host(6381)));
    }

    #[test]
    fn test_corrupt_document_is_a_serialization_error() {
        assert!(matches!(
            decode_cluster_status("not json"),
            Err(Error::Serialization(_))
        ));
        assert!(matches!(
            decode_node_states("{\"available\": 42}"),
            Err(Error::Serialization(_))
        ));
    }
}
