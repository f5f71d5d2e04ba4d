//! JSON payloads stored in coordination-service nodes.
//!
//! Node data is JSON so that external tooling can inspect and repair cluster
//! state. Every payload carries a format `version` field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::PAYLOAD_FORMAT_VERSION;
use crate::types::{BrokerId, LeaderAndIsr, TopicPartition};

/// Data stored at `/controller`: who currently holds the controllership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerRegistration {
    pub version: i32,
    pub brokerid: i32,
    pub timestamp: i64,
}

impl ControllerRegistration {
    pub fn new(broker_id: BrokerId, timestamp: i64) -> Self {
        ControllerRegistration {
            version: PAYLOAD_FORMAT_VERSION,
            brokerid: broker_id.value(),
            timestamp,
        }
    }
}

/// Data stored at `/brokers/ids/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerRegistration {
    pub version: i32,
    pub host: String,
    pub port: i32,
}

/// Data stored at `/brokers/topics/<topic>`: partition index (as a string
/// key, matching the JSON object encoding) to assigned replica list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicAssignment {
    pub version: i32,
    pub partitions: BTreeMap<String, Vec<i32>>,
}

impl TopicAssignment {
    pub fn from_assignment(assignment: &BTreeMap<i32, Vec<BrokerId>>) -> Self {
        TopicAssignment {
            version: PAYLOAD_FORMAT_VERSION,
            partitions: assignment
                .iter()
                .map(|(partition, replicas)| {
                    (
                        partition.to_string(),
                        replicas.iter().map(|b| b.value()).collect(),
                    )
                })
                .collect(),
        }
    }

    /// Decode back into typed partition indexes. Non-numeric keys are
    /// rejected by the caller as malformed payloads.
    pub fn to_assignment(&self) -> Option<BTreeMap<i32, Vec<BrokerId>>> {
        let mut out = BTreeMap::new();
        for (partition, replicas) in &self.partitions {
            let partition: i32 = partition.parse().ok()?;
            out.insert(partition, replicas.iter().map(|b| BrokerId(*b)).collect());
        }
        Some(out)
    }
}

/// Data stored at `/brokers/topics/<topic>/partitions/<p>/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionStateData {
    pub version: i32,
    pub leader: i32,
    pub leader_epoch: i32,
    pub isr: Vec<i32>,
    pub controller_epoch: i32,
}

impl PartitionStateData {
    pub fn new(leader_and_isr: &LeaderAndIsr, controller_epoch: i32) -> Self {
        PartitionStateData {
            version: PAYLOAD_FORMAT_VERSION,
            leader: leader_and_isr.leader.value(),
            leader_epoch: leader_and_isr.leader_epoch,
            isr: leader_and_isr.isr.iter().map(|b| b.value()).collect(),
            controller_epoch,
        }
    }

    /// Rebuild the typed leadership value; `node_version` is the version of
    /// the node this payload was read from.
    pub fn to_leader_and_isr(&self, node_version: i32) -> LeaderAndIsr {
        LeaderAndIsr {
            leader: BrokerId(self.leader),
            leader_epoch: self.leader_epoch,
            isr: self.isr.iter().map(|b| BrokerId(*b)).collect(),
            version: node_version,
        }
    }
}

/// One pending reassignment entry at `/admin/reassign_partitions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassignmentEntry {
    pub topic: String,
    pub partition: i32,
    pub replicas: Vec<i32>,
}

/// Data stored at `/admin/reassign_partitions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassignmentData {
    pub version: i32,
    pub partitions: Vec<ReassignmentEntry>,
}

/// One partition named at `/admin/preferred_replica_election` or inside a
/// notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub topic: String,
    pub partition: i32,
}

impl PartitionEntry {
    pub fn from_partition(tp: &TopicPartition) -> Self {
        PartitionEntry {
            topic: tp.topic.clone(),
            partition: tp.partition,
        }
    }

    pub fn to_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Data stored at `/admin/preferred_replica_election`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferredElectionData {
    pub version: i32,
    pub partitions: Vec<PartitionEntry>,
}

/// Data stored in one `/isr_change_notification/<seq>` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsrChangeNotificationData {
    pub version: i32,
    pub partitions: Vec<PartitionEntry>,
}

/// Data stored in one `/log_dir_event_notification/<seq>` node: a broker
/// reporting partitions lost to a failed log directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDirEventData {
    pub version: i32,
    pub broker: i32,
    pub partitions: Vec<PartitionEntry>,
}

/// A drained log-dir event, decoded for the controller.
#[derive(Debug, Clone)]
pub struct LogDirEvent {
    pub broker_id: BrokerId,
    pub partitions: Vec<TopicPartition>,
}

/// Data stored at `/config/topics/<topic>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicConfigData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unclean_leader_election_enable: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_assignment_round_trip() {
        let mut assignment = BTreeMap::new();
        assignment.insert(0, vec![BrokerId(1), BrokerId(2)]);
        assignment.insert(1, vec![BrokerId(2), BrokerId(3)]);

        let payload = TopicAssignment::from_assignment(&assignment);
        let json = serde_json::to_string(&payload).unwrap();
        let decoded: TopicAssignment = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.to_assignment().unwrap(), assignment);
    }

    #[test]
    fn test_partition_state_data_preserves_node_version() {
        let leadership = LeaderAndIsr {
            leader: BrokerId(2),
            leader_epoch: 6,
            isr: vec![BrokerId(2), BrokerId(3)],
            version: 4,
        };
        let payload = PartitionStateData::new(&leadership, 7);
        assert_eq!(payload.to_leader_and_isr(4), leadership);
    }
}
