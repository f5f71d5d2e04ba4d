//! Type-safe wrappers for the controller's core entities.
//!
//! These newtypes and aggregates prevent mixing up different integer types
//! that have the same underlying representation but different semantic
//! meanings, and carry the leadership state that the controller persists to
//! the coordination service.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{INITIAL_LEADER_EPOCH, INITIAL_PARTITION_VERSION};

/// A broker's numeric identity within the cluster.
///
/// # Special Values
///
/// `-1` ([`BrokerId::NO_LEADER`]) marks a partition that currently has no
/// leader, e.g. after the leader was removed from the ISR and no in-sync
/// replacement exists.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BrokerId(pub i32);

impl BrokerId {
    /// Sentinel meaning "this partition has no leader".
    pub const NO_LEADER: Self = BrokerId(-1);

    /// Create a new broker ID from a raw value.
    #[inline]
    pub const fn new(value: i32) -> Self {
        BrokerId(value)
    }

    /// Get the raw i32 value.
    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }

    /// Check if this is a valid (non-negative) broker ID.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl From<i32> for BrokerId {
    fn from(value: i32) -> Self {
        BrokerId(value)
    }
}

impl From<BrokerId> for i32 {
    fn from(id: BrokerId) -> Self {
        id.0
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A topic/partition pair, the unit every controller decision is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        TopicPartition {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A replica of a partition, identified jointly by the partition and the
/// broker hosting it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionReplica {
    pub partition: TopicPartition,
    pub replica: BrokerId,
}

impl PartitionReplica {
    pub fn new(partition: TopicPartition, replica: BrokerId) -> Self {
        PartitionReplica { partition, replica }
    }
}

impl fmt::Display for PartitionReplica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} on broker {}]", self.partition, self.replica)
    }
}

/// A broker's registration: identity plus the endpoint other brokers use to
/// reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broker {
    pub id: BrokerId,
    pub host: String,
    pub port: i32,
}

impl Broker {
    pub fn new(id: BrokerId, host: impl Into<String>, port: i32) -> Self {
        Broker {
            id,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broker {} at {}:{}", self.id, self.host, self.port)
    }
}

/// Leadership state of a single partition.
///
/// `version` is the coordination-service node version observed when this
/// value was read or written; every update is a compare-and-swap against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderAndIsr {
    pub leader: BrokerId,
    pub leader_epoch: i32,
    pub isr: Vec<BrokerId>,
    pub version: i32,
}

impl LeaderAndIsr {
    /// Initial leadership for a freshly created partition.
    pub fn new(leader: BrokerId, isr: Vec<BrokerId>) -> Self {
        LeaderAndIsr {
            leader,
            leader_epoch: INITIAL_LEADER_EPOCH,
            isr,
            version: INITIAL_PARTITION_VERSION,
        }
    }

    /// New leadership with a different leader, same ISR. Bumps the leader
    /// epoch.
    pub fn with_new_leader(&self, leader: BrokerId) -> Self {
        LeaderAndIsr {
            leader,
            leader_epoch: self.leader_epoch + 1,
            isr: self.isr.clone(),
            version: self.version,
        }
    }

    /// New leadership with a different leader and ISR. Bumps the leader
    /// epoch.
    pub fn with_new_leader_and_isr(&self, leader: BrokerId, isr: Vec<BrokerId>) -> Self {
        LeaderAndIsr {
            leader,
            leader_epoch: self.leader_epoch + 1,
            isr,
            version: self.version,
        }
    }

    /// Same leader and ISR with a bumped leader epoch. Used to fence stale
    /// followers after a reassignment changes the replica set.
    pub fn with_bumped_epoch(&self) -> Self {
        LeaderAndIsr {
            leader: self.leader,
            leader_epoch: self.leader_epoch + 1,
            isr: self.isr.clone(),
            version: self.version,
        }
    }

    /// Replace the recorded node version after a successful write.
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    /// True if the partition currently has a leader.
    pub fn has_leader(&self) -> bool {
        self.leader != BrokerId::NO_LEADER
    }
}

impl fmt::Display for LeaderAndIsr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(leader={}, leaderEpoch={}, isr={:?}, version={})",
            self.leader,
            self.leader_epoch,
            self.isr.iter().map(|b| b.value()).collect::<Vec<_>>(),
            self.version
        )
    }
}

/// [`LeaderAndIsr`] together with the epoch of the controller that last
/// wrote it. A stored controller epoch greater than ours means we have been
/// superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderIsrAndControllerEpoch {
    pub leader_and_isr: LeaderAndIsr,
    pub controller_epoch: i32,
}

impl LeaderIsrAndControllerEpoch {
    pub fn new(leader_and_isr: LeaderAndIsr, controller_epoch: i32) -> Self {
        LeaderIsrAndControllerEpoch {
            leader_and_isr,
            controller_epoch,
        }
    }
}

impl fmt::Display for LeaderIsrAndControllerEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at controllerEpoch {}",
            self.leader_and_isr, self.controller_epoch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_leader_sentinel() {
        assert!(!BrokerId::NO_LEADER.is_valid());
        assert!(BrokerId::new(0).is_valid());
        assert_eq!(BrokerId::from(3).value(), 3);
    }

    #[test]
    fn test_leader_and_isr_epoch_bumps() {
        let initial = LeaderAndIsr::new(BrokerId(1), vec![BrokerId(1), BrokerId(2)]);
        assert_eq!(initial.leader_epoch, INITIAL_LEADER_EPOCH);

        let moved = initial.with_new_leader(BrokerId(2));
        assert_eq!(moved.leader, BrokerId(2));
        assert_eq!(moved.leader_epoch, initial.leader_epoch + 1);
        assert_eq!(moved.isr, initial.isr);

        let shrunk = moved.with_new_leader_and_isr(BrokerId(2), vec![BrokerId(2)]);
        assert_eq!(shrunk.leader_epoch, moved.leader_epoch + 1);
        assert_eq!(shrunk.isr, vec![BrokerId(2)]);

        let bumped = shrunk.with_bumped_epoch();
        assert_eq!(bumped.leader, shrunk.leader);
        assert_eq!(bumped.leader_epoch, shrunk.leader_epoch + 1);
    }

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition::new("events", 3);
        assert_eq!(tp.to_string(), "events-3");
    }
}
