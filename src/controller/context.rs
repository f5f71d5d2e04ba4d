//! The controller's in-memory view of cluster state.
//!
//! [`ControllerContext`] is the single source of truth for decisions made
//! during the current reign. It is populated once at failover from the
//! coordination service, mutated only from the event-loop task, and cleared
//! at resignation. Derived views (`replicas_on_brokers`,
//! `partitions_on_broker`, `all_live_replicas`) are recomputed on demand;
//! no redundant indexes are maintained.

use std::collections::{BTreeMap, BTreeSet};

use crate::constants::{INITIAL_CONTROLLER_EPOCH, INITIAL_CONTROLLER_EPOCH_VERSION};
use crate::types::{
    Broker, BrokerId, LeaderIsrAndControllerEpoch, PartitionReplica, TopicPartition,
};

/// Bookkeeping for one in-flight reassignment.
#[derive(Debug, Clone)]
pub struct ReassignmentContext {
    /// Requested replica list, in preferred-leader order.
    pub new_replicas: Vec<BrokerId>,
    /// Whether the per-partition ISR watch is currently registered.
    pub isr_watch_registered: bool,
}

/// In-memory cluster state cache, owned by the event loop.
#[derive(Debug, Default)]
pub struct ControllerContext {
    /// Epoch of the current reign.
    pub epoch: i32,
    /// Version of the epoch node; every shared-state write is fenced on it.
    pub epoch_version: i32,

    /// Registered brokers, live or shutting down.
    pub brokers: BTreeMap<BrokerId, Broker>,
    /// Brokers draining through a controlled shutdown.
    pub shutting_down_broker_ids: BTreeSet<BrokerId>,

    pub all_topics: BTreeSet<String>,
    /// topic -> partition index -> assigned replicas, in preferred-leader
    /// order.
    pub partition_assignment: BTreeMap<String, BTreeMap<i32, Vec<BrokerId>>>,
    pub partition_leadership: BTreeMap<TopicPartition, LeaderIsrAndControllerEpoch>,

    pub partitions_being_reassigned: BTreeMap<TopicPartition, ReassignmentContext>,
    /// Replicas lost to failed log directories, per broker. A replica here
    /// is offline even while its broker is live.
    pub replicas_on_offline_dirs: BTreeMap<BrokerId, BTreeSet<TopicPartition>>,

    pub topics_to_be_deleted: BTreeSet<String>,
    pub topics_ineligible_for_deletion: BTreeSet<String>,
}

impl ControllerContext {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Brokers
    // ========================================================================

    /// Brokers that are registered and not draining.
    pub fn live_broker_ids(&self) -> BTreeSet<BrokerId> {
        self.brokers
            .keys()
            .filter(|id| !self.shutting_down_broker_ids.contains(*id))
            .copied()
            .collect()
    }

    pub fn live_or_shutting_down_broker_ids(&self) -> BTreeSet<BrokerId> {
        self.brokers.keys().copied().collect()
    }

    pub fn live_or_shutting_down_brokers(&self) -> Vec<Broker> {
        self.brokers.values().cloned().collect()
    }

    pub fn is_broker_live(&self, broker_id: BrokerId) -> bool {
        self.brokers.contains_key(&broker_id)
            && !self.shutting_down_broker_ids.contains(&broker_id)
    }

    /// A replica is online iff its broker is live and the replica is not on
    /// a failed log directory.
    pub fn is_replica_online(&self, broker_id: BrokerId, partition: &TopicPartition) -> bool {
        self.is_broker_live(broker_id)
            && !self
                .replicas_on_offline_dirs
                .get(&broker_id)
                .map(|tps| tps.contains(partition))
                .unwrap_or(false)
    }

    // ========================================================================
    // Assignments
    // ========================================================================

    pub fn partition_replica_assignment(&self, partition: &TopicPartition) -> Vec<BrokerId> {
        self.partition_assignment
            .get(&partition.topic)
            .and_then(|partitions| partitions.get(&partition.partition))
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_partition_replica_assignment(
        &mut self,
        partition: &TopicPartition,
        replicas: Vec<BrokerId>,
    ) {
        self.partition_assignment
            .entry(partition.topic.clone())
            .or_default()
            .insert(partition.partition, replicas);
    }

    pub fn all_partitions(&self) -> BTreeSet<TopicPartition> {
        self.partition_assignment
            .iter()
            .flat_map(|(topic, partitions)| {
                partitions
                    .keys()
                    .map(move |partition| TopicPartition::new(topic.clone(), *partition))
            })
            .collect()
    }

    pub fn partitions_for_topic(&self, topic: &str) -> BTreeSet<TopicPartition> {
        self.partition_assignment
            .get(topic)
            .map(|partitions| {
                partitions
                    .keys()
                    .map(|partition| TopicPartition::new(topic, *partition))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn partition_count(&self) -> usize {
        self.partition_assignment
            .values()
            .map(|partitions| partitions.len())
            .sum()
    }

    // ========================================================================
    // Replica Views
    // ========================================================================

    /// Replicas hosted by any of the given brokers.
    pub fn replicas_on_brokers(&self, broker_ids: &BTreeSet<BrokerId>) -> BTreeSet<PartitionReplica> {
        let mut replicas = BTreeSet::new();
        for (topic, partitions) in &self.partition_assignment {
            for (partition, assigned) in partitions {
                for broker_id in assigned {
                    if broker_ids.contains(broker_id) {
                        replicas.insert(PartitionReplica::new(
                            TopicPartition::new(topic.clone(), *partition),
                            *broker_id,
                        ));
                    }
                }
            }
        }
        replicas
    }

    /// Partitions with a replica on the given broker.
    pub fn partitions_on_broker(&self, broker_id: BrokerId) -> BTreeSet<TopicPartition> {
        let ids = BTreeSet::from([broker_id]);
        self.replicas_on_brokers(&ids)
            .into_iter()
            .map(|replica| replica.partition)
            .collect()
    }

    /// Every replica of every partition.
    pub fn all_replicas(&self) -> BTreeSet<PartitionReplica> {
        self.replicas_on_brokers(&self.all_assigned_broker_ids())
    }

    /// Replicas whose broker is live and whose log dir is healthy.
    pub fn all_live_replicas(&self) -> BTreeSet<PartitionReplica> {
        self.replicas_on_brokers(&self.live_broker_ids())
            .into_iter()
            .filter(|replica| self.is_replica_online(replica.replica, &replica.partition))
            .collect()
    }

    pub fn replicas_for_topic(&self, topic: &str) -> BTreeSet<PartitionReplica> {
        self.partition_assignment
            .get(topic)
            .map(|partitions| {
                partitions
                    .iter()
                    .flat_map(|(partition, assigned)| {
                        let tp = TopicPartition::new(topic, *partition);
                        assigned
                            .iter()
                            .map(move |broker_id| PartitionReplica::new(tp.clone(), *broker_id))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn all_assigned_broker_ids(&self) -> BTreeSet<BrokerId> {
        self.partition_assignment
            .values()
            .flat_map(|partitions| partitions.values())
            .flatten()
            .copied()
            .collect()
    }

    // ========================================================================
    // Leadership Views
    // ========================================================================

    /// Partitions whose current leader is one of the given brokers.
    pub fn partitions_with_leader_on(
        &self,
        broker_ids: &BTreeSet<BrokerId>,
    ) -> BTreeSet<TopicPartition> {
        self.partition_leadership
            .iter()
            .filter(|(_, leadership)| broker_ids.contains(&leadership.leader_and_isr.leader))
            .map(|(partition, _)| partition.clone())
            .collect()
    }

    // ========================================================================
    // Topic Removal
    // ========================================================================

    /// Drop every trace of a topic from the cache.
    pub fn remove_topic(&mut self, topic: &str) {
        self.all_topics.remove(topic);
        self.partition_assignment.remove(topic);
        self.partition_leadership
            .retain(|partition, _| partition.topic != topic);
        self.partitions_being_reassigned
            .retain(|partition, _| partition.topic != topic);
        for partitions in self.replicas_on_offline_dirs.values_mut() {
            partitions.retain(|partition| partition.topic != topic);
        }
        self.topics_to_be_deleted.remove(topic);
        self.topics_ineligible_for_deletion.remove(topic);
    }

    /// Clear everything. Called at resignation; the next reign repopulates
    /// from the coordination service.
    pub fn reset(&mut self) {
        self.epoch = INITIAL_CONTROLLER_EPOCH;
        self.epoch_version = INITIAL_CONTROLLER_EPOCH_VERSION;
        self.brokers.clear();
        self.shutting_down_broker_ids.clear();
        self.all_topics.clear();
        self.partition_assignment.clear();
        self.partition_leadership.clear();
        self.partitions_being_reassigned.clear();
        self.replicas_on_offline_dirs.clear();
        self.topics_to_be_deleted.clear();
        self.topics_ineligible_for_deletion.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LeaderAndIsr;

    fn context_with_topic() -> ControllerContext {
        let mut ctx = ControllerContext::new();
        for id in 1..=3 {
            ctx.brokers.insert(
                BrokerId(id),
                Broker::new(BrokerId(id), format!("broker-{id}"), 9092),
            );
        }
        ctx.all_topics.insert("events".to_string());
        ctx.set_partition_replica_assignment(
            &TopicPartition::new("events", 0),
            vec![BrokerId(1), BrokerId(2), BrokerId(3)],
        );
        ctx.set_partition_replica_assignment(
            &TopicPartition::new("events", 1),
            vec![BrokerId(2), BrokerId(3)],
        );
        ctx
    }

    #[test]
    fn test_live_broker_ids_exclude_shutting_down() {
        let mut ctx = context_with_topic();
        ctx.shutting_down_broker_ids.insert(BrokerId(2));

        assert_eq!(ctx.live_broker_ids(), BTreeSet::from([BrokerId(1), BrokerId(3)]));
        assert_eq!(
            ctx.live_or_shutting_down_broker_ids(),
            BTreeSet::from([BrokerId(1), BrokerId(2), BrokerId(3)])
        );
        assert!(!ctx.is_broker_live(BrokerId(2)));
    }

    #[test]
    fn test_replica_on_offline_dir_is_not_online() {
        let mut ctx = context_with_topic();
        let tp = TopicPartition::new("events", 0);
        assert!(ctx.is_replica_online(BrokerId(1), &tp));

        ctx.replicas_on_offline_dirs
            .entry(BrokerId(1))
            .or_default()
            .insert(tp.clone());
        assert!(!ctx.is_replica_online(BrokerId(1), &tp));
        // Other partitions on the same broker stay online.
        assert!(ctx.is_replica_online(BrokerId(2), &TopicPartition::new("events", 1)));
    }

    #[test]
    fn test_replicas_on_brokers() {
        let ctx = context_with_topic();
        let replicas = ctx.replicas_on_brokers(&BTreeSet::from([BrokerId(3)]));
        assert_eq!(replicas.len(), 2);
        assert!(replicas.iter().all(|r| r.replica == BrokerId(3)));
    }

    #[test]
    fn test_partitions_with_leader_on() {
        let mut ctx = context_with_topic();
        let tp = TopicPartition::new("events", 0);
        ctx.partition_leadership.insert(
            tp.clone(),
            LeaderIsrAndControllerEpoch::new(
                LeaderAndIsr::new(BrokerId(1), vec![BrokerId(1), BrokerId(2)]),
                1,
            ),
        );

        let led = ctx.partitions_with_leader_on(&BTreeSet::from([BrokerId(1)]));
        assert_eq!(led, BTreeSet::from([tp]));
        assert!(ctx
            .partitions_with_leader_on(&BTreeSet::from([BrokerId(3)]))
            .is_empty());
    }

    #[test]
    fn test_remove_topic_drops_every_trace() {
        let mut ctx = context_with_topic();
        let tp = TopicPartition::new("events", 0);
        ctx.partition_leadership.insert(
            tp.clone(),
            LeaderIsrAndControllerEpoch::new(LeaderAndIsr::new(BrokerId(1), vec![BrokerId(1)]), 1),
        );
        ctx.topics_to_be_deleted.insert("events".to_string());

        ctx.remove_topic("events");
        assert!(ctx.all_topics.is_empty());
        assert!(ctx.partition_assignment.is_empty());
        assert!(ctx.partition_leadership.is_empty());
        assert!(ctx.topics_to_be_deleted.is_empty());
    }
}
