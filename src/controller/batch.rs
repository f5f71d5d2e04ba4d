//! Request batching for mass state transitions.
//!
//! A failover or large reassignment touches thousands of partitions; sending
//! one RPC per partition would explode into N^2 traffic. Instead every
//! state-machine pass stages its requests into a batch keyed by
//! (target broker, request kind) and flushes once: each broker receives at
//! most one LeaderAndIsr, one StopReplica per delete flag, and one
//! UpdateMetadata per batch.
//!
//! Batches are never retried. Reliability comes from state-machine replays
//! after brokers reconnect, not from the transport.

use std::collections::{BTreeMap, HashMap};

use crate::controller::channel_manager::ControllerChannelManager;
use crate::controller::context::ControllerContext;
use crate::controller::error::{ControllerError, ControllerResult};
use crate::controller::requests::{
    ControlRequest, LeaderAndIsrPartitionState, LeaderAndIsrRequest, StopReplicaRequest,
    UpdateMetadataPartitionState, UpdateMetadataRequest,
};
use crate::types::{BrokerId, LeaderIsrAndControllerEpoch, TopicPartition};

/// Staged control requests for one event's worth of state changes.
#[derive(Debug, Default)]
pub struct ControllerBrokerRequestBatch {
    controller_id: BrokerId,
    leader_and_isr: HashMap<BrokerId, BTreeMap<TopicPartition, LeaderAndIsrPartitionState>>,
    /// Inner value: delete flag for the staged StopReplica.
    stop_replica: HashMap<BrokerId, BTreeMap<TopicPartition, bool>>,
    update_metadata: HashMap<BrokerId, BTreeMap<TopicPartition, UpdateMetadataPartitionState>>,
}

impl ControllerBrokerRequestBatch {
    pub fn new(controller_id: BrokerId) -> Self {
        ControllerBrokerRequestBatch {
            controller_id,
            ..Default::default()
        }
    }

    /// Start a new batch. A leftover from a previous batch means a flush was
    /// skipped, which is unrecoverable bookkeeping corruption.
    pub fn new_batch(&mut self) -> ControllerResult<()> {
        if !self.leader_and_isr.is_empty() {
            return Err(ControllerError::IllegalState(format!(
                "controller {} opened a new batch with {} unsent LeaderAndIsr entries",
                self.controller_id,
                self.leader_and_isr.len()
            )));
        }
        if !self.stop_replica.is_empty() {
            return Err(ControllerError::IllegalState(format!(
                "controller {} opened a new batch with {} unsent StopReplica entries",
                self.controller_id,
                self.stop_replica.len()
            )));
        }
        if !self.update_metadata.is_empty() {
            return Err(ControllerError::IllegalState(format!(
                "controller {} opened a new batch with {} unsent UpdateMetadata entries",
                self.controller_id,
                self.update_metadata.len()
            )));
        }
        Ok(())
    }

    /// Drop all staged requests. Called when a batch turns out to be built
    /// on corrupt state.
    pub fn clear(&mut self) {
        self.leader_and_isr.clear();
        self.stop_replica.clear();
        self.update_metadata.clear();
    }

    /// Stage a LeaderAndIsr entry for each target broker. Later entries for
    /// the same (broker, partition) replace earlier ones.
    pub fn add_leader_and_isr_request_for_brokers(
        &mut self,
        broker_ids: &[BrokerId],
        partition: &TopicPartition,
        leadership: &LeaderIsrAndControllerEpoch,
        replicas: &[BrokerId],
        is_new: bool,
    ) {
        let state = LeaderAndIsrPartitionState {
            partition: partition.clone(),
            leader: leadership.leader_and_isr.leader,
            leader_epoch: leadership.leader_and_isr.leader_epoch,
            isr: leadership.leader_and_isr.isr.clone(),
            version: leadership.leader_and_isr.version,
            replicas: replicas.to_vec(),
            is_new,
        };
        for broker_id in broker_ids {
            if !broker_id.is_valid() {
                continue;
            }
            self.leader_and_isr
                .entry(*broker_id)
                .or_default()
                .insert(partition.clone(), state.clone());
        }
    }

    /// Stage a StopReplica entry for each target broker. A delete overrides
    /// a previously staged non-delete for the same partition.
    pub fn add_stop_replica_request_for_brokers(
        &mut self,
        broker_ids: &[BrokerId],
        partition: &TopicPartition,
        delete_partition: bool,
    ) {
        for broker_id in broker_ids {
            let staged = self
                .stop_replica
                .entry(*broker_id)
                .or_default()
                .entry(partition.clone())
                .or_insert(delete_partition);
            *staged = *staged || delete_partition;
        }
    }

    /// Stage UpdateMetadata entries for each target broker, snapshotting the
    /// given partitions from the context. Brokers are staged even with an
    /// empty partition set so that a pure broker-list refresh still goes out.
    pub fn add_update_metadata_request_for_brokers(
        &mut self,
        broker_ids: &[BrokerId],
        partitions: &[TopicPartition],
        ctx: &ControllerContext,
    ) {
        let mut states = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let Some(leadership) = ctx.partition_leadership.get(partition) else {
                continue;
            };
            let replicas = ctx.partition_replica_assignment(partition);
            let offline_replicas = replicas
                .iter()
                .filter(|replica| !ctx.is_replica_online(**replica, partition))
                .copied()
                .collect();
            states.push(UpdateMetadataPartitionState {
                partition: partition.clone(),
                leader: leadership.leader_and_isr.leader,
                leader_epoch: leadership.leader_and_isr.leader_epoch,
                isr: leadership.leader_and_isr.isr.clone(),
                version: leadership.leader_and_isr.version,
                replicas,
                offline_replicas,
            });
        }

        for broker_id in broker_ids {
            let staged = self.update_metadata.entry(*broker_id).or_default();
            for state in &states {
                staged.insert(state.partition.clone(), state.clone());
            }
        }
    }

    /// Flush the batch: build and enqueue at most one request of each kind
    /// per target broker, stamped with the given controller epoch.
    pub fn send_requests_to_brokers(
        &mut self,
        controller_epoch: i32,
        channel: &mut ControllerChannelManager,
        ctx: &ControllerContext,
    ) -> ControllerResult<()> {
        for (broker_id, partition_states) in std::mem::take(&mut self.leader_and_isr) {
            let states: Vec<LeaderAndIsrPartitionState> =
                partition_states.into_values().collect();
            let leader_ids: Vec<BrokerId> = states.iter().map(|state| state.leader).collect();
            let live_leaders = ctx
                .live_or_shutting_down_brokers()
                .into_iter()
                .filter(|broker| leader_ids.contains(&broker.id))
                .collect();
            channel.send_request(
                broker_id,
                ControlRequest::LeaderAndIsr(LeaderAndIsrRequest {
                    controller_id: self.controller_id,
                    controller_epoch,
                    partition_states: states,
                    live_leaders,
                }),
            );
        }

        for (broker_id, partitions) in std::mem::take(&mut self.stop_replica) {
            let (deleted, stopped): (Vec<_>, Vec<_>) =
                partitions.into_iter().partition(|(_, delete)| *delete);
            for (delete_partitions, group) in [(true, deleted), (false, stopped)] {
                if group.is_empty() {
                    continue;
                }
                channel.send_request(
                    broker_id,
                    ControlRequest::StopReplica(StopReplicaRequest {
                        controller_id: self.controller_id,
                        controller_epoch,
                        delete_partitions,
                        partitions: group.into_iter().map(|(partition, _)| partition).collect(),
                    }),
                );
            }
        }

        let live_brokers = ctx.live_or_shutting_down_brokers();
        for (broker_id, partition_states) in std::mem::take(&mut self.update_metadata) {
            channel.send_request(
                broker_id,
                ControlRequest::UpdateMetadata(UpdateMetadataRequest {
                    controller_id: self.controller_id,
                    controller_epoch,
                    partition_states: partition_states.into_values().collect(),
                    live_brokers: live_brokers.clone(),
                }),
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Broker, LeaderAndIsr};

    fn leadership(leader: i32, isr: &[i32]) -> LeaderIsrAndControllerEpoch {
        LeaderIsrAndControllerEpoch::new(
            LeaderAndIsr::new(BrokerId(leader), isr.iter().map(|b| BrokerId(*b)).collect()),
            1,
        )
    }

    #[test]
    fn test_new_batch_rejects_unsent_entries() {
        let mut batch = ControllerBrokerRequestBatch::new(BrokerId(0));
        assert!(batch.new_batch().is_ok());

        batch.add_leader_and_isr_request_for_brokers(
            &[BrokerId(1)],
            &TopicPartition::new("t", 0),
            &leadership(1, &[1, 2]),
            &[BrokerId(1), BrokerId(2)],
            false,
        );
        let err = batch.new_batch().unwrap_err();
        assert!(matches!(err, ControllerError::IllegalState(_)));

        batch.clear();
        assert!(batch.new_batch().is_ok());
    }

    #[test]
    fn test_later_leader_and_isr_entries_replace_earlier_ones() {
        let mut batch = ControllerBrokerRequestBatch::new(BrokerId(0));
        let tp = TopicPartition::new("t", 0);
        batch.add_leader_and_isr_request_for_brokers(
            &[BrokerId(1)],
            &tp,
            &leadership(1, &[1, 2]),
            &[BrokerId(1), BrokerId(2)],
            false,
        );
        batch.add_leader_and_isr_request_for_brokers(
            &[BrokerId(1)],
            &tp,
            &leadership(2, &[2]),
            &[BrokerId(1), BrokerId(2)],
            false,
        );
        let staged = batch.leader_and_isr.get(&BrokerId(1)).unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged.get(&tp).unwrap().leader, BrokerId(2));
    }

    #[test]
    fn test_stop_replica_delete_flag_is_sticky() {
        let mut batch = ControllerBrokerRequestBatch::new(BrokerId(0));
        let tp = TopicPartition::new("t", 0);
        batch.add_stop_replica_request_for_brokers(&[BrokerId(3)], &tp, true);
        batch.add_stop_replica_request_for_brokers(&[BrokerId(3)], &tp, false);
        assert!(batch.stop_replica[&BrokerId(3)][&tp]);
    }

    #[test]
    fn test_update_metadata_skips_partitions_without_leadership() {
        let mut ctx = ControllerContext::new();
        ctx.brokers
            .insert(BrokerId(1), Broker::new(BrokerId(1), "b1", 9092));
        ctx.set_partition_replica_assignment(
            &TopicPartition::new("t", 0),
            vec![BrokerId(1)],
        );

        let mut batch = ControllerBrokerRequestBatch::new(BrokerId(0));
        batch.add_update_metadata_request_for_brokers(
            &[BrokerId(1)],
            &[TopicPartition::new("t", 0)],
            &ctx,
        );
        // The broker is staged for a broker-list refresh, with no state for
        // the leaderless partition.
        assert!(batch.update_metadata[&BrokerId(1)].is_empty());
    }
}
