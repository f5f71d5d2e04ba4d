//! Topic deletion orchestration.
//!
//! Deleting a topic means deleting every replica on every broker, which can
//! only proceed while those brokers are reachable. The manager tracks which
//! queued topics are currently eligible, drives their replicas through
//! `OfflineReplica -> ReplicaDeletionStarted`, collects the per-replica
//! StopReplica results that re-enter the event loop, and finishes by
//! removing the topic from the coordination service and the context.
//!
//! A topic is ineligible while any of its partitions is being reassigned or
//! any of its replicas sits on a dead broker; eligibility is restored when
//! the reassignment completes or the broker returns.
//!
//! Queued and ineligible topic sets live in the `ControllerContext` so the
//! manager, the state machines, and the event handlers share one view.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::controller::error::ControllerResult;
use crate::controller::partition_state::{PartitionState, PartitionStateMachine};
use crate::controller::replica_state::{ReplicaState, ReplicaStateMachine};
use crate::controller::EventContext;
use crate::types::{BrokerId, PartitionReplica, TopicPartition};

/// Orchestrates the deletion lifecycle of queued topics.
pub struct TopicDeletionManager {
    enabled: bool,
}

impl TopicDeletionManager {
    pub fn new(enabled: bool) -> Self {
        TopicDeletionManager { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Populate the queued/ineligible sets at failover. When deletion is
    /// disabled the markers are removed instead of queued.
    pub(crate) async fn init(
        &mut self,
        ecx: &mut EventContext<'_>,
        queued: BTreeSet<String>,
        ineligible: BTreeSet<String>,
    ) -> ControllerResult<()> {
        if !self.enabled {
            for topic in &queued {
                info!(topic = %topic, "Topic deletion is disabled, removing deletion marker");
                ecx.coordination
                    .delete_topic_deletion_marker(topic, ecx.ctx.epoch_version)
                    .await?;
            }
            return Ok(());
        }
        ecx.ctx.topics_to_be_deleted.extend(queued.iter().cloned());
        ecx.ctx
            .topics_ineligible_for_deletion
            .extend(ineligible.intersection(&queued).cloned());
        Ok(())
    }

    /// Forget everything. Called at resignation (the context reset clears
    /// the shared sets).
    pub fn reset(&mut self) {
        debug!("Topic deletion manager reset");
    }

    /// Mark topics as temporarily undeletable.
    pub fn mark_topics_ineligible(&mut self, ecx: &mut EventContext<'_>, topics: &[String]) {
        for topic in topics {
            if ecx.ctx.topics_to_be_deleted.contains(topic)
                && ecx
                    .ctx
                    .topics_ineligible_for_deletion
                    .insert(topic.clone())
            {
                info!(topic = %topic, "Topic deletion marked ineligible");
            }
        }
    }

    /// Restore eligibility for topics whose blocker went away.
    pub(crate) async fn resume_deletion_for_topics(
        &mut self,
        ecx: &mut EventContext<'_>,
        partition_machine: &mut PartitionStateMachine,
        replica_machine: &mut ReplicaStateMachine,
        topics: &[String],
    ) -> ControllerResult<()> {
        let mut restored = false;
        for topic in topics {
            if ecx.ctx.topics_ineligible_for_deletion.remove(topic) {
                info!(topic = %topic, "Topic deletion eligible again");
                restored = true;
            }
        }
        if restored {
            self.resume_deletions(ecx, partition_machine, replica_machine)
                .await?;
        }
        Ok(())
    }

    /// A broker confirmed it deleted these replicas.
    pub(crate) async fn complete_replica_deletions(
        &mut self,
        ecx: &mut EventContext<'_>,
        partition_machine: &mut PartitionStateMachine,
        replica_machine: &mut ReplicaStateMachine,
        replicas: &[PartitionReplica],
    ) -> ControllerResult<()> {
        replica_machine
            .handle_state_changes(ecx, replicas, ReplicaState::ReplicaDeletionSuccessful)
            .await?;
        self.resume_deletions(ecx, partition_machine, replica_machine)
            .await
    }

    /// A broker failed to delete these replicas (or died holding them).
    /// Their topics wait until the broker comes back.
    pub(crate) async fn fail_replica_deletions(
        &mut self,
        ecx: &mut EventContext<'_>,
        replica_machine: &mut ReplicaStateMachine,
        replicas: &[PartitionReplica],
    ) -> ControllerResult<()> {
        if replicas.is_empty() {
            return Ok(());
        }
        warn!(replicas = replicas.len(), "Replica deletions failed");
        replica_machine
            .handle_state_changes(ecx, replicas, ReplicaState::ReplicaDeletionIneligible)
            .await?;
        let topics: BTreeSet<String> = replicas
            .iter()
            .map(|replica| replica.partition.topic.clone())
            .collect();
        let topics: Vec<String> = topics.into_iter().collect();
        self.mark_topics_ineligible(ecx, &topics);
        Ok(())
    }

    /// Drive every queued topic as far as it can go: finish fully deleted
    /// topics, start deletion for eligible ones that have not started.
    pub(crate) async fn resume_deletions(
        &mut self,
        ecx: &mut EventContext<'_>,
        partition_machine: &mut PartitionStateMachine,
        replica_machine: &mut ReplicaStateMachine,
    ) -> ControllerResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let queued: Vec<String> = ecx.ctx.topics_to_be_deleted.iter().cloned().collect();
        for topic in queued {
            let has_replicas = !ecx.ctx.replicas_for_topic(&topic).is_empty();
            if !has_replicas
                || replica_machine.are_all_replicas_for_topic_in_state(
                    &topic,
                    ReplicaState::ReplicaDeletionSuccessful,
                )
            {
                self.complete_topic_deletion(ecx, partition_machine, replica_machine, &topic)
                    .await?;
            } else if self.is_eligible(ecx, replica_machine, &topic) {
                self.start_topic_deletion(ecx, partition_machine, replica_machine, &topic)
                    .await?;
            } else {
                debug!(topic = %topic, "Topic deletion waiting for eligibility");
            }
        }
        Ok(())
    }

    fn is_eligible(
        &self,
        ecx: &EventContext<'_>,
        replica_machine: &ReplicaStateMachine,
        topic: &str,
    ) -> bool {
        !ecx.ctx.topics_ineligible_for_deletion.contains(topic)
            && !replica_machine
                .is_any_replica_for_topic_in_state(topic, ReplicaState::ReplicaDeletionStarted)
    }

    /// Take every replica of the topic offline and ask live ones to delete.
    async fn start_topic_deletion(
        &mut self,
        ecx: &mut EventContext<'_>,
        partition_machine: &mut PartitionStateMachine,
        replica_machine: &mut ReplicaStateMachine,
        topic: &str,
    ) -> ControllerResult<()> {
        info!(topic, "Starting topic deletion");

        // Brokers must stop advertising the topic before replicas disappear.
        let partitions: Vec<TopicPartition> =
            ecx.ctx.partitions_for_topic(topic).into_iter().collect();
        let live: Vec<BrokerId> = ecx
            .ctx
            .live_or_shutting_down_broker_ids()
            .into_iter()
            .collect();
        ecx.batch.new_batch()?;
        ecx.batch
            .add_update_metadata_request_for_brokers(&live, &partitions, ecx.ctx);
        let epoch = ecx.ctx.epoch;
        ecx.batch
            .send_requests_to_brokers(epoch, ecx.channel, ecx.ctx)?;

        partition_machine
            .handle_state_changes(ecx, &partitions, PartitionState::Offline, None)
            .await?;

        // On a retry, replicas already confirmed deleted stay where they
        // are; only the stragglers go through the offline/delete cycle.
        let replicas: Vec<PartitionReplica> = ecx
            .ctx
            .replicas_for_topic(topic)
            .into_iter()
            .filter(|replica| {
                replica_machine.state_of(replica) != ReplicaState::ReplicaDeletionSuccessful
            })
            .collect();
        replica_machine
            .handle_state_changes(ecx, &replicas, ReplicaState::OfflineReplica)
            .await?;

        let (online, dead): (Vec<PartitionReplica>, Vec<PartitionReplica>) =
            replicas.into_iter().partition(|replica| {
                ecx.ctx.is_replica_online(replica.replica, &replica.partition)
            });
        replica_machine
            .handle_state_changes(ecx, &online, ReplicaState::ReplicaDeletionStarted)
            .await?;
        self.fail_replica_deletions(ecx, replica_machine, &dead)
            .await
    }

    /// Every replica is gone: clear the topic out of the coordination
    /// service and the cache.
    async fn complete_topic_deletion(
        &mut self,
        ecx: &mut EventContext<'_>,
        partition_machine: &mut PartitionStateMachine,
        replica_machine: &mut ReplicaStateMachine,
        topic: &str,
    ) -> ControllerResult<()> {
        info!(topic, "Completing topic deletion");

        let replicas: Vec<PartitionReplica> =
            ecx.ctx.replicas_for_topic(topic).into_iter().collect();
        replica_machine
            .handle_state_changes(ecx, &replicas, ReplicaState::NonExistentReplica)
            .await?;

        let partitions: Vec<TopicPartition> =
            ecx.ctx.partitions_for_topic(topic).into_iter().collect();
        partition_machine
            .handle_state_changes(ecx, &partitions, PartitionState::NonExistent, None)
            .await?;

        ecx.coordination
            .unregister_partition_modification_watch(topic)
            .await;
        let epoch_version = ecx.ctx.epoch_version;
        ecx.coordination.delete_topic(topic, epoch_version).await?;
        ecx.coordination
            .delete_topic_deletion_marker(topic, epoch_version)
            .await?;
        ecx.ctx.remove_topic(topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_respects_enabled_flag() {
        assert!(TopicDeletionManager::new(true).is_enabled());
        assert!(!TopicDeletionManager::new(false).is_enabled());
    }
}
