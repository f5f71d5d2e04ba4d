//! Replica state machine.
//!
//! Tracks every replica (a partition on a specific broker) through its
//! lifecycle:
//!
//! ```text
//! NonExistent -> New -> Online <-> Offline -> DeletionStarted
//!                                     |            |        \
//!                                     |            v         v
//!                                     |     DeletionSuccessful  DeletionIneligible
//!                                     |            |               (retried when the
//!                                     |            v                broker returns)
//!                                     +----> NonExistent
//! ```
//!
//! Replica transitions stage follower resyncs (LeaderAndIsr), replication
//! stops (StopReplica), and - for a replica leaving the ISR - the
//! conditional ISR shrink of [`remove_replica_from_isr`]. Staged requests
//! go out in one batch per `handle_state_changes` call.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::controller::error::{ControllerError, ControllerResult};
use crate::controller::isr::remove_replica_from_isr;
use crate::controller::EventContext;
use crate::types::{BrokerId, PartitionReplica, TopicPartition};

/// Lifecycle state of one replica, from the controller's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaState {
    #[default]
    NonExistentReplica,
    NewReplica,
    OnlineReplica,
    OfflineReplica,
    ReplicaDeletionStarted,
    ReplicaDeletionSuccessful,
    ReplicaDeletionIneligible,
}

impl ReplicaState {
    pub fn name(self) -> &'static str {
        match self {
            ReplicaState::NonExistentReplica => "NonExistentReplica",
            ReplicaState::NewReplica => "NewReplica",
            ReplicaState::OnlineReplica => "OnlineReplica",
            ReplicaState::OfflineReplica => "OfflineReplica",
            ReplicaState::ReplicaDeletionStarted => "ReplicaDeletionStarted",
            ReplicaState::ReplicaDeletionSuccessful => "ReplicaDeletionSuccessful",
            ReplicaState::ReplicaDeletionIneligible => "ReplicaDeletionIneligible",
        }
    }

    fn valid_previous_states(self) -> &'static [ReplicaState] {
        match self {
            ReplicaState::NewReplica => &[ReplicaState::NonExistentReplica],
            ReplicaState::OnlineReplica => &[
                ReplicaState::NewReplica,
                ReplicaState::OnlineReplica,
                ReplicaState::OfflineReplica,
                ReplicaState::ReplicaDeletionIneligible,
            ],
            ReplicaState::OfflineReplica => &[
                ReplicaState::NewReplica,
                ReplicaState::OnlineReplica,
                ReplicaState::OfflineReplica,
                ReplicaState::ReplicaDeletionIneligible,
            ],
            ReplicaState::ReplicaDeletionStarted => &[ReplicaState::OfflineReplica],
            ReplicaState::ReplicaDeletionSuccessful => &[ReplicaState::ReplicaDeletionStarted],
            ReplicaState::ReplicaDeletionIneligible => &[
                ReplicaState::OfflineReplica,
                ReplicaState::ReplicaDeletionStarted,
            ],
            ReplicaState::NonExistentReplica => &[ReplicaState::ReplicaDeletionSuccessful],
        }
    }
}

/// The replica FSM. Holds only the state map; all cluster state it acts on
/// is threaded in per event.
pub struct ReplicaStateMachine {
    replica_states: HashMap<PartitionReplica, ReplicaState>,
}

impl ReplicaStateMachine {
    pub fn new() -> Self {
        ReplicaStateMachine {
            replica_states: HashMap::new(),
        }
    }

    /// Seed states from the freshly loaded context and resync every online
    /// replica. Called once per reign, at failover, before the partition
    /// state machine starts.
    pub(crate) async fn startup(&mut self, ecx: &mut EventContext<'_>) -> ControllerResult<()> {
        for replica in ecx.ctx.all_replicas() {
            let state = if ecx.ctx.is_replica_online(replica.replica, &replica.partition) {
                ReplicaState::OnlineReplica
            } else {
                // Dead on arrival: cannot be deleted until its broker returns.
                ReplicaState::ReplicaDeletionIneligible
            };
            self.replica_states.insert(replica, state);
        }
        info!(
            replicas = self.replica_states.len(),
            "Replica state machine started"
        );

        let online: Vec<PartitionReplica> = ecx.ctx.all_live_replicas().into_iter().collect();
        self.handle_state_changes(ecx, &online, ReplicaState::OnlineReplica)
            .await
    }

    /// Drop all state. Called at resignation.
    pub fn shutdown(&mut self) {
        self.replica_states.clear();
        debug!("Replica state machine stopped");
    }

    pub fn state_of(&self, replica: &PartitionReplica) -> ReplicaState {
        self.replica_states
            .get(replica)
            .copied()
            .unwrap_or_default()
    }

    /// Replicas of one topic currently in the given state.
    pub fn replicas_for_topic_in_state(
        &self,
        topic: &str,
        state: ReplicaState,
    ) -> Vec<PartitionReplica> {
        self.replica_states
            .iter()
            .filter(|(replica, s)| replica.partition.topic == topic && **s == state)
            .map(|(replica, _)| replica.clone())
            .collect()
    }

    /// True when every replica of the topic is in the given state.
    pub fn are_all_replicas_for_topic_in_state(&self, topic: &str, state: ReplicaState) -> bool {
        let mut any = false;
        for (replica, s) in &self.replica_states {
            if replica.partition.topic == topic {
                any = true;
                if *s != state {
                    return false;
                }
            }
        }
        any
    }

    /// True when any replica of the topic is in the given state.
    pub fn is_any_replica_for_topic_in_state(&self, topic: &str, state: ReplicaState) -> bool {
        self.replica_states
            .iter()
            .any(|(replica, s)| replica.partition.topic == topic && *s == state)
    }

    /// Move a set of replicas to the target state, staging and flushing the
    /// resulting broker requests as one batch.
    pub(crate) async fn handle_state_changes(
        &mut self,
        ecx: &mut EventContext<'_>,
        replicas: &[PartitionReplica],
        target: ReplicaState,
    ) -> ControllerResult<()> {
        if replicas.is_empty() {
            return Ok(());
        }
        ecx.batch.new_batch()?;

        for replica in replicas {
            if let Err(e) = self.do_transition(ecx, replica, target).await {
                if e.is_fatal() {
                    ecx.batch.clear();
                    return Err(e);
                }
                warn!(replica = %replica, target = target.name(), error = %e,
                    "Replica state change failed");
            }
        }

        let epoch = ecx.ctx.epoch;
        ecx.batch
            .send_requests_to_brokers(epoch, ecx.channel, ecx.ctx)
    }

    async fn do_transition(
        &mut self,
        ecx: &mut EventContext<'_>,
        replica: &PartitionReplica,
        target: ReplicaState,
    ) -> ControllerResult<()> {
        let current = self.state_of(replica);
        if !target.valid_previous_states().contains(&current) {
            return Err(ControllerError::StateChangeFailed {
                partition: replica.partition.clone(),
                reason: format!(
                    "invalid transition {} -> {} for replica on broker {}",
                    current.name(),
                    target.name(),
                    replica.replica
                ),
            });
        }
        let partition = &replica.partition;

        match target {
            ReplicaState::NewReplica => {
                if let Some(leadership) = ecx.ctx.partition_leadership.get(partition).cloned() {
                    if leadership.leader_and_isr.leader == replica.replica {
                        return Err(ControllerError::StateChangeFailed {
                            partition: partition.clone(),
                            reason: format!(
                                "replica on broker {} cannot become new, it is the leader",
                                replica.replica
                            ),
                        });
                    }
                    let assignment = ecx.ctx.partition_replica_assignment(partition);
                    ecx.batch.add_leader_and_isr_request_for_brokers(
                        &[replica.replica],
                        partition,
                        &leadership,
                        &assignment,
                        true,
                    );
                    self.stage_metadata_refresh(ecx, partition);
                }
            }
            ReplicaState::OnlineReplica => {
                if current == ReplicaState::NewReplica {
                    let mut assignment = ecx.ctx.partition_replica_assignment(partition);
                    if !assignment.contains(&replica.replica) {
                        assignment.push(replica.replica);
                        ecx.ctx
                            .set_partition_replica_assignment(partition, assignment);
                    }
                } else if let Some(leadership) =
                    ecx.ctx.partition_leadership.get(partition).cloned()
                {
                    let assignment = ecx.ctx.partition_replica_assignment(partition);
                    ecx.batch.add_leader_and_isr_request_for_brokers(
                        &[replica.replica],
                        partition,
                        &leadership,
                        &assignment,
                        false,
                    );
                    self.stage_metadata_refresh(ecx, partition);
                }
            }
            ReplicaState::OfflineReplica => {
                ecx.batch
                    .add_stop_replica_request_for_brokers(&[replica.replica], partition, false);

                if ecx.ctx.partition_leadership.contains_key(partition) {
                    let epoch = ecx.ctx.epoch;
                    let epoch_version = ecx.ctx.epoch_version;
                    let updated = remove_replica_from_isr(
                        ecx.coordination,
                        ecx.config,
                        partition,
                        replica.replica,
                        epoch,
                        epoch_version,
                    )
                    .await?;

                    if let Some(leadership) = updated {
                        ecx.ctx
                            .partition_leadership
                            .insert(partition.clone(), leadership.clone());
                        debug!(
                            replica = %replica,
                            isr = ?leadership.leader_and_isr.isr,
                            "Removed replica from ISR"
                        );

                        // Tell the remaining replicas about the shrunk ISR.
                        let assignment = ecx.ctx.partition_replica_assignment(partition);
                        let recipients: Vec<BrokerId> = assignment
                            .iter()
                            .filter(|r| **r != replica.replica)
                            .copied()
                            .collect();
                        if !ecx.ctx.topics_to_be_deleted.contains(&partition.topic) {
                            ecx.batch.add_leader_and_isr_request_for_brokers(
                                &recipients,
                                partition,
                                &leadership,
                                &assignment,
                                false,
                            );
                        }
                        self.stage_metadata_refresh(ecx, partition);
                    }
                }
            }
            ReplicaState::ReplicaDeletionStarted => {
                ecx.batch
                    .add_stop_replica_request_for_brokers(&[replica.replica], partition, true);
            }
            ReplicaState::ReplicaDeletionIneligible | ReplicaState::ReplicaDeletionSuccessful => {}
            ReplicaState::NonExistentReplica => {
                let assignment: Vec<BrokerId> = ecx
                    .ctx
                    .partition_replica_assignment(partition)
                    .into_iter()
                    .filter(|r| *r != replica.replica)
                    .collect();
                ecx.ctx
                    .set_partition_replica_assignment(partition, assignment);
                self.replica_states.remove(replica);
                return Ok(());
            }
        }

        self.replica_states.insert(replica.clone(), target);
        Ok(())
    }

    fn stage_metadata_refresh(&self, ecx: &mut EventContext<'_>, partition: &TopicPartition) {
        let live: Vec<BrokerId> = ecx
            .ctx
            .live_or_shutting_down_broker_ids()
            .into_iter()
            .collect();
        ecx.batch
            .add_update_metadata_request_for_brokers(&live, &[partition.clone()], ecx.ctx);
    }
}

impl Default for ReplicaStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(partition: i32, broker: i32) -> PartitionReplica {
        PartitionReplica::new(TopicPartition::new("t", partition), BrokerId(broker))
    }

    #[test]
    fn test_valid_previous_states() {
        assert!(ReplicaState::ReplicaDeletionStarted
            .valid_previous_states()
            .contains(&ReplicaState::OfflineReplica));
        assert!(!ReplicaState::ReplicaDeletionStarted
            .valid_previous_states()
            .contains(&ReplicaState::OnlineReplica));
        assert!(ReplicaState::NonExistentReplica
            .valid_previous_states()
            .contains(&ReplicaState::ReplicaDeletionSuccessful));
    }

    #[test]
    fn test_topic_state_queries() {
        let mut machine = ReplicaStateMachine::new();
        machine
            .replica_states
            .insert(replica(0, 1), ReplicaState::ReplicaDeletionSuccessful);
        machine
            .replica_states
            .insert(replica(0, 2), ReplicaState::ReplicaDeletionSuccessful);

        assert!(machine
            .are_all_replicas_for_topic_in_state("t", ReplicaState::ReplicaDeletionSuccessful));
        assert!(!machine.are_all_replicas_for_topic_in_state("other", ReplicaState::OnlineReplica));

        machine
            .replica_states
            .insert(replica(1, 1), ReplicaState::ReplicaDeletionStarted);
        assert!(!machine
            .are_all_replicas_for_topic_in_state("t", ReplicaState::ReplicaDeletionSuccessful));
        assert!(machine.is_any_replica_for_topic_in_state("t", ReplicaState::ReplicaDeletionStarted));
        assert_eq!(
            machine
                .replicas_for_topic_in_state("t", ReplicaState::ReplicaDeletionStarted)
                .len(),
            1
        );
    }
}
