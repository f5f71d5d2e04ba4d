//! Partition state machine.
//!
//! Tracks every partition through its lifecycle:
//!
//! ```text
//! NonExistent -> New -> Online <-> Offline
//!                        |            |
//!                        +-> NonExistent (topic deleted)
//! ```
//!
//! - **NonExistent**: never created, or deleted
//! - **New**: assignment recorded, no leadership written yet
//! - **Online**: has a live leader
//! - **Offline**: had a leader, currently has none
//!
//! Moving a partition to Online is the only transition that writes to the
//! coordination service: it either creates the initial leadership (for New
//! partitions, from the online assigned replicas) or runs a leader election
//! with the selector the caller picked. Staged LeaderAndIsr/UpdateMetadata
//! requests go out in one batch per `handle_state_changes` call.

use std::collections::HashMap;

use backon::Retryable;
use tracing::{debug, info, warn};

use crate::controller::election::{
    select_leader_for_controlled_shutdown, select_leader_for_offline_partition,
    select_leader_for_reassigned_partition, select_preferred_replica_leader,
    LeaderElectionStrategy, LeaderSelection,
};
use crate::controller::error::{ControllerError, ControllerResult};
use crate::controller::isr::unclean_election_enabled;
use crate::controller::retry::leadership_cas_policy;
use crate::controller::EventContext;
use crate::types::{BrokerId, LeaderAndIsr, LeaderIsrAndControllerEpoch, TopicPartition};

/// Lifecycle state of one partition, from the controller's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionState {
    #[default]
    NonExistent,
    New,
    Online,
    Offline,
}

impl PartitionState {
    pub fn name(self) -> &'static str {
        match self {
            PartitionState::NonExistent => "NonExistent",
            PartitionState::New => "New",
            PartitionState::Online => "Online",
            PartitionState::Offline => "Offline",
        }
    }

    fn valid_previous_states(self) -> &'static [PartitionState] {
        match self {
            PartitionState::New => &[PartitionState::NonExistent],
            PartitionState::Online => &[
                PartitionState::New,
                PartitionState::Online,
                PartitionState::Offline,
            ],
            PartitionState::Offline => &[
                PartitionState::New,
                PartitionState::Online,
                PartitionState::Offline,
            ],
            PartitionState::NonExistent => &[
                PartitionState::New,
                PartitionState::Online,
                PartitionState::Offline,
            ],
        }
    }
}

/// The partition FSM. Holds only the state map; all cluster state it acts on
/// is threaded in per event.
pub struct PartitionStateMachine {
    partition_states: HashMap<TopicPartition, PartitionState>,
}

impl PartitionStateMachine {
    pub fn new() -> Self {
        PartitionStateMachine {
            partition_states: HashMap::new(),
        }
    }

    /// Seed states from the freshly loaded context and bring every eligible
    /// partition online. Called once per reign, at failover.
    pub(crate) async fn startup(&mut self, ecx: &mut EventContext<'_>) -> ControllerResult<()> {
        for partition in ecx.ctx.all_partitions() {
            let state = match ecx.ctx.partition_leadership.get(&partition) {
                Some(leadership) => {
                    let leader = leadership.leader_and_isr.leader;
                    if ecx.ctx.is_replica_online(leader, &partition) {
                        PartitionState::Online
                    } else {
                        PartitionState::Offline
                    }
                }
                None => PartitionState::New,
            };
            self.partition_states.insert(partition, state);
        }
        info!(
            partitions = self.partition_states.len(),
            "Partition state machine started"
        );
        self.trigger_online_partition_state_change(ecx).await
    }

    /// Drop all state. Called at resignation.
    pub fn shutdown(&mut self) {
        self.partition_states.clear();
        debug!("Partition state machine stopped");
    }

    pub fn state_of(&self, partition: &TopicPartition) -> PartitionState {
        self.partition_states
            .get(partition)
            .copied()
            .unwrap_or_default()
    }

    pub fn partitions_in_state(&self, state: PartitionState) -> Vec<TopicPartition> {
        self.partition_states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(partition, _)| partition.clone())
            .collect()
    }

    pub fn offline_partition_count(&self) -> usize {
        self.partition_states
            .values()
            .filter(|state| **state == PartitionState::Offline)
            .count()
    }

    /// Try to elect leaders for every New or Offline partition, skipping
    /// topics queued for deletion.
    pub(crate) async fn trigger_online_partition_state_change(
        &mut self,
        ecx: &mut EventContext<'_>,
    ) -> ControllerResult<()> {
        let mut eligible: Vec<TopicPartition> = self
            .partition_states
            .iter()
            .filter(|(partition, state)| {
                matches!(**state, PartitionState::New | PartitionState::Offline)
                    && !ecx.ctx.topics_to_be_deleted.contains(&partition.topic)
            })
            .map(|(partition, _)| partition.clone())
            .collect();
        eligible.sort();
        self.handle_state_changes(
            ecx,
            &eligible,
            PartitionState::Online,
            Some(LeaderElectionStrategy::Offline),
        )
        .await
    }

    /// Move a set of partitions to the target state, staging and flushing
    /// the resulting broker requests as one batch.
    ///
    /// Per-partition failures (invalid transition, no eligible leader) are
    /// logged and skipped; fatal errors abort the batch and propagate.
    pub(crate) async fn handle_state_changes(
        &mut self,
        ecx: &mut EventContext<'_>,
        partitions: &[TopicPartition],
        target: PartitionState,
        strategy: Option<LeaderElectionStrategy>,
    ) -> ControllerResult<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        ecx.batch.new_batch()?;

        for partition in partitions {
            if let Err(e) = self.do_transition(ecx, partition, target, strategy).await {
                if e.is_fatal() {
                    ecx.batch.clear();
                    return Err(e);
                }
                warn!(partition = %partition, target = target.name(), error = %e,
                    "Partition state change failed");
            }
        }

        let epoch = ecx.ctx.epoch;
        ecx.batch
            .send_requests_to_brokers(epoch, ecx.channel, ecx.ctx)
    }

    async fn do_transition(
        &mut self,
        ecx: &mut EventContext<'_>,
        partition: &TopicPartition,
        target: PartitionState,
        strategy: Option<LeaderElectionStrategy>,
    ) -> ControllerResult<()> {
        let current = self.state_of(partition);
        if !target.valid_previous_states().contains(&current) {
            return Err(ControllerError::StateChangeFailed {
                partition: partition.clone(),
                reason: format!(
                    "invalid transition {} -> {}",
                    current.name(),
                    target.name()
                ),
            });
        }

        match target {
            PartitionState::New => {
                debug!(partition = %partition, "Partition created");
            }
            PartitionState::Online => match current {
                PartitionState::New => self.initialize_partition(ecx, partition).await?,
                _ => {
                    let strategy = strategy.ok_or_else(|| ControllerError::StateChangeFailed {
                        partition: partition.clone(),
                        reason: "no election strategy for an offline partition".to_string(),
                    })?;
                    self.elect_leader_for_partition(ecx, partition, strategy)
                        .await?;
                }
            },
            PartitionState::Offline => {
                debug!(partition = %partition, "Partition went offline");
            }
            PartitionState::NonExistent => {
                self.partition_states.remove(partition);
                return Ok(());
            }
        }

        self.partition_states.insert(partition.clone(), target);
        Ok(())
    }

    /// New -> Online: write the initial leadership, with the first online
    /// assigned replica as leader and all online assigned replicas as ISR.
    async fn initialize_partition(
        &mut self,
        ecx: &mut EventContext<'_>,
        partition: &TopicPartition,
    ) -> ControllerResult<()> {
        let assignment = ecx.ctx.partition_replica_assignment(partition);
        let online: Vec<BrokerId> = assignment
            .iter()
            .filter(|replica| ecx.ctx.is_replica_online(**replica, partition))
            .copied()
            .collect();
        let Some(leader) = online.first().copied() else {
            return Err(ControllerError::StateChangeFailed {
                partition: partition.clone(),
                reason: format!("no online replica in assignment {assignment:?}"),
            });
        };

        let leader_and_isr = LeaderAndIsr::new(leader, online.clone());
        ecx.coordination
            .create_leader_and_isr(partition, &leader_and_isr, ecx.ctx.epoch, ecx.ctx.epoch_version)
            .await?;
        let leadership = LeaderIsrAndControllerEpoch::new(leader_and_isr, ecx.ctx.epoch);
        ecx.ctx
            .partition_leadership
            .insert(partition.clone(), leadership.clone());
        info!(partition = %partition, leader = %leader, "Initialized partition leadership");

        ecx.batch.add_leader_and_isr_request_for_brokers(
            &online,
            partition,
            &leadership,
            &assignment,
            true,
        );
        let live: Vec<BrokerId> = ecx
            .ctx
            .live_or_shutting_down_broker_ids()
            .into_iter()
            .collect();
        ecx.batch
            .add_update_metadata_request_for_brokers(&live, &[partition.clone()], ecx.ctx);
        Ok(())
    }

    /// Offline/Online -> Online: run the selector, CAS the new leadership,
    /// and stage requests to the selector's recipients.
    async fn elect_leader_for_partition(
        &mut self,
        ecx: &mut EventContext<'_>,
        partition: &TopicPartition,
        strategy: LeaderElectionStrategy,
    ) -> ControllerResult<()> {
        let unclean = match strategy {
            LeaderElectionStrategy::Offline => {
                unclean_election_enabled(ecx.coordination, ecx.config, &partition.topic).await
            }
            _ => false,
        };

        let (written, recipients) = {
            let ctx = &*ecx.ctx;
            let coordination = ecx.coordination;
            let attempt = || async move {
                let stored = coordination.leader_and_isr(partition).await?.ok_or_else(|| {
                    ControllerError::StateChangeFailed {
                        partition: partition.clone(),
                        reason: "leadership node is missing".to_string(),
                    }
                })?;
                if stored.controller_epoch > ctx.epoch {
                    return Err(ControllerError::ControllerMoved(format!(
                        "leadership of {} was written by controller epoch {}, ours is {}",
                        partition, stored.controller_epoch, ctx.epoch
                    )));
                }

                let selection =
                    select_with_strategy(ctx, partition, &stored.leader_and_isr, strategy, unclean)?;
                let written = coordination
                    .update_leader_and_isr(
                        partition,
                        &selection.leader_and_isr,
                        ctx.epoch,
                        ctx.epoch_version,
                    )
                    .await?;
                Ok((written, selection.recipients))
            };
            attempt
                .retry(leadership_cas_policy())
                .when(ControllerError::is_version_conflict)
                .await?
        };

        let leadership = LeaderIsrAndControllerEpoch::new(written, ecx.ctx.epoch);
        ecx.ctx
            .partition_leadership
            .insert(partition.clone(), leadership.clone());
        info!(
            partition = %partition,
            leader = %leadership.leader_and_isr.leader,
            leader_epoch = leadership.leader_and_isr.leader_epoch,
            "Elected new leader"
        );

        let assignment = ecx.ctx.partition_replica_assignment(partition);
        ecx.batch.add_leader_and_isr_request_for_brokers(
            &recipients,
            partition,
            &leadership,
            &assignment,
            false,
        );
        let live: Vec<BrokerId> = ecx
            .ctx
            .live_or_shutting_down_broker_ids()
            .into_iter()
            .collect();
        ecx.batch
            .add_update_metadata_request_for_brokers(&live, &[partition.clone()], ecx.ctx);
        Ok(())
    }
}

impl Default for PartitionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch to the selector matching the strategy.
fn select_with_strategy(
    ctx: &crate::controller::context::ControllerContext,
    partition: &TopicPartition,
    current: &LeaderAndIsr,
    strategy: LeaderElectionStrategy,
    unclean: bool,
) -> ControllerResult<LeaderSelection> {
    let assignment = ctx.partition_replica_assignment(partition);
    let is_online = |replica: BrokerId| ctx.is_replica_online(replica, partition);

    match strategy {
        LeaderElectionStrategy::Offline => select_leader_for_offline_partition(
            partition,
            current,
            &assignment,
            is_online,
            unclean,
        ),
        LeaderElectionStrategy::Reassigned => {
            let new_replicas = ctx
                .partitions_being_reassigned
                .get(partition)
                .map(|reassignment| reassignment.new_replicas.clone())
                .ok_or_else(|| ControllerError::StateChangeFailed {
                    partition: partition.clone(),
                    reason: "no reassignment in progress".to_string(),
                })?;
            select_leader_for_reassigned_partition(partition, current, &new_replicas, is_online)
        }
        LeaderElectionStrategy::PreferredReplica => {
            select_preferred_replica_leader(partition, current, &assignment, is_online)
        }
        LeaderElectionStrategy::ControlledShutdown => select_leader_for_controlled_shutdown(
            partition,
            current,
            &assignment,
            is_online,
            &ctx.shutting_down_broker_ids,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_previous_states() {
        assert!(PartitionState::New
            .valid_previous_states()
            .contains(&PartitionState::NonExistent));
        assert!(!PartitionState::New
            .valid_previous_states()
            .contains(&PartitionState::Online));
        assert!(PartitionState::Online
            .valid_previous_states()
            .contains(&PartitionState::Offline));
        assert!(PartitionState::NonExistent
            .valid_previous_states()
            .contains(&PartitionState::Offline));
    }

    #[test]
    fn test_state_queries() {
        let mut machine = PartitionStateMachine::new();
        machine
            .partition_states
            .insert(TopicPartition::new("t", 0), PartitionState::Offline);
        machine
            .partition_states
            .insert(TopicPartition::new("t", 1), PartitionState::Online);

        assert_eq!(
            machine.state_of(&TopicPartition::new("t", 0)),
            PartitionState::Offline
        );
        assert_eq!(
            machine.state_of(&TopicPartition::new("t", 9)),
            PartitionState::NonExistent
        );
        assert_eq!(machine.offline_partition_count(), 1);
        assert_eq!(
            machine.partitions_in_state(PartitionState::Online),
            vec![TopicPartition::new("t", 1)]
        );
    }
}
