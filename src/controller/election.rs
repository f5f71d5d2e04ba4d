//! Leader selection.
//!
//! Four pure selection functions, one per election trigger. Each takes the
//! partition's current leadership, its assignment in preferred-leader order,
//! and a liveness predicate, and returns the new leadership (leader epoch
//! already bumped) plus the brokers that must be told about it. Ties break
//! strictly by assignment order.

use std::collections::BTreeSet;

use crate::controller::error::{ControllerError, ControllerResult};
use crate::controller::metrics;
use crate::types::{BrokerId, LeaderAndIsr, TopicPartition};

/// Which selector an election uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderElectionStrategy {
    /// The partition lost its leader.
    Offline,
    /// A reassignment finished syncing and leadership must land in the new
    /// replica set.
    Reassigned,
    /// Leadership is forced back to the preferred replica.
    PreferredReplica,
    /// The current leader is draining through a controlled shutdown.
    ControlledShutdown,
}

/// A selector's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderSelection {
    pub leader_and_isr: LeaderAndIsr,
    /// Brokers that must receive the new leadership.
    pub recipients: Vec<BrokerId>,
}

/// Pick a leader for a partition whose leader died.
///
/// Prefers the first assigned replica that is both in the ISR and online.
/// With unclean election enabled, falls back to the first online replica
/// outside the ISR (losing any records the ISR was ahead by); otherwise the
/// partition stays offline.
pub fn select_leader_for_offline_partition(
    partition: &TopicPartition,
    current: &LeaderAndIsr,
    assignment: &[BrokerId],
    is_online: impl Fn(BrokerId) -> bool,
    unclean_election_enabled: bool,
) -> ControllerResult<LeaderSelection> {
    let online_in_isr: Vec<BrokerId> = assignment
        .iter()
        .filter(|replica| current.isr.contains(*replica) && is_online(**replica))
        .copied()
        .collect();

    if let Some(leader) = online_in_isr.first() {
        return Ok(LeaderSelection {
            leader_and_isr: current.with_new_leader_and_isr(*leader, online_in_isr.clone()),
            recipients: online_replicas(assignment, &is_online),
        });
    }

    if unclean_election_enabled {
        if let Some(leader) = assignment.iter().find(|replica| is_online(**replica)) {
            metrics::UNCLEAN_LEADER_ELECTIONS_TOTAL.inc();
            return Ok(LeaderSelection {
                leader_and_isr: current.with_new_leader_and_isr(*leader, vec![*leader]),
                recipients: online_replicas(assignment, &is_online),
            });
        }
    }

    Err(ControllerError::NoReplicaOnline {
        partition: partition.clone(),
        assignment: assignment.to_vec(),
        live: online_replicas(assignment, &is_online),
    })
}

/// Pick a leader from a reassignment's target replica set: the first new
/// replica that is online and caught up (in the ISR).
pub fn select_leader_for_reassigned_partition(
    partition: &TopicPartition,
    current: &LeaderAndIsr,
    new_replicas: &[BrokerId],
    is_online: impl Fn(BrokerId) -> bool,
) -> ControllerResult<LeaderSelection> {
    let leader = new_replicas
        .iter()
        .find(|replica| current.isr.contains(*replica) && is_online(**replica))
        .copied()
        .ok_or_else(|| ControllerError::NoReplicaOnline {
            partition: partition.clone(),
            assignment: new_replicas.to_vec(),
            live: online_replicas(new_replicas, &is_online),
        })?;

    Ok(LeaderSelection {
        leader_and_isr: current.with_new_leader(leader),
        recipients: new_replicas.to_vec(),
    })
}

/// Force leadership back to the preferred replica (the first assigned one).
/// Fails unless that replica is online and in the ISR.
pub fn select_preferred_replica_leader(
    partition: &TopicPartition,
    current: &LeaderAndIsr,
    assignment: &[BrokerId],
    is_online: impl Fn(BrokerId) -> bool,
) -> ControllerResult<LeaderSelection> {
    let preferred = assignment
        .first()
        .copied()
        .ok_or_else(|| ControllerError::StateChangeFailed {
            partition: partition.clone(),
            reason: "partition has no assigned replicas".to_string(),
        })?;

    if preferred == current.leader {
        return Err(ControllerError::StateChangeFailed {
            partition: partition.clone(),
            reason: format!("preferred replica {} is already the leader", preferred),
        });
    }
    if !(current.isr.contains(&preferred) && is_online(preferred)) {
        return Err(ControllerError::StateChangeFailed {
            partition: partition.clone(),
            reason: format!(
                "preferred replica {} is offline or not in the ISR {:?}",
                preferred, current.isr
            ),
        });
    }

    Ok(LeaderSelection {
        leader_and_isr: current.with_new_leader(preferred),
        recipients: online_replicas(assignment, &is_online),
    })
}

/// Move leadership off a broker that is shutting down: the first assigned
/// replica that is in the ISR, online, and not itself draining. The ISR
/// shrinks to exclude every draining broker.
pub fn select_leader_for_controlled_shutdown(
    partition: &TopicPartition,
    current: &LeaderAndIsr,
    assignment: &[BrokerId],
    is_online: impl Fn(BrokerId) -> bool,
    shutting_down: &BTreeSet<BrokerId>,
) -> ControllerResult<LeaderSelection> {
    let new_isr: Vec<BrokerId> = current
        .isr
        .iter()
        .filter(|replica| !shutting_down.contains(*replica))
        .copied()
        .collect();

    let leader = assignment
        .iter()
        .find(|replica| new_isr.contains(*replica) && is_online(**replica))
        .copied()
        .ok_or_else(|| ControllerError::NoReplicaOnline {
            partition: partition.clone(),
            assignment: assignment.to_vec(),
            live: online_replicas(assignment, &is_online),
        })?;

    // Draining brokers still receive the shrunk leadership so they stop
    // fetching before the shutdown completes.
    let recipients = assignment
        .iter()
        .filter(|replica| is_online(**replica) || shutting_down.contains(*replica))
        .copied()
        .collect();

    Ok(LeaderSelection {
        leader_and_isr: current.with_new_leader_and_isr(leader, new_isr),
        recipients,
    })
}

fn online_replicas(assignment: &[BrokerId], is_online: impl Fn(BrokerId) -> bool) -> Vec<BrokerId> {
    assignment
        .iter()
        .filter(|replica| is_online(**replica))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[i32]) -> Vec<BrokerId> {
        raw.iter().map(|b| BrokerId(*b)).collect()
    }

    fn current(leader: i32, epoch: i32, isr: &[i32]) -> LeaderAndIsr {
        LeaderAndIsr {
            leader: BrokerId(leader),
            leader_epoch: epoch,
            isr: ids(isr),
            version: 3,
        }
    }

    fn tp() -> TopicPartition {
        TopicPartition::new("t", 0)
    }

    // ========================================================================
    // Offline Partition Selector
    // ========================================================================

    #[test]
    fn test_offline_selector_prefers_first_live_isr_replica_in_assignment_order() {
        let live = |id: BrokerId| id != BrokerId(1);
        let selection = select_leader_for_offline_partition(
            &tp(),
            &current(1, 5, &[1, 2, 3]),
            &ids(&[1, 2, 3]),
            live,
            false,
        )
        .unwrap();

        assert_eq!(selection.leader_and_isr.leader, BrokerId(2));
        assert_eq!(selection.leader_and_isr.isr, ids(&[2, 3]));
        assert_eq!(selection.leader_and_isr.leader_epoch, 6);
        assert_eq!(selection.recipients, ids(&[2, 3]));
    }

    #[test]
    fn test_offline_selector_fails_without_unclean_election() {
        // Only the dead broker is in the ISR.
        let live = |id: BrokerId| id == BrokerId(2);
        let err = select_leader_for_offline_partition(
            &tp(),
            &current(1, 5, &[1]),
            &ids(&[1, 2]),
            live,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ControllerError::NoReplicaOnline { .. }));
    }

    #[test]
    fn test_offline_selector_goes_unclean_when_enabled() {
        let live = |id: BrokerId| id == BrokerId(2);
        let selection = select_leader_for_offline_partition(
            &tp(),
            &current(1, 5, &[1]),
            &ids(&[1, 2]),
            live,
            true,
        )
        .unwrap();
        assert_eq!(selection.leader_and_isr.leader, BrokerId(2));
        assert_eq!(selection.leader_and_isr.isr, ids(&[2]));
    }

    // ========================================================================
    // Reassigned Partition Selector
    // ========================================================================

    #[test]
    fn test_reassigned_selector_picks_first_synced_new_replica() {
        let live = |_: BrokerId| true;
        let selection = select_leader_for_reassigned_partition(
            &tp(),
            &current(1, 5, &[1, 2, 3, 4, 5, 6]),
            &ids(&[4, 5, 6]),
            live,
        )
        .unwrap();
        assert_eq!(selection.leader_and_isr.leader, BrokerId(4));
        assert_eq!(selection.leader_and_isr.isr, ids(&[1, 2, 3, 4, 5, 6]));
        assert_eq!(selection.recipients, ids(&[4, 5, 6]));
    }

    #[test]
    fn test_reassigned_selector_fails_when_no_new_replica_is_in_isr() {
        let live = |_: BrokerId| true;
        let err = select_leader_for_reassigned_partition(
            &tp(),
            &current(1, 5, &[1, 2, 3]),
            &ids(&[4, 5, 6]),
            live,
        )
        .unwrap_err();
        assert!(matches!(err, ControllerError::NoReplicaOnline { .. }));
    }

    // ========================================================================
    // Preferred Replica Selector
    // ========================================================================

    #[test]
    fn test_preferred_selector_moves_leadership_to_first_assigned_replica() {
        let live = |_: BrokerId| true;
        let selection = select_preferred_replica_leader(
            &tp(),
            &current(3, 5, &[1, 2, 3]),
            &ids(&[2, 1, 3]),
            live,
        )
        .unwrap();
        assert_eq!(selection.leader_and_isr.leader, BrokerId(2));
        assert_eq!(selection.leader_and_isr.isr, ids(&[1, 2, 3]));
    }

    #[test]
    fn test_preferred_selector_fails_when_preferred_replica_lags() {
        let live = |_: BrokerId| true;
        let err = select_preferred_replica_leader(
            &tp(),
            &current(3, 5, &[1, 3]),
            &ids(&[2, 1, 3]),
            live,
        )
        .unwrap_err();
        assert!(matches!(err, ControllerError::StateChangeFailed { .. }));
    }

    // ========================================================================
    // Controlled Shutdown Selector
    // ========================================================================

    #[test]
    fn test_controlled_shutdown_selector_shrinks_isr_and_skips_draining_broker() {
        let live = |_: BrokerId| true;
        let shutting_down = BTreeSet::from([BrokerId(1)]);
        let selection = select_leader_for_controlled_shutdown(
            &tp(),
            &current(1, 5, &[1, 2, 3]),
            &ids(&[1, 2, 3]),
            live,
            &shutting_down,
        )
        .unwrap();
        assert_eq!(selection.leader_and_isr.leader, BrokerId(2));
        assert_eq!(selection.leader_and_isr.isr, ids(&[2, 3]));
        // The draining broker is still told about the new leadership.
        assert_eq!(selection.recipients, ids(&[1, 2, 3]));
    }

    #[test]
    fn test_controlled_shutdown_selector_fails_when_isr_is_only_the_draining_broker() {
        let live = |_: BrokerId| true;
        let shutting_down = BTreeSet::from([BrokerId(1)]);
        let err = select_leader_for_controlled_shutdown(
            &tp(),
            &current(1, 5, &[1]),
            &ids(&[1, 2]),
            live,
            &shutting_down,
        )
        .unwrap_err();
        assert!(matches!(err, ControllerError::NoReplicaOnline { .. }));
    }
}
