//! Conditional leadership writes.
//!
//! Two refresh-and-CAS helpers update a partition's leadership node. Both
//! re-read the node on every attempt, apply their change, and write
//! conditionally on the observed node version; a lost race refreshes and
//! retries under [`leadership_cas_policy`]. A stored controller epoch newer
//! than ours is never retried - we have been superseded.

use backon::Retryable;
use tracing::{debug, info};

use crate::controller::config::ControllerConfig;
use crate::controller::error::{ControllerError, ControllerResult};
use crate::controller::retry::leadership_cas_policy;
use crate::coordination::CoordinationClient;
use crate::types::{BrokerId, LeaderIsrAndControllerEpoch, TopicPartition};

/// Resolve the effective unclean-election flag for a topic: its override in
/// the coordination service, or the cluster default.
pub(crate) async fn unclean_election_enabled(
    coordination: &dyn CoordinationClient,
    config: &ControllerConfig,
    topic: &str,
) -> bool {
    match coordination.unclean_leader_election_enabled(topic).await {
        Ok(Some(enabled)) => enabled,
        Ok(None) => config.unclean_leader_election_enable,
        Err(e) => {
            debug!(topic, error = %e, "Failed to read topic config, using cluster default");
            config.unclean_leader_election_enable
        }
    }
}

/// Bump a partition's leader epoch without changing leader or ISR. Used to
/// fence stale replicas when the assigned replica set changes underneath
/// them.
///
/// Returns `None` when the leadership node does not exist; the caller treats
/// that as failure of its own operation only.
pub(crate) async fn update_leader_epoch(
    coordination: &dyn CoordinationClient,
    partition: &TopicPartition,
    controller_epoch: i32,
    epoch_version: i32,
) -> ControllerResult<Option<LeaderIsrAndControllerEpoch>> {
    let attempt = || async move {
        let Some(stored) = coordination.leader_and_isr(partition).await? else {
            return Ok(None);
        };
        check_stored_epoch(partition, &stored, controller_epoch)?;

        let bumped = stored.leader_and_isr.with_bumped_epoch();
        let written = coordination
            .update_leader_and_isr(partition, &bumped, controller_epoch, epoch_version)
            .await?;
        Ok(Some(LeaderIsrAndControllerEpoch::new(
            written,
            controller_epoch,
        )))
    };

    attempt
        .retry(leadership_cas_policy())
        .when(ControllerError::is_version_conflict)
        .await
}

/// Remove a replica from a partition's ISR, bumping the leader epoch.
///
/// - If the replica is not in the ISR, the stored leadership is returned
///   unchanged.
/// - If removal would empty the ISR and unclean election is disabled for the
///   topic, the ISR is retained: shrinking to nothing would silently commit
///   to data loss on the next election.
/// - If the removed replica was the leader, the partition is left without a
///   leader.
///
/// Returns `None` when the leadership node does not exist.
pub(crate) async fn remove_replica_from_isr(
    coordination: &dyn CoordinationClient,
    config: &ControllerConfig,
    partition: &TopicPartition,
    replica: BrokerId,
    controller_epoch: i32,
    epoch_version: i32,
) -> ControllerResult<Option<LeaderIsrAndControllerEpoch>> {
    let unclean = unclean_election_enabled(coordination, config, &partition.topic).await;

    let attempt = || async move {
        let Some(stored) = coordination.leader_and_isr(partition).await? else {
            return Ok(None);
        };
        check_stored_epoch(partition, &stored, controller_epoch)?;

        if !stored.leader_and_isr.isr.contains(&replica) {
            return Ok(Some(stored));
        }

        let new_isr: Vec<BrokerId> = stored
            .leader_and_isr
            .isr
            .iter()
            .filter(|r| **r != replica)
            .copied()
            .collect();
        let new_isr = if new_isr.is_empty() && !unclean {
            info!(
                partition = %partition,
                replica = %replica,
                "Retaining last ISR entry, unclean leader election is disabled"
            );
            stored.leader_and_isr.isr.clone()
        } else {
            new_isr
        };
        let new_leader = if stored.leader_and_isr.leader == replica {
            BrokerId::NO_LEADER
        } else {
            stored.leader_and_isr.leader
        };

        let updated = stored
            .leader_and_isr
            .with_new_leader_and_isr(new_leader, new_isr);
        let written = coordination
            .update_leader_and_isr(partition, &updated, controller_epoch, epoch_version)
            .await?;
        Ok(Some(LeaderIsrAndControllerEpoch::new(
            written,
            controller_epoch,
        )))
    };

    attempt
        .retry(leadership_cas_policy())
        .when(ControllerError::is_version_conflict)
        .await
}

fn check_stored_epoch(
    partition: &TopicPartition,
    stored: &LeaderIsrAndControllerEpoch,
    controller_epoch: i32,
) -> ControllerResult<()> {
    if stored.controller_epoch > controller_epoch {
        return Err(ControllerError::ControllerMoved(format!(
            "leadership of {} was written by controller epoch {}, ours is {}",
            partition, stored.controller_epoch, controller_epoch
        )));
    }
    Ok(())
}
