//! The controller's event vocabulary.
//!
//! Every external signal (watch firings, RPC responses, timer ticks, API
//! calls) becomes a [`ControllerEvent`] on the single event queue. Each
//! event carries a [`ControllerState`] tag used to bucket processing-time
//! metrics and to expose what the controller is currently doing.

use std::collections::BTreeSet;

use tokio::sync::oneshot;

use crate::controller::requests::LeaderAndIsrResponse;
use crate::controller::ControllerResult;
use crate::types::{BrokerId, PartitionReplica, TopicPartition};

/// All signals the controller reacts to, processed strictly in enqueue
/// order by a single worker.
#[derive(Debug)]
pub enum ControllerEvent {
    /// Initial event: register the controller-change watch and run the
    /// first election.
    Startup,

    /// The controller node's data changed; resign if we lost it.
    ControllerChange,

    /// The controller node was deleted or the session expired; resign if
    /// needed and run a new election.
    Reelect,

    /// Broker registrations changed.
    BrokerChange,

    /// One broker's registration data changed (e.g. new endpoints).
    BrokerModification(BrokerId),

    /// The topic list changed.
    TopicChange,

    /// Deletion markers changed.
    TopicDeletion,

    /// Partitions were added to an existing topic.
    PartitionModifications(String),

    /// The pending-reassignment node was created or changed.
    PartitionReassignment,

    /// The leadership node of a partition under reassignment changed.
    PartitionReassignmentIsrChange(TopicPartition),

    /// ISR-change notification sequence nodes appeared.
    IsrChangeNotification,

    /// Log-dir event notification sequence nodes appeared.
    LogDirEventNotification,

    /// A preferred-replica election was requested externally.
    PreferredReplicaLeaderElection,

    /// Periodic preferred-leader rebalance tick.
    AutoPreferredReplicaLeaderElection,

    /// A broker asked to shut down cleanly; the reply carries the
    /// partitions it still leads.
    ControlledShutdown {
        broker_id: BrokerId,
        reply: oneshot::Sender<ControllerResult<BTreeSet<TopicPartition>>>,
    },

    /// A broker answered a LeaderAndIsr request.
    LeaderAndIsrResponseReceived {
        broker_id: BrokerId,
        response: LeaderAndIsrResponse,
    },

    /// A broker answered a StopReplica request that carried
    /// `delete_partitions = true`, for one replica.
    TopicDeletionStopReplicaResult {
        replica: PartitionReplica,
        error: Option<String>,
    },

    /// Test-only fence: the sender fires once every previously enqueued
    /// event has been processed.
    AwaitLatch(oneshot::Sender<()>),

    /// Close the queue: resign if active and stop the worker.
    Shutdown,
}

impl ControllerEvent {
    /// Metric bucket for this event.
    pub fn state(&self) -> ControllerState {
        match self {
            ControllerEvent::Startup => ControllerState::Startup,
            ControllerEvent::ControllerChange | ControllerEvent::Reelect => {
                ControllerState::ControllerChange
            }
            ControllerEvent::BrokerChange | ControllerEvent::BrokerModification(_) => {
                ControllerState::BrokerChange
            }
            ControllerEvent::TopicChange | ControllerEvent::PartitionModifications(_) => {
                ControllerState::TopicChange
            }
            ControllerEvent::TopicDeletion | ControllerEvent::TopicDeletionStopReplicaResult { .. } => {
                ControllerState::TopicDeletion
            }
            ControllerEvent::PartitionReassignment
            | ControllerEvent::PartitionReassignmentIsrChange(_) => {
                ControllerState::PartitionReassignment
            }
            ControllerEvent::IsrChangeNotification => ControllerState::IsrChange,
            ControllerEvent::LogDirEventNotification => ControllerState::LogDirChange,
            ControllerEvent::PreferredReplicaLeaderElection => {
                ControllerState::ManualLeaderBalance
            }
            ControllerEvent::AutoPreferredReplicaLeaderElection => {
                ControllerState::AutoLeaderBalance
            }
            ControllerEvent::ControlledShutdown { .. } => ControllerState::ControlledShutdown,
            ControllerEvent::LeaderAndIsrResponseReceived { .. } => {
                ControllerState::LeaderAndIsrResponse
            }
            ControllerEvent::AwaitLatch(_) | ControllerEvent::Shutdown => ControllerState::Idle,
        }
    }
}

/// What the controller is doing, exposed as a gauge and used as the metric
/// label for per-event processing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Startup,
    ControllerChange,
    BrokerChange,
    TopicChange,
    TopicDeletion,
    PartitionReassignment,
    IsrChange,
    LogDirChange,
    ManualLeaderBalance,
    AutoLeaderBalance,
    ControlledShutdown,
    LeaderAndIsrResponse,
}

impl ControllerState {
    /// Stable numeric value for the state gauge.
    pub fn value(self) -> i64 {
        match self {
            ControllerState::Idle => 0,
            ControllerState::Startup => 1,
            ControllerState::ControllerChange => 2,
            ControllerState::BrokerChange => 3,
            ControllerState::TopicChange => 4,
            ControllerState::TopicDeletion => 5,
            ControllerState::PartitionReassignment => 6,
            ControllerState::IsrChange => 7,
            ControllerState::LogDirChange => 8,
            ControllerState::ManualLeaderBalance => 9,
            ControllerState::AutoLeaderBalance => 10,
            ControllerState::ControlledShutdown => 11,
            ControllerState::LeaderAndIsrResponse => 12,
        }
    }

    /// Metric label.
    pub fn name(self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Startup => "startup",
            ControllerState::ControllerChange => "controller_change",
            ControllerState::BrokerChange => "broker_change",
            ControllerState::TopicChange => "topic_change",
            ControllerState::TopicDeletion => "topic_deletion",
            ControllerState::PartitionReassignment => "partition_reassignment",
            ControllerState::IsrChange => "isr_change",
            ControllerState::LogDirChange => "log_dir_change",
            ControllerState::ManualLeaderBalance => "manual_leader_balance",
            ControllerState::AutoLeaderBalance => "auto_leader_balance",
            ControllerState::ControlledShutdown => "controlled_shutdown",
            ControllerState::LeaderAndIsrResponse => "leader_and_isr_response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_state_tags() {
        assert_eq!(ControllerEvent::Startup.state(), ControllerState::Startup);
        assert_eq!(
            ControllerEvent::BrokerChange.state(),
            ControllerState::BrokerChange
        );
        assert_eq!(
            ControllerEvent::PartitionReassignmentIsrChange(TopicPartition::new("t", 0)).state(),
            ControllerState::PartitionReassignment
        );
        assert_eq!(ControllerEvent::Shutdown.state(), ControllerState::Idle);
    }

    #[test]
    fn test_state_values_are_distinct() {
        let states = [
            ControllerState::Idle,
            ControllerState::Startup,
            ControllerState::ControllerChange,
            ControllerState::BrokerChange,
            ControllerState::TopicChange,
            ControllerState::TopicDeletion,
            ControllerState::PartitionReassignment,
            ControllerState::IsrChange,
            ControllerState::LogDirChange,
            ControllerState::ManualLeaderBalance,
            ControllerState::AutoLeaderBalance,
            ControllerState::ControlledShutdown,
            ControllerState::LeaderAndIsrResponse,
        ];
        let mut values: Vec<i64> = states.iter().map(|s| s.value()).collect();
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), states.len());
    }
}
