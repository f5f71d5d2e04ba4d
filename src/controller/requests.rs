//! Control-plane requests sent from the controller to brokers.
//!
//! Three request types carry every controller decision to the data plane:
//!
//! - [`LeaderAndIsrRequest`]: makes brokers leaders or followers
//! - [`StopReplicaRequest`]: stops replication, optionally deleting data
//! - [`UpdateMetadataRequest`]: refreshes every broker's metadata cache
//!
//! These are in-process representations; wire encoding lives with the RPC
//! layer. Every request is stamped with the sending controller's id and
//! epoch so receivers can discard messages from deposed controllers.

use std::fmt;

use crate::types::{Broker, BrokerId, TopicPartition};

/// Per-partition payload of a [`LeaderAndIsrRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderAndIsrPartitionState {
    pub partition: TopicPartition,
    pub leader: BrokerId,
    pub leader_epoch: i32,
    pub isr: Vec<BrokerId>,
    /// Coordination-service node version of the leadership state.
    pub version: i32,
    /// Full assigned replica list, in preferred-leader order.
    pub replicas: Vec<BrokerId>,
    /// True when the receiving broker has never hosted this replica before.
    pub is_new: bool,
}

/// Directs brokers to become leader or follower for a set of partitions.
#[derive(Debug, Clone)]
pub struct LeaderAndIsrRequest {
    pub controller_id: BrokerId,
    pub controller_epoch: i32,
    pub partition_states: Vec<LeaderAndIsrPartitionState>,
    /// Registrations of the brokers currently leading the partitions above,
    /// so followers can connect without a metadata round-trip.
    pub live_leaders: Vec<Broker>,
}

/// Directs a broker to stop replicating a set of partitions.
#[derive(Debug, Clone)]
pub struct StopReplicaRequest {
    pub controller_id: BrokerId,
    pub controller_epoch: i32,
    /// When true the broker also deletes the partition's local data.
    pub delete_partitions: bool,
    pub partitions: Vec<TopicPartition>,
}

/// Per-partition payload of an [`UpdateMetadataRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMetadataPartitionState {
    pub partition: TopicPartition,
    pub leader: BrokerId,
    pub leader_epoch: i32,
    pub isr: Vec<BrokerId>,
    pub version: i32,
    pub replicas: Vec<BrokerId>,
    /// Replicas currently unreachable (dead broker or failed log dir).
    pub offline_replicas: Vec<BrokerId>,
}

/// Refreshes a broker's view of cluster metadata.
#[derive(Debug, Clone)]
pub struct UpdateMetadataRequest {
    pub controller_id: BrokerId,
    pub controller_epoch: i32,
    pub partition_states: Vec<UpdateMetadataPartitionState>,
    pub live_brokers: Vec<Broker>,
}

/// The three control-plane request kinds, as queued per target broker.
#[derive(Debug, Clone)]
pub enum ControlRequest {
    LeaderAndIsr(LeaderAndIsrRequest),
    StopReplica(StopReplicaRequest),
    UpdateMetadata(UpdateMetadataRequest),
}

impl ControlRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlRequest::LeaderAndIsr(_) => "leader_and_isr",
            ControlRequest::StopReplica(_) => "stop_replica",
            ControlRequest::UpdateMetadata(_) => "update_metadata",
        }
    }
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlRequest::LeaderAndIsr(req) => write!(
                f,
                "LeaderAndIsr(epoch={}, partitions={})",
                req.controller_epoch,
                req.partition_states.len()
            ),
            ControlRequest::StopReplica(req) => write!(
                f,
                "StopReplica(epoch={}, delete={}, partitions={})",
                req.controller_epoch,
                req.delete_partitions,
                req.partitions.len()
            ),
            ControlRequest::UpdateMetadata(req) => write!(
                f,
                "UpdateMetadata(epoch={}, partitions={})",
                req.controller_epoch,
                req.partition_states.len()
            ),
        }
    }
}

/// Per-partition outcome inside a broker's response.
#[derive(Debug, Clone)]
pub struct PartitionResult {
    pub partition: TopicPartition,
    /// `None` on success; a broker-reported failure otherwise.
    pub error: Option<String>,
}

/// Response to a [`LeaderAndIsrRequest`]. Partition-level errors reveal
/// replicas the broker could not bring online (e.g. a failed log dir).
#[derive(Debug, Clone, Default)]
pub struct LeaderAndIsrResponse {
    pub error: Option<String>,
    pub partition_results: Vec<PartitionResult>,
}

/// Response to a [`StopReplicaRequest`].
#[derive(Debug, Clone, Default)]
pub struct StopReplicaResponse {
    pub partition_results: Vec<PartitionResult>,
}

/// Responses from the three control-plane request kinds.
#[derive(Debug, Clone)]
pub enum ControlResponse {
    LeaderAndIsr(LeaderAndIsrResponse),
    StopReplica(StopReplicaResponse),
    UpdateMetadata,
}
