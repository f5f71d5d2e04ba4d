//! Coordination-service client surface.
//!
//! The controller persists all shared cluster state through a ZooKeeper-like
//! coordination service: a tree of versioned nodes with ephemeral ownership,
//! conditional (compare-and-swap) writes, and child/data watches. This module
//! defines the client abstraction the controller core is written against:
//!
//! - [`CoordinationClient`]: reads, epoch-fenced conditional writes, and
//!   watch registration
//! - [`paths`]: the node layout
//! - [`payloads`]: the JSON node formats
//! - [`InMemoryCoordination`]: a full in-memory implementation for tests
//!
//! # Watches Become Events
//!
//! Watch firings never invoke controller logic directly. The client holds the
//! controller's [`EventSender`] and converts every firing into a
//! [`ControllerEvent`] enqueued on the single event queue, which preserves
//! the total order of controller decisions.
//!
//! # Epoch Fencing
//!
//! Every write method takes the caller's expected controller-epoch node
//! version. An implementation must reject the write with
//! [`CoordinationError::ControllerMoved`] when the stored version differs:
//! a newer controller has been elected and the caller must resign.
//!
//! [`ControllerEvent`]: crate::controller::ControllerEvent
//! [`EventSender`]: crate::controller::EventSender

pub mod paths;
pub mod payloads;

#[cfg(any(test, feature = "test-utilities"))]
pub mod memory;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use thiserror::Error as ThisError;

use crate::controller::EventSender;
use crate::types::{Broker, BrokerId, LeaderAndIsr, LeaderIsrAndControllerEpoch, TopicPartition};

pub use payloads::LogDirEvent;

#[cfg(any(test, feature = "test-utilities"))]
pub use memory::InMemoryCoordination;

/// Result type for coordination-service operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors surfaced by the coordination-service client.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum CoordinationError {
    /// A write observed a controller epoch (or epoch node version) newer
    /// than the caller's. Fatal for the caller's controllership.
    #[error("controller moved: {0}")]
    ControllerMoved(String),

    /// A conditional write lost a compare-and-swap race on a node version.
    /// Retriable: refresh the node and try again.
    #[error("version conflict at {path}")]
    VersionConflict { path: String },

    /// The addressed node does not exist.
    #[error("node missing at {path}")]
    NodeMissing { path: String },

    /// Creation failed because the node already exists.
    #[error("node already exists at {path}")]
    NodeExists { path: String },

    /// The client session expired; a new election is required.
    #[error("coordination session expired")]
    SessionExpired,

    /// Node data failed to decode.
    #[error("malformed payload at {path}: {reason}")]
    Payload { path: String, reason: String },

    /// Transport-level failure.
    #[error("coordination I/O error: {0}")]
    Io(String),
}

impl CoordinationError {
    /// True for CAS races that a refresh-and-retry loop may resolve.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, CoordinationError::VersionConflict { .. })
    }
}

/// Outcome of a successful controller election: the new epoch and the epoch
/// node version every subsequent write is fenced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerEpochRegistration {
    pub epoch: i32,
    pub epoch_version: i32,
}

/// Client abstraction over the coordination service.
///
/// All reads and writes are issued from the controller's event-loop task;
/// implementations only need interior mutability for watch bookkeeping and
/// the event sink.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    // ========================================================================
    // Event Delivery
    // ========================================================================

    /// Attach the sink that watch firings are delivered to. Called once at
    /// controller startup, before any watch is registered.
    async fn attach_event_sink(&self, sink: EventSender);

    // ========================================================================
    // Election and Epoch
    // ========================================================================

    /// Read the broker id stored at the controller node, if any.
    async fn active_controller_id(&self) -> CoordinationResult<Option<BrokerId>>;

    /// Attempt to become controller: create the ephemeral controller node
    /// and increment the epoch node in one transaction.
    ///
    /// Fails with [`CoordinationError::ControllerMoved`] when another broker
    /// holds the node.
    async fn register_controller(
        &self,
        broker_id: BrokerId,
    ) -> CoordinationResult<ControllerEpochRegistration>;

    /// Delete the controller node, conditional on the epoch node still
    /// having the expected version. Used by a resigning controller to force
    /// a new election without racing a successor.
    async fn delete_controller(&self, expected_epoch_version: i32) -> CoordinationResult<()>;

    /// Read the current `(epoch, epoch node version)` pair.
    async fn controller_epoch(&self) -> CoordinationResult<Option<(i32, i32)>>;

    // ========================================================================
    // Reads
    // ========================================================================

    /// All currently registered brokers.
    async fn live_brokers(&self) -> CoordinationResult<Vec<Broker>>;

    /// One broker's registration, if present.
    async fn broker(&self, broker_id: BrokerId) -> CoordinationResult<Option<Broker>>;

    /// All topic names.
    async fn all_topics(&self) -> CoordinationResult<BTreeSet<String>>;

    /// Replica assignment for one topic. Empty when the topic is unknown.
    async fn replica_assignment(
        &self,
        topic: &str,
    ) -> CoordinationResult<BTreeMap<TopicPartition, Vec<BrokerId>>>;

    /// Leadership state of one partition, if the state node exists.
    async fn leader_and_isr(
        &self,
        partition: &TopicPartition,
    ) -> CoordinationResult<Option<LeaderIsrAndControllerEpoch>>;

    /// Topics with a deletion marker.
    async fn topics_marked_for_deletion(&self) -> CoordinationResult<BTreeSet<String>>;

    /// Pending reassignments.
    async fn partitions_being_reassigned(
        &self,
    ) -> CoordinationResult<BTreeMap<TopicPartition, Vec<BrokerId>>>;

    /// Pending preferred-replica elections.
    async fn partitions_for_preferred_election(
        &self,
    ) -> CoordinationResult<BTreeSet<TopicPartition>>;

    /// Whether topic deletion is enabled cluster-wide.
    async fn topic_deletion_enabled(&self) -> CoordinationResult<bool>;

    /// Per-topic unclean-leader-election override, if one is configured.
    async fn unclean_leader_election_enabled(
        &self,
        topic: &str,
    ) -> CoordinationResult<Option<bool>>;

    // ========================================================================
    // Epoch-Fenced Writes
    // ========================================================================

    /// Create the leadership node for a new partition.
    async fn create_leader_and_isr(
        &self,
        partition: &TopicPartition,
        leader_and_isr: &LeaderAndIsr,
        controller_epoch: i32,
        expected_epoch_version: i32,
    ) -> CoordinationResult<()>;

    /// Conditionally replace a partition's leadership. The CAS is against
    /// `leader_and_isr.version`; on success the returned value carries the
    /// new node version.
    ///
    /// Fails with [`CoordinationError::ControllerMoved`] when the stored
    /// controller epoch exceeds `controller_epoch` or the epoch node version
    /// differs from `expected_epoch_version`.
    async fn update_leader_and_isr(
        &self,
        partition: &TopicPartition,
        leader_and_isr: &LeaderAndIsr,
        controller_epoch: i32,
        expected_epoch_version: i32,
    ) -> CoordinationResult<LeaderAndIsr>;

    /// Overwrite a topic's replica assignment.
    async fn set_replica_assignment(
        &self,
        topic: &str,
        assignment: &BTreeMap<i32, Vec<BrokerId>>,
        expected_epoch_version: i32,
    ) -> CoordinationResult<()>;

    /// Remove one partition from the pending-reassignment node, deleting the
    /// node once it is empty.
    async fn remove_partition_from_reassignment(
        &self,
        partition: &TopicPartition,
        expected_epoch_version: i32,
    ) -> CoordinationResult<()>;

    /// Delete the preferred-replica-election node.
    async fn clear_preferred_replica_election(
        &self,
        expected_epoch_version: i32,
    ) -> CoordinationResult<()>;

    /// Delete a topic's assignment and partition state nodes.
    async fn delete_topic(&self, topic: &str, expected_epoch_version: i32)
        -> CoordinationResult<()>;

    /// Delete a topic's deletion marker.
    async fn delete_topic_deletion_marker(
        &self,
        topic: &str,
        expected_epoch_version: i32,
    ) -> CoordinationResult<()>;

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Read and delete all ISR-change notification nodes, returning the
    /// partitions they name.
    async fn drain_isr_change_notifications(&self) -> CoordinationResult<Vec<TopicPartition>>;

    /// Read and delete all log-dir event notification nodes.
    async fn drain_log_dir_event_notifications(&self) -> CoordinationResult<Vec<LogDirEvent>>;

    // ========================================================================
    // Watches
    // ========================================================================

    /// Watch the controller node. Data changes enqueue `ControllerChange`;
    /// deletion enqueues `Reelect`.
    async fn register_controller_change_watch(&self) -> CoordinationResult<()>;

    /// Watch broker registrations (children of the broker-ids node).
    async fn register_broker_change_watch(&self) -> CoordinationResult<()>;

    /// Watch one broker's registration data.
    async fn register_broker_modification_watch(
        &self,
        broker_id: BrokerId,
    ) -> CoordinationResult<()>;

    async fn unregister_broker_modification_watch(&self, broker_id: BrokerId);

    /// Watch the topic list.
    async fn register_topic_change_watch(&self) -> CoordinationResult<()>;

    /// Watch deletion markers.
    async fn register_topic_deletion_watch(&self) -> CoordinationResult<()>;

    /// Watch one topic's assignment data for partition additions.
    async fn register_partition_modification_watch(&self, topic: &str) -> CoordinationResult<()>;

    async fn unregister_partition_modification_watch(&self, topic: &str);

    /// Watch the pending-reassignment node.
    async fn register_partition_reassignment_watch(&self) -> CoordinationResult<()>;

    /// Watch one partition's leadership node for ISR changes while a
    /// reassignment is in flight.
    async fn register_isr_change_watch(&self, partition: &TopicPartition)
        -> CoordinationResult<()>;

    async fn unregister_isr_change_watch(&self, partition: &TopicPartition);

    /// Watch the preferred-replica-election node.
    async fn register_preferred_election_watch(&self) -> CoordinationResult<()>;

    /// Watch ISR-change notification sequence nodes.
    async fn register_isr_change_notification_watch(&self) -> CoordinationResult<()>;

    /// Watch log-dir event notification sequence nodes.
    async fn register_log_dir_event_notification_watch(&self) -> CoordinationResult<()>;

    /// Drop every watch this client holds. Called during resignation.
    async fn unregister_all_watches(&self);
}
