//! In-memory coordination service for testing.
//!
//! A full-featured implementation of [`CoordinationClient`] over an
//! in-memory tree of versioned JSON nodes, honoring the same semantics a
//! real deployment sees:
//!
//! - conditional writes compare-and-swap on per-node versions
//! - every controller write is fenced on the epoch node version
//! - registered watches convert mutations into controller events
//!
//! Beyond the client trait, the store exposes mutators that tests use to
//! play the rest of the cluster: brokers registering and failing, topics
//! appearing, followers catching up, another controller seizing the epoch.
//!
//! Available when the `test-utilities` feature is enabled, or during unit
//! tests:
//!
//! ```toml
//! [dev-dependencies]
//! castellan = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::constants::PAYLOAD_FORMAT_VERSION;
use crate::controller::{ControllerEvent, EventSender};
use crate::coordination::payloads::{
    BrokerRegistration, ControllerRegistration, IsrChangeNotificationData, LogDirEvent,
    LogDirEventData, PartitionEntry, PartitionStateData, PreferredElectionData, ReassignmentData,
    ReassignmentEntry, TopicAssignment, TopicConfigData,
};
use crate::coordination::{
    paths, ControllerEpochRegistration, CoordinationClient, CoordinationError, CoordinationResult,
};
use crate::types::{Broker, BrokerId, LeaderAndIsr, LeaderIsrAndControllerEpoch, TopicPartition};

#[derive(Debug, Clone)]
struct Node {
    data: String,
    version: i32,
}

#[derive(Debug, Default)]
struct Watches {
    controller: bool,
    broker_change: bool,
    topic_change: bool,
    topic_deletion: bool,
    reassignment: bool,
    preferred_election: bool,
    isr_notifications: bool,
    log_dir_notifications: bool,
    broker_modifications: BTreeSet<BrokerId>,
    partition_modifications: BTreeSet<String>,
    isr_change: BTreeSet<TopicPartition>,
}

#[derive(Debug, Default)]
struct Store {
    nodes: BTreeMap<String, Node>,
    watches: Watches,
    next_isr_seq: u64,
    next_log_dir_seq: u64,
}

impl Store {
    /// Create or overwrite a node, bumping its version. Returns the new
    /// version (0 for a fresh node).
    fn write(&mut self, path: &str, data: String) -> i32 {
        match self.nodes.get_mut(path) {
            Some(node) => {
                node.data = data;
                node.version += 1;
                node.version
            }
            None => {
                self.nodes.insert(path.to_string(), Node { data, version: 0 });
                0
            }
        }
    }

    fn decode<T: DeserializeOwned>(&self, path: &str) -> CoordinationResult<Option<T>> {
        let Some(node) = self.nodes.get(path) else {
            return Ok(None);
        };
        serde_json::from_str(&node.data)
            .map(Some)
            .map_err(|e| CoordinationError::Payload {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }

    /// Direct children of a node, by name.
    fn children_of(&self, parent: &str) -> Vec<String> {
        let prefix = format!("{parent}/");
        self.nodes
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(|rest| rest.to_string())
            .collect()
    }

    /// Every controller write runs inside a transaction that checks the
    /// epoch node version; a mismatch means a newer controller exists.
    fn check_epoch(&self, expected_epoch_version: i32) -> CoordinationResult<()> {
        let current = self
            .nodes
            .get(paths::CONTROLLER_EPOCH)
            .map(|node| node.version)
            .unwrap_or(0);
        if current != expected_epoch_version {
            return Err(CoordinationError::ControllerMoved(format!(
                "epoch node is at version {current}, write was fenced on {expected_epoch_version}"
            )));
        }
        Ok(())
    }

    fn epoch(&self) -> Option<(i32, i32)> {
        let node = self.nodes.get(paths::CONTROLLER_EPOCH)?;
        let epoch = node.data.parse().ok()?;
        Some((epoch, node.version))
    }
}

fn encode<T: Serialize>(path: &str, value: &T) -> CoordinationResult<String> {
    serde_json::to_string(value).map_err(|e| CoordinationError::Payload {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// The in-memory coordination service.
#[derive(Default)]
pub struct InMemoryCoordination {
    state: RwLock<Store>,
    sink: RwLock<Option<EventSender>>,
}

impl InMemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    async fn fire(&self, event: ControllerEvent) {
        if let Some(sink) = self.sink.read().await.as_ref() {
            sink.put(event);
        } else {
            debug!("No event sink attached, dropping watch event");
        }
    }

    // ========================================================================
    // Test Mutators: the rest of the cluster
    // ========================================================================

    /// A broker registers itself (or re-registers after a bounce).
    pub async fn add_broker(&self, broker: Broker) {
        let path = paths::broker(broker.id.value());
        let registration = BrokerRegistration {
            version: PAYLOAD_FORMAT_VERSION,
            host: broker.host.clone(),
            port: broker.port,
        };
        let fire;
        {
            let mut store = self.state.write().await;
            store.write(&path, encode(&path, &registration).unwrap());
            fire = store.watches.broker_change;
        }
        if fire {
            self.fire(ControllerEvent::BrokerChange).await;
        }
    }

    /// A broker changes its registration data (e.g. new endpoints).
    pub async fn update_broker(&self, broker: Broker) {
        let path = paths::broker(broker.id.value());
        let registration = BrokerRegistration {
            version: PAYLOAD_FORMAT_VERSION,
            host: broker.host.clone(),
            port: broker.port,
        };
        let fire;
        {
            let mut store = self.state.write().await;
            store.write(&path, encode(&path, &registration).unwrap());
            fire = store.watches.broker_modifications.contains(&broker.id);
        }
        if fire {
            self.fire(ControllerEvent::BrokerModification(broker.id)).await;
        }
    }

    /// A broker's session ends: its ephemeral registration vanishes.
    pub async fn fail_broker(&self, broker_id: BrokerId) {
        let fire;
        {
            let mut store = self.state.write().await;
            store.nodes.remove(&paths::broker(broker_id.value()));
            fire = store.watches.broker_change;
        }
        if fire {
            self.fire(ControllerEvent::BrokerChange).await;
        }
    }

    /// An admin tool creates a topic with the given assignment.
    pub async fn create_topic(&self, topic: &str, assignment: BTreeMap<i32, Vec<BrokerId>>) {
        let path = paths::topic(topic);
        let payload = TopicAssignment::from_assignment(&assignment);
        let fire;
        {
            let mut store = self.state.write().await;
            store.write(&path, encode(&path, &payload).unwrap());
            fire = store.watches.topic_change;
        }
        if fire {
            self.fire(ControllerEvent::TopicChange).await;
        }
    }

    /// An admin tool adds partitions to an existing topic.
    pub async fn add_topic_partitions(&self, topic: &str, additions: BTreeMap<i32, Vec<BrokerId>>) {
        let path = paths::topic(topic);
        let fire;
        {
            let mut store = self.state.write().await;
            let mut assignment = store
                .decode::<TopicAssignment>(&path)
                .ok()
                .flatten()
                .and_then(|payload| payload.to_assignment())
                .unwrap_or_default();
            assignment.extend(additions);
            let payload = TopicAssignment::from_assignment(&assignment);
            store.write(&path, encode(&path, &payload).unwrap());
            fire = store.watches.partition_modifications.contains(topic);
        }
        if fire {
            self.fire(ControllerEvent::PartitionModifications(topic.to_string()))
                .await;
        }
    }

    /// The partition leader expands or shrinks the ISR (followers caught up
    /// or fell behind). Bumps the node version, not the leader epoch.
    pub async fn set_isr(&self, partition: &TopicPartition, isr: Vec<BrokerId>) {
        let path = paths::partition_state(partition);
        let fire;
        {
            let mut store = self.state.write().await;
            let Some(stored) = store.decode::<PartitionStateData>(&path).ok().flatten() else {
                return;
            };
            let updated = PartitionStateData {
                isr: isr.iter().map(|b| b.value()).collect(),
                ..stored
            };
            store.write(&path, encode(&path, &updated).unwrap());
            fire = store.watches.isr_change.contains(partition);
        }
        if fire {
            self.fire(ControllerEvent::PartitionReassignmentIsrChange(
                partition.clone(),
            ))
            .await;
        }
    }

    /// A leader batches ISR changes into a notification node.
    pub async fn write_isr_change_notification(&self, partitions: &[TopicPartition]) {
        let payload = IsrChangeNotificationData {
            version: PAYLOAD_FORMAT_VERSION,
            partitions: partitions.iter().map(PartitionEntry::from_partition).collect(),
        };
        let fire;
        {
            let mut store = self.state.write().await;
            let seq = store.next_isr_seq;
            store.next_isr_seq += 1;
            let path = paths::isr_change_notification(seq);
            store.write(&path, encode(&path, &payload).unwrap());
            fire = store.watches.isr_notifications;
        }
        if fire {
            self.fire(ControllerEvent::IsrChangeNotification).await;
        }
    }

    /// A broker reports partitions lost to a failed log directory.
    pub async fn write_log_dir_event(&self, broker_id: BrokerId, partitions: &[TopicPartition]) {
        let payload = LogDirEventData {
            version: PAYLOAD_FORMAT_VERSION,
            broker: broker_id.value(),
            partitions: partitions.iter().map(PartitionEntry::from_partition).collect(),
        };
        let fire;
        {
            let mut store = self.state.write().await;
            let seq = store.next_log_dir_seq;
            store.next_log_dir_seq += 1;
            let path = paths::log_dir_event_notification(seq);
            store.write(&path, encode(&path, &payload).unwrap());
            fire = store.watches.log_dir_notifications;
        }
        if fire {
            self.fire(ControllerEvent::LogDirEventNotification).await;
        }
    }

    /// An admin tool requests reassignments.
    pub async fn request_reassignment(&self, requested: BTreeMap<TopicPartition, Vec<BrokerId>>) {
        let payload = ReassignmentData {
            version: PAYLOAD_FORMAT_VERSION,
            partitions: requested
                .iter()
                .map(|(partition, replicas)| ReassignmentEntry {
                    topic: partition.topic.clone(),
                    partition: partition.partition,
                    replicas: replicas.iter().map(|b| b.value()).collect(),
                })
                .collect(),
        };
        let fire;
        {
            let mut store = self.state.write().await;
            store.write(
                paths::REASSIGN_PARTITIONS,
                encode(paths::REASSIGN_PARTITIONS, &payload).unwrap(),
            );
            fire = store.watches.reassignment;
        }
        if fire {
            self.fire(ControllerEvent::PartitionReassignment).await;
        }
    }

    /// An admin tool requests preferred-replica elections.
    pub async fn request_preferred_election(&self, partitions: &[TopicPartition]) {
        let payload = PreferredElectionData {
            version: PAYLOAD_FORMAT_VERSION,
            partitions: partitions.iter().map(PartitionEntry::from_partition).collect(),
        };
        let fire;
        {
            let mut store = self.state.write().await;
            store.write(
                paths::PREFERRED_REPLICA_ELECTION,
                encode(paths::PREFERRED_REPLICA_ELECTION, &payload).unwrap(),
            );
            fire = store.watches.preferred_election;
        }
        if fire {
            self.fire(ControllerEvent::PreferredReplicaLeaderElection).await;
        }
    }

    /// An admin tool marks a topic for deletion.
    pub async fn mark_topic_for_deletion(&self, topic: &str) {
        let path = paths::delete_topic(topic);
        let fire;
        {
            let mut store = self.state.write().await;
            store.write(&path, String::new());
            fire = store.watches.topic_deletion;
        }
        if fire {
            self.fire(ControllerEvent::TopicDeletion).await;
        }
    }

    pub async fn set_topic_deletion_enabled(&self, enabled: bool) {
        let mut store = self.state.write().await;
        store.write(paths::TOPIC_DELETION_FLAG, enabled.to_string());
    }

    pub async fn set_unclean_leader_election(&self, topic: &str, enabled: bool) {
        let path = paths::topic_config(topic);
        let payload = TopicConfigData {
            unclean_leader_election_enable: Some(enabled),
        };
        let mut store = self.state.write().await;
        store.write(&path, encode(&path, &payload).unwrap());
    }

    /// The controller's session expires: its ephemeral node vanishes and the
    /// client must run a new election.
    pub async fn expire_session(&self) {
        {
            let mut store = self.state.write().await;
            store.nodes.remove(paths::CONTROLLER);
        }
        self.fire(ControllerEvent::Reelect).await;
    }

    /// Another controller won an election and bumped the epoch node, but its
    /// watch deliveries have not arrived yet. Every write fenced on the old
    /// epoch version now fails.
    pub async fn advance_controller_epoch(&self) {
        let mut store = self.state.write().await;
        let (epoch, _) = store.epoch().unwrap_or((0, 0));
        store.write(paths::CONTROLLER_EPOCH, (epoch + 1).to_string());
    }

    // ========================================================================
    // Test Inspection
    // ========================================================================

    pub async fn has_controller(&self) -> bool {
        self.state.read().await.nodes.contains_key(paths::CONTROLLER)
    }

    pub async fn deletion_markers(&self) -> BTreeSet<String> {
        let store = self.state.read().await;
        store.children_of(paths::DELETE_TOPICS).into_iter().collect()
    }
}

#[async_trait]
impl CoordinationClient for InMemoryCoordination {
    async fn attach_event_sink(&self, sink: EventSender) {
        *self.sink.write().await = Some(sink);
    }

    // ---- election / epoch --------------------------------------------------

    async fn active_controller_id(&self) -> CoordinationResult<Option<BrokerId>> {
        let store = self.state.read().await;
        Ok(store
            .decode::<ControllerRegistration>(paths::CONTROLLER)?
            .map(|registration| BrokerId(registration.brokerid)))
    }

    async fn register_controller(
        &self,
        broker_id: BrokerId,
    ) -> CoordinationResult<ControllerEpochRegistration> {
        let fire;
        let registration;
        {
            let mut store = self.state.write().await;
            if store.nodes.contains_key(paths::CONTROLLER) {
                return Err(CoordinationError::NodeExists {
                    path: paths::CONTROLLER.to_string(),
                });
            }
            let (epoch, _) = store.epoch().unwrap_or((0, 0));
            let new_epoch = epoch + 1;
            let epoch_version = store.write(paths::CONTROLLER_EPOCH, new_epoch.to_string());

            let payload =
                ControllerRegistration::new(broker_id, Utc::now().timestamp_millis());
            store.write(paths::CONTROLLER, encode(paths::CONTROLLER, &payload)?);

            registration = ControllerEpochRegistration {
                epoch: new_epoch,
                epoch_version,
            };
            fire = store.watches.controller;
        }
        if fire {
            self.fire(ControllerEvent::ControllerChange).await;
        }
        Ok(registration)
    }

    async fn delete_controller(&self, expected_epoch_version: i32) -> CoordinationResult<()> {
        let fire;
        {
            let mut store = self.state.write().await;
            store.check_epoch(expected_epoch_version)?;
            if store.nodes.remove(paths::CONTROLLER).is_none() {
                return Err(CoordinationError::NodeMissing {
                    path: paths::CONTROLLER.to_string(),
                });
            }
            fire = store.watches.controller;
        }
        if fire {
            self.fire(ControllerEvent::Reelect).await;
        }
        Ok(())
    }

    async fn controller_epoch(&self) -> CoordinationResult<Option<(i32, i32)>> {
        Ok(self.state.read().await.epoch())
    }

    // ---- reads -------------------------------------------------------------

    async fn live_brokers(&self) -> CoordinationResult<Vec<Broker>> {
        let store = self.state.read().await;
        let mut brokers = Vec::new();
        for child in store.children_of(paths::BROKER_IDS) {
            let Ok(id) = child.parse::<i32>() else { continue };
            if let Some(registration) =
                store.decode::<BrokerRegistration>(&paths::broker(id))?
            {
                brokers.push(Broker::new(BrokerId(id), registration.host, registration.port));
            }
        }
        Ok(brokers)
    }

    async fn broker(&self, broker_id: BrokerId) -> CoordinationResult<Option<Broker>> {
        let store = self.state.read().await;
        Ok(store
            .decode::<BrokerRegistration>(&paths::broker(broker_id.value()))?
            .map(|registration| Broker::new(broker_id, registration.host, registration.port)))
    }

    async fn all_topics(&self) -> CoordinationResult<BTreeSet<String>> {
        let store = self.state.read().await;
        Ok(store.children_of(paths::TOPICS).into_iter().collect())
    }

    async fn replica_assignment(
        &self,
        topic: &str,
    ) -> CoordinationResult<BTreeMap<TopicPartition, Vec<BrokerId>>> {
        let store = self.state.read().await;
        let path = paths::topic(topic);
        let Some(payload) = store.decode::<TopicAssignment>(&path)? else {
            return Ok(BTreeMap::new());
        };
        let assignment = payload.to_assignment().ok_or(CoordinationError::Payload {
            path,
            reason: "non-numeric partition key".to_string(),
        })?;
        Ok(assignment
            .into_iter()
            .map(|(partition, replicas)| (TopicPartition::new(topic, partition), replicas))
            .collect())
    }

    async fn leader_and_isr(
        &self,
        partition: &TopicPartition,
    ) -> CoordinationResult<Option<LeaderIsrAndControllerEpoch>> {
        let store = self.state.read().await;
        let path = paths::partition_state(partition);
        let Some(payload) = store.decode::<PartitionStateData>(&path)? else {
            return Ok(None);
        };
        let version = store.nodes.get(&path).map(|node| node.version).unwrap_or(0);
        Ok(Some(LeaderIsrAndControllerEpoch::new(
            payload.to_leader_and_isr(version),
            payload.controller_epoch,
        )))
    }

    async fn topics_marked_for_deletion(&self) -> CoordinationResult<BTreeSet<String>> {
        let store = self.state.read().await;
        Ok(store.children_of(paths::DELETE_TOPICS).into_iter().collect())
    }

    async fn partitions_being_reassigned(
        &self,
    ) -> CoordinationResult<BTreeMap<TopicPartition, Vec<BrokerId>>> {
        let store = self.state.read().await;
        let Some(payload) = store.decode::<ReassignmentData>(paths::REASSIGN_PARTITIONS)? else {
            return Ok(BTreeMap::new());
        };
        Ok(payload
            .partitions
            .into_iter()
            .map(|entry| {
                (
                    TopicPartition::new(entry.topic, entry.partition),
                    entry.replicas.into_iter().map(BrokerId).collect(),
                )
            })
            .collect())
    }

    async fn partitions_for_preferred_election(
        &self,
    ) -> CoordinationResult<BTreeSet<TopicPartition>> {
        let store = self.state.read().await;
        let Some(payload) =
            store.decode::<PreferredElectionData>(paths::PREFERRED_REPLICA_ELECTION)?
        else {
            return Ok(BTreeSet::new());
        };
        Ok(payload
            .partitions
            .iter()
            .map(PartitionEntry::to_partition)
            .collect())
    }

    async fn topic_deletion_enabled(&self) -> CoordinationResult<bool> {
        let store = self.state.read().await;
        Ok(store
            .nodes
            .get(paths::TOPIC_DELETION_FLAG)
            .map(|node| node.data == "true")
            .unwrap_or(true))
    }

    async fn unclean_leader_election_enabled(
        &self,
        topic: &str,
    ) -> CoordinationResult<Option<bool>> {
        let store = self.state.read().await;
        Ok(store
            .decode::<TopicConfigData>(&paths::topic_config(topic))?
            .and_then(|config| config.unclean_leader_election_enable))
    }

    // ---- epoch-fenced writes -----------------------------------------------

    async fn create_leader_and_isr(
        &self,
        partition: &TopicPartition,
        leader_and_isr: &LeaderAndIsr,
        controller_epoch: i32,
        expected_epoch_version: i32,
    ) -> CoordinationResult<()> {
        let path = paths::partition_state(partition);
        let fire;
        {
            let mut store = self.state.write().await;
            store.check_epoch(expected_epoch_version)?;
            if store.nodes.contains_key(&path) {
                return Err(CoordinationError::NodeExists { path });
            }
            let payload = PartitionStateData::new(leader_and_isr, controller_epoch);
            store.write(&path, encode(&path, &payload)?);
            fire = store.watches.isr_change.contains(partition);
        }
        if fire {
            self.fire(ControllerEvent::PartitionReassignmentIsrChange(
                partition.clone(),
            ))
            .await;
        }
        Ok(())
    }

    async fn update_leader_and_isr(
        &self,
        partition: &TopicPartition,
        leader_and_isr: &LeaderAndIsr,
        controller_epoch: i32,
        expected_epoch_version: i32,
    ) -> CoordinationResult<LeaderAndIsr> {
        let path = paths::partition_state(partition);
        let fire;
        let written;
        {
            let mut store = self.state.write().await;
            store.check_epoch(expected_epoch_version)?;
            let Some(node) = store.nodes.get(&path) else {
                return Err(CoordinationError::NodeMissing { path });
            };
            let stored: PartitionStateData =
                serde_json::from_str(&node.data).map_err(|e| CoordinationError::Payload {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            if stored.controller_epoch > controller_epoch {
                return Err(CoordinationError::ControllerMoved(format!(
                    "partition state of {partition} carries controller epoch {}, ours is {}",
                    stored.controller_epoch, controller_epoch
                )));
            }
            if node.version != leader_and_isr.version {
                return Err(CoordinationError::VersionConflict { path });
            }
            let payload = PartitionStateData::new(leader_and_isr, controller_epoch);
            let version = store.write(&path, encode(&path, &payload)?);
            written = leader_and_isr.clone().with_version(version);
            fire = store.watches.isr_change.contains(partition);
        }
        if fire {
            self.fire(ControllerEvent::PartitionReassignmentIsrChange(
                partition.clone(),
            ))
            .await;
        }
        Ok(written)
    }

    async fn set_replica_assignment(
        &self,
        topic: &str,
        assignment: &BTreeMap<i32, Vec<BrokerId>>,
        expected_epoch_version: i32,
    ) -> CoordinationResult<()> {
        let path = paths::topic(topic);
        let fire;
        {
            let mut store = self.state.write().await;
            store.check_epoch(expected_epoch_version)?;
            let payload = TopicAssignment::from_assignment(assignment);
            store.write(&path, encode(&path, &payload)?);
            fire = store.watches.partition_modifications.contains(topic);
        }
        if fire {
            self.fire(ControllerEvent::PartitionModifications(topic.to_string()))
                .await;
        }
        Ok(())
    }

    async fn remove_partition_from_reassignment(
        &self,
        partition: &TopicPartition,
        expected_epoch_version: i32,
    ) -> CoordinationResult<()> {
        let fire;
        {
            let mut store = self.state.write().await;
            store.check_epoch(expected_epoch_version)?;
            let Some(mut payload) =
                store.decode::<ReassignmentData>(paths::REASSIGN_PARTITIONS)?
            else {
                return Ok(());
            };
            payload.partitions.retain(|entry| {
                entry.topic != partition.topic || entry.partition != partition.partition
            });
            if payload.partitions.is_empty() {
                store.nodes.remove(paths::REASSIGN_PARTITIONS);
            } else {
                store.write(
                    paths::REASSIGN_PARTITIONS,
                    encode(paths::REASSIGN_PARTITIONS, &payload)?,
                );
            }
            fire = store.watches.reassignment;
        }
        if fire {
            self.fire(ControllerEvent::PartitionReassignment).await;
        }
        Ok(())
    }

    async fn clear_preferred_replica_election(
        &self,
        expected_epoch_version: i32,
    ) -> CoordinationResult<()> {
        let mut store = self.state.write().await;
        store.check_epoch(expected_epoch_version)?;
        store.nodes.remove(paths::PREFERRED_REPLICA_ELECTION);
        Ok(())
    }

    async fn delete_topic(&self, topic: &str, expected_epoch_version: i32) -> CoordinationResult<()> {
        let fire;
        {
            let mut store = self.state.write().await;
            store.check_epoch(expected_epoch_version)?;
            let topic_path = paths::topic(topic);
            let subtree = format!("{topic_path}/");
            store
                .nodes
                .retain(|path, _| path != &topic_path && !path.starts_with(&subtree));
            fire = store.watches.topic_change;
        }
        if fire {
            self.fire(ControllerEvent::TopicChange).await;
        }
        Ok(())
    }

    async fn delete_topic_deletion_marker(
        &self,
        topic: &str,
        expected_epoch_version: i32,
    ) -> CoordinationResult<()> {
        let fire;
        {
            let mut store = self.state.write().await;
            store.check_epoch(expected_epoch_version)?;
            fire = store.nodes.remove(&paths::delete_topic(topic)).is_some()
                && store.watches.topic_deletion;
        }
        if fire {
            self.fire(ControllerEvent::TopicDeletion).await;
        }
        Ok(())
    }

    // ---- notifications -----------------------------------------------------

    async fn drain_isr_change_notifications(&self) -> CoordinationResult<Vec<TopicPartition>> {
        let mut store = self.state.write().await;
        let mut partitions = Vec::new();
        for child in store.children_of(paths::ISR_CHANGE_NOTIFICATION) {
            let path = format!("{}/{child}", paths::ISR_CHANGE_NOTIFICATION);
            if let Some(payload) = store.decode::<IsrChangeNotificationData>(&path)? {
                partitions.extend(payload.partitions.iter().map(PartitionEntry::to_partition));
            }
            store.nodes.remove(&path);
        }
        Ok(partitions)
    }

    async fn drain_log_dir_event_notifications(&self) -> CoordinationResult<Vec<LogDirEvent>> {
        let mut store = self.state.write().await;
        let mut events = Vec::new();
        for child in store.children_of(paths::LOG_DIR_EVENT_NOTIFICATION) {
            let path = format!("{}/{child}", paths::LOG_DIR_EVENT_NOTIFICATION);
            if let Some(payload) = store.decode::<LogDirEventData>(&path)? {
                events.push(LogDirEvent {
                    broker_id: BrokerId(payload.broker),
                    partitions: payload
                        .partitions
                        .iter()
                        .map(PartitionEntry::to_partition)
                        .collect(),
                });
            }
            store.nodes.remove(&path);
        }
        Ok(events)
    }

    // ---- watches -----------------------------------------------------------

    async fn register_controller_change_watch(&self) -> CoordinationResult<()> {
        self.state.write().await.watches.controller = true;
        Ok(())
    }

    async fn register_broker_change_watch(&self) -> CoordinationResult<()> {
        self.state.write().await.watches.broker_change = true;
        Ok(())
    }

    async fn register_broker_modification_watch(
        &self,
        broker_id: BrokerId,
    ) -> CoordinationResult<()> {
        self.state
            .write()
            .await
            .watches
            .broker_modifications
            .insert(broker_id);
        Ok(())
    }

    async fn unregister_broker_modification_watch(&self, broker_id: BrokerId) {
        self.state
            .write()
            .await
            .watches
            .broker_modifications
            .remove(&broker_id);
    }

    async fn register_topic_change_watch(&self) -> CoordinationResult<()> {
        self.state.write().await.watches.topic_change = true;
        Ok(())
    }

    async fn register_topic_deletion_watch(&self) -> CoordinationResult<()> {
        self.state.write().await.watches.topic_deletion = true;
        Ok(())
    }

    async fn register_partition_modification_watch(&self, topic: &str) -> CoordinationResult<()> {
        self.state
            .write()
            .await
            .watches
            .partition_modifications
            .insert(topic.to_string());
        Ok(())
    }

    async fn unregister_partition_modification_watch(&self, topic: &str) {
        self.state
            .write()
            .await
            .watches
            .partition_modifications
            .remove(topic);
    }

    async fn register_partition_reassignment_watch(&self) -> CoordinationResult<()> {
        self.state.write().await.watches.reassignment = true;
        Ok(())
    }

    async fn register_isr_change_watch(
        &self,
        partition: &TopicPartition,
    ) -> CoordinationResult<()> {
        self.state
            .write()
            .await
            .watches
            .isr_change
            .insert(partition.clone());
        Ok(())
    }

    async fn unregister_isr_change_watch(&self, partition: &TopicPartition) {
        self.state.write().await.watches.isr_change.remove(partition);
    }

    async fn register_preferred_election_watch(&self) -> CoordinationResult<()> {
        self.state.write().await.watches.preferred_election = true;
        Ok(())
    }

    async fn register_isr_change_notification_watch(&self) -> CoordinationResult<()> {
        self.state.write().await.watches.isr_notifications = true;
        Ok(())
    }

    async fn register_log_dir_event_notification_watch(&self) -> CoordinationResult<()> {
        self.state.write().await.watches.log_dir_notifications = true;
        Ok(())
    }

    async fn unregister_all_watches(&self) {
        self.state.write().await.watches = Watches::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp() -> TopicPartition {
        TopicPartition::new("events", 0)
    }

    async fn store_with_partition() -> (InMemoryCoordination, ControllerEpochRegistration) {
        let store = InMemoryCoordination::new();
        let registration = store.register_controller(BrokerId(0)).await.unwrap();
        store
            .create_leader_and_isr(
                &tp(),
                &LeaderAndIsr::new(BrokerId(1), vec![BrokerId(1), BrokerId(2)]),
                registration.epoch,
                registration.epoch_version,
            )
            .await
            .unwrap();
        (store, registration)
    }

    #[tokio::test]
    async fn test_election_is_exclusive_and_bumps_the_epoch() {
        let store = InMemoryCoordination::new();
        let first = store.register_controller(BrokerId(0)).await.unwrap();
        assert_eq!(first.epoch, 1);
        assert_eq!(
            store.active_controller_id().await.unwrap(),
            Some(BrokerId(0))
        );

        let second = store.register_controller(BrokerId(1)).await;
        assert!(matches!(second, Err(CoordinationError::NodeExists { .. })));
    }

    #[tokio::test]
    async fn test_update_leader_and_isr_is_a_cas() {
        let (store, registration) = store_with_partition().await;
        let stored = store.leader_and_isr(&tp()).await.unwrap().unwrap();

        let bumped = stored.leader_and_isr.with_bumped_epoch();
        let written = store
            .update_leader_and_isr(&tp(), &bumped, registration.epoch, registration.epoch_version)
            .await
            .unwrap();
        assert_eq!(written.version, stored.leader_and_isr.version + 1);

        // Re-using the stale version loses the race.
        let stale = store
            .update_leader_and_isr(&tp(), &bumped, registration.epoch, registration.epoch_version)
            .await;
        assert!(matches!(
            stale,
            Err(CoordinationError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_writes_are_fenced_on_the_epoch_version() {
        let (store, registration) = store_with_partition().await;
        store.advance_controller_epoch().await;

        let stored = store.leader_and_isr(&tp()).await.unwrap().unwrap();
        let result = store
            .update_leader_and_isr(
                &tp(),
                &stored.leader_and_isr.with_bumped_epoch(),
                registration.epoch,
                registration.epoch_version,
            )
            .await;
        assert!(matches!(
            result,
            Err(CoordinationError::ControllerMoved(_))
        ));
    }

    #[tokio::test]
    async fn test_notifications_drain_and_delete() {
        let store = InMemoryCoordination::new();
        store.write_isr_change_notification(&[tp()]).await;
        store
            .write_isr_change_notification(&[TopicPartition::new("events", 1)])
            .await;

        let drained = store.drain_isr_change_notifications().await.unwrap();
        assert_eq!(drained.len(), 2);
        assert!(store.drain_isr_change_notifications().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_children_scan_excludes_grandchildren() {
        let (store, _) = store_with_partition().await;
        let mut assignment = BTreeMap::new();
        assignment.insert(0, vec![BrokerId(1)]);
        store.create_topic("events", assignment).await;

        // The partition state node lives under the topic but is not a topic.
        let topics = store.all_topics().await.unwrap();
        assert_eq!(topics, BTreeSet::from(["events".to_string()]));
    }
}
