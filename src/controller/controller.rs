//! The controller orchestrator.
//!
//! Owns the context, both state machines, the deletion manager, the request
//! batch, and the per-broker channels, and implements every event handler:
//! election and failover, broker/topic/partition change reconciliation, the
//! reassignment protocol, controlled shutdown, preferred-leader balancing,
//! and the epoch-fencing reaction that ends a superseded reign.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::controller::batch::ControllerBrokerRequestBatch;
use crate::controller::channel_manager::{BrokerRequestSender, ControllerChannelManager};
use crate::controller::config::ControllerConfig;
use crate::controller::context::{ControllerContext, ReassignmentContext};
use crate::controller::deletion::TopicDeletionManager;
use crate::controller::election::LeaderElectionStrategy;
use crate::controller::error::{ControllerError, ControllerResult};
use crate::controller::event_manager::{ControllerEventManager, EventProcessor, EventSender};
use crate::controller::events::ControllerEvent;
use crate::controller::isr::update_leader_epoch;
use crate::controller::metrics;
use crate::controller::partition_state::{PartitionState, PartitionStateMachine};
use crate::controller::replica_state::{ReplicaState, ReplicaStateMachine};
use crate::controller::requests::LeaderAndIsrResponse;
use crate::controller::scheduler::Scheduler;
use crate::controller::EventContext;
use crate::coordination::{CoordinationClient, CoordinationError};
use crate::types::{BrokerId, PartitionReplica, TopicPartition};

const AUTO_REBALANCE_TASK: &str = "auto-leader-rebalance";

/// Public handle to a running controller.
///
/// Dropping the handle aborts the event loop; prefer [`shutdown`] for a
/// clean stop that resigns first.
///
/// [`shutdown`]: ControllerHandle::shutdown
pub struct ControllerHandle {
    events: EventSender,
    manager: ControllerEventManager,
}

impl ControllerHandle {
    /// The enqueue capability, for wiring additional event producers.
    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    /// Ask the controller to move leadership off a broker that wants to shut
    /// down. Returns the partitions the broker still leads afterwards
    /// (those with replication factor 1).
    pub async fn controlled_shutdown(
        &self,
        broker_id: BrokerId,
    ) -> ControllerResult<BTreeSet<TopicPartition>> {
        let (reply, result) = oneshot::channel();
        if !self
            .events
            .put(ControllerEvent::ControlledShutdown { broker_id, reply })
        {
            return Err(ControllerError::IllegalState(
                "controller has shut down".to_string(),
            ));
        }
        result.await.map_err(|_| {
            ControllerError::IllegalState("controller dropped the shutdown reply".to_string())
        })?
    }

    /// Fence the event queue: resolves once every event enqueued before this
    /// call has been processed.
    pub async fn await_idle(&self) {
        let (latch, released) = oneshot::channel();
        if self.events.put(ControllerEvent::AwaitLatch(latch)) {
            let _ = released.await;
        }
    }

    /// Resign (if active) and stop the event loop.
    pub async fn shutdown(self) {
        self.manager.shutdown().await;
    }
}

/// The controller core. Constructed and driven exclusively by the event
/// loop; external code interacts through [`ControllerHandle`].
pub struct Controller {
    broker_id: BrokerId,
    config: ControllerConfig,
    coordination: Arc<dyn CoordinationClient>,
    events: EventSender,

    ctx: ControllerContext,
    channel: ControllerChannelManager,
    batch: ControllerBrokerRequestBatch,
    partition_machine: PartitionStateMachine,
    replica_machine: ReplicaStateMachine,
    deletion: TopicDeletionManager,
    scheduler: Scheduler,

    /// Holder of the controller node, as last observed. `NO_LEADER` while
    /// unknown or vacant.
    active_controller_id: BrokerId,
}

impl Controller {
    /// Validate the config, spawn the event loop, and enqueue the initial
    /// startup event. Must be called from within a tokio runtime.
    pub fn start(
        broker_id: BrokerId,
        config: ControllerConfig,
        coordination: Arc<dyn CoordinationClient>,
        request_sender: Arc<dyn BrokerRequestSender>,
    ) -> crate::error::Result<ControllerHandle> {
        config
            .validate()
            .map_err(|errors| crate::error::Error::Config(errors.join(", ")))?;

        let manager = ControllerEventManager::start(move |events| Controller {
            broker_id,
            channel: ControllerChannelManager::new(request_sender, events.clone()),
            batch: ControllerBrokerRequestBatch::new(broker_id),
            deletion: TopicDeletionManager::new(true),
            config,
            coordination,
            events,
            ctx: ControllerContext::new(),
            partition_machine: PartitionStateMachine::new(),
            replica_machine: ReplicaStateMachine::new(),
            scheduler: Scheduler::new(),
            active_controller_id: BrokerId::NO_LEADER,
        });

        Ok(ControllerHandle {
            events: manager.sender(),
            manager,
        })
    }

    fn is_active(&self) -> bool {
        self.active_controller_id == self.broker_id
    }

    /// Split the controller into the per-event view the state machines and
    /// the deletion manager operate on.
    fn split(
        &mut self,
    ) -> (
        EventContext<'_>,
        &mut PartitionStateMachine,
        &mut ReplicaStateMachine,
        &mut TopicDeletionManager,
    ) {
        (
            EventContext {
                ctx: &mut self.ctx,
                coordination: self.coordination.as_ref(),
                batch: &mut self.batch,
                channel: &mut self.channel,
                config: &self.config,
            },
            &mut self.partition_machine,
            &mut self.replica_machine,
            &mut self.deletion,
        )
    }

    // ========================================================================
    // Election, Failover, Resignation
    // ========================================================================

    async fn process_startup(&mut self) -> ControllerResult<()> {
        self.coordination.attach_event_sink(self.events.clone()).await;
        self.coordination.register_controller_change_watch().await?;
        self.elect().await
    }

    async fn elect(&mut self) -> ControllerResult<()> {
        self.active_controller_id = self
            .coordination
            .active_controller_id()
            .await?
            .unwrap_or(BrokerId::NO_LEADER);
        if self.active_controller_id.is_valid() {
            debug!(
                active_controller = %self.active_controller_id,
                "A controller is already elected"
            );
            return Ok(());
        }

        match self.coordination.register_controller(self.broker_id).await {
            Ok(registration) => {
                self.ctx.epoch = registration.epoch;
                self.ctx.epoch_version = registration.epoch_version;
                self.active_controller_id = self.broker_id;
                info!(
                    broker_id = %self.broker_id,
                    epoch = registration.epoch,
                    "Elected as controller"
                );
                if let Err(e) = self.on_controller_failover().await {
                    if e.is_fatal() {
                        warn!(error = %e, "Lost controllership during failover");
                        self.maybe_resign().await?;
                    } else {
                        error!(error = %e, "Controller failover failed, forcing re-election");
                        self.trigger_controller_move().await;
                    }
                }
                Ok(())
            }
            Err(
                CoordinationError::NodeExists { .. } | CoordinationError::ControllerMoved(_),
            ) => {
                // Lost the race to another broker.
                self.maybe_resign().await
            }
            Err(e) => {
                error!(error = %e, "Controller election failed");
                self.trigger_controller_move().await;
                Ok(())
            }
        }
    }

    /// Re-read the controller node and resign if we no longer hold it.
    async fn maybe_resign(&mut self) -> ControllerResult<()> {
        let was_active = self.is_active();
        self.active_controller_id = self
            .coordination
            .active_controller_id()
            .await?
            .unwrap_or(BrokerId::NO_LEADER);
        if was_active && !self.is_active() {
            info!(
                new_controller = %self.active_controller_id,
                "Controllership moved to another broker"
            );
            self.on_controller_resignation().await;
        }
        Ok(())
    }

    async fn process_reelect(&mut self) -> ControllerResult<()> {
        self.maybe_resign().await?;
        self.elect().await
    }

    /// Bootstrap a new reign. Watches are registered before state is read so
    /// nothing changes unobserved between read and subscribe.
    async fn on_controller_failover(&mut self) -> ControllerResult<()> {
        info!(epoch = self.ctx.epoch, "Controller failover starting");

        self.coordination.register_broker_change_watch().await?;
        self.coordination.register_topic_change_watch().await?;
        self.coordination.register_topic_deletion_watch().await?;
        self.coordination
            .register_partition_reassignment_watch()
            .await?;
        self.coordination.register_preferred_election_watch().await?;
        self.coordination
            .register_isr_change_notification_watch()
            .await?;
        self.coordination
            .register_log_dir_event_notification_watch()
            .await?;

        self.initialize_controller_context().await?;
        let pending_deletion = self.coordination.topics_marked_for_deletion().await?;
        let pending_reassignments = self.coordination.partitions_being_reassigned().await?;
        let pending_elections = self.coordination.partitions_for_preferred_election().await?;

        // Brokers learn about the new controller (and its epoch) before any
        // state machine starts issuing leadership changes.
        let all_brokers: Vec<BrokerId> = self
            .ctx
            .live_or_shutting_down_broker_ids()
            .into_iter()
            .collect();
        let all_partitions: Vec<TopicPartition> = self.ctx.all_partitions().into_iter().collect();
        self.send_update_metadata(&all_brokers, &all_partitions)?;

        let (mut ecx, partition_machine, replica_machine, _) = self.split();
        replica_machine.startup(&mut ecx).await?;
        partition_machine.startup(&mut ecx).await?;

        for topic in self.ctx.all_topics.clone() {
            self.coordination
                .register_partition_modification_watch(&topic)
                .await?;
        }

        for (partition, new_replicas) in pending_reassignments {
            self.initiate_reassign_replicas(partition, new_replicas)
                .await?;
        }
        self.on_preferred_replica_election(
            pending_elections.into_iter().collect(),
            false,
        )
        .await?;

        let deletion_enabled = self.coordination.topic_deletion_enabled().await?;
        self.deletion = TopicDeletionManager::new(deletion_enabled);
        let mut ineligible = BTreeSet::new();
        for topic in &pending_deletion {
            let has_offline_replica = self
                .ctx
                .replicas_for_topic(topic)
                .iter()
                .any(|replica| !self.ctx.is_replica_online(replica.replica, &replica.partition));
            let reassigning = self
                .ctx
                .partitions_being_reassigned
                .keys()
                .any(|partition| partition.topic == *topic);
            if has_offline_replica || reassigning {
                ineligible.insert(topic.clone());
            }
        }
        let (mut ecx, partition_machine, replica_machine, deletion) = self.split();
        deletion.init(&mut ecx, pending_deletion, ineligible).await?;
        deletion
            .resume_deletions(&mut ecx, partition_machine, replica_machine)
            .await?;

        if self.config.auto_leader_rebalance_enable {
            let events = self.events.clone();
            let interval = self.config.leader_imbalance_check_interval;
            self.scheduler.schedule(AUTO_REBALANCE_TASK, async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick fires immediately; the first check should
                // wait one full interval.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if !events.put(ControllerEvent::AutoPreferredReplicaLeaderElection) {
                        break;
                    }
                }
            });
        }

        metrics::ACTIVE_CONTROLLER_COUNT.set(1);
        info!(epoch = self.ctx.epoch, "Controller failover complete");
        Ok(())
    }

    async fn initialize_controller_context(&mut self) -> ControllerResult<()> {
        let brokers = self.coordination.live_brokers().await?;
        for broker in &brokers {
            self.coordination
                .register_broker_modification_watch(broker.id)
                .await?;
            self.ctx.brokers.insert(broker.id, broker.clone());
        }
        self.channel.startup(&brokers);

        self.ctx.all_topics = self.coordination.all_topics().await?;
        for topic in self.ctx.all_topics.clone() {
            let assignment = self.coordination.replica_assignment(&topic).await?;
            for (partition, replicas) in assignment {
                self.ctx.set_partition_replica_assignment(&partition, replicas);
            }
        }
        for partition in self.ctx.all_partitions() {
            if let Some(leadership) = self.coordination.leader_and_isr(&partition).await? {
                self.ctx.partition_leadership.insert(partition, leadership);
            }
        }

        info!(
            brokers = self.ctx.brokers.len(),
            topics = self.ctx.all_topics.len(),
            partitions = self.ctx.partition_count(),
            "Controller context initialized"
        );
        Ok(())
    }

    /// Tear down the reign, in reverse order of the failover bootstrap.
    async fn on_controller_resignation(&mut self) {
        info!(epoch = self.ctx.epoch, "Controller resigning");
        self.coordination.unregister_all_watches().await;
        // The controller watch outlives the reign: without it this broker
        // could never stand in the next election.
        if let Err(e) = self.coordination.register_controller_change_watch().await {
            warn!(error = %e, "Failed to re-register the controller watch");
        }
        self.deletion.reset();
        self.scheduler.shutdown();
        for reassignment in self.ctx.partitions_being_reassigned.values_mut() {
            reassignment.isr_watch_registered = false;
        }
        self.replica_machine.shutdown();
        self.partition_machine.shutdown();
        self.channel.shutdown();
        self.ctx.reset();
        metrics::ACTIVE_CONTROLLER_COUNT.set(0);
    }

    /// Give up the controller node so a healthy broker can win the next
    /// election. Used after failures that leave this broker unfit to
    /// continue its reign.
    async fn trigger_controller_move(&mut self) {
        let epoch_version = self.ctx.epoch_version;
        if self.is_active() {
            self.on_controller_resignation().await;
        }
        self.active_controller_id = BrokerId::NO_LEADER;
        if let Err(e) = self.coordination.delete_controller(epoch_version).await {
            warn!(error = %e, "Failed to delete the controller node, a successor already moved on");
        }
    }

    /// Reaction to corrupted bookkeeping or epoch fencing: drop whatever the
    /// current batch staged and end the reign.
    async fn handle_illegal_state(&mut self) {
        self.batch.clear();
        self.trigger_controller_move().await;
    }

    // ========================================================================
    // Broker Changes
    // ========================================================================

    async fn process_broker_change(&mut self) -> ControllerResult<()> {
        let registered = self.coordination.live_brokers().await?;
        let current_ids: BTreeSet<BrokerId> = registered.iter().map(|broker| broker.id).collect();
        let known_ids = self.ctx.live_or_shutting_down_broker_ids();

        let new_ids: BTreeSet<BrokerId> = current_ids.difference(&known_ids).copied().collect();
        let dead_ids: BTreeSet<BrokerId> = known_ids.difference(&current_ids).copied().collect();

        for broker in registered {
            if new_ids.contains(&broker.id) {
                self.ctx.brokers.insert(broker.id, broker);
            }
        }
        for broker_id in &dead_ids {
            self.ctx.brokers.remove(broker_id);
        }
        info!(
            new = ?new_ids.iter().map(|b| b.value()).collect::<Vec<_>>(),
            dead = ?dead_ids.iter().map(|b| b.value()).collect::<Vec<_>>(),
            live = self.ctx.brokers.len(),
            "Broker change"
        );

        if !new_ids.is_empty() {
            self.on_broker_startup(&new_ids).await?;
        }
        if !dead_ids.is_empty() {
            self.on_broker_failure(&dead_ids).await?;
        }
        Ok(())
    }

    async fn on_broker_startup(&mut self, new_ids: &BTreeSet<BrokerId>) -> ControllerResult<()> {
        for broker_id in new_ids {
            self.coordination
                .register_broker_modification_watch(*broker_id)
                .await?;
            if let Some(broker) = self.ctx.brokers.get(broker_id).cloned() {
                self.channel.add_broker(broker);
            }
        }

        // Everyone learns the new broker list; the newcomers get the full
        // partition snapshot.
        let all_brokers: Vec<BrokerId> = self
            .ctx
            .live_or_shutting_down_broker_ids()
            .into_iter()
            .collect();
        self.send_update_metadata(&all_brokers, &[])?;

        let replicas_on_new: Vec<PartitionReplica> =
            self.ctx.replicas_on_brokers(new_ids).into_iter().collect();
        let (mut ecx, partition_machine, replica_machine, _) = self.split();
        replica_machine
            .handle_state_changes(&mut ecx, &replicas_on_new, ReplicaState::OnlineReplica)
            .await?;
        partition_machine
            .trigger_online_partition_state_change(&mut ecx)
            .await?;

        let reassignments_to_resume: Vec<TopicPartition> = self
            .ctx
            .partitions_being_reassigned
            .iter()
            .filter(|(_, reassignment)| {
                reassignment
                    .new_replicas
                    .iter()
                    .any(|replica| new_ids.contains(replica))
            })
            .map(|(partition, _)| partition.clone())
            .collect();
        for partition in reassignments_to_resume {
            if let Err(e) = self.on_partition_reassignment(&partition).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(partition = %partition, error = %e, "Failed to resume reassignment");
            }
        }

        let topics_to_resume: Vec<String> = self
            .ctx
            .topics_to_be_deleted
            .iter()
            .filter(|topic| {
                self.ctx
                    .replicas_for_topic(topic)
                    .iter()
                    .any(|replica| new_ids.contains(&replica.replica))
            })
            .cloned()
            .collect();
        let (mut ecx, partition_machine, replica_machine, deletion) = self.split();
        deletion
            .resume_deletion_for_topics(&mut ecx, partition_machine, replica_machine, &topics_to_resume)
            .await
    }

    async fn on_broker_failure(&mut self, dead_ids: &BTreeSet<BrokerId>) -> ControllerResult<()> {
        for broker_id in dead_ids {
            self.coordination
                .unregister_broker_modification_watch(*broker_id)
                .await;
            self.channel.remove_broker(*broker_id);
            self.ctx.replicas_on_offline_dirs.remove(broker_id);
            self.ctx.shutting_down_broker_ids.remove(broker_id);
        }
        let replicas_on_dead = self.ctx.replicas_on_brokers(dead_ids);
        self.on_replicas_become_offline(replicas_on_dead).await
    }

    /// Shared flow for dead brokers, failed log dirs, and broker-reported
    /// offline replicas.
    async fn on_replicas_become_offline(
        &mut self,
        offline_replicas: BTreeSet<PartitionReplica>,
    ) -> ControllerResult<()> {
        if offline_replicas.is_empty() {
            return Ok(());
        }
        let offline_brokers: BTreeSet<BrokerId> = offline_replicas
            .iter()
            .map(|replica| replica.replica)
            .collect();

        let partitions_without_leader: Vec<TopicPartition> = self
            .ctx
            .partition_leadership
            .iter()
            .filter(|(partition, leadership)| {
                offline_replicas.iter().any(|replica| {
                    replica.partition == **partition
                        && replica.replica == leadership.leader_and_isr.leader
                }) && !self.ctx.topics_to_be_deleted.contains(&partition.topic)
            })
            .map(|(partition, _)| partition.clone())
            .collect();
        debug!(
            offline_replicas = offline_replicas.len(),
            brokers = ?offline_brokers.iter().map(|b| b.value()).collect::<Vec<_>>(),
            leaderless = partitions_without_leader.len(),
            "Replicas went offline"
        );

        let (not_deleting, deleting): (Vec<PartitionReplica>, Vec<PartitionReplica>) =
            offline_replicas
                .iter()
                .cloned()
                .partition(|replica| {
                    !self
                        .ctx
                        .topics_to_be_deleted
                        .contains(&replica.partition.topic)
                });

        let (mut ecx, partition_machine, replica_machine, deletion) = self.split();
        partition_machine
            .handle_state_changes(
                &mut ecx,
                &partitions_without_leader,
                PartitionState::Offline,
                None,
            )
            .await?;
        partition_machine
            .trigger_online_partition_state_change(&mut ecx)
            .await?;
        replica_machine
            .handle_state_changes(&mut ecx, &not_deleting, ReplicaState::OfflineReplica)
            .await?;
        deletion
            .fail_replica_deletions(&mut ecx, replica_machine, &deleting)
            .await?;

        // Brokers must see the offline replicas even where leadership did
        // not change.
        let affected: Vec<TopicPartition> = offline_replicas
            .iter()
            .map(|replica| replica.partition.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let all_brokers: Vec<BrokerId> = self
            .ctx
            .live_or_shutting_down_broker_ids()
            .into_iter()
            .collect();
        self.send_update_metadata(&all_brokers, &affected)
    }

    async fn process_broker_modification(&mut self, broker_id: BrokerId) -> ControllerResult<()> {
        let Some(updated) = self.coordination.broker(broker_id).await? else {
            return Ok(());
        };
        let changed = self
            .ctx
            .brokers
            .get(&broker_id)
            .map(|known| *known != updated)
            .unwrap_or(false);
        if !changed {
            return Ok(());
        }
        info!(broker_id = %broker_id, "Broker endpoints changed");
        self.ctx.brokers.insert(broker_id, updated);
        let all_brokers: Vec<BrokerId> = self
            .ctx
            .live_or_shutting_down_broker_ids()
            .into_iter()
            .collect();
        self.send_update_metadata(&all_brokers, &[])
    }

    // ========================================================================
    // Topic and Partition Changes
    // ========================================================================

    async fn process_topic_change(&mut self) -> ControllerResult<()> {
        let topics = self.coordination.all_topics().await?;
        let new_topics: Vec<String> = topics.difference(&self.ctx.all_topics).cloned().collect();
        let gone_topics: Vec<String> = self
            .ctx
            .all_topics
            .difference(&topics)
            // Topics mid-deletion are removed by the deletion manager.
            .filter(|topic| !self.ctx.topics_to_be_deleted.contains(*topic))
            .cloned()
            .collect();

        for topic in &gone_topics {
            info!(topic = %topic, "Topic disappeared, dropping it from the cache");
            self.ctx.remove_topic(topic);
        }
        self.ctx.all_topics = topics;

        let mut new_partitions = Vec::new();
        for topic in &new_topics {
            self.coordination
                .register_partition_modification_watch(topic)
                .await?;
            let assignment = self.coordination.replica_assignment(topic).await?;
            for (partition, replicas) in assignment {
                self.ctx.set_partition_replica_assignment(&partition, replicas);
                new_partitions.push(partition);
            }
        }
        if !new_topics.is_empty() {
            info!(topics = ?new_topics, partitions = new_partitions.len(), "New topics");
            self.on_new_partition_creation(new_partitions).await?;
        }
        Ok(())
    }

    async fn process_partition_modifications(&mut self, topic: String) -> ControllerResult<()> {
        let assignment = self.coordination.replica_assignment(&topic).await?;
        let new_entries: Vec<(TopicPartition, Vec<BrokerId>)> = assignment
            .into_iter()
            .filter(|(partition, _)| {
                self.ctx.partition_replica_assignment(partition).is_empty()
            })
            .collect();
        if new_entries.is_empty() {
            return Ok(());
        }
        if self.ctx.topics_to_be_deleted.contains(&topic) {
            error!(
                topic = %topic,
                "Ignoring partitions added to a topic queued for deletion"
            );
            return Ok(());
        }

        let mut new_partitions = Vec::new();
        for (partition, replicas) in new_entries {
            self.ctx.set_partition_replica_assignment(&partition, replicas);
            new_partitions.push(partition);
        }
        info!(topic = %topic, partitions = new_partitions.len(), "Partitions added");
        self.on_new_partition_creation(new_partitions).await
    }

    async fn on_new_partition_creation(
        &mut self,
        partitions: Vec<TopicPartition>,
    ) -> ControllerResult<()> {
        let replicas: Vec<PartitionReplica> = partitions
            .iter()
            .flat_map(|partition| {
                self.ctx
                    .partition_replica_assignment(partition)
                    .into_iter()
                    .map(|broker_id| PartitionReplica::new(partition.clone(), broker_id))
            })
            .collect();

        let (mut ecx, partition_machine, replica_machine, _) = self.split();
        partition_machine
            .handle_state_changes(&mut ecx, &partitions, PartitionState::New, None)
            .await?;
        replica_machine
            .handle_state_changes(&mut ecx, &replicas, ReplicaState::NewReplica)
            .await?;
        partition_machine
            .handle_state_changes(&mut ecx, &partitions, PartitionState::Online, None)
            .await?;
        replica_machine
            .handle_state_changes(&mut ecx, &replicas, ReplicaState::OnlineReplica)
            .await
    }

    // ========================================================================
    // Topic Deletion
    // ========================================================================

    async fn process_topic_deletion(&mut self) -> ControllerResult<()> {
        let marked = self.coordination.topics_marked_for_deletion().await?;
        let epoch_version = self.ctx.epoch_version;

        let mut existing = BTreeSet::new();
        for topic in marked {
            if self.ctx.all_topics.contains(&topic) {
                existing.insert(topic);
            } else {
                warn!(topic = %topic, "Deletion marker for unknown topic, removing it");
                self.coordination
                    .delete_topic_deletion_marker(&topic, epoch_version)
                    .await?;
            }
        }

        if !self.deletion.is_enabled() {
            for topic in existing {
                info!(topic = %topic, "Topic deletion is disabled, removing deletion marker");
                self.coordination
                    .delete_topic_deletion_marker(&topic, epoch_version)
                    .await?;
            }
            return Ok(());
        }

        let reassigning: Vec<String> = existing
            .iter()
            .filter(|topic| {
                self.ctx
                    .partitions_being_reassigned
                    .keys()
                    .any(|partition| partition.topic == **topic)
            })
            .cloned()
            .collect();

        let (mut ecx, partition_machine, replica_machine, deletion) = self.split();
        ecx.ctx.topics_to_be_deleted.extend(existing);
        deletion.mark_topics_ineligible(&mut ecx, &reassigning);
        deletion
            .resume_deletions(&mut ecx, partition_machine, replica_machine)
            .await
    }

    async fn process_topic_deletion_stop_replica_result(
        &mut self,
        replica: PartitionReplica,
        stop_error: Option<String>,
    ) -> ControllerResult<()> {
        // Reassignments also issue deleting StopReplica requests; only
        // queued topics belong to the deletion manager.
        if !self
            .ctx
            .topics_to_be_deleted
            .contains(&replica.partition.topic)
        {
            return Ok(());
        }
        let (mut ecx, partition_machine, replica_machine, deletion) = self.split();
        match stop_error {
            Some(reason) => {
                warn!(replica = %replica, reason, "Broker failed to delete replica");
                deletion
                    .fail_replica_deletions(&mut ecx, replica_machine, &[replica])
                    .await
            }
            None => {
                deletion
                    .complete_replica_deletions(
                        &mut ecx,
                        partition_machine,
                        replica_machine,
                        &[replica],
                    )
                    .await
            }
        }
    }

    // ========================================================================
    // Partition Reassignment
    // ========================================================================

    async fn process_partition_reassignment(&mut self) -> ControllerResult<()> {
        let requested = self.coordination.partitions_being_reassigned().await?;
        for (partition, new_replicas) in requested {
            if self.ctx.partitions_being_reassigned.contains_key(&partition) {
                continue;
            }
            if self.ctx.topics_to_be_deleted.contains(&partition.topic) {
                info!(
                    partition = %partition,
                    "Refusing reassignment for a topic queued for deletion"
                );
                let epoch_version = self.ctx.epoch_version;
                self.coordination
                    .remove_partition_from_reassignment(&partition, epoch_version)
                    .await?;
                continue;
            }
            self.initiate_reassign_replicas(partition, new_replicas)
                .await?;
        }
        Ok(())
    }

    async fn initiate_reassign_replicas(
        &mut self,
        partition: TopicPartition,
        new_replicas: Vec<BrokerId>,
    ) -> ControllerResult<()> {
        match self.try_initiate_reassignment(&partition, new_replicas).await {
            Ok(()) => Ok(()),
            // Epoch fencing rethrows before any cleanup.
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!(partition = %partition, error = %e, "Reassignment failed, clearing it");
                // Clear the admin path and the in-memory entry symmetrically
                // so a half-started reassignment cannot linger in one place.
                if let Err(cleanup) = self.clear_reassignment(&partition).await {
                    warn!(partition = %partition, error = %cleanup,
                        "Failed to clean up aborted reassignment");
                }
                Ok(())
            }
        }
    }

    async fn try_initiate_reassignment(
        &mut self,
        partition: &TopicPartition,
        new_replicas: Vec<BrokerId>,
    ) -> ControllerResult<()> {
        let current = self.ctx.partition_replica_assignment(partition);
        if current.is_empty() {
            return Err(ControllerError::StateChangeFailed {
                partition: partition.clone(),
                reason: "partition does not exist".to_string(),
            });
        }
        if current == new_replicas {
            info!(
                partition = %partition,
                "Requested replicas already assigned, clearing reassignment"
            );
            return self.clear_reassignment(partition).await;
        }

        info!(
            partition = %partition,
            from = ?current.iter().map(|b| b.value()).collect::<Vec<_>>(),
            to = ?new_replicas.iter().map(|b| b.value()).collect::<Vec<_>>(),
            "Starting partition reassignment"
        );
        self.coordination.register_isr_change_watch(partition).await?;
        self.ctx.partitions_being_reassigned.insert(
            partition.clone(),
            ReassignmentContext {
                new_replicas,
                isr_watch_registered: true,
            },
        );
        let topic = partition.topic.clone();
        let (mut ecx, _, _, deletion) = self.split();
        deletion.mark_topics_ineligible(&mut ecx, &[topic]);

        self.on_partition_reassignment(partition).await
    }

    /// One step of the reassignment protocol, re-entrant from any event.
    /// While the new replicas are not all in the ISR this runs the expand
    /// phase; once they are, the shrink-and-complete phase.
    async fn on_partition_reassignment(
        &mut self,
        partition: &TopicPartition,
    ) -> ControllerResult<()> {
        let Some(reassignment) = self.ctx.partitions_being_reassigned.get(partition).cloned()
        else {
            return Ok(());
        };
        let new_replicas = reassignment.new_replicas;

        if !self.are_replicas_in_isr(partition, &new_replicas).await? {
            info!(partition = %partition, "Reassignment waiting for new replicas to catch up");
            let current = self.ctx.partition_replica_assignment(partition);

            // Expanded assignment: new replicas first (the preferred leader
            // should land in the target set), surviving old ones after.
            let mut expanded = new_replicas.clone();
            for replica in &current {
                if !expanded.contains(replica) {
                    expanded.push(*replica);
                }
            }
            self.ctx
                .set_partition_replica_assignment(partition, expanded.clone());
            self.write_topic_assignment(&partition.topic).await?;

            // Fence the old replica set with a bumped leader epoch.
            self.update_leader_epoch_and_send_request(partition, &expanded, &expanded)
                .await?;

            // Start the truly new replicas fetching.
            let starting: Vec<PartitionReplica> = new_replicas
                .iter()
                .filter(|replica| !current.contains(*replica))
                .map(|replica| PartitionReplica::new(partition.clone(), *replica))
                .collect();
            let (mut ecx, _, replica_machine, _) = self.split();
            let starting: Vec<PartitionReplica> = starting
                .into_iter()
                .filter(|replica| {
                    replica_machine.state_of(replica) == ReplicaState::NonExistentReplica
                })
                .collect();
            replica_machine
                .handle_state_changes(&mut ecx, &starting, ReplicaState::NewReplica)
                .await?;
            return Ok(());
        }

        let expanded = self.ctx.partition_replica_assignment(partition);
        let old_replicas: Vec<BrokerId> = expanded
            .iter()
            .filter(|replica| !new_replicas.contains(*replica))
            .copied()
            .collect();

        let synced: Vec<PartitionReplica> = new_replicas
            .iter()
            .map(|replica| PartitionReplica::new(partition.clone(), *replica))
            .collect();
        let (mut ecx, _, replica_machine, _) = self.split();
        replica_machine
            .handle_state_changes(&mut ecx, &synced, ReplicaState::OnlineReplica)
            .await?;

        self.ctx
            .set_partition_replica_assignment(partition, new_replicas.clone());
        self.move_reassigned_partition_leader_if_required(partition, &new_replicas)
            .await?;

        let leaving: Vec<PartitionReplica> = old_replicas
            .iter()
            .map(|replica| PartitionReplica::new(partition.clone(), *replica))
            .collect();
        let (mut ecx, _, replica_machine, _) = self.split();
        replica_machine
            .handle_state_changes(&mut ecx, &leaving, ReplicaState::OfflineReplica)
            .await?;
        replica_machine
            .handle_state_changes(&mut ecx, &leaving, ReplicaState::ReplicaDeletionStarted)
            .await?;
        replica_machine
            .handle_state_changes(&mut ecx, &leaving, ReplicaState::ReplicaDeletionSuccessful)
            .await?;
        replica_machine
            .handle_state_changes(&mut ecx, &leaving, ReplicaState::NonExistentReplica)
            .await?;

        self.write_topic_assignment(&partition.topic).await?;
        self.clear_reassignment(partition).await?;

        let topic = partition.topic.clone();
        let (mut ecx, partition_machine, replica_machine, deletion) = self.split();
        deletion
            .resume_deletion_for_topics(&mut ecx, partition_machine, replica_machine, &[topic])
            .await?;

        let all_brokers: Vec<BrokerId> = self
            .ctx
            .live_or_shutting_down_broker_ids()
            .into_iter()
            .collect();
        self.send_update_metadata(&all_brokers, &[partition.clone()])?;
        info!(partition = %partition, "Partition reassignment complete");
        Ok(())
    }

    async fn process_reassignment_isr_change(
        &mut self,
        partition: TopicPartition,
    ) -> ControllerResult<()> {
        let Some(reassignment) = self.ctx.partitions_being_reassigned.get(&partition).cloned()
        else {
            return Ok(());
        };
        if self
            .are_replicas_in_isr(&partition, &reassignment.new_replicas)
            .await?
        {
            self.on_partition_reassignment(&partition).await
        } else {
            debug!(partition = %partition, "Reassignment still waiting for the ISR");
            Ok(())
        }
    }

    async fn are_replicas_in_isr(
        &self,
        partition: &TopicPartition,
        replicas: &[BrokerId],
    ) -> ControllerResult<bool> {
        let Some(leadership) = self.coordination.leader_and_isr(partition).await? else {
            return Ok(false);
        };
        Ok(replicas
            .iter()
            .all(|replica| leadership.leader_and_isr.isr.contains(replica)))
    }

    /// Step 7: make sure the leader ends up inside the new replica set with
    /// a freshly bumped epoch.
    async fn move_reassigned_partition_leader_if_required(
        &mut self,
        partition: &TopicPartition,
        new_replicas: &[BrokerId],
    ) -> ControllerResult<()> {
        let leadership = self
            .ctx
            .partition_leadership
            .get(partition)
            .cloned()
            .ok_or_else(|| ControllerError::StateChangeFailed {
                partition: partition.clone(),
                reason: "no leadership recorded during reassignment".to_string(),
            })?;
        let current_leader = leadership.leader_and_isr.leader;

        if new_replicas.contains(&current_leader)
            && self.ctx.is_replica_online(current_leader, partition)
        {
            // Leader survives; a bumped epoch fences replicas that still
            // hold the expanded assignment.
            self.update_leader_epoch_and_send_request(partition, new_replicas, new_replicas)
                .await
        } else {
            let (mut ecx, partition_machine, _, _) = self.split();
            partition_machine
                .handle_state_changes(
                    &mut ecx,
                    &[partition.clone()],
                    PartitionState::Online,
                    Some(LeaderElectionStrategy::Reassigned),
                )
                .await
        }
    }

    async fn update_leader_epoch_and_send_request(
        &mut self,
        partition: &TopicPartition,
        recipients: &[BrokerId],
        assigned_replicas: &[BrokerId],
    ) -> ControllerResult<()> {
        let epoch = self.ctx.epoch;
        let epoch_version = self.ctx.epoch_version;
        let updated = update_leader_epoch(
            self.coordination.as_ref(),
            partition,
            epoch,
            epoch_version,
        )
        .await?
        .ok_or_else(|| ControllerError::StateChangeFailed {
            partition: partition.clone(),
            reason: "leadership node vanished during reassignment".to_string(),
        })?;

        self.ctx
            .partition_leadership
            .insert(partition.clone(), updated.clone());

        let (mut ecx, _, _, _) = self.split();
        ecx.batch.new_batch()?;
        ecx.batch.add_leader_and_isr_request_for_brokers(
            recipients,
            partition,
            &updated,
            assigned_replicas,
            false,
        );
        let live: Vec<BrokerId> = ecx
            .ctx
            .live_or_shutting_down_broker_ids()
            .into_iter()
            .collect();
        ecx.batch
            .add_update_metadata_request_for_brokers(&live, &[partition.clone()], ecx.ctx);
        let epoch = ecx.ctx.epoch;
        ecx.batch
            .send_requests_to_brokers(epoch, ecx.channel, ecx.ctx)
    }

    async fn write_topic_assignment(&mut self, topic: &str) -> ControllerResult<()> {
        let assignment: BTreeMap<i32, Vec<BrokerId>> = self
            .ctx
            .partition_assignment
            .get(topic)
            .cloned()
            .unwrap_or_default();
        let epoch_version = self.ctx.epoch_version;
        self.coordination
            .set_replica_assignment(topic, &assignment, epoch_version)
            .await?;
        Ok(())
    }

    /// Remove every trace of a reassignment, in the coordination service and
    /// in memory.
    async fn clear_reassignment(&mut self, partition: &TopicPartition) -> ControllerResult<()> {
        let epoch_version = self.ctx.epoch_version;
        self.coordination
            .remove_partition_from_reassignment(partition, epoch_version)
            .await?;
        self.coordination.unregister_isr_change_watch(partition).await;
        self.ctx.partitions_being_reassigned.remove(partition);
        Ok(())
    }

    // ========================================================================
    // Preferred-Replica Elections
    // ========================================================================

    async fn process_preferred_replica_election(&mut self) -> ControllerResult<()> {
        let partitions = self.coordination.partitions_for_preferred_election().await?;
        self.on_preferred_replica_election(partitions.into_iter().collect(), false)
            .await
    }

    async fn on_preferred_replica_election(
        &mut self,
        partitions: Vec<TopicPartition>,
        auto_triggered: bool,
    ) -> ControllerResult<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        let (eligible, deleting): (Vec<TopicPartition>, Vec<TopicPartition>) = partitions
            .into_iter()
            .partition(|partition| !self.ctx.topics_to_be_deleted.contains(&partition.topic));
        if !deleting.is_empty() {
            info!(
                skipped = deleting.len(),
                "Skipping preferred-replica election for topics queued for deletion"
            );
        }

        let (mut ecx, partition_machine, _, _) = self.split();
        partition_machine
            .handle_state_changes(
                &mut ecx,
                &eligible,
                PartitionState::Online,
                Some(LeaderElectionStrategy::PreferredReplica),
            )
            .await?;

        if !auto_triggered {
            let epoch_version = self.ctx.epoch_version;
            self.coordination
                .clear_preferred_replica_election(epoch_version)
                .await?;
        }
        Ok(())
    }

    async fn process_auto_preferred_replica_election(&mut self) -> ControllerResult<()> {
        // Reassignments churn leadership by design; balancing against that
        // noise moves leaders twice. One global throttle, not per partition.
        if !self.ctx.partitions_being_reassigned.is_empty() {
            debug!("Skipping auto leader balance while a reassignment is in progress");
            return Ok(());
        }

        let threshold = self.config.leader_imbalance_per_broker_percentage as f64;
        let mut total_not_preferred = 0usize;
        let mut to_elect: Vec<TopicPartition> = Vec::new();

        for broker_id in self.ctx.live_broker_ids() {
            let preferred: Vec<TopicPartition> = self
                .ctx
                .all_partitions()
                .into_iter()
                .filter(|partition| {
                    !self.ctx.topics_to_be_deleted.contains(&partition.topic)
                        && self
                            .ctx
                            .partition_replica_assignment(partition)
                            .first()
                            .copied()
                            == Some(broker_id)
                })
                .collect();
            if preferred.is_empty() {
                continue;
            }
            let not_led: Vec<TopicPartition> = preferred
                .iter()
                .filter(|partition| {
                    self.ctx
                        .partition_leadership
                        .get(*partition)
                        .map(|leadership| leadership.leader_and_isr.leader != broker_id)
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            total_not_preferred += not_led.len();

            let imbalance = not_led.len() as f64 * 100.0 / preferred.len() as f64;
            if imbalance > threshold {
                info!(
                    broker_id = %broker_id,
                    imbalance = format!("{imbalance:.1}%"),
                    partitions = not_led.len(),
                    "Broker leader imbalance above threshold"
                );
                to_elect.extend(not_led);
            }
        }
        metrics::PREFERRED_REPLICA_IMBALANCE_COUNT.set(total_not_preferred as i64);

        self.on_preferred_replica_election(to_elect, true).await
    }

    // ========================================================================
    // Controlled Shutdown
    // ========================================================================

    async fn do_controlled_shutdown(
        &mut self,
        broker_id: BrokerId,
    ) -> ControllerResult<BTreeSet<TopicPartition>> {
        if !self.is_active() {
            return Err(ControllerError::ControllerMoved(format!(
                "broker {} is not the active controller",
                self.broker_id
            )));
        }
        if !self.ctx.brokers.contains_key(&broker_id) {
            return Err(ControllerError::BrokerNotAvailable(broker_id));
        }
        info!(broker_id = %broker_id, "Controlled shutdown starting");
        self.ctx.shutting_down_broker_ids.insert(broker_id);

        let replicated: Vec<TopicPartition> = self
            .ctx
            .partitions_on_broker(broker_id)
            .into_iter()
            .filter(|partition| self.ctx.partition_replica_assignment(partition).len() > 1)
            .collect();
        let (led, followed): (Vec<TopicPartition>, Vec<TopicPartition>) =
            replicated.into_iter().partition(|partition| {
                self.ctx
                    .partition_leadership
                    .get(partition)
                    .map(|leadership| leadership.leader_and_isr.leader == broker_id)
                    .unwrap_or(false)
            });

        let batch_size = self.config.controlled_shutdown_partition_batch_size;
        for chunk in led.chunks(batch_size) {
            let (mut ecx, partition_machine, _, _) = self.split();
            partition_machine
                .handle_state_changes(
                    &mut ecx,
                    chunk,
                    PartitionState::Online,
                    Some(LeaderElectionStrategy::ControlledShutdown),
                )
                .await?;
        }

        for chunk in followed.chunks(batch_size) {
            let (mut ecx, _, replica_machine, _) = self.split();
            ecx.batch.new_batch()?;
            for partition in chunk {
                ecx.batch
                    .add_stop_replica_request_for_brokers(&[broker_id], partition, false);
            }
            let epoch = ecx.ctx.epoch;
            ecx.batch
                .send_requests_to_brokers(epoch, ecx.channel, ecx.ctx)?;

            let replicas: Vec<PartitionReplica> = chunk
                .iter()
                .map(|partition| PartitionReplica::new(partition.clone(), broker_id))
                .collect();
            replica_machine
                .handle_state_changes(&mut ecx, &replicas, ReplicaState::OfflineReplica)
                .await?;
        }

        let still_led = self
            .ctx
            .partitions_with_leader_on(&BTreeSet::from([broker_id]));
        info!(
            broker_id = %broker_id,
            remaining = still_led.len(),
            "Controlled shutdown finished"
        );
        Ok(still_led)
    }

    // ========================================================================
    // Notifications and Responses
    // ========================================================================

    async fn process_isr_change_notification(&mut self) -> ControllerResult<()> {
        let partitions = self.coordination.drain_isr_change_notifications().await?;
        if partitions.is_empty() {
            return Ok(());
        }
        let known: Vec<TopicPartition> = partitions
            .into_iter()
            .filter(|partition| {
                !self.ctx.partition_replica_assignment(partition).is_empty()
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for partition in &known {
            if let Some(leadership) = self.coordination.leader_and_isr(partition).await? {
                self.ctx
                    .partition_leadership
                    .insert(partition.clone(), leadership);
            }
        }
        debug!(partitions = known.len(), "ISR change notifications processed");

        let all_brokers: Vec<BrokerId> = self
            .ctx
            .live_or_shutting_down_broker_ids()
            .into_iter()
            .collect();
        self.send_update_metadata(&all_brokers, &known)
    }

    async fn process_log_dir_event_notification(&mut self) -> ControllerResult<()> {
        let events = self.coordination.drain_log_dir_event_notifications().await?;
        let mut offline_replicas = BTreeSet::new();
        for event in events {
            for partition in event.partitions {
                let hosted = self
                    .ctx
                    .partition_replica_assignment(&partition)
                    .contains(&event.broker_id);
                if !hosted {
                    continue;
                }
                self.ctx
                    .replicas_on_offline_dirs
                    .entry(event.broker_id)
                    .or_default()
                    .insert(partition.clone());
                offline_replicas.insert(PartitionReplica::new(partition, event.broker_id));
            }
        }
        self.on_replicas_become_offline(offline_replicas).await
    }

    async fn process_leader_and_isr_response(
        &mut self,
        broker_id: BrokerId,
        response: LeaderAndIsrResponse,
    ) -> ControllerResult<()> {
        if let Some(reason) = response.error {
            warn!(broker_id = %broker_id, reason, "LeaderAndIsr request failed");
            return Ok(());
        }
        let mut offline_replicas = BTreeSet::new();
        for result in response.partition_results {
            let Some(reason) = result.error else { continue };
            if !self
                .ctx
                .partition_replica_assignment(&result.partition)
                .contains(&broker_id)
            {
                continue;
            }
            warn!(
                broker_id = %broker_id,
                partition = %result.partition,
                reason,
                "Broker reported an offline replica"
            );
            self.ctx
                .replicas_on_offline_dirs
                .entry(broker_id)
                .or_default()
                .insert(result.partition.clone());
            offline_replicas.insert(PartitionReplica::new(result.partition, broker_id));
        }
        self.on_replicas_become_offline(offline_replicas).await
    }

    // ========================================================================
    // Shared Helpers
    // ========================================================================

    /// Stage and flush one UpdateMetadata wave. An empty partition list
    /// means the full snapshot.
    fn send_update_metadata(
        &mut self,
        brokers: &[BrokerId],
        partitions: &[TopicPartition],
    ) -> ControllerResult<()> {
        let all: Vec<TopicPartition>;
        let partitions = if partitions.is_empty() {
            all = self.ctx.all_partitions().into_iter().collect();
            &all
        } else {
            partitions
        };

        let (mut ecx, _, _, _) = self.split();
        ecx.batch.new_batch()?;
        ecx.batch
            .add_update_metadata_request_for_brokers(brokers, partitions, ecx.ctx);
        let epoch = ecx.ctx.epoch;
        ecx.batch
            .send_requests_to_brokers(epoch, ecx.channel, ecx.ctx)
    }

    fn update_metrics(&self) {
        metrics::OFFLINE_PARTITIONS_COUNT.set(self.partition_machine.offline_partition_count() as i64);
        metrics::GLOBAL_TOPIC_COUNT.set(self.ctx.all_topics.len() as i64);
        metrics::GLOBAL_PARTITION_COUNT.set(self.ctx.partition_count() as i64);
    }
}

#[async_trait]
impl EventProcessor for Controller {
    async fn process(&mut self, event: ControllerEvent) {
        let result = match event {
            ControllerEvent::Startup => self.process_startup().await,
            ControllerEvent::ControllerChange => self.maybe_resign().await,
            ControllerEvent::Reelect => self.process_reelect().await,
            ControllerEvent::AwaitLatch(latch) => {
                let _ = latch.send(());
                Ok(())
            }
            ControllerEvent::Shutdown => {
                if self.is_active() {
                    self.on_controller_resignation().await;
                }
                Ok(())
            }
            ControllerEvent::ControlledShutdown { broker_id, reply } => {
                let result = self.do_controlled_shutdown(broker_id).await;
                let fatal = result.as_ref().err().map(|e| e.is_fatal()).unwrap_or(false);
                if let Err(e) = &result {
                    warn!(broker_id = %broker_id, error = %e, "Controlled shutdown failed");
                }
                let _ = reply.send(result);
                if fatal {
                    self.handle_illegal_state().await;
                }
                Ok(())
            }
            event if !self.is_active() => {
                debug!(state = event.state().name(), "Ignoring event, not the active controller");
                Ok(())
            }
            ControllerEvent::BrokerChange => self.process_broker_change().await,
            ControllerEvent::BrokerModification(broker_id) => {
                self.process_broker_modification(broker_id).await
            }
            ControllerEvent::TopicChange => self.process_topic_change().await,
            ControllerEvent::TopicDeletion => self.process_topic_deletion().await,
            ControllerEvent::PartitionModifications(topic) => {
                self.process_partition_modifications(topic).await
            }
            ControllerEvent::PartitionReassignment => {
                self.process_partition_reassignment().await
            }
            ControllerEvent::PartitionReassignmentIsrChange(partition) => {
                self.process_reassignment_isr_change(partition).await
            }
            ControllerEvent::IsrChangeNotification => {
                self.process_isr_change_notification().await
            }
            ControllerEvent::LogDirEventNotification => {
                self.process_log_dir_event_notification().await
            }
            ControllerEvent::PreferredReplicaLeaderElection => {
                self.process_preferred_replica_election().await
            }
            ControllerEvent::AutoPreferredReplicaLeaderElection => {
                self.process_auto_preferred_replica_election().await
            }
            ControllerEvent::LeaderAndIsrResponseReceived {
                broker_id,
                response,
            } => self.process_leader_and_isr_response(broker_id, response).await,
            ControllerEvent::TopicDeletionStopReplicaResult { replica, error } => {
                self.process_topic_deletion_stop_replica_result(replica, error)
                    .await
            }
        };

        if let Err(e) = result {
            if e.is_fatal() {
                error!(error = %e, "Fatal controller error, resigning");
                self.handle_illegal_state().await;
            } else {
                error!(error = %e, "Controller event failed");
            }
        }
        self.update_metrics();
    }
}
