//! End-to-end controller scenarios.
//!
//! Each test runs a real controller against the in-memory coordination
//! service and the recording request sender, drives cluster changes through
//! the store, and asserts on the persisted state and the requests brokers
//! received.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use castellan::controller::{
    ControlRequest, Controller, ControllerConfig, ControllerError, ControllerEvent,
    ControllerHandle, RecordingRequestSender,
};
use castellan::coordination::{CoordinationClient, InMemoryCoordination};
use castellan::types::{Broker, BrokerId, LeaderAndIsr, TopicPartition};

const CONTROLLER_BROKER: BrokerId = BrokerId(0);

struct TestCluster {
    coordination: Arc<InMemoryCoordination>,
    sender: Arc<RecordingRequestSender>,
    handle: ControllerHandle,
}

/// Register the given brokers, start a controller on broker 0, and wait for
/// the failover to finish.
async fn start_cluster(broker_ids: &[i32]) -> TestCluster {
    start_cluster_with_config(broker_ids, ControllerConfig::default()).await
}

async fn start_cluster_with_config(broker_ids: &[i32], config: ControllerConfig) -> TestCluster {
    let coordination = Arc::new(InMemoryCoordination::new());
    coordination
        .add_broker(Broker::new(CONTROLLER_BROKER, "controller", 9092))
        .await;
    for id in broker_ids {
        coordination
            .add_broker(Broker::new(BrokerId(*id), format!("broker-{id}"), 9092))
            .await;
    }
    let sender = Arc::new(RecordingRequestSender::new());
    let handle = Controller::start(CONTROLLER_BROKER, config, coordination.clone(), sender.clone())
        .expect("controller should start");
    handle.await_idle().await;

    TestCluster {
        coordination,
        sender,
        handle,
    }
}

async fn eventually<F, Fut>(what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn ids(raw: &[i32]) -> Vec<BrokerId> {
    raw.iter().map(|b| BrokerId(*b)).collect()
}

async fn leadership_of(
    coordination: &InMemoryCoordination,
    partition: &TopicPartition,
) -> LeaderAndIsr {
    coordination
        .leader_and_isr(partition)
        .await
        .unwrap()
        .expect("partition state should exist")
        .leader_and_isr
}

// ============================================================================
// Topic Creation
// ============================================================================

#[tokio::test]
async fn test_new_topic_gets_initialized_with_preferred_leader() {
    let cluster = start_cluster(&[1, 2, 3]).await;
    let tp = TopicPartition::new("events", 0);

    cluster
        .coordination
        .create_topic("events", BTreeMap::from([(0, ids(&[2, 1, 3]))]))
        .await;

    eventually("partition initialization", || async {
        cluster
            .coordination
            .leader_and_isr(&tp)
            .await
            .unwrap()
            .is_some()
    })
    .await;

    let leadership = leadership_of(&cluster.coordination, &tp).await;
    assert_eq!(leadership.leader, BrokerId(2));
    assert_eq!(leadership.isr, ids(&[2, 1, 3]));

    // Each assigned replica received the initial LeaderAndIsr marked new.
    eventually("LeaderAndIsr to the replicas", || async {
        [1, 2, 3].iter().all(|broker| {
            cluster
                .sender
                .requests_to(BrokerId(*broker))
                .iter()
                .any(|request| match request {
                    ControlRequest::LeaderAndIsr(req) => req
                        .partition_states
                        .iter()
                        .any(|state| state.partition == tp && state.is_new),
                    _ => false,
                })
        })
    })
    .await;

    cluster.handle.shutdown().await;
}

// ============================================================================
// Leader Failover
// ============================================================================

#[tokio::test]
async fn test_leader_failure_elects_next_replica_in_assignment_order() {
    let cluster = start_cluster(&[1, 2, 3]).await;
    let tp = TopicPartition::new("events", 0);
    cluster
        .coordination
        .create_topic("events", BTreeMap::from([(0, ids(&[1, 2, 3]))]))
        .await;
    eventually("initial leadership", || async {
        cluster
            .coordination
            .leader_and_isr(&tp)
            .await
            .unwrap()
            .is_some()
    })
    .await;
    let before = leadership_of(&cluster.coordination, &tp).await;
    assert_eq!(before.leader, BrokerId(1));

    cluster.coordination.fail_broker(BrokerId(1)).await;

    eventually("new leader elected", || async {
        leadership_of(&cluster.coordination, &tp).await.leader == BrokerId(2)
    })
    .await;
    let after = leadership_of(&cluster.coordination, &tp).await;
    assert_eq!(after.leader, BrokerId(2));
    assert_eq!(after.isr, ids(&[2, 3]));
    assert_eq!(after.leader_epoch, before.leader_epoch + 1);

    // The surviving replicas were told about the new leadership, and the
    // dead broker was not.
    eventually("LeaderAndIsr to the survivors", || async {
        [2, 3].iter().all(|broker| {
            cluster
                .sender
                .requests_to(BrokerId(*broker))
                .iter()
                .any(|request| matches!(
                    request,
                    ControlRequest::LeaderAndIsr(req) if req
                        .partition_states
                        .iter()
                        .any(|state| state.leader == BrokerId(2))
                ))
        })
    })
    .await;
    assert!(!cluster
        .sender
        .requests_to(BrokerId(1))
        .iter()
        .any(|request| matches!(
            request,
            ControlRequest::LeaderAndIsr(req) if req
                .partition_states
                .iter()
                .any(|state| state.leader == BrokerId(2))
        )));

    cluster.handle.shutdown().await;
}

#[tokio::test]
async fn test_unclean_election_disabled_keeps_partition_offline() {
    let cluster = start_cluster(&[1, 2]).await;
    let tp = TopicPartition::new("events", 0);
    cluster
        .coordination
        .create_topic("events", BTreeMap::from([(0, ids(&[1, 2]))]))
        .await;
    eventually("initial leadership", || async {
        cluster
            .coordination
            .leader_and_isr(&tp)
            .await
            .unwrap()
            .is_some()
    })
    .await;

    // Broker 2 fell behind; only the leader remains in the ISR.
    cluster.coordination.set_isr(&tp, ids(&[1])).await;
    let before = leadership_of(&cluster.coordination, &tp).await;

    cluster.coordination.fail_broker(BrokerId(1)).await;
    cluster.handle.await_idle().await;

    eventually("leader removed from ISR", || async {
        leadership_of(&cluster.coordination, &tp).await.leader == BrokerId::NO_LEADER
    })
    .await;
    let after = leadership_of(&cluster.coordination, &tp).await;
    // Broker 2 is alive but out of sync: with unclean election disabled it
    // must not be elected, and the last ISR entry is retained.
    assert_eq!(after.leader, BrokerId::NO_LEADER);
    assert_eq!(after.isr, ids(&[1]));
    assert_eq!(after.leader_epoch, before.leader_epoch + 1);

    cluster.handle.shutdown().await;
}

#[tokio::test]
async fn test_unclean_election_enabled_sacrifices_consistency_for_availability() {
    let cluster = start_cluster(&[1, 2]).await;
    let tp = TopicPartition::new("events", 0);
    cluster
        .coordination
        .set_unclean_leader_election("events", true)
        .await;
    cluster
        .coordination
        .create_topic("events", BTreeMap::from([(0, ids(&[1, 2]))]))
        .await;
    eventually("initial leadership", || async {
        cluster
            .coordination
            .leader_and_isr(&tp)
            .await
            .unwrap()
            .is_some()
    })
    .await;

    cluster.coordination.set_isr(&tp, ids(&[1])).await;
    cluster.coordination.fail_broker(BrokerId(1)).await;

    eventually("unclean election of the lagging replica", || async {
        leadership_of(&cluster.coordination, &tp).await.leader == BrokerId(2)
    })
    .await;
    let after = leadership_of(&cluster.coordination, &tp).await;
    assert_eq!(after.isr, ids(&[2]));

    cluster.handle.shutdown().await;
}

// ============================================================================
// Controlled Shutdown
// ============================================================================

#[tokio::test]
async fn test_controlled_shutdown_of_follower_only_broker() {
    let cluster = start_cluster(&[1, 2, 3]).await;
    let tp = TopicPartition::new("events", 0);
    cluster
        .coordination
        .create_topic("events", BTreeMap::from([(0, ids(&[1, 2, 3]))]))
        .await;
    eventually("initial leadership", || async {
        cluster
            .coordination
            .leader_and_isr(&tp)
            .await
            .unwrap()
            .is_some()
    })
    .await;
    let before = leadership_of(&cluster.coordination, &tp).await;
    cluster.sender.clear();

    let remaining = cluster
        .handle
        .controlled_shutdown(BrokerId(3))
        .await
        .expect("controlled shutdown should succeed");

    // Broker 3 led nothing, so nothing is left behind.
    assert!(remaining.is_empty());

    let after = leadership_of(&cluster.coordination, &tp).await;
    assert_eq!(after.leader, BrokerId(1));
    assert_eq!(after.isr, ids(&[1, 2]));
    assert_eq!(after.leader_epoch, before.leader_epoch + 1);

    // The draining broker was told to stop replicating, without deleting.
    eventually("StopReplica to the draining broker", || async {
        cluster
            .sender
            .requests_to(BrokerId(3))
            .iter()
            .any(|request| matches!(
                request,
                ControlRequest::StopReplica(req)
                    if !req.delete_partitions && req.partitions.contains(&tp)
            ))
    })
    .await;

    cluster.handle.shutdown().await;
}

#[tokio::test]
async fn test_controlled_shutdown_moves_leadership_off_the_draining_broker() {
    let cluster = start_cluster(&[1, 2, 3]).await;
    let tp = TopicPartition::new("events", 0);
    cluster
        .coordination
        .create_topic("events", BTreeMap::from([(0, ids(&[1, 2, 3]))]))
        .await;
    eventually("initial leadership", || async {
        cluster
            .coordination
            .leader_and_isr(&tp)
            .await
            .unwrap()
            .is_some()
    })
    .await;

    let remaining = cluster
        .handle
        .controlled_shutdown(BrokerId(1))
        .await
        .expect("controlled shutdown should succeed");
    assert!(remaining.is_empty());

    let after = leadership_of(&cluster.coordination, &tp).await;
    assert_eq!(after.leader, BrokerId(2));
    assert!(!after.isr.contains(&BrokerId(1)));

    cluster.handle.shutdown().await;
}

#[tokio::test]
async fn test_controlled_shutdown_of_unknown_broker_fails() {
    let cluster = start_cluster(&[1]).await;
    let result = cluster.handle.controlled_shutdown(BrokerId(42)).await;
    assert!(matches!(
        result,
        Err(ControllerError::BrokerNotAvailable(BrokerId(42)))
    ));
    cluster.handle.shutdown().await;
}

#[tokio::test]
async fn test_controlled_shutdown_leaves_unreplicated_partitions_behind() {
    let cluster = start_cluster(&[1, 2]).await;
    let replicated = TopicPartition::new("events", 0);
    let unreplicated = TopicPartition::new("events", 1);
    cluster
        .coordination
        .create_topic(
            "events",
            BTreeMap::from([(0, ids(&[1, 2])), (1, ids(&[1]))]),
        )
        .await;
    eventually("initial leadership", || async {
        cluster
            .coordination
            .leader_and_isr(&unreplicated)
            .await
            .unwrap()
            .is_some()
    })
    .await;

    let remaining = cluster
        .handle
        .controlled_shutdown(BrokerId(1))
        .await
        .expect("controlled shutdown should succeed");

    // Only the replication-factor-1 partition stays on the broker.
    assert_eq!(remaining, BTreeSet::from([unreplicated]));
    let moved = leadership_of(&cluster.coordination, &replicated).await;
    assert_eq!(moved.leader, BrokerId(2));

    cluster.handle.shutdown().await;
}

// ============================================================================
// Epoch Fencing
// ============================================================================

#[tokio::test]
async fn test_fenced_write_forces_resignation_and_reelection() {
    let cluster = start_cluster(&[1, 2, 3]).await;
    let tp = TopicPartition::new("events", 0);
    cluster
        .coordination
        .create_topic("events", BTreeMap::from([(0, ids(&[1, 2, 3]))]))
        .await;
    eventually("initial leadership", || async {
        cluster
            .coordination
            .leader_and_isr(&tp)
            .await
            .unwrap()
            .is_some()
    })
    .await;
    let epoch_before = cluster.coordination.controller_epoch().await.unwrap().unwrap();

    // Another controller bumped the epoch node; our next write is fenced.
    cluster.coordination.advance_controller_epoch().await;
    cluster.coordination.fail_broker(BrokerId(2)).await;
    cluster.handle.await_idle().await;

    // The fenced write must not have gone through.
    let leadership = leadership_of(&cluster.coordination, &tp).await;
    assert!(leadership.isr.contains(&BrokerId(2)));

    // The controller resigned: topics created now are ignored.
    cluster
        .coordination
        .create_topic("ignored", BTreeMap::from([(0, ids(&[3]))]))
        .await;
    cluster.handle.await_idle().await;
    assert!(cluster
        .coordination
        .leader_and_isr(&TopicPartition::new("ignored", 0))
        .await
        .unwrap()
        .is_none());

    // Session expiry forces the next election; the controller comes back
    // with a fresh epoch and picks up the topic it missed.
    cluster.coordination.expire_session().await;
    eventually("re-election with a fresh epoch", || async {
        cluster
            .coordination
            .controller_epoch()
            .await
            .unwrap()
            .unwrap()
            .0
            > epoch_before.0 + 1
    })
    .await;
    eventually("missed topic initialized after re-election", || async {
        cluster
            .coordination
            .leader_and_isr(&TopicPartition::new("ignored", 0))
            .await
            .unwrap()
            .is_some()
    })
    .await;

    cluster.handle.shutdown().await;
}

// ============================================================================
// Log-Dir Failures
// ============================================================================

#[tokio::test]
async fn test_log_dir_failure_moves_leadership_off_the_broken_disk() {
    let cluster = start_cluster(&[1, 2, 3]).await;
    let tp = TopicPartition::new("events", 0);
    cluster
        .coordination
        .create_topic("events", BTreeMap::from([(0, ids(&[1, 2, 3]))]))
        .await;
    eventually("initial leadership", || async {
        cluster
            .coordination
            .leader_and_isr(&tp)
            .await
            .unwrap()
            .is_some()
    })
    .await;
    cluster.sender.clear();

    // Broker 1 (the leader) lost the log directory holding the partition,
    // but the broker itself stays up.
    cluster
        .coordination
        .write_log_dir_event(BrokerId(1), &[tp.clone()])
        .await;

    eventually("leadership moved off the broken disk", || async {
        leadership_of(&cluster.coordination, &tp).await.leader == BrokerId(2)
    })
    .await;
    eventually("metadata reports the offline replica", || async {
        cluster
            .sender
            .requests_to(BrokerId(2))
            .iter()
            .any(|request| matches!(
                request,
                ControlRequest::UpdateMetadata(req) if req.partition_states.iter().any(
                    |state| state.partition == tp
                        && state.offline_replicas.contains(&BrokerId(1))
                )
            ))
    })
    .await;

    cluster.handle.shutdown().await;
}

// ============================================================================
// ISR Change Notifications
// ============================================================================

#[tokio::test]
async fn test_isr_change_notifications_refresh_metadata_and_drain() {
    let cluster = start_cluster(&[1, 2]).await;
    let tp = TopicPartition::new("events", 0);
    cluster
        .coordination
        .create_topic("events", BTreeMap::from([(0, ids(&[1, 2]))]))
        .await;
    eventually("initial leadership", || async {
        cluster
            .coordination
            .leader_and_isr(&tp)
            .await
            .unwrap()
            .is_some()
    })
    .await;
    cluster.sender.clear();

    // The leader shrank the ISR on its own and left a notification.
    cluster.coordination.set_isr(&tp, ids(&[1])).await;
    cluster
        .coordination
        .write_isr_change_notification(&[tp.clone()])
        .await;

    eventually("metadata carries the shrunk ISR", || async {
        cluster
            .sender
            .requests_to(BrokerId(2))
            .iter()
            .any(|request| matches!(
                request,
                ControlRequest::UpdateMetadata(req) if req.partition_states.iter().any(
                    |state| state.partition == tp && state.isr == ids(&[1])
                )
            ))
    })
    .await;

    cluster.handle.shutdown().await;
}

// ============================================================================
// Auto Preferred-Leader Rebalance
// ============================================================================

#[tokio::test]
async fn test_auto_rebalance_elects_preferred_leaders_above_threshold() {
    let cluster = start_cluster(&[1, 2]).await;
    let partitions: Vec<TopicPartition> = (0..10)
        .map(|partition| TopicPartition::new("events", partition))
        .collect();
    let assignment: BTreeMap<i32, Vec<BrokerId>> =
        (0..10).map(|partition| (partition, ids(&[2, 1]))).collect();
    cluster.coordination.create_topic("events", assignment).await;
    eventually("all partitions initialized", || async {
        cluster
            .coordination
            .leader_and_isr(&partitions[9])
            .await
            .unwrap()
            .is_some()
    })
    .await;

    // Knock broker 2 out and back in: every partition is now led by
    // broker 1 even though broker 2 is the preferred replica.
    cluster.coordination.fail_broker(BrokerId(2)).await;
    eventually("leadership moved to broker 1", || async {
        leadership_of(&cluster.coordination, &partitions[0]).await.leader == BrokerId(1)
    })
    .await;
    cluster
        .coordination
        .add_broker(Broker::new(BrokerId(2), "broker-2", 9092))
        .await;
    cluster.handle.await_idle().await;
    for partition in &partitions {
        cluster.coordination.set_isr(partition, ids(&[2, 1])).await;
    }

    // Move half of them back via an explicit preferred election.
    cluster
        .coordination
        .request_preferred_election(&partitions[..5])
        .await;
    eventually("manual preferred election done", || async {
        leadership_of(&cluster.coordination, &partitions[4]).await.leader == BrokerId(2)
    })
    .await;
    let untouched_before = leadership_of(&cluster.coordination, &partitions[4]).await;

    // Broker 2 now leads 5 of its 10 preferred partitions: 50% imbalance,
    // far above the 10% threshold. The rebalance tick fixes the other 5.
    cluster
        .handle
        .event_sender()
        .put(ControllerEvent::AutoPreferredReplicaLeaderElection);
    eventually("auto rebalance moved the rest", || async {
        for partition in &partitions[5..] {
            if leadership_of(&cluster.coordination, partition).await.leader != BrokerId(2) {
                return false;
            }
        }
        true
    })
    .await;

    // Partitions already on their preferred leader were left alone.
    let untouched_after = leadership_of(&cluster.coordination, &partitions[4]).await;
    assert_eq!(untouched_after.leader_epoch, untouched_before.leader_epoch);

    cluster.handle.shutdown().await;
}

// ============================================================================
// Failover Round-Trip
// ============================================================================

#[tokio::test]
async fn test_reelection_after_session_expiry_preserves_cluster_state() {
    let cluster = start_cluster(&[1, 2, 3]).await;
    let tp = TopicPartition::new("events", 0);
    cluster
        .coordination
        .create_topic("events", BTreeMap::from([(0, ids(&[1, 2, 3]))]))
        .await;
    eventually("initial leadership", || async {
        cluster
            .coordination
            .leader_and_isr(&tp)
            .await
            .unwrap()
            .is_some()
    })
    .await;
    let before = leadership_of(&cluster.coordination, &tp).await;
    let epoch_before = cluster.coordination.controller_epoch().await.unwrap().unwrap();

    cluster.coordination.expire_session().await;
    eventually("re-elected with a bumped epoch", || async {
        cluster
            .coordination
            .controller_epoch()
            .await
            .unwrap()
            .unwrap()
            .0
            == epoch_before.0 + 1
    })
    .await;
    cluster.handle.await_idle().await;

    // Leadership survives the failover untouched: the partition was healthy.
    let after = leadership_of(&cluster.coordination, &tp).await;
    assert_eq!(after, before);
    assert!(cluster.coordination.has_controller().await);

    cluster.handle.shutdown().await;
}
