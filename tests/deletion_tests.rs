//! Topic deletion lifecycle scenarios.
//!
//! Deletion only completes once every broker hosting a replica has
//! confirmed it deleted its data; dead brokers park the topic until they
//! return. The recording sender acknowledges StopReplica requests, so these
//! tests exercise the full request/response round trip through the event
//! loop.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use castellan::controller::{
    ControlRequest, Controller, ControllerConfig, ControllerHandle, RecordingRequestSender,
};
use castellan::coordination::{CoordinationClient, InMemoryCoordination};
use castellan::types::{Broker, BrokerId, TopicPartition};

struct TestCluster {
    coordination: Arc<InMemoryCoordination>,
    sender: Arc<RecordingRequestSender>,
    handle: ControllerHandle,
}

async fn start_cluster(broker_ids: &[i32]) -> TestCluster {
    let coordination = Arc::new(InMemoryCoordination::new());
    coordination
        .add_broker(Broker::new(BrokerId(0), "controller", 9092))
        .await;
    for id in broker_ids {
        coordination
            .add_broker(Broker::new(BrokerId(*id), format!("broker-{id}"), 9092))
            .await;
    }
    let sender = Arc::new(RecordingRequestSender::new());
    let handle = Controller::start(
        BrokerId(0),
        ControllerConfig::default(),
        coordination.clone(),
        sender.clone(),
    )
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

async fn create_topic_and_wait(cluster: &TestCluster, topic: &str, replicas: &[i32]) {
    cluster
        .coordination
        .create_topic(topic, BTreeMap::from([(0, ids(replicas))]))
        .await;
    let tp = TopicPartition::new(topic, 0);
    eventually("topic initialization", || async {
        cluster
            .coordination
            .leader_and_isr(&tp)
            .await
            .unwrap()
            .is_some()
    })
    .await;
}

// ============================================================================
// Happy Path
// ============================================================================

#[tokio::test]
async fn test_deletion_removes_topic_once_all_brokers_confirm() {
    let cluster = start_cluster(&[1, 2, 3]).await;
    create_topic_and_wait(&cluster, "doomed", &[1, 2, 3]).await;
    let tp = TopicPartition::new("doomed", 0);

    cluster.coordination.mark_topic_for_deletion("doomed").await;

    eventually("topic fully deleted", || async {
        cluster.coordination.all_topics().await.unwrap().is_empty()
    })
    .await;
    assert!(cluster.coordination.deletion_markers().await.is_empty());
    assert!(cluster
        .coordination
        .leader_and_isr(&tp)
        .await
        .unwrap()
        .is_none());

    // Every replica was told to delete its data.
    for broker in [1, 2, 3] {
        assert!(cluster
            .sender
            .requests_to(BrokerId(broker))
            .iter()
            .any(|request| matches!(
                request,
                ControlRequest::StopReplica(req)
                    if req.delete_partitions && req.partitions.contains(&tp)
            )));
    }

    cluster.handle.shutdown().await;
}

#[tokio::test]
async fn test_deletion_leaves_other_topics_alone() {
    let cluster = start_cluster(&[1, 2]).await;
    create_topic_and_wait(&cluster, "doomed", &[1, 2]).await;
    create_topic_and_wait(&cluster, "survivor", &[1, 2]).await;

    cluster.coordination.mark_topic_for_deletion("doomed").await;

    eventually("doomed topic deleted", || async {
        !cluster
            .coordination
            .all_topics()
            .await
            .unwrap()
            .contains("doomed")
    })
    .await;
    assert!(cluster
        .coordination
        .all_topics()
        .await
        .unwrap()
        .contains("survivor"));
    assert!(cluster
        .coordination
        .leader_and_isr(&TopicPartition::new("survivor", 0))
        .await
        .unwrap()
        .is_some());

    cluster.handle.shutdown().await;
}

// ============================================================================
// Dead Brokers
// ============================================================================

#[tokio::test]
async fn test_deletion_waits_for_a_dead_broker_to_return() {
    let cluster = start_cluster(&[1, 2, 3]).await;
    create_topic_and_wait(&cluster, "doomed", &[1, 2, 3]).await;

    cluster.coordination.fail_broker(BrokerId(3)).await;
    cluster.handle.await_idle().await;

    cluster.coordination.mark_topic_for_deletion("doomed").await;
    cluster.handle.await_idle().await;

    // The live brokers confirmed, but broker 3 cannot: the topic and its
    // marker stay until it returns.
    eventually("live brokers asked to delete", || async {
        [1, 2].iter().all(|broker| {
            cluster
                .sender
                .requests_to(BrokerId(*broker))
                .iter()
                .any(|request| matches!(
                    request,
                    ControlRequest::StopReplica(req) if req.delete_partitions
                ))
        })
    })
    .await;
    cluster.handle.await_idle().await;
    assert!(cluster
        .coordination
        .all_topics()
        .await
        .unwrap()
        .contains("doomed"));
    assert!(cluster.coordination.deletion_markers().await.contains("doomed"));

    // Broker 3 comes back and the deletion drains.
    cluster
        .coordination
        .add_broker(Broker::new(BrokerId(3), "broker-3", 9092))
        .await;
    eventually("topic deleted after the broker returned", || async {
        cluster.coordination.all_topics().await.unwrap().is_empty()
    })
    .await;
    assert!(cluster.coordination.deletion_markers().await.is_empty());

    cluster.handle.shutdown().await;
}

// ============================================================================
// Deletion Disabled
// ============================================================================

#[tokio::test]
async fn test_deletion_disabled_removes_the_marker_and_keeps_the_topic() {
    let coordination = Arc::new(InMemoryCoordination::new());
    coordination.set_topic_deletion_enabled(false).await;
    coordination
        .add_broker(Broker::new(BrokerId(0), "controller", 9092))
        .await;
    coordination
        .add_broker(Broker::new(BrokerId(1), "broker-1", 9092))
        .await;
    let sender = Arc::new(RecordingRequestSender::new());
    let handle = Controller::start(
        BrokerId(0),
        ControllerConfig::default(),
        coordination.clone(),
        sender.clone(),
    )
    .expect("controller should start");
    handle.await_idle().await;

    coordination
        .create_topic("sticky", BTreeMap::from([(0, ids(&[1]))]))
        .await;
    let tp = TopicPartition::new("sticky", 0);
    eventually("topic initialization", || async {
        coordination.leader_and_isr(&tp).await.unwrap().is_some()
    })
    .await;

    coordination.mark_topic_for_deletion("sticky").await;
    eventually("marker removed", || async {
        coordination.deletion_markers().await.is_empty()
    })
    .await;
    handle.await_idle().await;

    // The topic itself is untouched.
    assert!(coordination.all_topics().await.unwrap().contains("sticky"));
    assert!(coordination.leader_and_isr(&tp).await.unwrap().is_some());
    assert!(!sender
        .requests_to(BrokerId(1))
        .iter()
        .any(|request| matches!(
            request,
            ControlRequest::StopReplica(req) if req.delete_partitions
        )));

    handle.shutdown().await;
}

// ============================================================================
// Deletion vs. Reassignment
// ============================================================================

#[tokio::test]
async fn test_reassignment_for_a_queued_topic_is_refused() {
    let cluster = start_cluster(&[1, 2, 3]).await;
    create_topic_and_wait(&cluster, "doomed", &[1, 2]).await;
    let tp = TopicPartition::new("doomed", 0);

    // Park the deletion so the topic stays queued while we try to reassign.
    cluster.coordination.fail_broker(BrokerId(2)).await;
    cluster.handle.await_idle().await;
    cluster.coordination.mark_topic_for_deletion("doomed").await;
    cluster.handle.await_idle().await;

    cluster
        .coordination
        .request_reassignment(BTreeMap::from([(tp, ids(&[1, 3]))]))
        .await;

    eventually("reassignment refused and cleared", || async {
        cluster
            .coordination
            .partitions_being_reassigned()
            .await
            .unwrap()
            .is_empty()
    })
    .await;

    cluster.handle.shutdown().await;
}
