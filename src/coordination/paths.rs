//! Node path layout in the coordination service.
//!
//! Paths are designed so that every piece of shared cluster state has a
//! stable, human-readable location, and sequence nodes sort in creation
//! order.
//!
//! ## Layout
//!
//! ```text
//! /controller                                   ephemeral, current controller
//! /controller_epoch                             persistent, monotonic epoch
//! /brokers/ids/<id>                             ephemeral, broker registration
//! /brokers/topics/<topic>                       persistent, replica assignment
//! /brokers/topics/<topic>/partitions/<p>/state  persistent, leader/ISR state
//! /admin/reassign_partitions                    persistent, pending reassignments
//! /admin/preferred_replica_election             persistent, pending elections
//! /admin/delete_topics/<topic>                  persistent, deletion markers
//! /isr_change_notification/<seq>                sequence, ISR change events
//! /log_dir_event_notification/<seq>             sequence, log-dir failures
//! /topic_deletion_flag                          persistent, feature toggle
//! /config/topics/<topic>                        persistent, per-topic overrides
//! ```

use crate::types::TopicPartition;

pub const CONTROLLER: &str = "/controller";
pub const CONTROLLER_EPOCH: &str = "/controller_epoch";
pub const BROKER_IDS: &str = "/brokers/ids";
pub const TOPICS: &str = "/brokers/topics";
pub const REASSIGN_PARTITIONS: &str = "/admin/reassign_partitions";
pub const PREFERRED_REPLICA_ELECTION: &str = "/admin/preferred_replica_election";
pub const DELETE_TOPICS: &str = "/admin/delete_topics";
pub const ISR_CHANGE_NOTIFICATION: &str = "/isr_change_notification";
pub const LOG_DIR_EVENT_NOTIFICATION: &str = "/log_dir_event_notification";
pub const TOPIC_DELETION_FLAG: &str = "/topic_deletion_flag";
pub const TOPIC_CONFIGS: &str = "/config/topics";

/// Registration node for one broker.
pub fn broker(id: i32) -> String {
    format!("{}/{}", BROKER_IDS, id)
}

/// Replica-assignment node for one topic.
pub fn topic(topic: &str) -> String {
    format!("{}/{}", TOPICS, topic)
}

/// Leader/ISR state node for one partition.
pub fn partition_state(tp: &TopicPartition) -> String {
    format!("{}/{}/partitions/{}/state", TOPICS, tp.topic, tp.partition)
}

/// Deletion marker for one topic.
pub fn delete_topic(topic: &str) -> String {
    format!("{}/{}", DELETE_TOPICS, topic)
}

/// Per-topic config overrides.
pub fn topic_config(topic: &str) -> String {
    format!("{}/{}", TOPIC_CONFIGS, topic)
}

/// ISR change notification sequence node. Zero-padded so lexicographic
/// ordering matches creation order.
pub fn isr_change_notification(seq: u64) -> String {
    format!("{}/isr_change_{:010}", ISR_CHANGE_NOTIFICATION, seq)
}

/// Log-dir event notification sequence node.
pub fn log_dir_event_notification(seq: u64) -> String {
    format!("{}/log_dir_event_{:010}", LOG_DIR_EVENT_NOTIFICATION, seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_state_path() {
        let tp = TopicPartition::new("events", 2);
        assert_eq!(
            partition_state(&tp),
            "/brokers/topics/events/partitions/2/state"
        );
    }

    #[test]
    fn test_sequence_nodes_sort_in_creation_order() {
        assert!(isr_change_notification(9) < isr_change_notification(10));
        assert!(log_dir_event_notification(99) < log_dir_event_notification(100));
    }
}
