//! Per-broker outgoing request queues.
//!
//! The controller never sends RPCs inline: each broker gets its own
//! unbounded queue and sender task, so one slow broker cannot stall the
//! event loop or the queues of other brokers. Responses that the controller
//! cares about (LeaderAndIsr results, StopReplica results during topic
//! deletion) re-enter the event queue instead of invoking controller logic
//! on the sender task.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::controller::event_manager::EventSender;
use crate::controller::events::ControllerEvent;
use crate::controller::requests::{ControlRequest, ControlResponse};
use crate::controller::ControllerResult;
use crate::types::{Broker, BrokerId, PartitionReplica};

/// Transport for control-plane requests. Implementations own connection
/// management and wire encoding.
#[async_trait]
pub trait BrokerRequestSender: Send + Sync {
    async fn send(
        &self,
        broker: &Broker,
        request: ControlRequest,
    ) -> ControllerResult<ControlResponse>;
}

struct BrokerChannel {
    tx: mpsc::UnboundedSender<ControlRequest>,
    task: JoinHandle<()>,
}

/// Owns one outgoing queue per registered broker.
pub struct ControllerChannelManager {
    sender: Arc<dyn BrokerRequestSender>,
    events: EventSender,
    channels: HashMap<BrokerId, BrokerChannel>,
}

impl ControllerChannelManager {
    pub fn new(sender: Arc<dyn BrokerRequestSender>, events: EventSender) -> Self {
        ControllerChannelManager {
            sender,
            events,
            channels: HashMap::new(),
        }
    }

    /// Open queues for every broker known at failover.
    pub fn startup(&mut self, brokers: &[Broker]) {
        for broker in brokers {
            self.add_broker(broker.clone());
        }
    }

    /// Open a queue and sender task for a broker. Idempotent.
    pub fn add_broker(&mut self, broker: Broker) {
        if self.channels.contains_key(&broker.id) {
            return;
        }
        debug!(broker_id = %broker.id, "Opening control channel");

        let broker_id = broker.id;
        let (tx, mut rx) = mpsc::unbounded_channel::<ControlRequest>();
        let sender = self.sender.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let deleting = matches!(
                    &request,
                    ControlRequest::StopReplica(req) if req.delete_partitions
                );
                match sender.send(&broker, request).await {
                    Ok(response) => {
                        forward_response(&events, broker.id, response, deleting);
                    }
                    Err(e) => {
                        warn!(broker_id = %broker.id, error = %e, "Control request failed");
                    }
                }
            }
            debug!(broker_id = %broker.id, "Control channel closed");
        });

        self.channels.insert(broker_id, BrokerChannel { tx, task });
    }

    /// Close a broker's queue. Queued requests already handed to the sender
    /// task drain; new sends are dropped.
    pub fn remove_broker(&mut self, broker_id: BrokerId) {
        if let Some(channel) = self.channels.remove(&broker_id) {
            debug!(broker_id = %broker_id, "Closing control channel");
            drop(channel.tx);
            drop(channel.task);
        }
    }

    /// Enqueue a request for one broker. A missing channel is logged, not an
    /// error: the broker change that removed it is already queued behind
    /// this event and state-machine replays will resend what matters.
    pub fn send_request(&mut self, broker_id: BrokerId, request: ControlRequest) {
        match self.channels.get(&broker_id) {
            Some(channel) => {
                if channel.tx.send(request).is_err() {
                    warn!(broker_id = %broker_id, "Control channel task is gone");
                }
            }
            None => {
                warn!(broker_id = %broker_id, "No control channel for broker, dropping request");
            }
        }
    }

    /// Drop every channel. Called at resignation.
    pub fn shutdown(&mut self) {
        let broker_ids: Vec<BrokerId> = self.channels.keys().copied().collect();
        for broker_id in broker_ids {
            self.remove_broker(broker_id);
        }
    }
}

/// Convert a broker response into the controller events it warrants.
fn forward_response(
    events: &EventSender,
    broker_id: BrokerId,
    response: ControlResponse,
    deleting: bool,
) {
    match response {
        ControlResponse::LeaderAndIsr(response) => {
            events.put(ControllerEvent::LeaderAndIsrResponseReceived {
                broker_id,
                response,
            });
        }
        ControlResponse::StopReplica(response) if deleting => {
            for result in response.partition_results {
                events.put(ControllerEvent::TopicDeletionStopReplicaResult {
                    replica: PartitionReplica::new(result.partition, broker_id),
                    error: result.error,
                });
            }
        }
        ControlResponse::StopReplica(_) | ControlResponse::UpdateMetadata => {}
    }
}

#[cfg(any(test, feature = "test-utilities"))]
pub use recording::RecordingRequestSender;

#[cfg(any(test, feature = "test-utilities"))]
mod recording {
    //! A [`BrokerRequestSender`] that records every request and fabricates
    //! successful responses, for driving the controller in tests.

    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use super::*;
    use crate::controller::requests::{
        LeaderAndIsrResponse, PartitionResult, StopReplicaResponse,
    };
    use crate::types::TopicPartition;

    #[derive(Default)]
    pub struct RecordingRequestSender {
        sent: Mutex<Vec<(BrokerId, ControlRequest)>>,
        /// (broker, partition) pairs that answer LeaderAndIsr with an error,
        /// simulating a failed log directory on that broker.
        failing_replicas: Mutex<BTreeSet<(BrokerId, TopicPartition)>>,
    }

    impl RecordingRequestSender {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make LeaderAndIsr requests for these partitions fail on a broker.
        pub fn fail_replicas_on(&self, broker_id: BrokerId, partitions: &[TopicPartition]) {
            let mut failing = self.failing_replicas.lock().unwrap();
            for partition in partitions {
                failing.insert((broker_id, partition.clone()));
            }
        }

        pub fn all_requests(&self) -> Vec<(BrokerId, ControlRequest)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn requests_to(&self, broker_id: BrokerId) -> Vec<ControlRequest> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(target, _)| *target == broker_id)
                .map(|(_, request)| request.clone())
                .collect()
        }

        pub fn clear(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl BrokerRequestSender for RecordingRequestSender {
        async fn send(
            &self,
            broker: &Broker,
            request: ControlRequest,
        ) -> ControllerResult<ControlResponse> {
            self.sent
                .lock()
                .unwrap()
                .push((broker.id, request.clone()));

            let response = match &request {
                ControlRequest::LeaderAndIsr(req) => {
                    let failing = self.failing_replicas.lock().unwrap();
                    ControlResponse::LeaderAndIsr(LeaderAndIsrResponse {
                        error: None,
                        partition_results: req
                            .partition_states
                            .iter()
                            .map(|state| PartitionResult {
                                partition: state.partition.clone(),
                                error: failing
                                    .contains(&(broker.id, state.partition.clone()))
                                    .then(|| "log dir offline".to_string()),
                            })
                            .collect(),
                    })
                }
                ControlRequest::StopReplica(req) => {
                    ControlResponse::StopReplica(StopReplicaResponse {
                        partition_results: req
                            .partitions
                            .iter()
                            .map(|partition| PartitionResult {
                                partition: partition.clone(),
                                error: None,
                            })
                            .collect(),
                    })
                }
                ControlRequest::UpdateMetadata(_) => ControlResponse::UpdateMetadata,
            };
            Ok(response)
        }
    }
}
