//! Single-consumer event queue serializing all controller decisions.
//!
//! The queue is an unbounded FIFO with exactly one worker task. Every
//! mutation of controller state happens inside the worker, so handlers may
//! freely block on coordination-service round-trips without any locking;
//! suspension stalls later events, which is intentional - it provides total
//! ordering of controller decisions.
//!
//! Producers (watch callbacks, RPC response callbacks, timers, API calls)
//! hold an [`EventSender`], the narrow "enqueue" capability: they can post
//! events but touch nothing else.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::controller::events::{ControllerEvent, ControllerState};
use crate::controller::metrics;

/// Consumes events in enqueue order. Implemented by the controller.
#[async_trait]
pub trait EventProcessor: Send + 'static {
    async fn process(&mut self, event: ControllerEvent);
}

/// Cloneable enqueue capability handed to event producers.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ControllerEvent>,
}

impl EventSender {
    /// Enqueue an event. Returns false when the queue is closed (the
    /// controller has shut down); the event is dropped.
    pub fn put(&self, event: ControllerEvent) -> bool {
        if let Err(e) = self.tx.send(event) {
            debug!(event = ?e.0, "Dropping event, controller queue is closed");
            return false;
        }
        true
    }
}

/// The queue plus its worker task.
pub struct ControllerEventManager {
    sender: EventSender,
    worker: Option<JoinHandle<()>>,
}

impl ControllerEventManager {
    /// Build the processor from its own [`EventSender`], enqueue the initial
    /// [`ControllerEvent::Startup`], and start the worker.
    pub fn start<P, F>(build: F) -> Self
    where
        P: EventProcessor,
        F: FnOnce(EventSender) -> P,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = EventSender { tx };
        let mut processor = build(sender.clone());

        sender.put(ControllerEvent::Startup);

        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let state = event.state();
                let stop = matches!(event, ControllerEvent::Shutdown);

                metrics::CONTROLLER_STATE.set(state.value());
                let timer = metrics::EVENT_PROCESSING_SECONDS
                    .with_label_values(&[state.name()])
                    .start_timer();
                processor.process(event).await;
                timer.observe_duration();
                metrics::CONTROLLER_STATE.set(ControllerState::Idle.value());

                if stop {
                    break;
                }
            }
            debug!("Controller event worker stopped");
        });

        ControllerEventManager {
            sender,
            worker: Some(worker),
        }
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Enqueue [`ControllerEvent::Shutdown`] and join the worker.
    pub async fn shutdown(mut self) {
        self.sender.put(ControllerEvent::Shutdown);
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Controller event worker panicked");
            }
        }
    }
}

impl Drop for ControllerEventManager {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    /// Records the order events arrive in.
    struct Recorder {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventProcessor for Recorder {
        async fn process(&mut self, event: ControllerEvent) {
            match event {
                ControllerEvent::AwaitLatch(latch) => {
                    let _ = latch.send(());
                }
                ControllerEvent::Shutdown => {}
                _ => {
                    self.seen.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_await_latch_fences_previously_enqueued_events() {
        let seen = Arc::new(AtomicUsize::new(0));
        let manager = ControllerEventManager::start(|_| Recorder { seen: seen.clone() });
        let sender = manager.sender();

        for _ in 0..5 {
            sender.put(ControllerEvent::BrokerChange);
        }
        let (latch_tx, latch_rx) = oneshot::channel();
        sender.put(ControllerEvent::AwaitLatch(latch_tx));
        latch_rx.await.unwrap();

        // Startup + 5 broker changes processed before the latch fired.
        assert_eq!(seen.load(Ordering::SeqCst), 6);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_worker_and_closes_the_queue() {
        let seen = Arc::new(AtomicUsize::new(0));
        let manager = ControllerEventManager::start(|_| Recorder { seen: seen.clone() });
        let sender = manager.sender();
        manager.shutdown().await;

        // The queue is closed once the worker exits.
        assert!(!sender.put(ControllerEvent::BrokerChange));
    }
}
