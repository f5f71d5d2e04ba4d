//! Named background tasks owned by the controller.
//!
//! The controller runs a small number of periodic jobs (currently the
//! preferred-leader rebalance ticker). They are registered by name so the
//! whole set can be torn down in one call at resignation, and a re-scheduled
//! name replaces the previous task instead of leaking it.

use std::collections::HashMap;
use std::future::Future;

use tokio::task::JoinHandle;
use tracing::debug;

/// Registry of named background tasks.
pub struct Scheduler {
    tasks: HashMap<&'static str, JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            tasks: HashMap::new(),
        }
    }

    /// Spawn a named task, aborting any previous task with the same name.
    pub fn schedule<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(previous) = self.tasks.insert(name, tokio::spawn(task)) {
            previous.abort();
        }
        debug!(task = name, "Scheduled background task");
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Abort every task. Called at resignation.
    pub fn shutdown(&mut self) {
        for (name, task) in self.tasks.drain() {
            debug!(task = name, "Stopping background task");
            task.abort();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_aborts_tasks() {
        let mut scheduler = Scheduler::new();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        scheduler.schedule("ticker", async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            flag.store(false, Ordering::SeqCst);
        });
        assert!(scheduler.is_scheduled("ticker"));

        scheduler.shutdown();
        assert!(!scheduler.is_scheduled("ticker"));
        // The task was aborted before it could flip the flag.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_rescheduling_replaces_previous_task() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule("ticker", async {});
        scheduler.schedule("ticker", async {});
        assert_eq!(scheduler.tasks.len(), 1);
    }
}
