//! Retry policies for coordination-service write loops.
//!
//! Policies are built with the `backon` crate so every retry site shares the
//! same jittered-exponential shape instead of hand-rolled sleep loops.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Policy for leadership compare-and-swap loops
/// (`update_leader_epoch`, `remove_replica_from_isr`).
///
/// Characteristics:
/// - Short initial delay (10ms): conflicts come from brokers shrinking the
///   ISR concurrently and resolve quickly
/// - Short max delay (500ms) and few retries (5): exhaustion is harmless,
///   the next ISR-change event replays the update
/// - Includes jitter to avoid lock-step retries across partitions
pub fn leadership_cas_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(5)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use backon::Retryable;

    #[tokio::test]
    async fn test_cas_policy_retries_until_success() {
        let attempts = AtomicU32::new(0);

        let result = (|| async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "conflict"))
            } else {
                Ok(7)
            }
        })
        .retry(leadership_cas_policy())
        .when(|_| true)
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cas_policy_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), std::io::Error> = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "conflict"))
        })
        .retry(leadership_cas_policy())
        .when(|_| true)
        .await;

        assert!(result.is_err());
        // Initial attempt + 5 retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
    }
}
