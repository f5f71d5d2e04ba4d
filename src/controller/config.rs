//! Controller configuration.

use std::time::Duration;

/// Tunables for the controller core.
///
/// Defaults are safe for production; `validate()` reports every violation so
/// misconfiguration fails loudly at startup instead of misbehaving later.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Whether the periodic preferred-leader rebalance runs.
    ///
    /// Default: true
    pub auto_leader_rebalance_enable: bool,

    /// Per-broker imbalance threshold, in percent.
    ///
    /// When more than this share of a broker's preferred partitions are led
    /// elsewhere, a preferred-replica election is triggered for them.
    ///
    /// Default: 10
    pub leader_imbalance_per_broker_percentage: u32,

    /// How often the rebalance check runs.
    ///
    /// Default: 300 seconds
    pub leader_imbalance_check_interval: Duration,

    /// Cluster-wide default for unclean leader election, used when a topic
    /// carries no override.
    ///
    /// Electing a leader from outside the ISR trades possible data loss for
    /// availability.
    ///
    /// Default: false
    pub unclean_leader_election_enable: bool,

    /// Partitions moved per batch during a controlled shutdown.
    ///
    /// Chunking bounds the size of each leadership wave so a large broker
    /// drains without stalling the event loop on one huge write burst.
    ///
    /// Default: 100
    pub controlled_shutdown_partition_batch_size: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            auto_leader_rebalance_enable: true,
            leader_imbalance_per_broker_percentage: 10,
            leader_imbalance_check_interval: Duration::from_secs(300),
            unclean_leader_election_enable: false,
            controlled_shutdown_partition_batch_size: 100,
        }
    }
}

impl ControllerConfig {
    /// Validate the configuration, returning all violations.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.leader_imbalance_per_broker_percentage > 100 {
            errors.push(format!(
                "leader_imbalance_per_broker_percentage must be <= 100, got {}",
                self.leader_imbalance_per_broker_percentage
            ));
        }
        if self.leader_imbalance_check_interval < Duration::from_secs(1) {
            errors.push(format!(
                "leader_imbalance_check_interval must be >= 1s, got {:?}",
                self.leader_imbalance_check_interval
            ));
        }
        if self.controlled_shutdown_partition_batch_size == 0 {
            errors.push("controlled_shutdown_partition_batch_size must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_reports_every_violation() {
        let config = ControllerConfig {
            leader_imbalance_per_broker_percentage: 250,
            leader_imbalance_check_interval: Duration::from_millis(10),
            controlled_shutdown_partition_batch_size: 0,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
