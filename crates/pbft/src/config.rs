//! Engine configuration.

use crate::error::ConfigError;
use std::time::Duration;

/// Tunable parameters of a replica.
///
/// The replica set itself (`N`, the local id, peer keys) lives in
/// [`palisade_types::Topology`]; this struct holds the knobs.
#[derive(Debug, Clone)]
pub struct PbftConfig {
    /// Checkpoint period `K`: a state digest is taken every `K` delivered
    /// requests. The log holds `L = 2K` sequence numbers.
    pub checkpoint_period: u64,

    /// Initial per-request progress timeout. Expiry triggers a view change.
    pub request_timeout: Duration,

    /// Initial new-view timeout; doubled on every re-arm while a view
    /// change fails to complete.
    pub new_view_timeout: Duration,

    /// Testing flag: when true the simulation may inject misbehavior for
    /// this replica. The engine itself never consults it.
    pub byzantine: bool,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            checkpoint_period: 10,
            request_timeout: Duration::from_secs(5),
            new_view_timeout: Duration::from_secs(5),
            byzantine: false,
        }
    }
}

impl PbftConfig {
    /// Log length `L = 2K`: the width of the watermark window.
    pub fn log_size(&self) -> u64 {
        2 * self.checkpoint_period
    }

    /// Check the parameters, including the replica count the engine will
    /// run with.
    pub fn validate(&self, replica_count: usize) -> Result<(), ConfigError> {
        if self.checkpoint_period == 0 {
            return Err(ConfigError::ZeroCheckpointPeriod);
        }
        if replica_count < 4 || (replica_count - 1) % 3 != 0 {
            return Err(ConfigError::InvalidReplicaCount(replica_count));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PbftConfig::default().validate(4).is_ok());
        assert!(PbftConfig::default().validate(7).is_ok());
    }

    #[test]
    fn test_rejects_bad_replica_counts() {
        let config = PbftConfig::default();
        for n in [0, 1, 2, 3, 5, 6, 8] {
            assert_eq!(
                config.validate(n),
                Err(ConfigError::InvalidReplicaCount(n)),
                "n = {n}"
            );
        }
    }

    #[test]
    fn test_rejects_zero_checkpoint_period() {
        let config = PbftConfig {
            checkpoint_period: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(4), Err(ConfigError::ZeroCheckpointPeriod));
    }

    #[test]
    fn test_log_size_is_twice_period() {
        let config = PbftConfig {
            checkpoint_period: 10,
            ..Default::default()
        };
        assert_eq!(config.log_size(), 20);
    }
}
