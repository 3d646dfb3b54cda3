use {
    serde::{Deserialize, Serialize},
    std::time::Duration,
    tracing::warn,
};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_STALENESS_MULTIPLIER: u32 = 2;

///
/// Timing knobs of the locking protocol.
///
/// Missing fields fall back to their defaults when deserialized.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    ///
    /// Delay between two renewals of a held lock.
    pub heartbeat_interval: Duration,
    ///
    /// Lease claimed on acquisition. A holder silent for `staleness_multiplier * lease_duration` is considered dead.
    pub lease_duration: Duration,
    ///
    /// Records with no heartbeat for this long are garbage collected on every acquisition, whatever their lease.
    pub retention: Duration,
    pub staleness_multiplier: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            lease_duration: DEFAULT_LEASE_DURATION,
            retention: DEFAULT_RETENTION,
            staleness_multiplier: DEFAULT_STALENESS_MULTIPLIER,
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("heartbeat interval must be greater than zero")]
    ZeroHeartbeatInterval,
    #[error("heartbeat interval ({heartbeat_interval:?}) must be shorter than the lease duration ({lease_duration:?})")]
    HeartbeatNotShorterThanLease {
        heartbeat_interval: Duration,
        lease_duration: Duration,
    },
    #[error("staleness multiplier must be at least 1")]
    ZeroStalenessMultiplier,
}

impl LockConfig {
    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_staleness_multiplier(mut self, staleness_multiplier: u32) -> Self {
        self.staleness_multiplier = staleness_multiplier;
        self
    }

    ///
    /// Window after which a silent holder is considered dead.
    ///
    pub fn staleness_window(&self) -> Duration {
        self.lease_duration.saturating_mul(self.staleness_multiplier)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        if self.heartbeat_interval >= self.lease_duration {
            return Err(ConfigError::HeartbeatNotShorterThanLease {
                heartbeat_interval: self.heartbeat_interval,
                lease_duration: self.lease_duration,
            });
        }
        if self.staleness_multiplier == 0 {
            return Err(ConfigError::ZeroStalenessMultiplier);
        }
        if self.retention <= self.staleness_window() {
            warn!(
                "retention window {:?} is not longer than the staleness window {:?}, live locks may be garbage collected",
                self.retention,
                self.staleness_window()
            );
        }
        Ok(())
    }
}
