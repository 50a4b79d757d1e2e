//! Manager configuration.

use std::time::Duration;

/// Configuration for a replication manager.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Process-wide identifier; `None` skips duplicate detection.
    pub id: Option<String>,
    /// Allow several live managers with the same id.
    pub allow_duplicate_id: bool,
    /// How often replicas are polled for external changes. `None` pauses
    /// polling until a period is configured again.
    pub poll_period: Option<Duration>,
    /// How soon an unset poll period is looked at again.
    pub recheck_interval: Duration,
    /// Upper bound for each individual replica call. `None` waits for the
    /// backend's own transport to give up.
    pub io_timeout: Option<Duration>,
    /// Length bound of the recent-value window.
    pub recent_values_len: Option<usize>,
    /// Age bound of the recent-value window.
    pub recent_values_age: Option<Duration>,
    /// Adopt the shared value without consulting the policy when every
    /// diverging replica agrees and at least one of them is in sync.
    pub agreement_fast_path: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            id: None,
            allow_duplicate_id: false,
            poll_period: Some(Duration::from_secs(60)),
            recheck_interval: Duration::from_secs(5),
            io_timeout: None,
            recent_values_len: Some(20),
            recent_values_age: Some(Duration::from_secs(60 * 60)),
            agreement_fast_path: true,
        }
    }
}

/// Builder for manager configuration.
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = Some(id.into());
        self
    }

    pub fn allow_duplicate_id(mut self, allowed: bool) -> Self {
        self.config.allow_duplicate_id = allowed;
        self
    }

    pub fn poll_period(mut self, period: Option<Duration>) -> Self {
        self.config.poll_period = period;
        self
    }

    pub fn recheck_interval(mut self, interval: Duration) -> Self {
        self.config.recheck_interval = interval;
        self
    }

    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.io_timeout = timeout;
        self
    }

    pub fn recent_values(mut self, max_len: Option<usize>, max_age: Option<Duration>) -> Self {
        self.config.recent_values_len = max_len;
        self.config.recent_values_age = max_age;
        self
    }

    pub fn agreement_fast_path(mut self, enabled: bool) -> Self {
        self.config.agreement_fast_path = enabled;
        self
    }

    pub fn build(self) -> ManagerConfig {
        self.config
    }
}

impl Default for ManagerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ManagerConfigBuilder::new()
            .id("settings")
            .allow_duplicate_id(true)
            .poll_period(None)
            .recheck_interval(Duration::from_millis(250))
            .io_timeout(Some(Duration::from_secs(3)))
            .recent_values(Some(4), None)
            .agreement_fast_path(false)
            .build();

        assert_eq!(config.id.as_deref(), Some("settings"));
        assert!(config.allow_duplicate_id);
        assert_eq!(config.poll_period, None);
        assert_eq!(config.recheck_interval, Duration::from_millis(250));
        assert_eq!(config.io_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.recent_values_len, Some(4));
        assert_eq!(config.recent_values_age, None);
        assert!(!config.agreement_fast_path);
    }

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.poll_period, Some(Duration::from_secs(60)));
        assert_eq!(config.io_timeout, None);
        assert!(config.agreement_fast_path);
    }
}
