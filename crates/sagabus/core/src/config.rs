//! Environment-based configuration loaders.

use crate::subscriber::SubscriberConfig;
use std::time::Duration;
use tracing::warn;

/// Reads engine configuration from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig;

impl EnvConfig {
    /// Load [`SubscriberConfig`], falling back to defaults for unset or
    /// unparsable variables.
    ///
    /// Recognized variables:
    /// - `SAGABUS_MAX_TASKS_IN_PROGRESS`
    /// - `SAGABUS_PROCESSING_TIMEOUT_SECS`
    /// - `SAGABUS_SHUTDOWN_TIMEOUT_SECS`
    /// - `SAGABUS_SCHEDULE_TIMEOUT_SECS`
    pub fn load_subscriber_config() -> SubscriberConfig {
        let mut config = SubscriberConfig::default();

        if let Some(n) = read_var::<usize>("SAGABUS_MAX_TASKS_IN_PROGRESS") {
            config = config.with_max_tasks_in_progress(n);
        }
        if let Some(secs) = read_var::<u64>("SAGABUS_PROCESSING_TIMEOUT_SECS") {
            config = config.with_package_processing_max_time(Duration::from_secs(secs));
        }
        if let Some(secs) = read_var::<u64>("SAGABUS_SHUTDOWN_TIMEOUT_SECS") {
            config = config.with_graceful_shutdown_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = read_var::<u64>("SAGABUS_SCHEDULE_TIMEOUT_SECS") {
            config = config.with_schedule_timeout(Duration::from_secs(secs));
        }

        config
    }
}

fn read_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_environment() {
        let config = EnvConfig::load_subscriber_config();
        assert_eq!(config.max_tasks_in_progress, 100);
    }

    #[test]
    fn environment_overrides_are_applied() {
        unsafe {
            std::env::set_var("SAGABUS_MAX_TASKS_IN_PROGRESS", "7");
            std::env::set_var("SAGABUS_SCHEDULE_TIMEOUT_SECS", "1");
        }

        let config = EnvConfig::load_subscriber_config();
        assert_eq!(config.max_tasks_in_progress, 7);
        assert_eq!(config.schedule_timeout, Duration::from_secs(1));

        unsafe {
            std::env::remove_var("SAGABUS_MAX_TASKS_IN_PROGRESS");
            std::env::remove_var("SAGABUS_SCHEDULE_TIMEOUT_SECS");
        }
    }

    #[test]
    fn unparsable_values_fall_back_to_defaults() {
        unsafe {
            std::env::set_var("SAGABUS_SHUTDOWN_TIMEOUT_SECS", "soon");
        }

        let config = EnvConfig::load_subscriber_config();
        assert_eq!(config.graceful_shutdown_timeout, Duration::from_secs(120));

        unsafe {
            std::env::remove_var("SAGABUS_SHUTDOWN_TIMEOUT_SECS");
        }
    }
}
