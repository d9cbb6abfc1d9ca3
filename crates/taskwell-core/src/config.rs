//! Scheduler configuration, deserializable from any serde source with
//! environment-variable fallbacks at startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime configuration for the scheduling core.
///
/// Every field has a sensible default so the scheduler works out-of-the-box
/// with `SchedulerConfig::default()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Bound on concurrently running `Parallel` tasks. 0 = the host's
    /// logical core count.
    #[serde(default = "default_max_parallel")]
    pub max_parallel_tasks: usize,

    /// Dispatch loop tick interval in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_interval_ms: u64,

    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_parallel() -> usize {
    0
}
fn default_tick_ms() -> u64 {
    100
}
fn default_event_capacity() -> usize {
    256
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: default_max_parallel(),
            tick_interval_ms: default_tick_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl SchedulerConfig {
    /// Build a config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            max_parallel_tasks: parse_env("TASKWELL_MAX_PARALLEL", default_max_parallel()),
            tick_interval_ms: parse_env("TASKWELL_TICK_MS", default_tick_ms()),
            event_capacity: parse_env("TASKWELL_EVENT_CAPACITY", default_event_capacity()),
        }
    }

    /// The dispatch tick as a `Duration`; clamped to at least 1 ms.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_parallel_tasks, 0);
        assert_eq!(config.tick_interval_ms, 100);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn tick_interval_clamped() {
        let config = SchedulerConfig {
            tick_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_millis(1));
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{ "max_parallel_tasks": 8 }"#).expect("partial config");
        assert_eq!(config.max_parallel_tasks, 8);
        assert_eq!(config.tick_interval_ms, 100);
    }
}
