//! Engine configuration types for Stagehand.
//!
//! `EngineConfig` represents the `stagehand.toml` file that sizes the
//! scheduler's concurrency ceilings, timeouts, and the activity tracker's
//! polling behaviour. Every field has a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum phase executions in flight at once in this worker.
    #[serde(default = "default_max_concurrent_phases")]
    pub max_concurrent_phases: usize,

    /// Maximum units simultaneously holding an activation slot.
    #[serde(default = "default_max_activation_slots")]
    pub max_activation_slots: usize,

    /// Hard ceiling on a single phase execution, in seconds.
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,

    /// Bounded wait for in-flight work, also the idle delay, in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Interval between heartbeat snapshots, in seconds.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default)]
    pub tracker: TrackerConfig,
}

fn default_max_concurrent_phases() -> usize {
    50
}

fn default_max_activation_slots() -> usize {
    10
}

fn default_phase_timeout_secs() -> u64 {
    1800
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_phases: default_max_concurrent_phases(),
            max_activation_slots: default_max_activation_slots(),
            phase_timeout_secs: default_phase_timeout_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Activity tracker polling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Fixed interval between poll cycles, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Backward buffer applied to the poll window start for clock skew.
    #[serde(default = "default_poll_window_buffer_secs")]
    pub poll_window_buffer_secs: u64,

    /// Concurrency limit for per-id fallback queries.
    #[serde(default = "default_fallback_concurrency")]
    pub fallback_concurrency: usize,

    /// Consecutive fully failed cycles before every outstanding id is failed.
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    /// Absolute age after which an activity is resolved as timed out.
    #[serde(default = "default_max_activity_age_secs")]
    pub max_activity_age_secs: u64,

    /// Default timeout for callers waiting on a single activity.
    #[serde(default = "default_wait_timeout_secs")]
    pub default_wait_timeout_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_poll_window_buffer_secs() -> u64 {
    60
}

fn default_fallback_concurrency() -> usize {
    8
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_max_activity_age_secs() -> u64 {
    3600
}

fn default_wait_timeout_secs() -> u64 {
    1800
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            poll_window_buffer_secs: default_poll_window_buffer_secs(),
            fallback_concurrency: default_fallback_concurrency(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            max_activity_age_secs: default_max_activity_age_secs(),
            default_wait_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.default_wait_timeout_secs)
    }
}
