//! crates/study_state_core/src/config.rs
//!
//! Tuning knobs for the in-process state. The service builds this from its environment.

use chrono::Duration;

#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Idle time after which an open study session is closed on the next touch or sweep.
    pub inactivity_timeout: Duration,
    /// Trailing window of transcript entries shown to live consumers.
    pub rolling_window: Duration,
    /// Minimum time between two evictions of one rolling buffer on the append path.
    pub eviction_throttle: Duration,
    /// Idle time after which a mirrored context is dropped from the cache.
    pub context_cache_ttl: Duration,
    /// Idle time after which a lecture's in-memory buffer is dropped.
    pub lecture_buffer_idle: Duration,
    pub janitor_interval: std::time::Duration,
    pub history_limit: i64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::seconds(300),
            rolling_window: Duration::seconds(60),
            eviction_throttle: Duration::seconds(10),
            context_cache_ttl: Duration::seconds(3600),
            lecture_buffer_idle: Duration::seconds(1800),
            janitor_interval: std::time::Duration::from_secs(60),
            history_limit: 50,
        }
    }
}
