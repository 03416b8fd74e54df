//! Tunables for the sync layer

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Latency buckets for the active quality probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyThresholds {
    /// Below this is `Excellent`
    pub excellent_ms: u64,
    /// Below this is `Good`
    pub good_ms: u64,
    /// Below this is `Fair`, otherwise `Poor`
    pub fair_ms: u64,
}

impl Default for LatencyThresholds {
    fn default() -> Self {
        Self {
            excellent_ms: 50,
            good_ms: 150,
            fair_ms: 300,
        }
    }
}

/// Configuration shared by every component of a [`crate::SyncClient`].
///
/// Missing keys in a config file fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Messages per live window and per `load_older` page
    pub message_page_size: usize,
    /// Optional cap on the match list query
    pub match_list_limit: Option<usize>,
    /// Concurrent partner profile lookups after a match list refresh
    pub profile_fanout: usize,
    /// Bound on establishing a live listener
    pub listen_timeout_ms: u64,
    /// Bound on `wait_for_connection`
    pub connect_timeout_ms: u64,
    /// Bound on out-of-band reachability and latency probes
    pub probe_timeout_ms: u64,
    /// Capacity of broadcast event channels
    pub event_capacity: usize,
    pub latency: LatencyThresholds,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            message_page_size: 50,
            match_list_limit: None,
            profile_fanout: 8,
            listen_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            probe_timeout_ms: 3_000,
            event_capacity: 256,
            latency: LatencyThresholds::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        let config: SyncConfig =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.message_page_size == 0 {
            return Err(SyncError::Config("message_page_size must be > 0".into()));
        }
        if self.profile_fanout == 0 {
            return Err(SyncError::Config("profile_fanout must be > 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::Config("event_capacity must be > 0".into()));
        }
        let t = &self.latency;
        if !(t.excellent_ms < t.good_ms && t.good_ms < t.fair_ms) {
            return Err(SyncError::Config(format!(
                "latency thresholds must increase: {} < {} < {}",
                t.excellent_ms, t.good_ms, t.fair_ms
            )));
        }
        Ok(())
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
