//! Handler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use concord_federation::FetchConfig;
use concord_store::DEFAULT_EVENT_CACHE_CAPACITY;

/// Configuration for the [`EventHandler`](crate::EventHandler).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Verify event signatures against the key ring.
    pub verify_signatures: bool,
    /// How long one request to a remote server may take.
    pub fetch_timeout: Duration,
    /// The most missing prev events fetched to fill a gap.
    pub max_missing_events: usize,
    /// Mark events that fail against the current state as soft-failed.
    pub soft_fail_enabled: bool,
    /// Entries in the event cache in front of the store.
    pub event_cache_capacity: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            verify_signatures: true,
            fetch_timeout: Duration::from_secs(30),
            max_missing_events: 20,
            soft_fail_enabled: true,
            event_cache_capacity: DEFAULT_EVENT_CACHE_CAPACITY,
        }
    }
}

impl HandlerConfig {
    /// The fetch limits derived from this configuration.
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout: self.fetch_timeout,
            ..FetchConfig::default()
        }
    }
}
