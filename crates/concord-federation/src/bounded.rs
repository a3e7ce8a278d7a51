//! Time and size limits on federation requests.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use concord_core::{Event, EventId, RoomVersion};

use crate::client::FederationClient;
use crate::error::{FetchError, Result};

/// Configuration for fetching from remote servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// How long a single request may take.
    pub timeout: Duration,
    /// The longest auth chain accepted from a remote.
    pub max_auth_chain_len: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_auth_chain_len: 10_000,
        }
    }
}

/// A client whose requests give up after [`FetchConfig::timeout`].
///
/// A request that runs out of time is dropped and reported as
/// [`FetchError::Timeout`]; nothing is guessed in its place.
pub struct BoundedClient<C> {
    inner: C,
    config: FetchConfig,
}

impl<C: FederationClient> BoundedClient<C> {
    pub fn new(inner: C, config: FetchConfig) -> Self {
        Self { inner, config }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: FederationClient> FederationClient for BoundedClient<C> {
    async fn fetch_event(&self, event_id: &EventId, room_version: &RoomVersion) -> Result<Event> {
        match tokio::time::timeout(self.config.timeout, self.inner.fetch_event(event_id, room_version)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(event_id = %event_id, timeout = ?self.config.timeout, "event fetch timed out");
                Err(FetchError::Timeout {
                    event_id: event_id.clone(),
                    after: self.config.timeout,
                })
            }
        }
    }

    async fn fetch_missing_auth_chain(&self, event_id: &EventId, room_version: &RoomVersion) -> Result<Vec<Event>> {
        let fetch = self.inner.fetch_missing_auth_chain(event_id, room_version);
        let chain = match tokio::time::timeout(self.config.timeout, fetch).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(event_id = %event_id, timeout = ?self.config.timeout, "auth chain fetch timed out");
                return Err(FetchError::Timeout {
                    event_id: event_id.clone(),
                    after: self.config.timeout,
                });
            }
        };
        if chain.len() > self.config.max_auth_chain_len {
            warn!(event_id = %event_id, len = chain.len(), "auth chain too long");
            return Err(FetchError::TooLarge {
                len: chain.len(),
                max: self.config.max_auth_chain_len,
            });
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFederation;
    use concord_core::EventView;
    use concord_testkit::fixtures::{TestRoom, ALICE};

    #[tokio::test(start_paused = true)]
    async fn test_slow_remote_times_out() {
        let room = TestRoom::new(&RoomVersion::V10);
        let federation = MemoryFederation::new();
        federation.publish_all(room.events(), room.version).await;
        federation.set_latency(Some(Duration::from_secs(60))).await;

        let client = BoundedClient::new(
            federation.clone(),
            FetchConfig {
                timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );
        let err = client.fetch_event(room.last().event_id(), room.version).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout { after, .. } if after == Duration::from_secs(5)));

        federation.set_latency(None).await;
        let event = client.fetch_event(room.last().event_id(), room.version).await.unwrap();
        assert_eq!(event.event_id(), room.last().event_id());
    }

    #[tokio::test]
    async fn test_auth_chain_limit() {
        let mut room = TestRoom::new(&RoomVersion::V10);
        let message = room.message(ALICE, "hi");
        let federation = MemoryFederation::new();
        federation.publish_all(room.events(), room.version).await;

        let strict = BoundedClient::new(
            federation.clone(),
            FetchConfig {
                max_auth_chain_len: 2,
                ..Default::default()
            },
        );
        let err = strict
            .fetch_missing_auth_chain(message.event_id(), room.version)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { len: 3, max: 2 }));

        let lenient = BoundedClient::new(federation, FetchConfig::default());
        let chain = lenient
            .fetch_missing_auth_chain(message.event_id(), room.version)
            .await
            .unwrap();
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_config_from_json() {
        let config: FetchConfig = serde_json::from_str(r#"{"max_auth_chain_len": 50}"#).unwrap();
        assert_eq!(config.max_auth_chain_len, 50);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }
}
