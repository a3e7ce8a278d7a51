//! A simple in-memory federation for testing.
//!
//! Stands in for every remote server at once: events are published as PDU
//! JSON and parsed again on fetch, so callers see what a real remote would
//! send. Failures and latency can be injected.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use concord_core::{Event, EventId, EventView, RoomVersion};

use crate::client::FederationClient;
use crate::error::{FetchError, Result};

/// Shared state of the in-memory federation.
#[derive(Default)]
pub struct MemoryFederation {
    /// Published events as PDU JSON.
    events: RwLock<HashMap<EventId, Value>>,
    /// Delay applied to every request.
    latency: RwLock<Option<Duration>>,
    unreachable: AtomicBool,
    requests: AtomicUsize,
}

impl MemoryFederation {
    /// Create a new memory federation.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make an event available to fetch.
    pub async fn publish(&self, event: &Event, room_version: &RoomVersion) {
        let pdu = Value::Object(event.pdu_json(room_version));
        self.events.write().await.insert(event.event_id().clone(), pdu);
    }

    pub async fn publish_all<'a, I>(&self, events: I, room_version: &RoomVersion)
    where
        I: IntoIterator<Item = &'a Event>,
    {
        for event in events {
            self.publish(event, room_version).await;
        }
    }

    /// Replace the published JSON of an event, e.g. with a tampered copy.
    pub async fn publish_raw(&self, event_id: EventId, pdu: Value) {
        self.events.write().await.insert(event_id, pdu);
    }

    /// Fail every request with a transport error while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay every request.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().await = latency;
    }

    /// Requests served so far, failed ones included.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    async fn begin_request(&self) -> Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.read().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(FetchError::Transport("remote unreachable".into()));
        }
        Ok(())
    }

    async fn parse(&self, event_id: &EventId, room_version: &RoomVersion) -> Result<Event> {
        let pdu = self
            .events
            .read()
            .await
            .get(event_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(event_id.clone()))?;
        let event = Event::from_pdu_json(room_version, pdu).map_err(|e| FetchError::InvalidEvent(e.to_string()))?;
        if event.event_id() != event_id {
            return Err(FetchError::InvalidEvent(format!(
                "asked for {}, received {}",
                event_id,
                event.event_id()
            )));
        }
        Ok(event)
    }
}

#[async_trait]
impl FederationClient for MemoryFederation {
    async fn fetch_event(&self, event_id: &EventId, room_version: &RoomVersion) -> Result<Event> {
        self.begin_request().await?;
        debug!(event_id = %event_id, "serving event");
        self.parse(event_id, room_version).await
    }

    async fn fetch_missing_auth_chain(&self, event_id: &EventId, room_version: &RoomVersion) -> Result<Vec<Event>> {
        self.begin_request().await?;
        let root = self.parse(event_id, room_version).await?;

        let mut seen = BTreeSet::new();
        let mut stack: Vec<EventId> = root.auth_event_ids().to_vec();
        let mut chain = Vec::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let event = self.parse(&id, room_version).await?;
            stack.extend(event.auth_event_ids().iter().cloned());
            chain.push(event);
        }
        chain.sort_by(|a, b| (a.depth(), a.event_id()).cmp(&(b.depth(), b.event_id())));
        debug!(event_id = %event_id, len = chain.len(), "serving auth chain");
        Ok(chain)
    }
}
