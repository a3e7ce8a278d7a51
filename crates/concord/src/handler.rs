//! The EventHandler: the path every incoming event takes.
//!
//! ```text
//! validate -> verify -> [room lock] fetch missing -> auth (claimed)
//!     -> auth (state before) -> soft-fail (current state) -> persist
//! ```
//!
//! Auth failures are verdicts and get persisted. Errors are returned only
//! when the handler cannot reach a verdict, and then nothing about the
//! event itself is written.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use concord_auth::{auth_types_for_event, check_auth_rules_for_event, check_state_independent_auth_rules, AuthOutcome};
use concord_core::{
    event_type, require_room_version, validate_event_for_room_version, verify_event_signatures,
    AuthError, Event, EventFields, EventId, EventMetadata, EventView, RoomVersion,
    SignatureVerifier, StateDelta, StateMap, StoredEvent, ValidationError, DEFAULT_ROOM_VERSION_ID,
};
use concord_federation::{BoundedClient, FederationClient, FetchError};
use concord_stateres::resolve_state;
use concord_store::{CachedStore, EventMap, EventStore};

use crate::batch::order_batch_by_auth;
use crate::config::HandlerConfig;
use crate::error::{HandlerError, Result};
use crate::locks::RoomLocks;
use crate::redaction::check_redaction_target;

/// What happened to a processed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessedOutcome {
    /// Persisted and part of the room's state and timeline.
    Accepted {
        /// A redaction that may only apply once its target's sender is
        /// confirmed. See [`EventHandler::redaction_applies`].
        recheck_redaction: bool,
    },
    /// Failed the auth rules. Persisted with the reason and kept out of
    /// state.
    Rejected { reason: String },
    /// Allowed at its position in the DAG but not by the room's current
    /// state. Persisted, withheld from clients.
    SoftFailed { reason: String },
    /// Already processed.
    Duplicate,
}

impl ProcessedOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ProcessedOutcome::Accepted { .. })
    }
}

/// Events fetched to fill a gap before the incoming event can be judged.
#[derive(Default)]
struct Gaps {
    /// Auth chain events we did not have. Persisted as outliers.
    outliers: Vec<Event>,
    outlier_ids: HashSet<EventId>,
    /// Missing prev events, shallowest first. Processed as timeline events.
    prevs: Vec<Event>,
}

/// The verdict reached for one event, before persistence.
struct Verdict {
    rejected_reason: Option<String>,
    soft_fail_reason: Option<String>,
    recheck_redaction: bool,
}

/// Runs incoming events through validation, authorization and persistence.
pub struct EventHandler<S, F> {
    store: CachedStore<S>,
    federation: BoundedClient<F>,
    verifier: Arc<dyn SignatureVerifier>,
    config: HandlerConfig,
    room_locks: RoomLocks,
}

impl<S: EventStore, F: FederationClient> EventHandler<S, F> {
    /// Create a new handler.
    pub fn new(store: S, federation: F, verifier: Arc<dyn SignatureVerifier>, config: HandlerConfig) -> Self {
        let store = CachedStore::new(store, config.event_cache_capacity);
        let federation = BoundedClient::new(federation, config.fetch_config());
        Self {
            store,
            federation,
            verifier,
            config,
            room_locks: RoomLocks::new(),
        }
    }

    /// Get the store reference.
    pub fn store(&self) -> &CachedStore<S> {
        &self.store
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entry Points
    // ─────────────────────────────────────────────────────────────────────────

    /// Process one event received from another server.
    ///
    /// Missing auth events and prev events are fetched first. If they
    /// cannot be fetched the event is left undecided and the fetch error
    /// is returned.
    #[instrument(skip_all, fields(event_id = %event.event_id(), room = %event.room_id()))]
    pub async fn process_incoming(&self, event: Event) -> Result<ProcessedOutcome> {
        let room_version = self.room_version_for(&event).await?;
        let event = self.validate(room_version, event)?;

        let _guard = self.room_locks.lock(event.room_id()).await;
        if self.is_duplicate(event.event_id()).await? {
            debug!("already processed");
            return Ok(ProcessedOutcome::Duplicate);
        }

        let gaps = self.fill_gaps(room_version, &event).await?;
        self.persist_outliers(room_version, gaps.outliers).await?;
        for prev in gaps.prevs {
            let outcome = self.process_timeline(room_version, prev).await?;
            debug!(?outcome, "processed missing prev event");
        }
        self.process_timeline(room_version, event).await
    }

    /// Process a batch of events, each after the batch members it names as
    /// auth events.
    ///
    /// Stops at the first event that cannot be decided. Events before it
    /// stay persisted.
    #[instrument(skip_all, fields(len = events.len()))]
    pub async fn process_batch(&self, events: Vec<Event>) -> Result<Vec<(EventId, ProcessedOutcome)>> {
        let ordered = order_batch_by_auth(events)?;
        let mut outcomes = Vec::with_capacity(ordered.len());
        for event in ordered {
            let event_id = event.event_id().clone();
            let outcome = self.process_incoming(event).await?;
            outcomes.push((event_id, outcome));
        }
        Ok(outcomes)
    }

    /// Whether an accepted redaction may now be applied to its target.
    ///
    /// Clears the redaction's recheck flag once the target is known and was
    /// sent from the redacter's server. Returns `false` while the target is
    /// unknown.
    pub async fn redaction_applies(&self, redaction_id: &EventId) -> Result<bool> {
        let Some(redaction) = self.store.get_event(redaction_id).await? else {
            return Ok(false);
        };
        let metadata = &redaction.metadata;
        if redaction.event_type() != event_type::REDACTION
            || metadata.outlier
            || metadata.rejected_reason.is_some()
            || metadata.soft_failed
        {
            return Ok(false);
        }
        if !metadata.recheck_redaction {
            return Ok(true);
        }

        match check_redaction_target(&self.store, &redaction).await? {
            Some(true) => {
                let cleared = EventMetadata {
                    recheck_redaction: false,
                    ..metadata.clone()
                };
                self.store.update_metadata(redaction_id, &cleared).await?;
                debug!(redaction = %redaction_id, "redaction confirmed against its target");
                Ok(true)
            }
            Some(false) => {
                debug!(redaction = %redaction_id, "redaction target is from another server");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────────────

    async fn room_version_for(&self, event: &Event) -> Result<&'static RoomVersion> {
        if event.event_type() == event_type::CREATE && event.state_key() == Some("") {
            let id = event
                .content()
                .get("room_version")
                .and_then(|v| v.as_str())
                .unwrap_or(DEFAULT_ROOM_VERSION_ID);
            return Ok(require_room_version(id)?);
        }
        self.store
            .get_room_version(event.room_id())
            .await?
            .ok_or_else(|| HandlerError::UnknownRoom(event.room_id().clone()))
    }

    /// Size limits, signatures and the content hash.
    ///
    /// An event whose content does not match its hash is kept in redacted
    /// form.
    fn validate(&self, room_version: &RoomVersion, event: Event) -> Result<Event> {
        validate_event_for_room_version(room_version, &event)?;
        if self.config.verify_signatures {
            verify_event_signatures(room_version, &event, self.verifier.as_ref()).map_err(ValidationError::from)?;
        }
        if !event.content_hash_matches(room_version)? {
            warn!(event_id = %event.event_id(), "content hash mismatch, redacting");
            return Ok(event.redacted(room_version)?);
        }
        Ok(event)
    }

    /// [`Self::validate`] for fetched events. A bad event from a remote
    /// leaves the incoming event undecided.
    fn validate_fetched(&self, room_version: &RoomVersion, event: Event) -> Result<Event> {
        let event_id = event.event_id().clone();
        self.validate(room_version, event).map_err(|e| match e {
            HandlerError::Validation(_) | HandlerError::Core(_) => {
                HandlerError::Fetch(FetchError::InvalidEvent(format!("{event_id}: {e}")))
            }
            other => other,
        })
    }

    async fn is_duplicate(&self, event_id: &EventId) -> Result<bool> {
        Ok(matches!(
            self.store.get_metadata(event_id).await?,
            Some(metadata) if !metadata.outlier
        ))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Filling Gaps
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch unknown auth events and prev events without state.
    ///
    /// Prev events are followed breadth-first until every branch reaches an
    /// event with state, at most `max_missing_events` of them.
    async fn fill_gaps(&self, room_version: &RoomVersion, event: &Event) -> Result<Gaps> {
        let mut gaps = Gaps::default();
        self.fetch_missing_auth(room_version, event, &mut gaps).await?;

        let mut seen: HashSet<EventId> = event.prev_event_ids().iter().cloned().collect();
        let mut queue: VecDeque<EventId> = event.prev_event_ids().iter().cloned().collect();
        while let Some(prev_id) = queue.pop_front() {
            if self.store.get_state_at(&prev_id).await?.is_some() {
                continue;
            }
            if gaps.prevs.len() >= self.config.max_missing_events {
                warn!(event_id = %event.event_id(), "too many missing prev events");
                return Err(HandlerError::Unprocessable {
                    event_id: event.event_id().clone(),
                    reason: format!("more than {} missing prev events", self.config.max_missing_events),
                });
            }

            debug!(prev = %prev_id, "fetching missing prev event");
            let prev = self.federation.fetch_event(&prev_id, room_version).await?;
            let prev = self.validate_fetched(room_version, prev)?;
            self.fetch_missing_auth(room_version, &prev, &mut gaps).await?;
            for id in prev.prev_event_ids() {
                if seen.insert(id.clone()) {
                    queue.push_back(id.clone());
                }
            }
            gaps.prevs.push(prev);
        }

        gaps.prevs
            .sort_by(|a, b| (a.depth(), a.event_id()).cmp(&(b.depth(), b.event_id())));
        Ok(gaps)
    }

    async fn fetch_missing_auth(&self, room_version: &RoomVersion, event: &Event, gaps: &mut Gaps) -> Result<()> {
        let mut missing = Vec::new();
        for id in event.auth_event_ids() {
            if !gaps.outlier_ids.contains(id) && !self.store.has_event(id).await? {
                missing.push(id);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        warn!(event_id = %event.event_id(), ?missing, "missing auth events, fetching auth chain");
        let chain = self
            .federation
            .fetch_missing_auth_chain(event.event_id(), room_version)
            .await?;
        for auth_event in chain {
            if gaps.outlier_ids.contains(auth_event.event_id()) || self.store.has_event(auth_event.event_id()).await? {
                continue;
            }
            let auth_event = self.validate_fetched(room_version, auth_event)?;
            gaps.outlier_ids.insert(auth_event.event_id().clone());
            gaps.outliers.push(auth_event);
        }
        Ok(())
    }

    /// Persist fetched auth chain events as outliers, each checked against
    /// the auth events it claims.
    async fn persist_outliers(&self, room_version: &RoomVersion, outliers: Vec<Event>) -> Result<()> {
        for outlier in order_batch_by_auth(outliers)? {
            let auth_events = self.load_auth_events(&outlier).await?;
            let metadata = match check_claimed_auth(room_version, &outlier, &auth_events) {
                Ok(_) => EventMetadata::outlier(),
                Err(e) => {
                    warn!(event_id = %outlier.event_id(), reason = %e.reason, "rejecting fetched auth event");
                    EventMetadata {
                        outlier: true,
                        ..EventMetadata::rejected(e.reason)
                    }
                }
            };

            self.store.insert_event(&outlier, &metadata).await?;
            if metadata.rejected_reason.is_none() {
                if outlier.event_type() == event_type::CREATE && outlier.state_key() == Some("") {
                    self.store.store_room_version(outlier.room_id(), room_version).await?;
                }
                if outlier.is_state() {
                    self.store.allocate_chain(&outlier).await?;
                }
            }
            debug!(event_id = %outlier.event_id(), "persisted outlier");
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Timeline Processing
    // ─────────────────────────────────────────────────────────────────────────

    /// Judge and persist an event whose prev events all have state.
    ///
    /// The caller holds the room lock.
    async fn process_timeline(&self, room_version: &RoomVersion, event: Event) -> Result<ProcessedOutcome> {
        let existing = self.store.get_metadata(event.event_id()).await?;
        if matches!(&existing, Some(metadata) if !metadata.outlier) {
            return Ok(ProcessedOutcome::Duplicate);
        }

        let auth_events = self.load_auth_events(&event).await?;
        if let Some(missing) = event.auth_event_ids().iter().find(|id| !auth_events.contains_key(*id)) {
            return Err(HandlerError::Unprocessable {
                event_id: event.event_id().clone(),
                reason: format!("auth event {missing} unavailable"),
            });
        }
        let (state_before, base) = self.state_before(room_version, &event).await?;

        let verdict = self.judge(room_version, &event, &auth_events, &state_before).await?;
        self.persist(room_version, &event, existing, &verdict, state_before, base).await?;

        let outcome = if let Some(reason) = verdict.rejected_reason {
            ProcessedOutcome::Rejected { reason }
        } else if let Some(reason) = verdict.soft_fail_reason {
            ProcessedOutcome::SoftFailed { reason }
        } else {
            ProcessedOutcome::Accepted {
                recheck_redaction: verdict.recheck_redaction,
            }
        };
        debug!(event_id = %event.event_id(), ?outcome, "processed event");
        Ok(outcome)
    }

    /// The auth checks, in order: claimed auth events, state before the
    /// event, current state.
    async fn judge(
        &self,
        room_version: &RoomVersion,
        event: &Event,
        auth_events: &HashMap<EventId, StoredEvent>,
        state_before: &StateMap,
    ) -> Result<Verdict> {
        let mut verdict = Verdict {
            rejected_reason: None,
            soft_fail_reason: None,
            recheck_redaction: false,
        };

        if let Err(e) = check_claimed_auth(room_version, event, auth_events) {
            verdict.rejected_reason = Some(into_rejection(event, e)?);
            return Ok(verdict);
        }

        let outcome = match self.check_against_state(room_version, event, state_before).await? {
            Ok(outcome) => outcome,
            Err(e) => {
                verdict.rejected_reason = Some(into_rejection(event, e)?);
                return Ok(verdict);
            }
        };
        if outcome.needs_recheck() {
            verdict.recheck_redaction = check_redaction_target(&self.store, event).await? != Some(true);
        }

        if self.config.soft_fail_enabled && event.event_type() != event_type::CREATE {
            let current = self.store.get_current_state(event.room_id()).await?;
            if !current.is_empty() {
                if let Err(e) = self.check_against_state(room_version, event, &current).await? {
                    if e.is_invariant_violation() {
                        error!(event_id = %event.event_id(), reason = %e.reason, "current state broke auth preconditions");
                        return Err(HandlerError::Invariant(e));
                    }
                    warn!(event_id = %event.event_id(), reason = %e.reason, "soft-failing event");
                    verdict.soft_fail_reason = Some(e.reason);
                }
            }
        }
        Ok(verdict)
    }

    /// Run the auth rules with auth events taken from `state`.
    ///
    /// The outer result carries storage failures, the inner one the verdict.
    async fn check_against_state(
        &self,
        room_version: &RoomVersion,
        event: &Event,
        state: &StateMap,
    ) -> Result<std::result::Result<AuthOutcome, AuthError>> {
        let auth_types = match auth_types_for_event(room_version, event) {
            Ok(auth_types) => auth_types,
            Err(e) => return Ok(Err(e)),
        };
        let ids: Vec<EventId> = auth_types
            .iter()
            .filter_map(|key| state.get(key).cloned())
            .collect();
        let auth_events = self.store.get_events(&ids).await?;
        if auth_events.len() < ids.len() {
            let found: HashSet<&EventId> = auth_events.iter().map(|e| e.event.event_id()).collect();
            let missing: Vec<String> = ids
                .iter()
                .filter(|id| !found.contains(id))
                .map(ToString::to_string)
                .collect();
            warn!(event_id = %event.event_id(), missing = ?missing, "state refers to unknown events");
            return Err(HandlerError::Unprocessable {
                event_id: event.event_id().clone(),
                reason: format!("state events not stored: {}", missing.join(", ")),
            });
        }
        Ok(check_auth_rules_for_event(room_version, event, auth_events.iter()))
    }

    /// The state before an event, and the state after its first prev event
    /// which its own state is stored against.
    async fn state_before(&self, room_version: &RoomVersion, event: &Event) -> Result<(StateMap, Option<StateMap>)> {
        let mut sets = Vec::with_capacity(event.prev_event_ids().len());
        for prev in event.prev_event_ids() {
            let state = self
                .store
                .get_state_at(prev)
                .await?
                .ok_or_else(|| HandlerError::Unprocessable {
                    event_id: event.event_id().clone(),
                    reason: format!("no state for prev event {prev}"),
                })?;
            sets.push(state);
        }

        match sets.len() {
            0 => Ok((StateMap::new(), None)),
            1 => {
                let state = sets.swap_remove(0);
                Ok((state.clone(), Some(state)))
            }
            _ => {
                let resolved = resolve_state(event.room_id(), room_version, &sets, &EventMap::new(), &self.store).await?;
                Ok((resolved, Some(sets.swap_remove(0))))
            }
        }
    }

    async fn load_auth_events(&self, event: &Event) -> Result<HashMap<EventId, StoredEvent>> {
        Ok(self
            .store
            .get_events(event.auth_event_ids())
            .await?
            .into_iter()
            .map(|stored| (stored.event_id().clone(), stored))
            .collect())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    async fn persist(
        &self,
        room_version: &RoomVersion,
        event: &Event,
        existing: Option<EventMetadata>,
        verdict: &Verdict,
        state_before: StateMap,
        base: Option<StateMap>,
    ) -> Result<()> {
        let room_id = event.room_id();
        let event_id = event.event_id();
        let accepted = verdict.rejected_reason.is_none();

        let metadata = EventMetadata {
            outlier: false,
            rejected_reason: verdict.rejected_reason.clone(),
            soft_failed: verdict.soft_fail_reason.is_some(),
            recheck_redaction: verdict.recheck_redaction,
            stream_ordering: existing.as_ref().and_then(|m| m.stream_ordering),
        };
        match existing {
            Some(_) => {
                debug!(%event_id, "de-outliering event");
                self.store.update_metadata(event_id, &metadata).await?;
            }
            None => {
                self.store.insert_event(event, &metadata).await?;
            }
        }

        if accepted && event.event_type() == event_type::CREATE && event.state_key() == Some("") {
            self.store.store_room_version(room_id, room_version).await?;
        }

        let mut state_after = state_before;
        if accepted {
            if let Some(slot) = event.state_slot() {
                state_after.insert(slot, event_id.clone());
            }
        }
        let delta = StateDelta::between(&base.unwrap_or_default(), &state_after);
        self.store
            .store_state_delta(room_id, event_id, event.prev_event_ids().first(), &delta)
            .await?;

        if accepted && event.is_state() {
            self.store.allocate_chain(event).await?;
        }

        if accepted && verdict.soft_fail_reason.is_none() {
            self.update_current_state(room_version, event, state_after).await?;
        }
        Ok(())
    }

    /// Make the event a forward extremity and recompute current state.
    async fn update_current_state(&self, room_version: &RoomVersion, event: &Event, state_after: StateMap) -> Result<()> {
        let room_id = event.room_id();
        let mut extremities: BTreeSet<EventId> = self.store.get_forward_extremities(room_id).await?;
        for prev in event.prev_event_ids() {
            extremities.remove(prev);
        }
        extremities.insert(event.event_id().clone());

        let new_state = if extremities.len() == 1 {
            state_after
        } else {
            let mut sets = Vec::with_capacity(extremities.len());
            for extremity in &extremities {
                if extremity == event.event_id() {
                    sets.push(state_after.clone());
                } else {
                    let state = self.store.get_state_at(extremity).await?.ok_or_else(|| {
                        error!(room = %room_id, extremity = %extremity, "forward extremity has no state");
                        HandlerError::Unprocessable {
                            event_id: event.event_id().clone(),
                            reason: format!("no state for forward extremity {extremity}"),
                        }
                    })?;
                    sets.push(state);
                }
            }
            resolve_state(room_id, room_version, &sets, &EventMap::new(), &self.store).await?
        };

        let current = self.store.get_current_state(room_id).await?;
        let delta = StateDelta::between(&current, &new_state);
        if !delta.is_empty() {
            info!(room = %room_id, extremities = extremities.len(), "current state changed");
            self.store.apply_current_state_delta(room_id, &delta).await?;
        }
        self.store.set_forward_extremities(room_id, &extremities).await?;
        Ok(())
    }
}

/// The auth rules against the event's own claimed auth events.
fn check_claimed_auth(
    room_version: &RoomVersion,
    event: &Event,
    auth_events: &HashMap<EventId, StoredEvent>,
) -> std::result::Result<AuthOutcome, AuthError> {
    check_state_independent_auth_rules(room_version, event, |id| auth_events.get(id))?;
    let claimed = event.auth_event_ids().iter().filter_map(|id| auth_events.get(id));
    check_auth_rules_for_event(room_version, event, claimed)
}

/// The rejection reason for an auth failure, or an error if the failure
/// means the handler broke a precondition.
fn into_rejection(event: &Event, e: AuthError) -> Result<String> {
    if e.is_invariant_violation() {
        error!(event_id = %event.event_id(), reason = %e.reason, "auth precondition violated");
        return Err(HandlerError::Invariant(e));
    }
    info!(event_id = %event.event_id(), reason = %e.reason, "rejecting event");
    Ok(e.reason)
}

impl<S, F> std::fmt::Debug for EventHandler<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandler")
            .field("config", &self.config)
            .field("rooms", &self.room_locks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{RoomVersion, StateKey};
    use concord_federation::MemoryFederation;
    use concord_store::MemoryStore;
    use concord_testkit::fixtures::{key_ring, room_id, TestRoom, ALICE, BOB};

    fn handler() -> (EventHandler<MemoryStore, Arc<MemoryFederation>>, Arc<MemoryFederation>) {
        let federation = MemoryFederation::new();
        let handler = EventHandler::new(
            MemoryStore::new(),
            federation.clone(),
            Arc::new(key_ring()),
            HandlerConfig::default(),
        );
        (handler, federation)
    }

    #[tokio::test]
    async fn test_room_from_scratch() {
        let (handler, _) = handler();
        let mut room = TestRoom::new(&RoomVersion::V10);
        room.join(BOB);
        room.message(BOB, "hello");

        for event in room.events().to_vec() {
            let outcome = handler.process_incoming(event).await.unwrap();
            assert!(outcome.is_accepted(), "{outcome:?}");
        }

        let store = handler.store();
        assert_eq!(store.get_current_state(&room_id()).await.unwrap(), room.state_map());
        assert_eq!(
            store.get_forward_extremities(&room_id()).await.unwrap(),
            room.heads()
        );
    }

    #[tokio::test]
    async fn test_unknown_room() {
        let (handler, _) = handler();
        let mut room = TestRoom::new(&RoomVersion::V10);
        let message = room.message(ALICE, "hi");
        let err = handler.process_incoming(message).await.unwrap_err();
        assert!(matches!(err, HandlerError::UnknownRoom(_)));
    }

    #[tokio::test]
    async fn test_duplicate() {
        let (handler, _) = handler();
        let room = TestRoom::new(&RoomVersion::V10);
        let create = room.create_event().clone();
        handler.process_incoming(create.clone()).await.unwrap();
        let outcome = handler.process_incoming(create).await.unwrap();
        assert_eq!(outcome, ProcessedOutcome::Duplicate);
    }

    async fn seeded(handler: &EventHandler<MemoryStore, Arc<MemoryFederation>>, room: &TestRoom) {
        for event in room.events().to_vec() {
            assert!(handler.process_incoming(event).await.unwrap().is_accepted());
        }
    }

    #[tokio::test]
    async fn test_state_naming_unstored_event_is_unprocessable() {
        let (handler, _) = handler();
        let mut room = TestRoom::new(&RoomVersion::V10);
        room.join(BOB);
        seeded(&handler, &room).await;

        // The state after the last event points its power levels elsewhere.
        let mut state = room.state_map();
        state.insert(
            StateKey::new(event_type::POWER_LEVELS, ""),
            EventId::parse("$unstored").unwrap(),
        );
        let full = StateDelta::between(&StateMap::new(), &state);
        handler
            .store()
            .store_state_delta(&room_id(), room.last().event_id(), None, &full)
            .await
            .unwrap();

        let message = room.message(BOB, "hi");
        let err = handler.process_incoming(message.clone()).await.unwrap_err();
        assert!(matches!(err, HandlerError::Unprocessable { .. }), "{err}");
        assert!(!handler.store().has_event(message.event_id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_extremity_without_state_is_unprocessable() {
        let (handler, _) = handler();
        let mut room = TestRoom::new(&RoomVersion::V10);
        seeded(&handler, &room).await;

        let mut extremities = room.heads();
        extremities.insert(EventId::parse("$stateless").unwrap());
        handler
            .store()
            .set_forward_extremities(&room_id(), &extremities)
            .await
            .unwrap();

        let current = handler.store().get_current_state(&room_id()).await.unwrap();
        let err = handler.process_incoming(room.message(ALICE, "hi")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Unprocessable { .. }), "{err}");
        assert_eq!(handler.store().get_current_state(&room_id()).await.unwrap(), current);
    }
}
