//! End-to-end tests of the event handler.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use concord::core::{event_type, EventBuilder, EventFields, EventView, ServerKeypair, UserId};
use concord::federation::{FetchError, MemoryFederation};
use concord::store::{EventStore, MemoryStore, SqliteStore};
use concord::{
    resolve_state, Event, EventHandler, HandlerConfig, HandlerError, ProcessedOutcome, RoomVersion,
};
use concord_testkit::fixtures::{key_ring, merged_event_map, room_id, TestRoom, ALICE, BOB, ZARA};
use concord_testkit::scenarios;

type MemoryHandler = EventHandler<MemoryStore, Arc<MemoryFederation>>;

fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

fn memory_handler(config: HandlerConfig) -> (MemoryHandler, Arc<MemoryFederation>) {
    setup_logging();
    let federation = MemoryFederation::new();
    let handler = EventHandler::new(MemoryStore::new(), federation.clone(), Arc::new(key_ring()), config);
    (handler, federation)
}

async fn process_all<S: EventStore>(handler: &EventHandler<S, Arc<MemoryFederation>>, events: &[Event]) {
    for event in events {
        let outcome = handler.process_incoming(event.clone()).await.unwrap();
        assert!(
            outcome.is_accepted() || outcome == ProcessedOutcome::Duplicate,
            "{} was {:?}",
            event.event_id(),
            outcome
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Verdicts
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_non_member_message_rejected() {
    let (handler, _) = memory_handler(HandlerConfig::default());
    let mut room = TestRoom::new(&RoomVersion::V10);
    process_all(&handler, room.events()).await;
    let heads = room.heads();

    let intruder = room.event(BOB, event_type::MESSAGE, None, json!({"body": "let me in"}));
    let outcome = handler.process_incoming(intruder.clone()).await.unwrap();
    assert!(matches!(outcome, ProcessedOutcome::Rejected { .. }), "{outcome:?}");

    let store = handler.store();
    let metadata = store.get_metadata(intruder.event_id()).await.unwrap().unwrap();
    assert!(metadata.rejected_reason.is_some());
    assert!(!metadata.outlier);
    // Kept in the DAG with state, out of the room's current state.
    assert!(store.get_state_at(intruder.event_id()).await.unwrap().is_some());
    assert_eq!(store.get_current_state(&room_id()).await.unwrap(), room.state_map());
    assert_eq!(store.get_forward_extremities(&room_id()).await.unwrap(), heads);
}

#[tokio::test]
async fn test_banned_sender_soft_failed() {
    let (handler, _) = memory_handler(HandlerConfig::default());
    let mut room = TestRoom::new(&RoomVersion::V10);
    room.join(BOB);
    let mut stale = room.fork();
    let ban = room.send_member(ALICE, BOB, "ban");
    process_all(&handler, room.events()).await;

    // Bob's message was fine where he sent it, but he is banned now.
    let message = stale.message(BOB, "from before the ban");
    let outcome = handler.process_incoming(message.clone()).await.unwrap();
    assert!(matches!(outcome, ProcessedOutcome::SoftFailed { .. }), "{outcome:?}");

    let store = handler.store();
    let metadata = store.get_metadata(message.event_id()).await.unwrap().unwrap();
    assert!(metadata.soft_failed);
    assert!(metadata.rejected_reason.is_none());
    assert_eq!(
        store.get_forward_extremities(&room_id()).await.unwrap(),
        [ban.event_id().clone()].into_iter().collect()
    );
}

#[tokio::test]
async fn test_soft_fail_disabled() {
    let (handler, _) = memory_handler(HandlerConfig {
        soft_fail_enabled: false,
        ..Default::default()
    });
    let mut room = TestRoom::new(&RoomVersion::V10);
    room.join(BOB);
    let mut stale = room.fork();
    room.send_member(ALICE, BOB, "ban");
    process_all(&handler, room.events()).await;

    let outcome = handler
        .process_incoming(stale.message(BOB, "from before the ban"))
        .await
        .unwrap();
    assert!(outcome.is_accepted(), "{outcome:?}");
}

#[tokio::test]
async fn test_duplicate_is_reported() {
    let (handler, _) = memory_handler(HandlerConfig::default());
    let room = TestRoom::new(&RoomVersion::V10);
    process_all(&handler, room.events()).await;

    let outcome = handler.process_incoming(room.last().clone()).await.unwrap();
    assert_eq!(outcome, ProcessedOutcome::Duplicate);
}

#[tokio::test]
async fn test_concurrent_copies_processed_once() {
    let (handler, _) = memory_handler(HandlerConfig::default());
    let mut room = TestRoom::new(&RoomVersion::V10);
    let message = room.message(ALICE, "hi");
    let (setup, rest) = room.events().split_at(room.events().len() - 1);
    process_all(&handler, setup).await;
    assert_eq!(rest[0].event_id(), message.event_id());

    let (a, b) = tokio::join!(
        handler.process_incoming(message.clone()),
        handler.process_incoming(message.clone())
    );
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| o.is_accepted());
    assert_eq!(outcomes[0], ProcessedOutcome::Duplicate);
    assert!(outcomes[1].is_accepted());
}

// ─────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_signature_from_wrong_server() {
    let (handler, _) = memory_handler(HandlerConfig::default());
    let room = TestRoom::new(&RoomVersion::V10);
    process_all(&handler, room.events()).await;

    let forged = EventBuilder::new(room_id(), UserId::parse(ALICE).unwrap(), event_type::MESSAGE)
        .content(json!({"body": "not really alice"}))
        .prev_events(room.heads().into_iter().collect())
        .auth_events(room.last().auth_event_ids().to_vec())
        .depth(room.last().depth() + 1)
        .origin_server_ts(99_000)
        .build(room.version, &ServerKeypair::derive("evil.org"))
        .unwrap();

    let err = handler.process_incoming(forged.clone()).await.unwrap_err();
    assert!(matches!(err, HandlerError::Validation(_)), "{err}");
    assert!(!handler.store().has_event(forged.event_id()).await.unwrap());
}

#[tokio::test]
async fn test_content_hash_mismatch_stored_redacted() {
    let (handler, _) = memory_handler(HandlerConfig::default());
    let mut room = TestRoom::new(&RoomVersion::V10);
    let message = room.message(ALICE, "original");
    let (setup, _) = room.events().split_at(room.events().len() - 1);
    process_all(&handler, setup).await;

    let mut pdu = message.pdu_json(room.version);
    pdu.insert("content".into(), json!({"msgtype": "m.text", "body": "edited in transit"}));
    let tampered = Event::from_pdu_json(room.version, Value::Object(pdu)).unwrap();
    // Content is not covered by the reference hash.
    assert_eq!(tampered.event_id(), message.event_id());

    let outcome = handler.process_incoming(tampered).await.unwrap();
    assert!(outcome.is_accepted(), "{outcome:?}");
    let stored = handler.store().get_event(message.event_id()).await.unwrap().unwrap();
    assert!(stored.content().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────
// Filling Gaps
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_missing_history_fetched() -> anyhow::Result<()> {
    let (handler, federation) = memory_handler(HandlerConfig::default());
    let mut room = TestRoom::new(&RoomVersion::V10);
    let message = room.message(ALICE, "hi");
    federation.publish_all(room.events(), room.version).await;

    // Only the create event is known locally.
    handler.process_incoming(room.create_event().clone()).await?;

    let outcome = handler.process_incoming(message.clone()).await?;
    assert!(outcome.is_accepted(), "{outcome:?}");
    // One auth chain request, then the join, power levels and join rules.
    assert_eq!(federation.request_count(), 4);

    let store = handler.store();
    for event in room.events() {
        let metadata = store.get_metadata(event.event_id()).await?.unwrap();
        assert!(!metadata.outlier, "{} is still an outlier", event.event_id());
        assert!(metadata.rejected_reason.is_none());
    }
    assert_eq!(store.get_current_state(&room_id()).await?, room.state_map());
    assert_eq!(store.get_forward_extremities(&room_id()).await?, room.heads());
    Ok(())
}

#[tokio::test]
async fn test_auth_chain_kept_as_outliers() -> anyhow::Result<()> {
    let (handler, federation) = memory_handler(HandlerConfig::default());
    let mut room = TestRoom::new(&RoomVersion::V10);
    process_all(&handler, room.events()).await;

    let bob_join = room.join(BOB);
    let message = room.message(BOB, "hi");
    federation.publish_all(room.events(), room.version).await;

    let outcome = handler.process_incoming(message.clone()).await?;
    assert!(outcome.is_accepted(), "{outcome:?}");
    // Bob's join was needed both as auth event and as prev event: it ends
    // up in the timeline.
    let metadata = handler.store().get_metadata(bob_join.event_id()).await?.unwrap();
    assert!(!metadata.outlier);
    assert!(handler.store().get_chain_position(bob_join.event_id()).await?.is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_slow_remote_leaves_event_undecided() {
    let (handler, federation) = memory_handler(HandlerConfig {
        fetch_timeout: Duration::from_secs(5),
        ..Default::default()
    });
    let mut room = TestRoom::new(&RoomVersion::V10);
    process_all(&handler, room.events()).await;
    room.join(BOB);
    let message = room.message(BOB, "hi");
    federation.publish_all(room.events(), room.version).await;
    federation.set_latency(Some(Duration::from_secs(60))).await;

    let err = handler.process_incoming(message.clone()).await.unwrap_err();
    assert!(matches!(err, HandlerError::Fetch(FetchError::Timeout { .. })), "{err}");
    assert!(!handler.store().has_event(message.event_id()).await.unwrap());

    // Nothing was guessed: once the remote answers the event goes through.
    federation.set_latency(None).await;
    let outcome = handler.process_incoming(message).await.unwrap();
    assert!(outcome.is_accepted(), "{outcome:?}");
}

#[tokio::test]
async fn test_unreachable_remote() {
    let (handler, federation) = memory_handler(HandlerConfig::default());
    let mut room = TestRoom::new(&RoomVersion::V10);
    process_all(&handler, room.events()).await;
    room.join(BOB);
    let message = room.message(BOB, "hi");
    federation.set_unreachable(true);

    let err = handler.process_incoming(message).await.unwrap_err();
    assert!(matches!(err, HandlerError::Fetch(FetchError::Transport(_))), "{err}");
}

#[tokio::test]
async fn test_too_many_missing_events() {
    let (handler, federation) = memory_handler(HandlerConfig {
        max_missing_events: 1,
        ..Default::default()
    });
    let mut room = TestRoom::new(&RoomVersion::V10);
    process_all(&handler, room.events()).await;
    room.join(BOB);
    room.message(BOB, "one");
    let last = room.message(BOB, "two");
    federation.publish_all(room.events(), room.version).await;

    let err = handler.process_incoming(last.clone()).await.unwrap_err();
    assert!(matches!(err, HandlerError::Unprocessable { .. }), "{err}");
    assert!(!handler.store().has_event(last.event_id()).await.unwrap());
}

// ─────────────────────────────────────────────────────────────────────────
// Redactions
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_redaction_recheck() {
    let (handler, _) = memory_handler(HandlerConfig::default());
    let mut room = TestRoom::new(&RoomVersion::V10);
    room.join(BOB);
    room.join(ZARA);
    let zara_message = room.message(ZARA, "from other.org");
    let bob_message = room.message(BOB, "from example.org");
    process_all(&handler, room.events()).await;

    // Bob may not redact other servers' events.
    let foreign = room.redaction(BOB, &zara_message);
    let foreign = room.push(foreign);
    let outcome = handler.process_incoming(foreign.clone()).await.unwrap();
    assert_eq!(outcome, ProcessedOutcome::Accepted { recheck_redaction: true });
    assert!(!handler.redaction_applies(foreign.event_id()).await.unwrap());

    let own = room.redaction(BOB, &bob_message);
    let own = room.push(own);
    let outcome = handler.process_incoming(own.clone()).await.unwrap();
    assert_eq!(outcome, ProcessedOutcome::Accepted { recheck_redaction: false });
    assert!(handler.redaction_applies(own.event_id()).await.unwrap());

    // Moderators may redact anything.
    let moderated = room.redaction(ALICE, &zara_message);
    let moderated = room.push(moderated);
    let outcome = handler.process_incoming(moderated.clone()).await.unwrap();
    assert_eq!(outcome, ProcessedOutcome::Accepted { recheck_redaction: false });
}

#[tokio::test]
async fn test_redaction_before_target() {
    let (handler, _) = memory_handler(HandlerConfig::default());
    let mut room = TestRoom::new(&RoomVersion::V10);
    room.join(BOB);
    process_all(&handler, room.events()).await;

    let target = room.event(BOB, event_type::MESSAGE, None, json!({"body": "oops"}));
    let redaction = room.redaction(BOB, &target);
    let redaction = room.push(redaction);

    let outcome = handler.process_incoming(redaction.clone()).await.unwrap();
    assert_eq!(outcome, ProcessedOutcome::Accepted { recheck_redaction: true });
    assert!(!handler.redaction_applies(redaction.event_id()).await.unwrap());

    let outcome = handler.process_incoming(target).await.unwrap();
    assert!(outcome.is_accepted(), "{outcome:?}");
    assert!(handler.redaction_applies(redaction.event_id()).await.unwrap());
    let metadata = handler.store().get_metadata(redaction.event_id()).await.unwrap().unwrap();
    assert!(!metadata.recheck_redaction);
}

// ─────────────────────────────────────────────────────────────────────────
// Batches
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_batch_in_any_order() {
    let (handler, _) = memory_handler(HandlerConfig::default());
    let mut room = TestRoom::new(&RoomVersion::V10);
    room.invite_and_join(BOB);
    room.set_name(ALICE, "Batch");
    room.message(BOB, "hi");

    let mut shuffled = room.events().to_vec();
    shuffled.reverse();
    let outcomes = handler.process_batch(shuffled).await.unwrap();
    assert_eq!(outcomes.len(), room.events().len());
    assert!(outcomes.iter().all(|(_, o)| o.is_accepted()), "{outcomes:?}");
    assert_eq!(
        handler.store().get_current_state(&room_id()).await.unwrap(),
        room.state_map()
    );
}

#[tokio::test]
async fn test_batch_with_auth_cycle() {
    let (handler, _) = memory_handler(HandlerConfig::default());
    let room = TestRoom::new(&RoomVersion::V1);
    process_all(&handler, room.events()).await;

    let event = |id: &str, auth: &str| {
        Event::from_pdu_json(
            &RoomVersion::V1,
            json!({
                "event_id": id,
                "room_id": room_id().as_str(),
                "sender": ALICE,
                "type": "m.room.message",
                "content": {},
                "prev_events": [],
                "auth_events": [auth],
                "depth": 9,
                "origin_server_ts": 0,
            }),
        )
        .unwrap()
    };
    let batch = vec![
        event("$x:example.org", "$y:example.org"),
        event("$y:example.org", "$x:example.org"),
    ];
    let err = handler.process_batch(batch).await.unwrap_err();
    assert!(matches!(err, HandlerError::AuthCycle(ref ids) if ids.len() == 2), "{err}");
}

// ─────────────────────────────────────────────────────────────────────────
// Forks
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fork_resolved_on_sqlite() -> anyhow::Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("concord.db");
    let version = &RoomVersion::V10;
    let (mut left, right) = scenarios::ban_versus_rename(version);

    let expected = resolve_state(
        &room_id(),
        version,
        &[left.state_map(), right.state_map()],
        &merged_event_map(&[&left, &right]),
        &MemoryStore::new(),
    )
    .await?;

    {
        let handler = EventHandler::new(
            SqliteStore::open(&path)?,
            MemoryFederation::new(),
            Arc::new(key_ring()),
            HandlerConfig::default(),
        );
        // The rename arrives first and is current until the ban shows up
        // on the other branch.
        process_all(&handler, right.events()).await;
        let outcome = handler.process_incoming(left.last().clone()).await?;
        assert!(outcome.is_accepted(), "{outcome:?}");

        let store = handler.store();
        assert_eq!(store.get_forward_extremities(&room_id()).await?.len(), 2);
        assert_eq!(store.get_current_state(&room_id()).await?, expected);

        left.merge_heads(&right);
        let merge = left.message(ALICE, "merged");
        let outcome = handler.process_incoming(merge.clone()).await?;
        assert!(outcome.is_accepted(), "{outcome:?}");
        assert_eq!(store.get_state_at(merge.event_id()).await?, Some(expected.clone()));
        assert_eq!(
            store.get_forward_extremities(&room_id()).await?,
            [merge.event_id().clone()].into_iter().collect()
        );
    }

    // Everything survives a restart.
    let store = SqliteStore::open(&path)?;
    assert_eq!(store.get_current_state(&room_id()).await?, expected);
    assert!(!expected.contains_key(&concord::core::StateKey::new(event_type::NAME, "")));
    Ok(())
}

#[tokio::test]
async fn test_rename_after_ban_soft_fails() {
    let (handler, _) = memory_handler(HandlerConfig::default());
    let (left, right) = scenarios::ban_versus_rename(&RoomVersion::V10);

    process_all(&handler, left.events()).await;
    let outcome = handler.process_incoming(right.last().clone()).await.unwrap();
    assert!(matches!(outcome, ProcessedOutcome::SoftFailed { .. }), "{outcome:?}");
    assert_eq!(
        handler.store().get_current_state(&room_id()).await.unwrap(),
        left.state_map()
    );
}
