//! # Concord
//!
//! Event authorization and state resolution for federated rooms.
//!
//! ## Overview
//!
//! Servers exchange room events that form a DAG per room. Every server must
//! derive the same room state from that DAG, whatever order events arrive
//! in. Concord provides:
//!
//! - **Validation**: size limits, signatures and content hashes
//! - **Authorization**: the auth rules, against an event's claimed auth
//!   events, the state before it, and the room's current state
//! - **State resolution**: one state map from divergent branches
//! - **Persistence**: events with their processing metadata, the state
//!   after each event, and the chain cover index
//!
//! ## Key Concepts
//!
//! - **Rejected**: failed the auth rules. Stored with a reason, never part
//!   of state.
//! - **Soft-failed**: allowed by its own history but not by current state.
//!   Stored and kept in the DAG, withheld from clients.
//! - **Outlier**: fetched only to satisfy another event's auth chain. Not
//!   part of the timeline until processed as a timeline event.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use concord::{EventHandler, HandlerConfig};
//! use concord::core::KeyRing;
//! use concord::federation::MemoryFederation;
//! use concord::store::SqliteStore;
//!
//! async fn example() {
//!     let store = SqliteStore::open("concord.db").unwrap();
//!     let handler = EventHandler::new(
//!         store,
//!         MemoryFederation::new(),
//!         Arc::new(KeyRing::new()),
//!         HandlerConfig::default(),
//!     );
//!
//!     // let outcome = handler.process_incoming(event).await.unwrap();
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `concord::core` - Events, identifiers, room versions, validation
//! - `concord::auth` - The auth rules
//! - `concord::store` - Storage abstraction, SQLite and the chain cover
//! - `concord::stateres` - State resolution
//! - `concord::federation` - Fetching from remote servers

pub mod batch;
pub mod config;
pub mod error;
pub mod handler;
pub mod locks;
pub mod redaction;

// Re-export component crates
pub use concord_auth as auth;
pub use concord_core as core;
pub use concord_federation as federation;
pub use concord_stateres as stateres;
pub use concord_store as store;

// Re-export main types for convenience
pub use batch::order_batch_by_auth;
pub use config::HandlerConfig;
pub use error::{HandlerError, Result};
pub use handler::{EventHandler, ProcessedOutcome};
pub use locks::{RoomGuard, RoomLocks};
pub use redaction::check_redaction_target;

// Re-export the engine's entry points
pub use concord_auth::{auth_types_for_event, check_auth_rules_for_event, AuthOutcome};
pub use concord_core::{validate_event_for_room_version, Event, EventId, RoomId, RoomVersion, StateMap};
pub use concord_stateres::resolve_state;
