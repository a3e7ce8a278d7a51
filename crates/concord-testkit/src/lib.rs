//! # Concord Testkit
//!
//! Testing utilities for Concord.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: [`TestRoom`], a room that signs events on top of its
//!   current state and can be forked into divergent branches
//! - **Generators**: Proptest strategies for users, power levels and whole
//!   forked room histories
//! - **Scenarios**: Canned conflicting branches for state resolution tests
//!
//! ## Test Fixtures
//!
//! ```rust
//! use concord_core::RoomVersion;
//! use concord_testkit::fixtures::{TestRoom, ALICE, BOB};
//!
//! let mut room = TestRoom::new(&RoomVersion::V10);
//! room.join(BOB);
//! let mut fork = room.fork();
//! fork.set_name(ALICE, "elsewhere");
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use concord_testkit::generators::ForkPlan;
//!
//! proptest! {
//!     #[test]
//!     fn resolution_is_symmetric(plan: ForkPlan) {
//!         let (_, left, right) = plan.build(&RoomVersion::V10);
//!         // resolve [left, right] and [right, left] and compare
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod scenarios;

pub use fixtures::{key_ring, merged_event_map, room_id, TestRoom};
pub use generators::{Action, ForkPlan};
