//! # Concord Federation
//!
//! Fetching events from other servers.
//!
//! ## Overview
//!
//! The engine reaches other servers only to fill gaps: a single missing
//! event, or the auth chain of an event whose auth events are unknown.
//! [`FederationClient`] is that capability. Transport and request encoding
//! are left to the implementation.
//!
//! ## Failure
//!
//! A failed fetch never rejects an event. [`FetchError`] propagates as
//! "cannot decide yet", and the caller either retries later or leaves the
//! event unprocessed. [`BoundedClient`] turns a slow remote into
//! [`FetchError::Timeout`] instead of letting it stall the room.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use concord_federation::{BoundedClient, FetchConfig, MemoryFederation};
//!
//! let federation = MemoryFederation::new();
//! let client = BoundedClient::new(federation, FetchConfig::default());
//! ```

pub mod bounded;
pub mod client;
pub mod error;
pub mod memory;

pub use bounded::{BoundedClient, FetchConfig};
pub use client::FederationClient;
pub use error::{FetchError, Result};
pub use memory::MemoryFederation;
