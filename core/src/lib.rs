//! Coordination substrate for multi-agent systems: a durable event bus,
//! pluggable key/value storage, and replicated shared state.
//!
//! The three layers compose bottom-up: the [`bus`] carries events between
//! components, [`storage`] persists values (and mirrors its mutations onto
//! the bus), and [`state`] keeps a versioned JSON tree consistent across
//! instances by replicating operations over the bus and snapshotting through
//! storage.

pub mod api;
pub mod bus;
pub mod config;
pub mod error;
pub mod state;
pub mod storage;
pub mod util;
