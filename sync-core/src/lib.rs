//! # sync-core
//!
//! Pure logic for the Nexodus watch engine (no I/O, instant tests).
//!
//! This crate implements the state machines behind the watch protocol
//! without any network or database I/O:
//! - [`KindCursor`] - per watched kind: drain, fetch, mark the tail, park
//! - [`ListenerState`] - lifecycle of the clustered notify listener
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. The API server performs the actual fetches, waits and
//! database connections, and feeds the outcomes back in as events.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod listener;
pub mod watch;

pub use listener::{BackoffPolicy, ListenerAction, ListenerEvent, ListenerState};
pub use watch::{KindCursor, KindEvent, Revisioned, Step};
