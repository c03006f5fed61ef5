//! # nexodus-sync-server
//!
//! Real-time watch engine for the Nexodus API server.
//!
//! Agents follow devices, security groups and device metadata of their
//! organization through long-lived watch streams. This crate implements:
//! - A signal bus that wakes watchers after committed mutations, in memory
//!   or fanned out across replicas through Postgres `LISTEN`/`NOTIFY`
//! - A fetch manager that coalesces concurrent reads of the same list into
//!   one storage query
//! - A watch dispatcher that multiplexes several kinds onto one stream
//!
//! ## Architecture
//!
//! ```text
//!  PUT/DELETE ──► storage (SQLite) ──commit──► signal bus ──► other replicas
//!                      ▲                          │
//!                      │ page > gt_revision       │ wake
//!                 fetch manager ◄──── watch dispatcher ──► NDJSON stream
//! ```
//!
//! ## Events
//!
//! Each line of a watch stream is one event:
//! - `change` / `delete` for a row newer than the client's revision
//! - `tail` once the initial list is complete
//! - `bookmark` after a batch of later changes
//! - `error` / `close` ends the stream

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod fetchmgr;
pub mod http;
pub mod limits;
pub mod maintenance;
pub mod server;
pub mod signalbus;
pub mod storage;
pub mod watch;
