//! # sync-types
//!
//! Wire format types for the Nexodus watch protocol.
//!
//! This crate provides the foundational types shared by the API server and
//! its clients:
//! - [`Revision`] - Resumable, monotonically increasing read cursor
//! - [`Watch`] - A request to watch one resource kind
//! - [`WatchEvent`] / [`EventType`] - One line of a watch stream
//! - [`ResourceItem`] / [`Resource`] - Revisioned values carried by events
//! - [`ApiError`] / [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod resource;
mod revision;
mod watch;

pub use error::{ApiError, TypesError};
pub use resource::{Resource, ResourceItem, ResourceList};
pub use revision::Revision;
pub use watch::{EventType, Watch, WatchEvent, WATCH_CONTENT_TYPE};
