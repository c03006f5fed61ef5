//! # sync-client
//!
//! Client library for Nexodus watch streams.
//!
//! ## Features
//!
//! - **Watch streams**: open a multi-kind watch and read events one at a time
//! - **Line decoding**: split an arbitrary chunked body into events
//! - **Informers**: keep a keyed snapshot of one kind and resume after errors
//!
//! ## Example
//!
//! ```ignore
//! use sync_client::{Informer, ResourceAdaptor, WatchClient};
//!
//! let client = WatchClient::new("https://api.example.com")?;
//! let mut devices = Informer::new(ResourceAdaptor::new("device"));
//!
//! let mut stream = client.watch(&org, &[devices.watch()]).await?;
//! while let Some(event) = stream.next_event().await? {
//!     devices.apply(&event)?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod decoder;
pub mod error;
pub mod informer;

pub use client::{WatchClient, WatchStream};
pub use decoder::LineDecoder;
pub use error::ClientError;
pub use informer::{Informer, InformerAdaptor, ResourceAdaptor};
