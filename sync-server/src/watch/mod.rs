//! Watch streams.
//!
//! A client posts the list of kinds it wants to follow, each with the last
//! revision it has seen. The server answers with a long-lived stream of
//! newline-delimited [`WatchEvent`](sync_types::WatchEvent)s:
//!
//! ```text
//! client                              server
//!   │ POST /events [{kind, gt_revision}] │
//!   │───────────────────────────────────►│  fetch page > gt_revision
//!   │◄─────────── change / delete ───────│  (drain)
//!   │◄─────────── tail ──────────────────│  page empty: initial list complete
//!   │                                    │  park, wait for signal
//!   │◄─────────── change / delete ───────│  signal: fetch again
//!   │◄─────────── bookmark ──────────────│
//!   │◄─────────── error / close ─────────│  stream ends
//! ```

mod dispatcher;
mod kinds;
mod stream;

pub use dispatcher::{KindWatch, WatchDispatcher, WatchSource};
pub use kinds::{storage_loader, ResourceKind};
pub use stream::watch_response;
