//! Revision cursor for the watch protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A monotonically increasing sequence number for one resource kind.
///
/// Assigned by the storage layer on every insert, update, and soft delete.
/// Revisions are never reused and never decrease for a given kind, which
/// makes them usable as a resumable read cursor: a client that has seen
/// revision `r` resumes by asking for everything with `revision > r`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    /// Create a new Revision with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this Revision.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The revision meaning "from the beginning".
    pub fn zero() -> Self {
        Self(0)
    }

    /// Check whether this is the "from the beginning" revision.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Increment the revision by one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for Revision {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Revision({})", self.0)
    }
}
