//! Informers keep a local snapshot of one watched kind.
//!
//! Feed every event of a stream to [`Informer::apply`]. The informer tracks
//! the last revision it applied, so after an `error` event (or a dropped
//! connection) [`Informer::watch`] yields the request that resumes exactly
//! where the snapshot left off.

use crate::error::ClientError;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::hash::Hash;
use sync_types::{EventType, Resource, Revision, TypesError, Watch, WatchEvent};
use uuid::Uuid;

/// Describes how an [`Informer`] reads and keys one kind.
pub trait InformerAdaptor {
    /// Item type carried by `change` and `delete` events.
    type Item: DeserializeOwned;
    /// Key identifying an item in the snapshot.
    type Key: Eq + Hash + Clone;

    /// Kind name to watch.
    fn kind(&self) -> &str;

    /// Key of `item`.
    fn key(&self, item: &Self::Item) -> Self::Key;

    /// Revision of `item`.
    fn revision(&self, item: &Self::Item) -> Revision;

    /// Options sent with the watch request.
    fn options(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        None
    }
}

/// Adaptor for the stock [`Resource`] shape, keyed by id.
#[derive(Debug, Clone)]
pub struct ResourceAdaptor {
    kind: String,
    prefixes: Vec<String>,
}

impl ResourceAdaptor {
    /// Watch every resource of `kind`.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            prefixes: Vec::new(),
        }
    }

    /// Only follow names starting with one of `prefixes`.
    pub fn with_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.prefixes = prefixes;
        self
    }
}

impl InformerAdaptor for ResourceAdaptor {
    type Item = Resource;
    type Key = Uuid;

    fn kind(&self) -> &str {
        &self.kind
    }

    fn key(&self, item: &Resource) -> Uuid {
        item.id
    }

    fn revision(&self, item: &Resource) -> Revision {
        item.revision
    }

    fn options(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        if self.prefixes.is_empty() {
            return None;
        }
        let mut options = serde_json::Map::new();
        options.insert("prefixes".into(), serde_json::json!(self.prefixes));
        Some(options)
    }
}

/// Keyed snapshot of one kind, maintained from watch events.
pub struct Informer<A: InformerAdaptor> {
    adaptor: A,
    items: HashMap<A::Key, A::Item>,
    gt_revision: Revision,
    at_tail: bool,
    last_error: Option<String>,
}

impl<A: InformerAdaptor> std::fmt::Debug for Informer<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Informer")
            .field("kind", &self.adaptor.kind())
            .field("items", &self.items.len())
            .field("gt_revision", &self.gt_revision)
            .field("at_tail", &self.at_tail)
            .finish()
    }
}

impl<A: InformerAdaptor> Informer<A> {
    /// Create an empty informer.
    pub fn new(adaptor: A) -> Self {
        Self {
            adaptor,
            items: HashMap::new(),
            gt_revision: Revision::zero(),
            at_tail: false,
            last_error: None,
        }
    }

    /// The request that resumes this informer's kind.
    pub fn watch(&self) -> Watch {
        Watch {
            kind: self.adaptor.kind().to_string(),
            gt_revision: self.gt_revision,
            at_tail: self.at_tail,
            options: self.adaptor.options(),
        }
    }

    /// Apply one event from a watch stream.
    ///
    /// Events for other kinds and changes at or below the informer's
    /// revision are ignored. Returns whether the snapshot changed.
    pub fn apply(&mut self, event: &WatchEvent) -> Result<bool, ClientError> {
        match event.event_type {
            EventType::Error => {
                self.last_error = event.error_message();
                tracing::debug!(
                    kind = self.adaptor.kind(),
                    error = ?self.last_error,
                    "watch error"
                );
                Ok(false)
            }
            EventType::Close => Ok(false),
            _ if event.kind != self.adaptor.kind() => Ok(false),
            EventType::Tail | EventType::Bookmark => {
                if let Some(revision) = event.marker_revision() {
                    self.gt_revision = self.gt_revision.max(revision);
                }
                if event.event_type == EventType::Tail && !self.at_tail {
                    tracing::debug!(
                        kind = self.adaptor.kind(),
                        items = self.items.len(),
                        "informer synced"
                    );
                }
                self.at_tail = true;
                Ok(false)
            }
            EventType::Change | EventType::Delete => {
                let value = event.value.clone().unwrap_or(serde_json::Value::Null);
                let item: A::Item = serde_json::from_value(value)
                    .map_err(|e| ClientError::Decode(TypesError::Decode(e)))?;
                let revision = self.adaptor.revision(&item);
                if revision <= self.gt_revision {
                    return Ok(false);
                }
                self.gt_revision = revision;

                let key = self.adaptor.key(&item);
                if event.event_type == EventType::Delete {
                    Ok(self.items.remove(&key).is_some())
                } else {
                    self.items.insert(key, item);
                    Ok(true)
                }
            }
        }
    }

    /// Look up an item by key.
    pub fn get(&self, key: &A::Key) -> Option<&A::Item> {
        self.items.get(key)
    }

    /// Iterate over the snapshot.
    pub fn items(&self) -> impl Iterator<Item = &A::Item> {
        self.items.values()
    }

    /// Number of items in the snapshot.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the initial list has been fully received.
    pub fn is_synced(&self) -> bool {
        self.at_tail
    }

    /// Revision of the last applied change.
    pub fn gt_revision(&self) -> Revision {
        self.gt_revision
    }

    /// Take the message of the last `error` event.
    pub fn take_error(&mut self) -> Option<String> {
        self.last_error.take()
    }
}
