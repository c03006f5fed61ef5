//! Per-kind watch cursor.
//!
//! Each kind watched by a connection moves through:
//!
//! ```text
//!            page has items            page empty, marker unsent
//! Fetching ──────────────────► Draining        Fetching ──────► emit tail/bookmark, Parked
//!    ▲                            │            page empty, marker sent
//!    │       page exhausted       │            Fetching ──────► Parked
//!    └────────────────────────────┘            Parked ──wake──► Fetching
//! ```
//!
//! The empty page that produced a marker already proved the kind is at the
//! tail, so the cursor parks with the marker instead of fetching again.
//!
//! The cursor never performs the fetch itself. [`KindCursor::step`] says
//! what to do next and [`KindCursor::on_fetched`] consumes the result.

use std::collections::VecDeque;
use sync_types::{ResourceItem, Revision};

/// Something ordered by revision that may be a tombstone.
pub trait Revisioned {
    /// Revision of the item.
    fn revision(&self) -> Revision;
    /// Whether the item marks a deletion.
    fn is_tombstone(&self) -> bool;
}

impl Revisioned for ResourceItem {
    fn revision(&self) -> Revision {
        self.revision
    }

    fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Event produced for one watched kind.
#[derive(Debug, Clone, PartialEq)]
pub enum KindEvent<T> {
    /// Item created or updated.
    Change(T),
    /// Item soft deleted.
    Delete(T),
    /// First time the kind reached the live tail.
    Tail(Revision),
    /// Reached the tail again after draining new items.
    Bookmark(Revision),
}

/// What the driver should do next for a kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<T> {
    /// Send this event to the client.
    Emit(KindEvent<T>),
    /// Fetch items newer than the revision, then call [`KindCursor::on_fetched`].
    Fetch(Revision),
    /// Nothing to do until the kind's signal fires.
    Parked,
}

/// Watch state for one kind within one connection.
#[derive(Debug, Clone)]
pub struct KindCursor<T> {
    gt_revision: Revision,
    page: VecDeque<T>,
    marker_sent: bool,
    reached_tail: bool,
    parked: bool,
}

impl<T: Revisioned> KindCursor<T> {
    /// Start watching after `gt_revision`.
    ///
    /// When `at_tail` is set the client already holds a complete list, so the
    /// first tail marker is suppressed.
    pub fn new(gt_revision: Revision, at_tail: bool) -> Self {
        Self {
            gt_revision,
            page: VecDeque::new(),
            marker_sent: at_tail,
            reached_tail: at_tail,
            parked: false,
        }
    }

    /// Revision of the last item emitted (or the starting revision).
    pub fn gt_revision(&self) -> Revision {
        self.gt_revision
    }

    /// Whether the kind is waiting for its signal.
    pub fn is_parked(&self) -> bool {
        self.parked
    }

    /// Number of fetched items not yet emitted.
    pub fn buffered(&self) -> usize {
        self.page.len()
    }

    /// The kind's signal fired; fetch again on the next step.
    pub fn wake(&mut self) {
        self.parked = false;
    }

    /// Decide the next step.
    pub fn step(&mut self) -> Step<T> {
        if self.parked {
            return Step::Parked;
        }
        match self.page.pop_front() {
            Some(item) => Step::Emit(self.emit(item)),
            None => Step::Fetch(self.gt_revision),
        }
    }

    /// Consume a fetch result.
    ///
    /// Items at or below the current revision are dropped so that emitted
    /// revisions never go backwards, even if the loader returns stale rows.
    /// Returns the event to send now, if any. An empty page always parks
    /// the kind, whether or not it also yields a marker.
    pub fn on_fetched(&mut self, items: Vec<T>) -> Option<KindEvent<T>> {
        let gt = self.gt_revision;
        let mut fresh: Vec<T> = items.into_iter().filter(|i| i.revision() > gt).collect();
        fresh.sort_by_key(|i| i.revision());

        let mut fresh = VecDeque::from(fresh);
        if let Some(first) = fresh.pop_front() {
            // A new drain cycle starts: the next empty fetch marks the tail again.
            self.marker_sent = false;
            self.page = fresh;
            return Some(self.emit(first));
        }

        self.parked = true;
        if self.marker_sent {
            return None;
        }

        self.marker_sent = true;
        if self.reached_tail {
            Some(KindEvent::Bookmark(gt))
        } else {
            self.reached_tail = true;
            Some(KindEvent::Tail(gt))
        }
    }

    fn emit(&mut self, item: T) -> KindEvent<T> {
        self.gt_revision = item.revision();
        if item.is_tombstone() {
            KindEvent::Delete(item)
        } else {
            KindEvent::Change(item)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(revision: u64) -> ResourceItem {
        ResourceItem::new(serde_json::json!({ "rev": revision }), Revision::new(revision))
    }

    fn tombstone(revision: u64) -> ResourceItem {
        ResourceItem::tombstone(serde_json::json!({}), Revision::new(revision), 1)
    }

    #[test]
    fn starts_by_fetching_from_requested_revision() {
        let mut cursor = KindCursor::<ResourceItem>::new(Revision::new(5), false);
        assert_eq!(cursor.step(), Step::Fetch(Revision::new(5)));
    }

    #[test]
    fn drains_page_in_revision_order() {
        let mut cursor = KindCursor::new(Revision::zero(), false);
        let first = cursor.on_fetched(vec![item(3), item(1), item(2)]);
        assert_eq!(first, Some(KindEvent::Change(item(1))));
        assert_eq!(cursor.step(), Step::Emit(KindEvent::Change(item(2))));
        assert_eq!(cursor.step(), Step::Emit(KindEvent::Change(item(3))));
        assert_eq!(cursor.gt_revision(), Revision::new(3));
        assert_eq!(cursor.step(), Step::Fetch(Revision::new(3)));
    }

    #[test]
    fn tombstones_become_deletes() {
        let mut cursor = KindCursor::new(Revision::zero(), false);
        let event = cursor.on_fetched(vec![tombstone(4)]);
        assert_eq!(event, Some(KindEvent::Delete(tombstone(4))));
    }

    #[test]
    fn stale_items_are_dropped() {
        let mut cursor = KindCursor::new(Revision::new(10), false);
        let event = cursor.on_fetched(vec![item(9), item(10), item(11)]);
        assert_eq!(event, Some(KindEvent::Change(item(11))));
        assert_eq!(cursor.buffered(), 0);
    }

    #[test]
    fn tail_is_emitted_once_then_parks() {
        let mut cursor = KindCursor::<ResourceItem>::new(Revision::new(2), false);
        assert_eq!(cursor.on_fetched(vec![]), Some(KindEvent::Tail(Revision::new(2))));
        assert!(cursor.is_parked());
        assert_eq!(cursor.step(), Step::Parked);

        // Spurious wakes that find nothing never repeat the marker.
        for _ in 0..3 {
            cursor.wake();
            assert_eq!(cursor.step(), Step::Fetch(Revision::new(2)));
            assert_eq!(cursor.on_fetched(vec![]), None);
            assert!(cursor.is_parked());
        }
    }

    #[test]
    fn bookmark_follows_new_drain_cycle() {
        let mut cursor = KindCursor::new(Revision::zero(), false);
        assert_eq!(cursor.on_fetched(vec![]), Some(KindEvent::Tail(Revision::zero())));
        assert_eq!(cursor.step(), Step::Parked);

        cursor.wake();
        assert_eq!(cursor.on_fetched(vec![item(7)]), Some(KindEvent::Change(item(7))));
        assert_eq!(cursor.step(), Step::Fetch(Revision::new(7)));
        assert_eq!(
            cursor.on_fetched(vec![]),
            Some(KindEvent::Bookmark(Revision::new(7)))
        );
        assert_eq!(cursor.step(), Step::Parked);

        cursor.wake();
        assert_eq!(cursor.on_fetched(vec![]), None);
    }

    #[test]
    fn at_tail_request_suppresses_first_marker() {
        let mut cursor = KindCursor::<ResourceItem>::new(Revision::new(40), true);
        assert_eq!(cursor.on_fetched(vec![]), None);
        assert!(cursor.is_parked());

        cursor.wake();
        assert_eq!(cursor.on_fetched(vec![item(41)]), Some(KindEvent::Change(item(41))));
        assert_eq!(
            cursor.on_fetched(vec![]),
            Some(KindEvent::Bookmark(Revision::new(41)))
        );
    }

    #[test]
    fn revisions_never_decrease() {
        let mut cursor = KindCursor::new(Revision::zero(), false);
        let mut last = Revision::zero();
        let pages = vec![vec![item(1), item(2)], vec![item(2), item(5)], vec![item(4), item(6)]];
        for page in pages {
            let mut event = cursor.on_fetched(page);
            while let Some(KindEvent::Change(i)) = event {
                assert!(i.revision >= last);
                last = i.revision;
                event = match cursor.step() {
                    Step::Emit(e) => Some(e),
                    _ => None,
                };
            }
        }
        assert_eq!(last, Revision::new(6));
    }
}
