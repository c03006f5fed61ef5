//! Ring buffer tail cache.

use async_trait::async_trait;
use sync_types::{ResourceItem, ResourceList, Revision};
use tokio::sync::RwLock;

use super::{Loader, TailCache, TailCursor};
use crate::error::FetchResult;

#[derive(Debug, Clone)]
struct CachedItem {
    item: ResourceItem,
    /// Revision the item directly follows: the loader saw nothing in
    /// `(after, item.revision)`.
    after: Revision,
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<CachedItem>>,
    write_pos: u64,
    /// Completed fills, including ones that loaded nothing.
    epoch: u64,
}

/// Per-process tail cache holding the last `size` loaded items.
#[derive(Debug)]
pub struct MemTailCache {
    ring: RwLock<Ring>,
}

impl MemTailCache {
    /// Create a ring of `size` slots (at least one).
    pub fn new(size: usize) -> Self {
        Self {
            ring: RwLock::new(Ring {
                slots: vec![None; size.max(1)],
                write_pos: 0,
                epoch: 0,
            }),
        }
    }
}

#[async_trait]
impl TailCache for MemTailCache {
    async fn read(&self, cursor: &mut TailCursor, gt: Revision) -> (ResourceList, u64) {
        let ring = self.ring.read().await;
        let size = ring.slots.len() as u64;
        let write_pos = ring.write_pos;

        // Slots older than one lap were overwritten.
        if write_pos.saturating_sub(cursor.read_pos) > size {
            cursor.read_pos = write_pos - size;
        }

        let mut gt = gt;
        let mut items = Vec::new();
        while cursor.read_pos < write_pos {
            let slot = &ring.slots[(cursor.read_pos % size) as usize];
            cursor.read_pos += 1;
            let Some(cached) = slot else { continue };
            if cached.item.revision <= gt {
                continue;
            }
            if cached.after > gt {
                cursor.from_tail = false;
                break;
            }
            gt = cached.item.revision;
            items.push(cached.item.clone());
        }
        (items, ring.epoch)
    }

    async fn fill(
        &self,
        _cursor: &mut TailCursor,
        loader: &dyn Loader,
        gt: Revision,
        mark: u64,
    ) -> FetchResult<Option<ResourceList>> {
        let mut ring = self.ring.write().await;
        if ring.epoch != mark {
            return Ok(None);
        }

        let items = loader.load(gt).await?;
        ring.epoch += 1;
        let size = ring.slots.len();
        let mut after = gt;
        for item in items.iter().take(size) {
            let pos = (ring.write_pos % size as u64) as usize;
            ring.slots[pos] = Some(CachedItem {
                item: item.clone(),
                after,
            });
            after = item.revision;
            ring.write_pos += 1;
        }
        Ok(Some(items))
    }
}
