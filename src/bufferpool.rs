use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use log::{debug, warn};

use crate::disk::DiskInterface;
use crate::errors::{DatabaseError, DatabaseResult};
use crate::phys_page::PhysicalPage;

/// Stable string identity of a physical page, deterministic from the table
/// name, the logical page's starting RID, the column index, and (for base
/// pages) the merge iteration.
pub type PhysicalPageID = String;

/// Write-through cache of physical pages shared by every table in a
/// database. A single mutex protects the resident-frame map; all physical
/// page access goes through it, so no caller ever holds a page reference
/// across a suspension point.
pub struct BufferPool {
    frames: Mutex<HashMap<PhysicalPageID, PhysicalPage>>,
    disk: DiskInterface,
    capacity: usize,
}

impl BufferPool {
    pub fn new(root: &Path, capacity: usize) -> DatabaseResult<Self> {
        assert!(capacity > 0, "buffer pool capacity must be positive");
        Ok(BufferPool {
            frames: Mutex::new(HashMap::new()),
            disk: DiskInterface::new(root)?,
            capacity,
        })
    }

    /// Write `value` into `slot` of the identified page. Faults the page in
    /// from disk, or creates a fresh zero-filled page when it exists nowhere
    /// yet. The page is left resident and dirty.
    pub fn write_value(&self, page_id: &PhysicalPageID, slot: usize, value: i64) -> DatabaseResult<()> {
        let mut frames = self.frames.lock().unwrap();

        if !frames.contains_key(page_id) {
            let page = if self.disk.page_exists(page_id) {
                self.evict_if_full(&mut frames)?;
                self.disk.read_page(page_id)?
            } else {
                self.evict_if_full(&mut frames)?;
                PhysicalPage::new()
            };
            frames.insert(page_id.clone(), page);
        }

        let page = frames.get_mut(page_id).expect("page resident after fault");
        page.set(slot, value)?;
        page.mark_dirty();
        Ok(())
    }

    /// Read `slot` of the identified page, faulting it in if needed. Fails
    /// with `PageNotFound` when the page is neither resident nor on disk.
    pub fn read_value(&self, page_id: &PhysicalPageID, slot: usize) -> DatabaseResult<i64> {
        let mut frames = self.frames.lock().unwrap();

        if !frames.contains_key(page_id) {
            if !self.disk.page_exists(page_id) {
                return Err(DatabaseError::PageNotFound(page_id.clone()));
            }
            self.evict_if_full(&mut frames)?;
            let page = self.disk.read_page(page_id)?;
            debug!("faulted in page {}", page_id);
            frames.insert(page_id.clone(), page);
        }

        frames
            .get_mut(page_id)
            .expect("page resident after fault")
            .get(slot)
    }

    /// Duplicate a page under a new identity. Fails when the destination
    /// already exists in memory or on disk.
    pub fn copy_page(&self, source: &PhysicalPageID, dest: &PhysicalPageID) -> DatabaseResult<()> {
        let mut frames = self.frames.lock().unwrap();

        if frames.contains_key(dest) || self.disk.page_exists(dest) {
            return Err(DatabaseError::PageExists(dest.clone()));
        }

        if !frames.contains_key(source) {
            if !self.disk.page_exists(source) {
                return Err(DatabaseError::PageNotFound(source.clone()));
            }
            self.evict_if_full(&mut frames)?;
            frames.insert(source.clone(), self.disk.read_page(source)?);
        }

        let mut copy = frames.get(source).expect("source resident").clone();
        copy.mark_dirty();
        self.evict_if_full(&mut frames)?;
        frames.insert(dest.clone(), copy);
        Ok(())
    }

    /// Whether the page exists at all, resident or on disk.
    pub fn page_exists(&self, page_id: &PhysicalPageID) -> bool {
        let frames = self.frames.lock().unwrap();
        frames.contains_key(page_id) || self.disk.page_exists(page_id)
    }

    /// Fault the page in and hold it resident until the matching unpin.
    pub fn pin_page(&self, page_id: &PhysicalPageID) -> DatabaseResult<()> {
        let mut frames = self.frames.lock().unwrap();

        if !frames.contains_key(page_id) {
            if !self.disk.page_exists(page_id) {
                return Err(DatabaseError::PageNotFound(page_id.clone()));
            }
            self.evict_if_full(&mut frames)?;
            frames.insert(page_id.clone(), self.disk.read_page(page_id)?);
        }

        frames.get_mut(page_id).expect("page resident").pin();
        Ok(())
    }

    pub fn unpin_page(&self, page_id: &PhysicalPageID) -> DatabaseResult<()> {
        let mut frames = self.frames.lock().unwrap();
        match frames.get_mut(page_id) {
            Some(page) => {
                page.unpin();
                Ok(())
            }
            None => Err(DatabaseError::PageNotFound(page_id.clone())),
        }
    }

    /// Write every dirty resident page through to disk and drop all frames.
    /// Called on database close.
    pub fn evict_all(&self) -> DatabaseResult<()> {
        let mut frames = self.frames.lock().unwrap();

        for (page_id, page) in frames.iter_mut() {
            if page.is_dirty() {
                self.disk.write_page(page_id, page)?;
                page.clear_dirty();
            }
        }

        debug!("evicted all {} resident pages", frames.len());
        frames.clear();
        Ok(())
    }

    /// Number of resident frames. Exposed for tests and observability.
    pub fn resident_pages(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Evict the oldest evictable page if the pool is at capacity. Dirty
    /// victims are written through before being dropped. When every frame is
    /// pinned the pool temporarily exceeds capacity rather than deadlock.
    fn evict_if_full(&self, frames: &mut HashMap<PhysicalPageID, PhysicalPage>) -> DatabaseResult<()> {
        if frames.len() < self.capacity {
            return Ok(());
        }

        let mut candidates: Vec<(u64, PhysicalPageID)> = frames
            .iter()
            .map(|(page_id, page)| (page.timestamp(), page_id.clone()))
            .collect();
        candidates.sort();

        for (_, page_id) in candidates {
            let page = &frames[&page_id];
            if !page.can_evict() {
                continue;
            }

            if page.is_dirty() {
                self.disk.write_page(&page_id, page)?;
            }

            debug!("evicted page {}", page_id);
            frames.remove(&page_id);
            return Ok(());
        }

        warn!("no evictable page among {} frames; exceeding pool capacity", frames.len());
        Ok(())
    }
}
