use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::DatabaseResult;
use crate::page::{SharedBasePage, SharedTailPage};
use crate::rid::{slot_of, starting_rid_of, RID};

/// A directory entry: the logical page currently holding a block of RIDs.
#[derive(Clone)]
pub enum DirectoryPage {
    Base(SharedBasePage),
    Tail(SharedTailPage),
}

impl DirectoryPage {
    pub fn get_column(&self, column: usize, slot: usize) -> DatabaseResult<i64> {
        match self {
            DirectoryPage::Base(page) => page.read().unwrap().get_column(column, slot),
            DirectoryPage::Tail(page) => page.read().unwrap().get_column(column, slot),
        }
    }

    pub fn get_indirection(&self, slot: usize) -> DatabaseResult<i64> {
        match self {
            DirectoryPage::Base(page) => page.read().unwrap().get_indirection(slot),
            DirectoryPage::Tail(page) => page.read().unwrap().get_indirection(slot),
        }
    }

    pub fn set_indirection(&self, slot: usize, value: i64) -> DatabaseResult<()> {
        match self {
            DirectoryPage::Base(page) => page.read().unwrap().set_indirection(slot, value),
            DirectoryPage::Tail(page) => page.read().unwrap().set_indirection(slot, value),
        }
    }

    pub fn num_total_cols(&self) -> usize {
        match self {
            DirectoryPage::Base(page) => page.read().unwrap().num_total_cols(),
            DirectoryPage::Tail(page) => page.read().unwrap().num_total_cols(),
        }
    }

    pub fn is_base(&self) -> bool {
        matches!(self, DirectoryPage::Base(_))
    }

    /// Merge watermark of a base page; tail pages have none.
    pub fn tps(&self) -> Option<i64> {
        match self {
            DirectoryPage::Base(page) => Some(page.read().unwrap().tps()),
            DirectoryPage::Tail(_) => None,
        }
    }
}

/// Page directory - maps from the starting RID of every logical page to the
/// page object currently holding it. The merger replaces base entries at the
/// same key; lookups clone the entry out under a short critical section, so
/// concurrent readers see the pre- or post-merge page in full, never a torn
/// mixture.
pub struct PageDirectory {
    pages: Mutex<HashMap<RID, DirectoryPage>>,
}

impl PageDirectory {
    pub fn new() -> Self {
        PageDirectory {
            pages: Mutex::new(HashMap::new()),
        }
    }

    /// Register a page under its starting RID. Last writer wins per key,
    /// which is exactly the merge-replacement contract.
    pub fn insert(&self, starting_rid: RID, page: DirectoryPage) {
        self.pages.lock().unwrap().insert(starting_rid, page);
    }

    pub fn get(&self, starting_rid: RID) -> Option<DirectoryPage> {
        self.pages.lock().unwrap().get(&starting_rid).cloned()
    }

    /// Resolve any RID to its current page and slot.
    pub fn locate(&self, rid: RID) -> Option<(DirectoryPage, usize)> {
        let page = self.get(starting_rid_of(rid))?;
        Some((page, slot_of(rid)))
    }

    pub fn delete(&self, starting_rid: RID) {
        self.pages.lock().unwrap().remove(&starting_rid);
    }

    pub fn len(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().unwrap().is_empty()
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufferpool::BufferPool;
    use crate::constants::SLOTS_PER_PAGE;
    use crate::page::{Base, LogicalPage};
    use crate::rid::RIDGenerator;
    use std::sync::{Arc, RwLock};

    fn base_page(pool: &Arc<BufferPool>, generator: &RIDGenerator) -> SharedBasePage {
        Arc::new(RwLock::new(LogicalPage::<Base>::new(
            "t",
            3,
            Arc::clone(pool),
            generator,
        )))
    }

    #[test]
    fn locate_resolves_any_rid_of_a_page() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(dir.path(), 8).unwrap());
        let generator = RIDGenerator::new();
        let directory = PageDirectory::new();

        let page = base_page(&pool, &generator);
        let starting_rid = page.read().unwrap().starting_rid();
        directory.insert(starting_rid, DirectoryPage::Base(page));

        let (entry, slot) = directory.locate(starting_rid + 5).unwrap();
        assert!(entry.is_base());
        assert_eq!(slot, 5);

        // RIDs of the next page are not covered.
        assert!(directory.locate(starting_rid + SLOTS_PER_PAGE as RID).is_none());
    }

    #[test]
    fn reinsert_replaces_and_delete_removes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(dir.path(), 8).unwrap());
        let generator = RIDGenerator::new();
        let directory = PageDirectory::new();

        let first = base_page(&pool, &generator);
        let starting_rid = first.read().unwrap().starting_rid();
        directory.insert(starting_rid, DirectoryPage::Base(first));

        // Last writer wins at the same key, as merge installation requires.
        let replacement = base_page(&pool, &generator);
        directory.insert(starting_rid, DirectoryPage::Base(Arc::clone(&replacement)));
        assert_eq!(directory.len(), 1);

        directory.delete(starting_rid);
        assert!(directory.get(starting_rid).is_none());
        assert!(directory.is_empty());
    }
}
