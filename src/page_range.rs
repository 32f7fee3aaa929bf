use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use crate::bufferpool::BufferPool;
use crate::constants::{
    BASE_RID_REV_IDX, CUMULATIVE_METADATA_COLS, INDIRECTION_REV_IDX, LOGICAL_DELETE,
    MAX_BASE_PAGES_PER_RANGE, MERGE_TAIL_THRESHOLD, NON_CUMULATIVE_METADATA_COLS,
    SCHEMA_ENCODING_REV_IDX,
};
use crate::directory::{DirectoryPage, PageDirectory};
use crate::errors::{DatabaseError, DatabaseResult};
use crate::helpers::{schema_bit_set, schema_encoding};
use crate::page::{Base, LogicalPage, SharedBasePage, SharedTailPage, Tail};
use crate::rid::{starting_rid_of, RIDGenerator, RID};

/// A batch of merge work drained from a page range: the starting RIDs of the
/// sealed tail pages, the starting RIDs of the base pages they touched, and
/// the watermark of the previous merge pass.
pub struct MergeBatch {
    pub sealed_tail_pages: Vec<RID>,
    pub updated_base_pages: Vec<RID>,
    pub previous_watermark: RID,
}

/// Represents a page range: a bounded cluster of base pages plus an
/// unbounded, append-only chain of tail pages. The update/version chain
/// logic lives here.
///
/// The base-page list mutex doubles as the insert lock and the tail-page
/// list mutex as the update lock; readers take neither and rely on the
/// atomicity of single-slot writes through the buffer pool.
pub struct PageRange {
    /// Name of the owning table.
    table: String,

    num_user_cols: usize,
    num_total_cols: usize,

    /// Whether tail rows materialise the full record (cumulative) or only
    /// the updated columns plus a schema-encoding bitmask.
    cumulative: bool,

    /// The set of base pages associated with this page range. Its length
    /// never exceeds `MAX_BASE_PAGES_PER_RANGE`.
    base_pages: Mutex<Vec<SharedBasePage>>,

    /// The set of tail pages associated with this page range. Unbounded.
    tail_pages: Mutex<Vec<SharedTailPage>>,

    /// Starting RIDs of tail pages that filled up and will never be written
    /// again; candidates for the next merge pass.
    sealed_tail_pages: Mutex<Vec<RID>>,

    /// Starting RIDs of base pages touched by updates since the last merge
    /// enqueue.
    updated_base_pages: Mutex<HashSet<RID>>,

    /// Watermark handed to the merger as the lower bound of the next pass.
    tps_watermark: AtomicI64,

    directory: Arc<PageDirectory>,
    rid_generator: Arc<RIDGenerator>,
    pool: Arc<BufferPool>,
}

impl PageRange {
    pub fn new(
        table: &str,
        num_user_cols: usize,
        cumulative: bool,
        directory: Arc<PageDirectory>,
        rid_generator: Arc<RIDGenerator>,
        pool: Arc<BufferPool>,
    ) -> Self {
        let metadata_cols = if cumulative {
            CUMULATIVE_METADATA_COLS
        } else {
            NON_CUMULATIVE_METADATA_COLS
        };

        let range = PageRange {
            table: table.to_string(),
            num_user_cols,
            num_total_cols: num_user_cols + metadata_cols,
            cumulative,
            base_pages: Mutex::new(Vec::new()),
            tail_pages: Mutex::new(Vec::new()),
            sealed_tail_pages: Mutex::new(Vec::new()),
            updated_base_pages: Mutex::new(HashSet::new()),
            tps_watermark: AtomicI64::new(0),
            directory,
            rid_generator,
            pool,
        };

        range.base_pages.lock().unwrap().push(range.new_base_page());
        range.tail_pages.lock().unwrap().push(range.new_tail_page());
        range
    }

    /// Rebuild a range from persisted pages. The caller registers nothing;
    /// every page is re-inserted into the directory here.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        table: String,
        num_user_cols: usize,
        cumulative: bool,
        base_pages: Vec<LogicalPage<Base>>,
        tail_pages: Vec<LogicalPage<Tail>>,
        sealed_tail_pages: Vec<RID>,
        tps_watermark: RID,
        directory: Arc<PageDirectory>,
        rid_generator: Arc<RIDGenerator>,
        pool: Arc<BufferPool>,
    ) -> Self {
        let metadata_cols = if cumulative {
            CUMULATIVE_METADATA_COLS
        } else {
            NON_CUMULATIVE_METADATA_COLS
        };

        let base_pages: Vec<SharedBasePage> = base_pages
            .into_iter()
            .map(|page| Arc::new(RwLock::new(page)))
            .collect();
        let tail_pages: Vec<SharedTailPage> = tail_pages
            .into_iter()
            .map(|page| Arc::new(RwLock::new(page)))
            .collect();

        for page in &base_pages {
            let starting_rid = page.read().unwrap().starting_rid();
            directory.insert(starting_rid, DirectoryPage::Base(Arc::clone(page)));
        }
        for page in &tail_pages {
            let starting_rid = page.read().unwrap().starting_rid();
            directory.insert(starting_rid, DirectoryPage::Tail(Arc::clone(page)));
        }

        PageRange {
            table,
            num_user_cols,
            num_total_cols: num_user_cols + metadata_cols,
            cumulative,
            base_pages: Mutex::new(base_pages),
            tail_pages: Mutex::new(tail_pages),
            sealed_tail_pages: Mutex::new(sealed_tail_pages),
            updated_base_pages: Mutex::new(HashSet::new()),
            tps_watermark: AtomicI64::new(tps_watermark),
            directory,
            rid_generator,
            pool,
        }
    }

    pub fn num_user_cols(&self) -> usize {
        self.num_user_cols
    }

    pub fn num_total_cols(&self) -> usize {
        self.num_total_cols
    }

    pub fn is_cumulative(&self) -> bool {
        self.cumulative
    }

    pub fn indirection_col(&self) -> usize {
        self.num_total_cols - 1 - INDIRECTION_REV_IDX
    }

    pub fn base_rid_col(&self) -> usize {
        self.num_total_cols - 1 - BASE_RID_REV_IDX
    }

    pub fn schema_encoding_col(&self) -> usize {
        debug_assert!(!self.cumulative, "schema encoding is only stored in non-cumulative mode");
        self.num_total_cols - 1 - SCHEMA_ENCODING_REV_IDX
    }

    /// Whether every base page is allocated and full.
    pub fn is_full(&self) -> bool {
        let base_pages = self.base_pages.lock().unwrap();
        base_pages.len() == MAX_BASE_PAGES_PER_RANGE
            && base_pages.last().map_or(false, |page| page.read().unwrap().is_full())
    }

    /// Create a new **base record**. Appends to the newest base page, opening
    /// a new one when full; fails with `PageRangeFilled` once the range holds
    /// its maximum of full base pages.
    pub fn insert_record(&self, columns: &[i64]) -> DatabaseResult<RID> {
        let mut base_pages = self.base_pages.lock().unwrap();

        if base_pages.last().expect("range has a base page").read().unwrap().is_full() {
            if base_pages.len() == MAX_BASE_PAGES_PER_RANGE {
                return Err(DatabaseError::PageRangeFilled);
            }
            base_pages.push(self.new_base_page());
        }

        let page = Arc::clone(base_pages.last().expect("range has a base page"));

        // User columns now; metadata set once the RID is known.
        let mut row: Vec<Option<i64>> = columns.iter().copied().map(Some).collect();
        if !self.cumulative {
            row.push(Some(0)); // schema encoding
        }
        row.push(None); // base rid
        row.push(None); // indirection

        let (rid, slot) = page.write().unwrap().insert_record(&row)?;

        // The record's indirection points at itself until the first update.
        let guard = page.read().unwrap();
        guard.set_column(self.base_rid_col(), slot, rid)?;
        guard.set_indirection(slot, rid)?;

        Ok(rid)
    }

    /// Update an existing record: append a tail row, link it into the
    /// version chain, and re-point the base record's indirection at it.
    ///
    /// Returns the new tail RID and, per user column, the value the update
    /// displaced (`None` when the column did not change) so the table can
    /// fix up its secondary indexes.
    pub fn update_record(
        &self,
        base_rid: RID,
        columns: &[Option<i64>],
    ) -> DatabaseResult<(RID, Vec<Option<i64>>)> {
        if columns.len() != self.num_user_cols {
            return Err(DatabaseError::NoSuchColumn(columns.len()));
        }

        let mut tail_pages = self.tail_pages.lock().unwrap();

        let (base_page, base_slot) = self
            .directory
            .locate(base_rid)
            .ok_or(DatabaseError::RidNotFound(base_rid))?;
        let base_indirection = base_page.get_indirection(base_slot)?;
        if base_indirection == LOGICAL_DELETE {
            return Err(DatabaseError::RidNotFound(base_rid));
        }

        let mut latest_rid = base_indirection;

        // First update in cumulative mode: materialise a zeroth tail row
        // carrying the current base values, so the chain invariant "the
        // latest tail holds the full record" needs no special cases.
        if self.cumulative && base_indirection == base_rid {
            let mut zeroth: Vec<Option<i64>> = Vec::with_capacity(self.num_total_cols);
            for column in 0..self.num_user_cols {
                zeroth.push(Some(base_page.get_column(column, base_slot)?));
            }
            zeroth.push(Some(base_rid)); // base rid
            zeroth.push(Some(base_rid)); // indirection loops back to the base

            let zeroth_rid = self.append_tail_row(&mut tail_pages, &zeroth)?;
            base_page.set_indirection(base_slot, zeroth_rid)?;
            latest_rid = zeroth_rid;
        }

        let (latest_page, latest_slot) = if latest_rid == base_rid {
            (base_page.clone(), base_slot)
        } else {
            self.directory
                .locate(latest_rid)
                .ok_or(DatabaseError::RidNotFound(latest_rid))?
        };

        let mut displaced: Vec<Option<i64>> = vec![None; self.num_user_cols];
        let mut row: Vec<Option<i64>> = Vec::with_capacity(self.num_total_cols);

        if self.cumulative {
            // Merge null entries with the prior version's values.
            for column in 0..self.num_user_cols {
                let prior = latest_page.get_column(column, latest_slot)?;
                match columns[column] {
                    Some(update) => {
                        if update != prior {
                            displaced[column] = Some(prior);
                        }
                        row.push(Some(update));
                    }
                    None => row.push(Some(prior)),
                }
            }
        } else {
            // Store the supplied columns verbatim; the schema encoding marks
            // which positions this row carries.
            for column in 0..self.num_user_cols {
                match columns[column] {
                    Some(update) => {
                        let prior = self.get_latest_column_value(base_rid, column)?;
                        if update != prior {
                            displaced[column] = Some(prior);
                        }
                        row.push(Some(update));
                    }
                    None => row.push(None),
                }
            }
            row.push(Some(schema_encoding(columns, self.num_user_cols)));
        }

        row.push(Some(base_rid));
        row.push(Some(latest_rid));

        let tail_rid = self.append_tail_row(&mut tail_pages, &row)?;
        base_page.set_indirection(base_slot, tail_rid)?;

        self.updated_base_pages
            .lock()
            .unwrap()
            .insert(starting_rid_of(base_rid));

        Ok((tail_rid, displaced))
    }

    /// Latest value of one column of one record.
    pub fn get_latest_column_value(&self, base_rid: RID, column: usize) -> DatabaseResult<i64> {
        if column >= self.num_user_cols {
            return Err(DatabaseError::NoSuchColumn(column));
        }
        if self.cumulative {
            self.cumulative_latest_column_value(base_rid, column)
        } else {
            self.non_cumulative_latest_column_value(base_rid, column)
        }
    }

    /// Cumulative mode: the latest version materialises the whole record, so
    /// one indirection hop suffices. When the base page's merge watermark
    /// already covers the newest tail, the base image itself is current.
    fn cumulative_latest_column_value(&self, base_rid: RID, column: usize) -> DatabaseResult<i64> {
        let (base_page, base_slot) = self
            .directory
            .locate(base_rid)
            .ok_or(DatabaseError::RidNotFound(base_rid))?;
        let indirection = base_page.get_indirection(base_slot)?;

        if indirection == LOGICAL_DELETE {
            return Err(DatabaseError::RidNotFound(base_rid));
        }
        if indirection == base_rid {
            return base_page.get_column(column, base_slot);
        }
        if let Some(tps) = base_page.tps() {
            if tps != 0 && indirection.unsigned_abs() <= tps.unsigned_abs() {
                return base_page.get_column(column, base_slot);
            }
        }

        let (tail_page, tail_slot) = self
            .directory
            .locate(indirection)
            .ok_or(DatabaseError::RidNotFound(indirection))?;
        tail_page.get_column(column, tail_slot)
    }

    /// Non-cumulative mode: walk the chain from the base through newest to
    /// oldest tails, stopping at the earliest row whose schema encoding
    /// carries the column, or back at the base when no tail does.
    fn non_cumulative_latest_column_value(&self, base_rid: RID, column: usize) -> DatabaseResult<i64> {
        let schema_col = self.schema_encoding_col();
        let (mut page, mut slot) = self
            .directory
            .locate(base_rid)
            .ok_or(DatabaseError::RidNotFound(base_rid))?;

        loop {
            let schema = page.get_column(schema_col, slot)?;
            if schema_bit_set(schema, column, self.num_user_cols) {
                break;
            }

            let next = page.get_indirection(slot)?;
            if next == LOGICAL_DELETE {
                return Err(DatabaseError::RidNotFound(base_rid));
            }
            let (next_page, next_slot) = self
                .directory
                .locate(next)
                .ok_or(DatabaseError::RidNotFound(next))?;
            page = next_page;
            slot = next_slot;
            if next == base_rid {
                break;
            }
        }

        page.get_column(column, slot)
    }

    /// Logically delete a record: snapshot its indexed columns, then stamp
    /// `LOGICAL_DELETE` through every row of its version chain.
    pub fn invalidate_record(
        &self,
        base_rid: RID,
        indexed_columns: &[bool],
    ) -> DatabaseResult<Vec<Option<i64>>> {
        let _update_guard = self.tail_pages.lock().unwrap();

        let mut snapshot: Vec<Option<i64>> = Vec::with_capacity(indexed_columns.len());
        for (column, indexed) in indexed_columns.iter().enumerate() {
            if *indexed {
                snapshot.push(Some(self.get_latest_column_value(base_rid, column)?));
            } else {
                snapshot.push(None);
            }
        }

        let mut current = base_rid;
        loop {
            let (page, slot) = self
                .directory
                .locate(current)
                .ok_or(DatabaseError::RidNotFound(current))?;
            let next = page.get_indirection(slot)?;
            page.set_indirection(slot, LOGICAL_DELETE)?;
            if next == base_rid || next == LOGICAL_DELETE {
                break;
            }
            current = next;
        }

        Ok(snapshot)
    }

    /// Diagnostic: the record's full version chain, base first, following
    /// indirection until it loops back. Columns a non-cumulative tail row
    /// never wrote read as zero.
    pub fn tail_chain(&self, base_rid: RID) -> DatabaseResult<Vec<(RID, Vec<i64>)>> {
        let mut chain = Vec::new();
        let mut current = base_rid;

        loop {
            let (page, slot) = self
                .directory
                .locate(current)
                .ok_or(DatabaseError::RidNotFound(current))?;

            let mut row = Vec::with_capacity(self.num_total_cols);
            for column in 0..self.num_total_cols {
                match page.get_column(column, slot) {
                    Ok(value) => row.push(value),
                    Err(DatabaseError::PageNotFound(_)) => row.push(0),
                    Err(error) => return Err(error),
                }
            }

            let next = row[self.indirection_col()];
            chain.push((current, row));
            if next == base_rid || next == LOGICAL_DELETE {
                break;
            }
            current = next;
        }

        Ok(chain)
    }

    /// Number of sealed tail pages awaiting a merge pass.
    pub fn sealed_tail_count(&self) -> usize {
        self.sealed_tail_pages.lock().unwrap().len()
    }

    /// Drain the sealed-tail and updated-base lists once the merge threshold
    /// is reached. Only one caller observes the batch.
    pub fn take_merge_batch(&self) -> Option<MergeBatch> {
        let mut sealed = self.sealed_tail_pages.lock().unwrap();
        if sealed.len() < MERGE_TAIL_THRESHOLD {
            return None;
        }

        let sealed_tail_pages = std::mem::take(&mut *sealed);
        let updated_base_pages: Vec<RID> =
            self.updated_base_pages.lock().unwrap().drain().collect();

        Some(MergeBatch {
            sealed_tail_pages,
            updated_base_pages,
            previous_watermark: self.tps_watermark.load(Ordering::SeqCst),
        })
    }

    pub fn watermark(&self) -> RID {
        self.tps_watermark.load(Ordering::SeqCst)
    }

    pub fn set_watermark(&self, watermark: RID) {
        self.tps_watermark.store(watermark, Ordering::SeqCst);
    }

    /// Swap a merged copy into place of the live page with the same starting
    /// RID, reconciling any rows inserted since the merger took its
    /// snapshot, and republish it in the page directory. Runs under the
    /// insert lock so racing inserts see either the old or the new page.
    pub fn install_merged_page(&self, mut copy: LogicalPage<Base>) -> DatabaseResult<()> {
        let mut base_pages = self.base_pages.lock().unwrap();

        let starting_rid = copy.starting_rid();
        let index = base_pages
            .iter()
            .position(|page| page.read().unwrap().starting_rid() == starting_rid)
            .ok_or(DatabaseError::RidNotFound(starting_rid))?;

        {
            let live = base_pages[index].read().unwrap();
            let live_slots: HashSet<usize> = live.available_slots().iter().copied().collect();
            for slot in copy.available_slots().to_vec() {
                if !live_slots.contains(&slot) {
                    // Inserted while the merge ran; carry the row over.
                    for column in 0..self.num_user_cols {
                        let value = live.get_column(column, slot)?;
                        copy.set_column(column, slot, value)?;
                    }
                }
            }
            copy.adopt_slot_state(live.available_slots().to_vec(), live.reserved_rids().to_vec());
        }

        debug!(
            "installing merged base page {} (iteration {})",
            starting_rid,
            copy.merge_iteration()
        );

        let shared = Arc::new(RwLock::new(copy));
        base_pages[index] = Arc::clone(&shared);
        self.directory.insert(starting_rid, DirectoryPage::Base(shared));
        Ok(())
    }

    /// Snapshot handles to the base pages named by a merge batch.
    pub fn base_pages_by_starting_rid(&self, starting_rids: &[RID]) -> Vec<SharedBasePage> {
        let base_pages = self.base_pages.lock().unwrap();
        base_pages
            .iter()
            .filter(|page| starting_rids.contains(&page.read().unwrap().starting_rid()))
            .map(Arc::clone)
            .collect()
    }

    /// Handle to the base page starting at `starting_rid`, if this range
    /// owns it.
    pub fn base_page(&self, starting_rid: RID) -> Option<SharedBasePage> {
        let base_pages = self.base_pages.lock().unwrap();
        base_pages
            .iter()
            .find(|page| page.read().unwrap().starting_rid() == starting_rid)
            .map(Arc::clone)
    }

    pub fn directory(&self) -> Arc<PageDirectory> {
        Arc::clone(&self.directory)
    }

    /// Handles to persist at close.
    pub fn pages_for_persist(&self) -> (Vec<SharedBasePage>, Vec<SharedTailPage>, Vec<RID>) {
        (
            self.base_pages.lock().unwrap().clone(),
            self.tail_pages.lock().unwrap().clone(),
            self.sealed_tail_pages.lock().unwrap().clone(),
        )
    }

    fn new_base_page(&self) -> SharedBasePage {
        let page = Arc::new(RwLock::new(LogicalPage::<Base>::new(
            &self.table,
            self.num_total_cols,
            Arc::clone(&self.pool),
            &self.rid_generator,
        )));
        let starting_rid = page.read().unwrap().starting_rid();
        self.directory.insert(starting_rid, DirectoryPage::Base(Arc::clone(&page)));
        page
    }

    fn new_tail_page(&self) -> SharedTailPage {
        let page = Arc::new(RwLock::new(LogicalPage::<Tail>::new(
            &self.table,
            self.num_total_cols,
            Arc::clone(&self.pool),
            &self.rid_generator,
        )));
        let starting_rid = page.read().unwrap().starting_rid();
        self.directory.insert(starting_rid, DirectoryPage::Tail(Arc::clone(&page)));
        page
    }

    /// Append one tail row, sealing the open tail page first when it is
    /// full. Sealed pages are never written again.
    fn append_tail_row(
        &self,
        tail_pages: &mut Vec<SharedTailPage>,
        row: &[Option<i64>],
    ) -> DatabaseResult<RID> {
        if tail_pages.last().expect("range has a tail page").read().unwrap().is_full() {
            let sealed_rid = tail_pages.last().unwrap().read().unwrap().starting_rid();
            self.sealed_tail_pages.lock().unwrap().push(sealed_rid);
            tail_pages.push(self.new_tail_page());
        }

        let page = Arc::clone(tail_pages.last().expect("range has a tail page"));
        let (rid, _slot) = page.write().unwrap().insert_record(row)?;
        Ok(rid)
    }
}
