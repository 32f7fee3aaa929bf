use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use crate::bufferpool::{BufferPool, PhysicalPageID};
use crate::errors::{DatabaseError, DatabaseResult};
use crate::rid::{base_page_id, tail_page_id, RIDGenerator, RID};

/// Zero sized struct representing **base** pages.
#[derive(Clone, Copy, Debug)]
pub struct Base;

/// Zero sized struct representing **tail** pages.
#[derive(Clone, Copy, Debug)]
pub struct Tail;

pub type SharedBasePage = Arc<RwLock<LogicalPage<Base>>>;
pub type SharedTailPage = Arc<RwLock<LogicalPage<Tail>>>;

/// Represents a **logical** base or tail page, depending on the provided
/// generic type argument: one record-slot unit across all columns of a
/// table, materialised as one physical page per column and fetched lazily
/// through the buffer pool.
pub struct LogicalPage<T> {
    /// Name of the owning table; part of every physical page identity.
    table: String,

    /// First RID of this page; the page's key in the page directory.
    starting_rid: RID,

    /// User columns followed by metadata columns.
    num_total_cols: usize,

    /// Physical page identifiers, one per column.
    columns: Vec<PhysicalPageID>,

    /// Free slots, popped `0, 1, 2, ...`.
    available_slots: Vec<usize>,

    /// RIDs reserved for this page, popped in lockstep with the slots.
    reserved_rids: Vec<RID>,

    /// How many times the merger has republished this page. Base pages only;
    /// stays 0 for tail pages.
    merge_iteration: u64,

    /// Tail-page-sequence watermark: the newest tail RID already folded into
    /// this page's user columns. Base pages only.
    tps: RID,

    /// Buffer pool shared by all tables.
    pool: Arc<BufferPool>,

    /// Phantom field for the generic type argument.
    phantom: PhantomData<T>,
}

/// Methods for all logical pages.
impl<T> LogicalPage<T> {
    /// Insert a new record given one value per column. Only non-null columns
    /// are written; the popped RID and slot are returned so the caller can
    /// link the row in afterwards.
    pub fn insert_record(&mut self, columns: &[Option<i64>]) -> DatabaseResult<(RID, usize)> {
        let slot = self.available_slots.pop().ok_or(DatabaseError::LogicalPageFull)?;
        let rid = self.reserved_rids.pop().expect("rid pool drained before slot pool");

        for (column, value) in self.columns.iter().zip(columns.iter()) {
            if let Some(value) = value {
                self.pool.write_value(column, slot, *value)?;
            }
        }

        Ok((rid, slot))
    }

    /// Read one column of one record through the buffer pool.
    pub fn get_column(&self, column: usize, slot: usize) -> DatabaseResult<i64> {
        self.pool.read_value(&self.columns[column], slot)
    }

    /// Overwrite one column of one record through the buffer pool.
    pub fn set_column(&self, column: usize, slot: usize, value: i64) -> DatabaseResult<()> {
        self.pool.write_value(&self.columns[column], slot, value)
    }

    /// Convenience for the indirection column, which is always last.
    pub fn set_indirection(&self, slot: usize, value: i64) -> DatabaseResult<()> {
        self.set_column(self.num_total_cols - 1, slot, value)
    }

    pub fn get_indirection(&self, slot: usize) -> DatabaseResult<i64> {
        self.get_column(self.num_total_cols - 1, slot)
    }

    pub fn is_full(&self) -> bool {
        self.available_slots.is_empty()
    }

    pub fn starting_rid(&self) -> RID {
        self.starting_rid
    }

    pub fn num_total_cols(&self) -> usize {
        self.num_total_cols
    }

    pub fn column_ids(&self) -> &[PhysicalPageID] {
        &self.columns
    }

    pub fn available_slots(&self) -> &[usize] {
        &self.available_slots
    }

    pub fn reserved_rids(&self) -> &[RID] {
        &self.reserved_rids
    }

    pub fn merge_iteration(&self) -> u64 {
        self.merge_iteration
    }

    /// Tail-page-sequence watermark. Meaningful for base pages; stays 0 for
    /// tail pages.
    pub fn tps(&self) -> RID {
        self.tps
    }

    /// Rebuild a page from persisted catalog state.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        table: String,
        starting_rid: RID,
        columns: Vec<PhysicalPageID>,
        available_slots: Vec<usize>,
        reserved_rids: Vec<RID>,
        merge_iteration: u64,
        tps: RID,
        pool: Arc<BufferPool>,
    ) -> Self {
        LogicalPage {
            table,
            starting_rid,
            num_total_cols: columns.len(),
            columns,
            available_slots,
            reserved_rids,
            merge_iteration,
            tps,
            pool,
            phantom: PhantomData,
        }
    }
}

/// Methods for logical **base** pages.
impl LogicalPage<Base> {
    /// Create a new base page, reserving a block of base RIDs for it.
    pub fn new(
        table: &str,
        num_total_cols: usize,
        pool: Arc<BufferPool>,
        rid_generator: &RIDGenerator,
    ) -> Self {
        let reserved_rids = rid_generator.reserve_base_page();
        let starting_rid = *reserved_rids.last().expect("empty rid reservation");

        LogicalPage {
            table: table.to_string(),
            starting_rid,
            num_total_cols,
            columns: (0..num_total_cols)
                .map(|column| base_page_id(table, starting_rid, column, 0))
                .collect(),
            available_slots: (0..reserved_rids.len()).rev().collect(),
            reserved_rids,
            merge_iteration: 0,
            tps: 0,
            pool,
            phantom: PhantomData,
        }
    }

    /// Overwrite the user columns of one record in place, leaving the
    /// metadata columns untouched. Used exclusively by the merger.
    pub fn update_record(&self, slot: usize, user_columns: &[Option<i64>]) -> DatabaseResult<()> {
        for (column, value) in user_columns.iter().enumerate() {
            if let Some(value) = value {
                self.set_column(column, slot, *value)?;
            }
        }
        Ok(())
    }

    /// Produce the merge copy of this page: a fresh merge iteration whose
    /// user-column physical pages are duplicated through the buffer pool and
    /// whose metadata columns keep the original page ids. Indirection writes
    /// that land after this snapshot therefore remain visible to the copy.
    pub fn copy_for_merge(&self, num_user_cols: usize) -> DatabaseResult<LogicalPage<Base>> {
        let merge_iteration = self.merge_iteration + 1;
        let mut columns = Vec::with_capacity(self.num_total_cols);

        for (index, column) in self.columns.iter().enumerate() {
            if index < num_user_cols {
                let copy_id = base_page_id(&self.table, self.starting_rid, index, merge_iteration);
                self.pool.copy_page(column, &copy_id)?;
                columns.push(copy_id);
            } else {
                columns.push(column.clone());
            }
        }

        Ok(LogicalPage {
            table: self.table.clone(),
            starting_rid: self.starting_rid,
            num_total_cols: self.num_total_cols,
            columns,
            available_slots: self.available_slots.clone(),
            reserved_rids: self.reserved_rids.clone(),
            merge_iteration,
            tps: self.tps,
            pool: Arc::clone(&self.pool),
            phantom: PhantomData,
        })
    }

    pub fn set_tps(&mut self, tps: RID) {
        self.tps = tps;
    }

    /// Hold this page's user-column physical pages resident in the pool.
    pub fn pin_user_columns(&self, num_user_cols: usize) -> DatabaseResult<()> {
        for column in self.columns.iter().take(num_user_cols) {
            self.pool.pin_page(column)?;
        }
        Ok(())
    }

    pub fn unpin_user_columns(&self, num_user_cols: usize) -> DatabaseResult<()> {
        for column in self.columns.iter().take(num_user_cols) {
            self.pool.unpin_page(column)?;
        }
        Ok(())
    }

    /// Adopt the free-slot state of the live page this copy is replacing.
    /// Called by the merger right before installing the copy.
    pub fn adopt_slot_state(&mut self, available_slots: Vec<usize>, reserved_rids: Vec<RID>) {
        self.available_slots = available_slots;
        self.reserved_rids = reserved_rids;
    }
}

/// Methods for logical **tail** pages.
impl LogicalPage<Tail> {
    /// Create a new tail page, reserving a block of tail RIDs for it.
    pub fn new(
        table: &str,
        num_total_cols: usize,
        pool: Arc<BufferPool>,
        rid_generator: &RIDGenerator,
    ) -> Self {
        let reserved_rids = rid_generator.reserve_tail_page();
        let starting_rid = *reserved_rids.last().expect("empty rid reservation");

        LogicalPage {
            table: table.to_string(),
            starting_rid,
            num_total_cols,
            columns: (0..num_total_cols)
                .map(|column| tail_page_id(table, starting_rid, column))
                .collect(),
            available_slots: (0..reserved_rids.len()).rev().collect(),
            reserved_rids,
            merge_iteration: 0,
            tps: 0,
            pool,
            phantom: PhantomData,
        }
    }
}
