use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::bufferpool::BufferPool;
use crate::constants::{LOGICAL_DELETE, RECORDS_PER_PAGE_RANGE, SLOTS_PER_PAGE};
use crate::directory::PageDirectory;
use crate::errors::{DatabaseError, DatabaseResult};
use crate::helpers::schema_bit_set;
use crate::index::PrimaryIndex;
use crate::page::{Base, LogicalPage, Tail};
use crate::page_range::{MergeBatch, PageRange};
use crate::persistables::{
    LogicalPagePersistable, PageRangePersistable, SecondaryIndexConfig, TableMetadata,
};
use crate::rid::{slot_of, starting_rid_of, RIDGenerator, RID};
use crate::secondary::{
    IndexOperation, IndexReply, IndexRequest, SecondaryIndex, SecondaryIndexHandle,
    SecondaryStructure,
};

/// How long a waiter polls an index worker's outbox before giving up.
const INDEX_WAIT_ATTEMPTS: usize = 500;
const INDEX_WAIT_SLICE: Duration = Duration::from_millis(10);

/// Per-table configuration fixed at creation.
#[derive(Clone, Copy, Debug)]
pub struct TableOptions {
    /// Cumulative tail rows (full record per version) or non-cumulative
    /// (updated columns plus a schema encoding).
    pub cumulative: bool,

    /// Container shape of the secondary indexes; `None` disables them.
    pub secondary: Option<SecondaryStructure>,

    /// Run each secondary index on its own worker thread.
    pub multiprocess_secondary: bool,

    /// Maintain a seed set alongside each secondary index.
    pub seeded_secondary: bool,
}

impl Default for TableOptions {
    fn default() -> Self {
        TableOptions {
            cumulative: true,
            secondary: Some(SecondaryStructure::Set),
            multiprocess_secondary: false,
            seeded_secondary: false,
        }
    }
}

/// Represents a merge request. Sent through the merge sender channel when a
/// page range accumulates enough sealed tail pages.
struct MergeRequest {
    range: Arc<PageRange>,
    sealed_tail_pages: Vec<RID>,
    updated_base_pages: Vec<RID>,
    previous_watermark: RID,
}

/// Represents a table: the owner of page ranges, indexes, the RID generator,
/// and the background merger, exposing the record-level operations the query
/// and transaction layers invoke.
pub struct Table {
    /// Name of the table.
    pub name: String,

    /// Number of user columns.
    pub num_columns: usize,

    /// Index of the primary key column.
    key_column: usize,

    options: TableOptions,

    /// Page ranges associated with this table. Expanded dynamically.
    page_ranges: Mutex<Vec<Arc<PageRange>>>,

    /// Page directory - maps starting RIDs to the logical pages holding them.
    page_directory: Arc<PageDirectory>,

    rid_generator: Arc<RIDGenerator>,

    primary_index: PrimaryIndex,

    /// One optional handle per user column; always `None` at the key column.
    secondary_indices: Vec<Option<SecondaryIndexHandle>>,

    /// Buffer pool shared by all tables.
    pool: Arc<BufferPool>,

    /// Database root; secondary-index files live here.
    root: PathBuf,

    /// Sender channel used to submit merge requests.
    merge_sender: Mutex<Option<Sender<MergeRequest>>>,
    merge_worker: Mutex<Option<JoinHandle<()>>>,
    merge_continue: Arc<AtomicBool>,

    /// Monotonic id source for async index requests.
    next_request_id: AtomicU64,

    /// Outstanding async request ids, mapped to their column.
    pending_requests: Mutex<HashMap<u64, usize>>,

    /// Replies collected while waiting for other requests.
    completed_requests: Mutex<HashMap<u64, IndexReply>>,
}

impl Table {
    /// Create a brand-new table.
    pub fn create(
        name: &str,
        num_columns: usize,
        key_column: usize,
        options: TableOptions,
        pool: Arc<BufferPool>,
        root: &Path,
    ) -> DatabaseResult<Arc<Table>> {
        assert!(key_column < num_columns, "key column out of bounds");

        let page_directory = Arc::new(PageDirectory::new());
        let rid_generator = Arc::new(RIDGenerator::new());

        let first_range = Arc::new(PageRange::new(
            name,
            num_columns,
            options.cumulative,
            Arc::clone(&page_directory),
            Arc::clone(&rid_generator),
            Arc::clone(&pool),
        ));

        let secondary_indices =
            Self::build_secondary_indices(name, num_columns, key_column, &options, root, false)?;

        Ok(Self::assemble(
            name.to_string(),
            num_columns,
            key_column,
            options,
            vec![first_range],
            page_directory,
            rid_generator,
            PrimaryIndex::new(),
            secondary_indices,
            pool,
            root.to_path_buf(),
        ))
    }

    /// Rebuild a table from its catalog entry.
    pub fn from_metadata(
        metadata: TableMetadata,
        pool: Arc<BufferPool>,
        root: &Path,
    ) -> DatabaseResult<Arc<Table>> {
        let options = TableOptions {
            cumulative: metadata.cumulative,
            secondary: metadata.secondary.map(|config| config.structure),
            multiprocess_secondary: metadata.secondary.map_or(false, |config| config.multiprocess),
            seeded_secondary: metadata.secondary.map_or(false, |config| config.seeded),
        };

        let page_directory = Arc::new(PageDirectory::new());
        let rid_generator = Arc::new(RIDGenerator::from_counters(
            metadata.next_base_rid,
            metadata.next_tail_rid,
        ));

        fn restore_page<T>(
            table_name: &str,
            page: &LogicalPagePersistable,
            pool: &Arc<BufferPool>,
        ) -> LogicalPage<T> {
            LogicalPage::restore(
                table_name.to_string(),
                page.starting_rid,
                page.columns.clone(),
                page.available_slots.clone(),
                page.reserved_rids.clone(),
                page.merge_iteration,
                page.tps,
                Arc::clone(pool),
            )
        }

        let mut page_ranges = Vec::with_capacity(metadata.page_ranges.len());
        for range in &metadata.page_ranges {
            page_ranges.push(Arc::new(PageRange::from_parts(
                metadata.name.clone(),
                metadata.num_columns,
                metadata.cumulative,
                range
                    .base_pages
                    .iter()
                    .map(|page| restore_page::<Base>(&metadata.name, page, &pool))
                    .collect(),
                range
                    .tail_pages
                    .iter()
                    .map(|page| restore_page::<Tail>(&metadata.name, page, &pool))
                    .collect(),
                range.sealed_tail_pages.clone(),
                range.tps_watermark,
                Arc::clone(&page_directory),
                Arc::clone(&rid_generator),
                Arc::clone(&pool),
            )));
        }

        let secondary_indices = Self::build_secondary_indices(
            &metadata.name,
            metadata.num_columns,
            metadata.key_column,
            &options,
            root,
            true,
        )?;

        info!("reopened table {} with {} page ranges", metadata.name, page_ranges.len());

        Ok(Self::assemble(
            metadata.name,
            metadata.num_columns,
            metadata.key_column,
            options,
            page_ranges,
            page_directory,
            rid_generator,
            PrimaryIndex::from_map(metadata.primary_index),
            secondary_indices,
            pool,
            root.to_path_buf(),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        name: String,
        num_columns: usize,
        key_column: usize,
        options: TableOptions,
        page_ranges: Vec<Arc<PageRange>>,
        page_directory: Arc<PageDirectory>,
        rid_generator: Arc<RIDGenerator>,
        primary_index: PrimaryIndex,
        secondary_indices: Vec<Option<SecondaryIndexHandle>>,
        pool: Arc<BufferPool>,
        root: PathBuf,
    ) -> Arc<Table> {
        let merge_continue = Arc::new(AtomicBool::new(true));
        let merge_sender = start_merge_thread(Arc::clone(&merge_continue));

        Arc::new(Table {
            name,
            num_columns,
            key_column,
            options,
            page_ranges: Mutex::new(page_ranges),
            page_directory,
            rid_generator,
            primary_index,
            secondary_indices,
            pool,
            root,
            merge_sender: Mutex::new(Some(merge_sender.0)),
            merge_worker: Mutex::new(Some(merge_sender.1)),
            merge_continue,
            next_request_id: AtomicU64::new(0),
            pending_requests: Mutex::new(HashMap::new()),
            completed_requests: Mutex::new(HashMap::new()),
        })
    }

    fn build_secondary_indices(
        name: &str,
        num_columns: usize,
        key_column: usize,
        options: &TableOptions,
        root: &Path,
        load: bool,
    ) -> DatabaseResult<Vec<Option<SecondaryIndexHandle>>> {
        let mut handles = Vec::with_capacity(num_columns);

        for column in 0..num_columns {
            let structure = match options.secondary {
                Some(structure) if column != key_column => structure,
                _ => {
                    handles.push(None);
                    continue;
                }
            };

            let mut index =
                SecondaryIndex::new(root, name, column, structure, options.seeded_secondary);
            if load {
                index.load_index()?;
            }
            handles.push(Some(SecondaryIndexHandle::new(
                index,
                options.multiprocess_secondary,
            )));
        }

        Ok(handles)
    }

    pub fn key_column(&self) -> usize {
        self.key_column
    }

    pub fn is_cumulative(&self) -> bool {
        self.options.cumulative
    }

    /// Base RID currently mapped to a primary key.
    pub fn rid_for_key(&self, key: i64) -> DatabaseResult<RID> {
        self.primary_index.get(key)
    }

    /// Create a new **base record**. Fails when the primary key is taken;
    /// allocates a new page range when the last one is full.
    pub fn insert_record(&self, columns: &[i64]) -> DatabaseResult<RID> {
        if columns.len() != self.num_columns {
            return Err(DatabaseError::NoSuchColumn(columns.len()));
        }

        let key = columns[self.key_column];
        if self.primary_index.exists(key) {
            return Err(DatabaseError::DuplicateKey(key));
        }

        let range = self.open_range();
        let rid = match range.insert_record(columns) {
            Ok(rid) => rid,
            Err(DatabaseError::PageRangeFilled) => {
                // Lost a race for the last slots; re-resolve the open range
                // (allocating the next one at most once) and retry.
                self.open_range().insert_record(columns)?
            }
            Err(error) => return Err(error),
        };

        self.primary_index.add(key, rid)?;

        for column in 0..self.num_columns {
            if self.secondary_indices[column].is_some() {
                self.post_secondary(
                    column,
                    vec![IndexOperation::Insert {
                        key: columns[column],
                        rid,
                    }],
                );
            }
        }

        Ok(rid)
    }

    /// Update an existing record: append a tail version and fix the indexes
    /// up. `None` entries leave their column unchanged.
    pub fn update_record(&self, key: i64, columns: &[Option<i64>]) -> DatabaseResult<RID> {
        if columns.len() != self.num_columns {
            return Err(DatabaseError::NoSuchColumn(columns.len()));
        }

        let rid = self.primary_index.get(key)?;

        // Refuse a key change that would collide before touching any state.
        if let Some(new_key) = columns[self.key_column] {
            if new_key != key && self.primary_index.exists(new_key) {
                return Err(DatabaseError::DuplicateKey(new_key));
            }
        }

        let range = self.range_of(rid)?;
        let (tail_rid, displaced) = range.update_record(rid, columns)?;

        if let Some(new_key) = columns[self.key_column] {
            if new_key != key {
                self.primary_index.delete(key)?;
                self.primary_index.add(new_key, rid)?;
            }
        }

        // Apply the displaced-value diff to the secondary indexes.
        for column in 0..self.num_columns {
            if self.secondary_indices[column].is_none() {
                continue;
            }
            if let Some(old_value) = displaced[column] {
                let new_value = columns[column].expect("displaced column carries an update");
                self.post_secondary(
                    column,
                    vec![
                        IndexOperation::Delete { key: old_value, rid },
                        IndexOperation::Insert { key: new_value, rid },
                    ],
                );
            }
        }

        if let Some(batch) = range.take_merge_batch() {
            self.enqueue_merge(Arc::clone(&range), batch);
        }

        Ok(tail_rid)
    }

    /// Logically delete a record and drop it from every index. Its RIDs are
    /// never reused.
    pub fn delete_record(&self, key: i64) -> DatabaseResult<()> {
        let rid = self.primary_index.get(key)?;
        let range = self.range_of(rid)?;

        let indexed: Vec<bool> = (0..self.num_columns)
            .map(|column| self.secondary_indices[column].is_some())
            .collect();
        let snapshot = range.invalidate_record(rid, &indexed)?;

        self.primary_index.delete(key)?;

        for (column, value) in snapshot.iter().enumerate() {
            if let Some(value) = value {
                self.post_secondary(
                    column,
                    vec![IndexOperation::Delete { key: *value, rid }],
                );
            }
        }

        Ok(())
    }

    /// Latest values of the projected columns, one row per input RID.
    pub fn get_latest_column_values(
        &self,
        rids: &[RID],
        projection: &[usize],
    ) -> DatabaseResult<Vec<Vec<i64>>> {
        let mut rows = Vec::with_capacity(rids.len());

        for rid in rids {
            let range = self.range_of(*rid)?;
            let mut row = Vec::new();
            for (column, include) in projection.iter().enumerate().take(self.num_columns) {
                if *include != 0 {
                    row.push(range.get_latest_column_value(*rid, column)?);
                }
            }
            rows.push(row);
        }

        Ok(rows)
    }

    /// RID of the version `relative_version` steps behind the latest, clamped
    /// at the base record. `0` is the latest version.
    pub fn get_versioned_rid(&self, rid: RID, relative_version: i64) -> DatabaseResult<RID> {
        let (base_page, base_slot) = self
            .page_directory
            .locate(rid)
            .ok_or(DatabaseError::RidNotFound(rid))?;

        let mut current = base_page.get_indirection(base_slot)?;
        if current == LOGICAL_DELETE {
            return Err(DatabaseError::RidNotFound(rid));
        }

        let mut remaining = relative_version.unsigned_abs();
        while remaining > 0 && current != rid {
            let (page, slot) = self
                .page_directory
                .locate(current)
                .ok_or(DatabaseError::RidNotFound(current))?;
            current = page.get_indirection(slot)?;
            remaining -= 1;
        }

        Ok(current)
    }

    /// Projected column values as of a historical version.
    pub fn get_versioned_column_values(
        &self,
        rid: RID,
        projection: &[usize],
        relative_version: i64,
    ) -> DatabaseResult<Vec<i64>> {
        let version_rid = self.get_versioned_rid(rid, relative_version)?;
        let mut row = Vec::new();

        for (column, include) in projection.iter().enumerate().take(self.num_columns) {
            if *include != 0 {
                row.push(self.versioned_column_value(rid, version_rid, column)?);
            }
        }

        Ok(row)
    }

    /// Every base RID whose current value in `column` equals `value`,
    /// answered by the cheapest index available.
    pub fn locate(&self, column: usize, value: i64) -> DatabaseResult<Vec<RID>> {
        if column >= self.num_columns {
            return Err(DatabaseError::NoSuchColumn(column));
        }

        if column == self.key_column {
            return Ok(match self.primary_index.get(value) {
                Ok(rid) => vec![rid],
                Err(_) => Vec::new(),
            });
        }

        if self.secondary_indices[column].is_some() {
            return self.secondary_search(column, value);
        }

        self.brute_force_search(value, column)
    }

    /// Fallback scan over the primary index when no secondary index covers
    /// the column.
    pub fn brute_force_search(&self, value: i64, column: usize) -> DatabaseResult<Vec<RID>> {
        let mut matches = Vec::new();

        for (_, rid) in self.primary_index.snapshot() {
            let range = self.range_of(rid)?;
            if range.get_latest_column_value(rid, column)? == value {
                matches.push(rid);
            }
        }

        Ok(matches)
    }

    /// Sum one column over every record whose primary key falls in the
    /// inclusive range.
    pub fn sum_column(&self, start_key: i64, end_key: i64, column: usize) -> DatabaseResult<i64> {
        if column >= self.num_columns {
            return Err(DatabaseError::NoSuchColumn(column));
        }

        let mut sum = 0i64;
        for rid in self.primary_index.rids_in_key_range(start_key, end_key) {
            let range = self.range_of(rid)?;
            sum += range.get_latest_column_value(rid, column)?;
        }

        Ok(sum)
    }

    /// Diagnostic: the full version chain of the record holding `key`.
    pub fn tail_chain(&self, key: i64) -> DatabaseResult<Vec<(RID, Vec<i64>)>> {
        let rid = self.primary_index.get(key)?;
        self.range_of(rid)?.tail_chain(rid)
    }

    pub fn num_page_ranges(&self) -> usize {
        self.page_ranges.lock().unwrap().len()
    }

    pub fn range_watermark(&self, range_index: usize) -> Option<RID> {
        self.page_ranges
            .lock()
            .unwrap()
            .get(range_index)
            .map(|range| range.watermark())
    }

    /// Block until every outstanding async index request has a reply.
    pub fn wait_all(&self) -> DatabaseResult<()> {
        let mut idle_rounds = 0;

        loop {
            if self.pending_requests.lock().unwrap().is_empty() {
                return Ok(());
            }

            if self.drain_responses() {
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
                if idle_rounds > INDEX_WAIT_ATTEMPTS {
                    return Err(DatabaseError::IndexWorker(
                        "timed out waiting for index workers".to_string(),
                    ));
                }
            }
        }
    }

    /// Block until the reply for one specific request id arrives and take it.
    pub fn wait_for_request(&self, request_id: u64) -> DatabaseResult<IndexReply> {
        let mut idle_rounds = 0;

        loop {
            if let Some(reply) = self.completed_requests.lock().unwrap().remove(&request_id) {
                return Ok(reply);
            }

            let known = self.pending_requests.lock().unwrap().contains_key(&request_id);
            if !known {
                return Err(DatabaseError::IndexWorker(format!(
                    "unknown index request id {}",
                    request_id
                )));
            }

            if self.drain_responses() {
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
                if idle_rounds > INDEX_WAIT_ATTEMPTS {
                    return Err(DatabaseError::IndexWorker(format!(
                        "timed out waiting for index request {}",
                        request_id
                    )));
                }
            }
        }
    }

    /// Persistable snapshot of this table.
    pub fn metadata(&self) -> TableMetadata {
        let (next_base_rid, next_tail_rid) = self.rid_generator.counters();

        let page_ranges = self
            .page_ranges
            .lock()
            .unwrap()
            .iter()
            .map(|range| {
                let (base_pages, tail_pages, sealed) = range.pages_for_persist();
                PageRangePersistable {
                    base_pages: base_pages
                        .iter()
                        .map(|page| LogicalPagePersistable::from_page(&*page.read().unwrap()))
                        .collect(),
                    tail_pages: tail_pages
                        .iter()
                        .map(|page| LogicalPagePersistable::from_page(&*page.read().unwrap()))
                        .collect(),
                    sealed_tail_pages: sealed,
                    tps_watermark: range.watermark(),
                }
            })
            .collect();

        TableMetadata {
            name: self.name.clone(),
            num_columns: self.num_columns,
            key_column: self.key_column,
            cumulative: self.options.cumulative,
            next_base_rid,
            next_tail_rid,
            page_ranges,
            primary_index: self.primary_index.snapshot().into_iter().collect(),
            secondary: self.options.secondary.map(|structure| SecondaryIndexConfig {
                structure,
                multiprocess: self.options.multiprocess_secondary,
                seeded: self.options.seeded_secondary,
            }),
        }
    }

    /// Stop the merger (draining its queue), settle and save every secondary
    /// index, and stop their workers. Called by `Database::close`.
    pub fn shutdown(&self) -> DatabaseResult<()> {
        self.merge_continue.store(false, Ordering::SeqCst);
        *self.merge_sender.lock().unwrap() = None;
        if let Some(worker) = self.merge_worker.lock().unwrap().take() {
            let _ = worker.join();
        }

        self.wait_all()?;

        for (column, handle) in self.secondary_indices.iter().enumerate() {
            match handle {
                Some(handle @ SecondaryIndexHandle::Inline(_)) => handle.save_inline()?,
                Some(SecondaryIndexHandle::Worker(worker)) => {
                    let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
                    self.pending_requests.lock().unwrap().insert(request_id, column);
                    worker.post(vec![IndexRequest {
                        request_id,
                        operation: IndexOperation::SaveIndex,
                    }]);
                    if let IndexReply::Failed(message) = self.wait_for_request(request_id)? {
                        return Err(DatabaseError::IndexWorker(message));
                    }
                    worker.stop();
                }
                None => {}
            }
        }

        info!("table {} shut down", self.name);
        Ok(())
    }

    /// Newest page range, allocating a fresh one when the current is full.
    fn open_range(&self) -> Arc<PageRange> {
        let mut ranges = self.page_ranges.lock().unwrap();
        if ranges.last().expect("table has a page range").is_full() {
            ranges.push(self.new_range());
        }
        Arc::clone(ranges.last().unwrap())
    }

    fn new_range(&self) -> Arc<PageRange> {
        debug!("table {} allocating a new page range", self.name);
        Arc::new(PageRange::new(
            &self.name,
            self.num_columns,
            self.options.cumulative,
            Arc::clone(&self.page_directory),
            Arc::clone(&self.rid_generator),
            Arc::clone(&self.pool),
        ))
    }

    /// Page range holding a base RID.
    fn range_of(&self, rid: RID) -> DatabaseResult<Arc<PageRange>> {
        debug_assert!(rid > 0, "range routing takes base RIDs");
        let index = ((rid - 1) / RECORDS_PER_PAGE_RANGE as i64) as usize;
        self.page_ranges
            .lock()
            .unwrap()
            .get(index)
            .map(Arc::clone)
            .ok_or(DatabaseError::RidNotFound(rid))
    }

    /// Value of `column` as of `version_rid` in the chain of `base_rid`.
    fn versioned_column_value(
        &self,
        base_rid: RID,
        version_rid: RID,
        column: usize,
    ) -> DatabaseResult<i64> {
        let range = self.range_of(base_rid)?;

        if self.options.cumulative || version_rid == base_rid {
            let (page, slot) = self
                .page_directory
                .locate(version_rid)
                .ok_or(DatabaseError::RidNotFound(version_rid))?;
            return page.get_column(column, slot);
        }

        // Non-cumulative: walk from the version toward the base until a row
        // carries the column.
        let schema_col = range.schema_encoding_col();
        let mut current = version_rid;
        loop {
            let (page, slot) = self
                .page_directory
                .locate(current)
                .ok_or(DatabaseError::RidNotFound(current))?;

            if current == base_rid {
                return page.get_column(column, slot);
            }

            let schema = page.get_column(schema_col, slot)?;
            if schema_bit_set(schema, column, self.num_columns) {
                return page.get_column(column, slot);
            }

            current = page.get_indirection(slot)?;
        }
    }

    /// Hand a batch of operations to one secondary index. Inline indexes
    /// apply it synchronously; worker-backed indexes get it posted under
    /// fresh request ids.
    fn post_secondary(&self, column: usize, operations: Vec<IndexOperation>) {
        match self.secondary_indices[column]
            .as_ref()
            .expect("caller checked the handle")
        {
            SecondaryIndexHandle::Inline(index) => {
                let mut index = index.lock().unwrap();
                for operation in operations {
                    match operation {
                        IndexOperation::Insert { key, rid } => index.add_record(key, rid),
                        IndexOperation::Delete { key, rid } => index.delete_record(key, rid),
                        _ => unreachable!("mutation path only posts inserts and deletes"),
                    }
                }
            }
            SecondaryIndexHandle::Worker(worker) => {
                let mut batch = Vec::with_capacity(operations.len());
                for operation in operations {
                    let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
                    self.pending_requests.lock().unwrap().insert(request_id, column);
                    batch.push(IndexRequest { request_id, operation });
                }
                worker.post(batch);
            }
        }
    }

    fn secondary_search(&self, column: usize, value: i64) -> DatabaseResult<Vec<RID>> {
        match self.secondary_indices[column]
            .as_ref()
            .expect("caller checked the handle")
        {
            SecondaryIndexHandle::Inline(index) => Ok(index.lock().unwrap().search_record(value)),
            SecondaryIndexHandle::Worker(worker) => {
                let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
                self.pending_requests.lock().unwrap().insert(request_id, column);
                worker.post(vec![IndexRequest {
                    request_id,
                    operation: IndexOperation::Search { key: value },
                }]);

                match self.wait_for_request(request_id)? {
                    IndexReply::Rids(rids) => Ok(rids),
                    IndexReply::Done => Ok(Vec::new()),
                    IndexReply::Failed(message) => Err(DatabaseError::IndexWorker(message)),
                }
            }
        }
    }

    /// Pull every currently available response out of the worker outboxes.
    /// Returns whether anything arrived.
    fn drain_responses(&self) -> bool {
        let mut any = false;

        for handle in self.secondary_indices.iter().flatten() {
            if let SecondaryIndexHandle::Worker(worker) = handle {
                while let Some(response) = worker.recv_response(INDEX_WAIT_SLICE) {
                    self.pending_requests.lock().unwrap().remove(&response.request_id);
                    self.completed_requests
                        .lock()
                        .unwrap()
                        .insert(response.request_id, response.reply);
                    any = true;
                }
            }
        }

        any
    }

    fn enqueue_merge(&self, range: Arc<PageRange>, batch: MergeBatch) {
        let sender = self.merge_sender.lock().unwrap();
        match sender.as_ref() {
            Some(sender) => {
                let request = MergeRequest {
                    range,
                    sealed_tail_pages: batch.sealed_tail_pages,
                    updated_base_pages: batch.updated_base_pages,
                    previous_watermark: batch.previous_watermark,
                };
                if sender.send(request).is_err() {
                    warn!("merge worker gone; dropping merge request");
                }
            }
            None => warn!("merge requested after shutdown; dropping"),
        }
    }
}

/// Initializes the internal merge thread. Returns the request sender and the
/// worker handle; the worker exits once the continue flag is cleared and its
/// queue is drained.
fn start_merge_thread(merge_continue: Arc<AtomicBool>) -> (Sender<MergeRequest>, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel::<MergeRequest>();

    let worker = thread::spawn(move || merge_loop(receiver, merge_continue));

    (sender, worker)
}

fn merge_loop(receiver: Receiver<MergeRequest>, merge_continue: Arc<AtomicBool>) {
    loop {
        match receiver.recv_timeout(Duration::from_millis(20)) {
            Ok(request) => {
                if let Err(error) = merge_pass(&request) {
                    warn!("merge pass failed: {}", error);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !merge_continue.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("merge worker stopped");
}

/// One merge pass: consolidate the sealed tail pages of a request into
/// copy-on-write snapshots of the base pages they touched, then publish the
/// snapshots through the page directory.
fn merge_pass(request: &MergeRequest) -> DatabaseResult<()> {
    let range = &request.range;
    let directory = range.directory();
    let num_user_cols = range.num_user_cols();
    let base_rid_col = range.base_rid_col();

    info!(
        "merge pass: {} sealed tail pages, {} updated base pages, watermark {}",
        request.sealed_tail_pages.len(),
        request.updated_base_pages.len(),
        request.previous_watermark
    );

    // 1. Copy-on-write snapshots, keyed by starting RID. The copies stay
    // pinned while the pass reads and writes them.
    let mut copies: HashMap<RID, LogicalPage<Base>> = HashMap::new();
    for starting_rid in &request.updated_base_pages {
        if let Some(live) = range.base_page(*starting_rid) {
            let copy = live.read().unwrap().copy_for_merge(num_user_cols)?;
            copy.pin_user_columns(num_user_cols)?;
            copies.insert(*starting_rid, copy);
        }
    }

    // 2. Walk sealed tail pages newest to oldest; within a page, tail RIDs
    // newest to oldest, so only the newest update of a record (or of a
    // column, in non-cumulative mode) wins.
    let mut sealed = request.sealed_tail_pages.clone();
    sealed.sort();

    let mut consolidated_rows: HashSet<RID> = HashSet::new();
    let mut consolidated_cols: HashMap<RID, i64> = HashMap::new();
    let mut watermark = request.previous_watermark;

    for tail_start in sealed {
        for slot in (0..SLOTS_PER_PAGE).rev() {
            let tail_rid = tail_start - slot as RID;
            if tail_rid.unsigned_abs() <= request.previous_watermark.unsigned_abs() {
                continue;
            }
            watermark = watermark.min(tail_rid);

            let (tail_page, tail_slot) = match directory.locate(tail_rid) {
                Some(located) => located,
                None => continue,
            };
            let base_rid = tail_page.get_column(base_rid_col, tail_slot)?;
            let base_start = starting_rid_of(base_rid);

            // The updated-base list is a hint; fall back to snapshotting on
            // demand so no tail row is left behind.
            if !copies.contains_key(&base_start) {
                match range.base_page(base_start) {
                    Some(live) => {
                        let copy = live.read().unwrap().copy_for_merge(num_user_cols)?;
                        copy.pin_user_columns(num_user_cols)?;
                        copies.insert(base_start, copy);
                    }
                    None => continue,
                }
            }
            let copy = copies.get(&base_start).expect("snapshot just ensured");
            let base_slot = slot_of(base_rid);

            if range.is_cumulative() {
                if !consolidated_rows.insert(base_rid) {
                    continue;
                }
                let mut values = Vec::with_capacity(num_user_cols);
                for column in 0..num_user_cols {
                    values.push(Some(tail_page.get_column(column, tail_slot)?));
                }
                copy.update_record(base_slot, &values)?;
            } else {
                let schema = tail_page.get_column(range.schema_encoding_col(), tail_slot)?;
                let done = consolidated_cols.entry(base_rid).or_insert(0);

                let mut values = vec![None; num_user_cols];
                for column in 0..num_user_cols {
                    let bit = 1i64 << (num_user_cols - column - 1);
                    if schema & bit != 0 && *done & bit == 0 {
                        values[column] = Some(tail_page.get_column(column, tail_slot)?);
                        *done |= bit;
                    }
                }
                copy.update_record(base_slot, &values)?;
            }
        }
    }

    // 3. Publish: stamp the watermark and swap each copy into the directory.
    for (_, mut copy) in copies {
        copy.set_tps(watermark);
        copy.unpin_user_columns(num_user_cols)?;
        range.install_merged_page(copy)?;
    }
    range.set_watermark(watermark);

    info!("merge pass complete; watermark now {}", watermark);
    Ok(())
}
