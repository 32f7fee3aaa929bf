use crate::rid::RID;

/// Size of one physical page in bytes. A small multiple of typical disk pages.
pub const PHYSICAL_PAGE_SIZE: usize = 4096;

/// Width of one attribute in bytes. Every user and metadata column is a
/// fixed-width signed integer of this size.
pub const ATTRIBUTE_SIZE: usize = 8;

/// Number of slots (one column value each) that fit in a physical page.
pub const SLOTS_PER_PAGE: usize = PHYSICAL_PAGE_SIZE / ATTRIBUTE_SIZE;

/// The number of (logical) base pages per page range.
pub const MAX_BASE_PAGES_PER_RANGE: usize = 16;

/// Base-record capacity of one page range.
pub const RECORDS_PER_PAGE_RANGE: usize = MAX_BASE_PAGES_PER_RANGE * SLOTS_PER_PAGE;

/// Number of physical pages the buffer pool may keep resident.
pub const MAX_BUFFER_POOL_SIZE: usize = 64;

/// Number of sealed tail pages that triggers a merge enqueue.
pub const MERGE_TAIL_THRESHOLD: usize = 3;

/// First base RID ever issued. Base RIDs grow upward from here.
pub const START_BASE_RID: RID = 1;

/// First tail RID ever issued. Tail RIDs grow downward from here.
pub const START_TAIL_RID: RID = -1;

/// Sentinel for "no such record". Zero is outside both RID ranges.
pub const INVALID_RID: RID = 0;

/// Sentinel for "no such slot".
pub const INVALID_SLOT: usize = usize::MAX;

/// Sentinel stored in the indirection column of every row of a deleted
/// record. Outside both RID ranges.
pub const LOGICAL_DELETE: i64 = i64::MIN;

/// Number of metadata columns in cumulative mode (BASE_RID | INDIRECTION).
pub const CUMULATIVE_METADATA_COLS: usize = 2;

/// Number of metadata columns in non-cumulative mode
/// (SCHEMA_ENCODING | BASE_RID | INDIRECTION).
pub const NON_CUMULATIVE_METADATA_COLS: usize = 3;

/// Index (zero-based) of the INDIRECTION column starting from the end of our columns.
pub const INDIRECTION_REV_IDX: usize = 0;

/// Index (zero-based) of the BASE_RID column starting from the end of our columns.
pub const BASE_RID_REV_IDX: usize = 1;

/// Index (zero-based) of the SCHEMA_ENCODING column starting from the end of our
/// columns. Only present in non-cumulative mode.
pub const SCHEMA_ENCODING_REV_IDX: usize = 2;
