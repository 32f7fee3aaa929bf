use thiserror::Error;

use crate::bufferpool::PhysicalPageID;

/// Every fallible operation in the crate returns this error type.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Slot index is out of bounds for a physical page.
    #[error("slot {0} is out of bounds")]
    InvalidSlot(usize),

    /// Value does not fit in a signed attribute of `ATTRIBUTE_SIZE` bytes.
    #[error("value {0} does not fit in an attribute")]
    ValueOutOfRange(i64),

    /// Physical page is neither resident nor on disk.
    #[error("physical page {0} not found")]
    PageNotFound(PhysicalPageID),

    /// Destination of a page copy already exists.
    #[error("physical page {0} already exists")]
    PageExists(PhysicalPageID),

    /// On-disk page image did not decompress to a full page.
    #[error("physical page {0} is corrupt")]
    CorruptPage(PhysicalPageID),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Primary key already present on insert.
    #[error("duplicate primary key {0}")]
    DuplicateKey(i64),

    /// Primary key absent on update/select/delete.
    #[error("unknown primary key {0}")]
    KeyNotFound(i64),

    /// No page directory entry covers the RID.
    #[error("rid {0} not found in the page directory")]
    RidNotFound(i64),

    /// Page range has been filled to capacity.
    #[error("page range filled to capacity")]
    PageRangeFilled,

    /// Logical page has no free slots left.
    #[error("logical page is full")]
    LogicalPageFull,

    /// Column index outside the table's user columns.
    #[error("no such column {0}")]
    NoSuchColumn(usize),

    /// A secondary-index worker reported a failure for a request.
    #[error("index worker error: {0}")]
    IndexWorker(String),

    /// Operation requires an open database.
    #[error("database is not open")]
    DatabaseNotOpen,
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;
