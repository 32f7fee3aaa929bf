use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::bufferpool::PhysicalPageID;
use crate::page::LogicalPage;
use crate::rid::RID;
use crate::secondary::SecondaryStructure;

/// Contains logical page metadata for writing to disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogicalPagePersistable {
    pub starting_rid: RID,

    /// Physical page IDs corresponding to each column.
    pub columns: Vec<PhysicalPageID>,

    pub available_slots: Vec<usize>,
    pub reserved_rids: Vec<RID>,
    pub merge_iteration: u64,
    pub tps: RID,
}

impl LogicalPagePersistable {
    pub fn from_page<T>(page: &LogicalPage<T>) -> Self {
        LogicalPagePersistable {
            starting_rid: page.starting_rid(),
            columns: page.column_ids().to_vec(),
            available_slots: page.available_slots().to_vec(),
            reserved_rids: page.reserved_rids().to_vec(),
            merge_iteration: page.merge_iteration(),
            tps: page.tps(),
        }
    }
}

/// Contains page range metadata for writing to disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageRangePersistable {
    pub base_pages: Vec<LogicalPagePersistable>,
    pub tail_pages: Vec<LogicalPagePersistable>,

    /// Sealed tail pages still short of the merge threshold at close.
    pub sealed_tail_pages: Vec<RID>,

    pub tps_watermark: RID,
}

/// How a table's secondary indexes were configured at creation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SecondaryIndexConfig {
    pub structure: SecondaryStructure,
    pub multiprocess: bool,
    pub seeded: bool,
}

/// Contains table metadata for writing to disk. One entry per table lives in
/// the catalog file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableMetadata {
    pub name: String,
    pub num_columns: usize,
    pub key_column: usize,
    pub cumulative: bool,
    pub next_base_rid: RID,
    pub next_tail_rid: RID,
    pub page_ranges: Vec<PageRangePersistable>,
    pub primary_index: HashMap<i64, RID>,
    pub secondary: Option<SecondaryIndexConfig>,
}

/// The catalog: table name to table metadata, serialised into `database.db`.
pub type Catalog = HashMap<String, TableMetadata>;
