use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use crate::bufferpool::BufferPool;
use crate::constants::MAX_BUFFER_POOL_SIZE;
use crate::errors::{DatabaseError, DatabaseResult};
use crate::persistables::Catalog;
use crate::table::{Table, TableOptions};

/// File holding the serialised catalog under the database root.
const CATALOG_FILE_NAME: &str = "database.db";

/// A directory-rooted database: owns the buffer pool and the tables, and
/// persists the catalog across clean close/open cycles.
pub struct Database {
    /// Root directory (set whenever `open` is called).
    path: Option<PathBuf>,

    /// Tables created or loaded in this database, by name.
    tables: HashMap<String, Arc<Table>>,

    /// Buffer pool manager shared by all tables in this database.
    pool: Option<Arc<BufferPool>>,
}

impl Database {
    pub fn new() -> Self {
        Database {
            path: None,
            tables: HashMap::new(),
            pool: None,
        }
    }

    /// Open the database rooted at `path`: create the buffer pool, then
    /// rebuild every table recorded in the catalog, if one exists.
    pub fn open(&mut self, path: &Path) -> DatabaseResult<()> {
        fs::create_dir_all(path)?;

        let pool = Arc::new(BufferPool::new(path, MAX_BUFFER_POOL_SIZE)?);

        let catalog_path = path.join(CATALOG_FILE_NAME);
        if catalog_path.is_file() {
            let catalog: Catalog = serde_json::from_reader(File::open(&catalog_path)?)?;
            for (name, metadata) in catalog {
                let table = Table::from_metadata(metadata, Arc::clone(&pool), path)?;
                self.tables.insert(name, table);
            }
        }

        info!("opened database at {} ({} tables)", path.display(), self.tables.len());
        self.path = Some(path.to_path_buf());
        self.pool = Some(pool);
        Ok(())
    }

    /// Close cleanly: stop every table's workers, persist the catalog and the
    /// secondary indexes, and flush the buffer pool.
    pub fn close(&mut self) -> DatabaseResult<()> {
        let path = self.path.take().ok_or(DatabaseError::DatabaseNotOpen)?;
        let pool = self.pool.take().ok_or(DatabaseError::DatabaseNotOpen)?;

        let mut catalog: Catalog = HashMap::new();
        for (name, table) in self.tables.drain() {
            table.shutdown()?;
            catalog.insert(name, table.metadata());
        }

        let tmp_path = path.join(format!("{}.tmp", CATALOG_FILE_NAME));
        serde_json::to_writer(File::create(&tmp_path)?, &catalog)?;
        fs::rename(&tmp_path, path.join(CATALOG_FILE_NAME))?;

        pool.evict_all()?;
        info!("closed database at {}", path.display());
        Ok(())
    }

    /// Create a new table associated with this database and its buffer pool.
    pub fn create_table(
        &mut self,
        name: &str,
        num_columns: usize,
        key_index: usize,
    ) -> DatabaseResult<Arc<Table>> {
        self.create_table_with_options(name, num_columns, key_index, TableOptions::default())
    }

    pub fn create_table_with_options(
        &mut self,
        name: &str,
        num_columns: usize,
        key_index: usize,
        options: TableOptions,
    ) -> DatabaseResult<Arc<Table>> {
        let path = self.path.as_ref().ok_or(DatabaseError::DatabaseNotOpen)?;
        let pool = self.pool.as_ref().ok_or(DatabaseError::DatabaseNotOpen)?;

        let table = Table::create(name, num_columns, key_index, options, Arc::clone(pool), path)?;
        self.tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Get a table that already exists using its name.
    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(name).map(Arc::clone)
    }

    pub fn pool(&self) -> Option<Arc<BufferPool>> {
        self.pool.as_ref().map(Arc::clone)
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}
