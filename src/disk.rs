use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::debug;

use crate::errors::{DatabaseError, DatabaseResult};
use crate::phys_page::PhysicalPage;

/// Reads and writes named physical pages under the database root, one
/// zlib-compressed file per page.
pub struct DiskInterface {
    root: PathBuf,
}

impl DiskInterface {
    pub fn new(root: &Path) -> DatabaseResult<Self> {
        fs::create_dir_all(root)?;
        Ok(DiskInterface {
            root: root.to_path_buf(),
        })
    }

    pub fn page_exists(&self, page_id: &str) -> bool {
        self.page_path(page_id).is_file()
    }

    /// Decompress the stored image back into a page. The image must restore
    /// to exactly one page worth of bytes.
    pub fn read_page(&self, page_id: &str) -> DatabaseResult<PhysicalPage> {
        let path = self.page_path(page_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(DatabaseError::PageNotFound(page_id.to_string()));
            }
            Err(error) => return Err(error.into()),
        };

        let mut decoder = ZlibDecoder::new(file);
        let mut data = Vec::new();
        decoder
            .read_to_end(&mut data)
            .map_err(|_| DatabaseError::CorruptPage(page_id.to_string()))?;

        PhysicalPage::from_bytes(page_id, data)
    }

    /// Compress and persist a page image. The write goes to a temporary file
    /// first and is renamed into place, so readers never observe a torn or
    /// empty page file.
    pub fn write_page(&self, page_id: &str, page: &PhysicalPage) -> DatabaseResult<()> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(page.bytes())?;
        let compressed = encoder.finish()?;

        let tmp_path = self.page_path(&format!("{}.tmp", page_id));
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&compressed)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, self.page_path(page_id))?;

        debug!("wrote page {} ({} compressed bytes)", page_id, compressed.len());
        Ok(())
    }

    fn page_path(&self, page_id: &str) -> PathBuf {
        self.root.join(page_id)
    }
}
