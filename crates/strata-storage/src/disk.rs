//! Page stores: the fixed-size page I/O layer beneath tables and indexes.

use log::trace;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use strata_common::page::{Page, PageId, PAGE_SIZE};
use strata_common::{Result, StrataError};

/// Fixed-size page storage addressed by (file, page number).
///
/// Pages of a file are numbered densely from 0 in allocation order, so
/// iterating all pages of a file is iterating `0..num_pages(file_id)`.
///
/// Files come into existence only through `create_file`. Every other call
/// on a missing file fails with `FileNotFound`, except `num_pages`, which
/// reports 0.
pub trait PageStore: Send + Sync {
    /// Creates an empty file. An existing file is left untouched.
    fn create_file(&self, file_id: u32) -> Result<()>;

    /// Appends a zeroed page to the file and returns its id.
    fn allocate_page(&self, file_id: u32) -> Result<PageId>;

    /// Reads a full page.
    fn read_page(&self, page_id: PageId) -> Result<Page>;

    /// Writes a full page back to its location.
    fn write_page(&self, page: &Page) -> Result<()>;

    /// Returns the number of allocated pages in a file.
    fn num_pages(&self, file_id: u32) -> Result<u32>;

    /// Removes a file and all of its pages.
    fn delete_file(&self, file_id: u32) -> Result<()>;
}

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Base directory for data files.
    pub data_dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

/// Manages reading and writing pages to disk files.
///
/// Each file_id maps to a separate data file holding one table or index.
pub struct DiskManager {
    /// Configuration.
    config: DiskManagerConfig,
    /// Open file handles keyed by file_id.
    files: Mutex<HashMap<u32, FileHandle>>,
}

/// Handle for an open data file.
struct FileHandle {
    /// The file handle.
    file: File,
    /// Number of pages in the file.
    num_pages: u32,
}

impl FileHandle {
    fn open(path: &Path, create: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)?;
        let num_pages = (file.metadata()?.len() / PAGE_SIZE as u64) as u32;
        Ok(Self { file, num_pages })
    }
}

impl DiskManager {
    /// Creates a new disk manager.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            config,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Generates the file path for a given file ID.
    fn file_path(&self, file_id: u32) -> PathBuf {
        self.config.data_dir.join(format!("{:08}.dat", file_id))
    }

    /// Runs `f` against the handle for `file_id`, opening the file first.
    fn with_file<T>(&self, file_id: u32, f: impl FnOnce(&mut FileHandle) -> Result<T>) -> Result<T> {
        let mut files = self.files.lock();
        let handle = match files.entry(file_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = self.file_path(file_id);
                if !path.exists() {
                    return Err(StrataError::FileNotFound(file_id));
                }
                entry.insert(FileHandle::open(&path, false)?)
            }
        };
        f(handle)
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        let files = self.files.lock();
        for handle in files.values() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Closes a specific file.
    pub fn close_file(&self, file_id: u32) -> Result<()> {
        let mut files = self.files.lock();
        if let Some(handle) = files.remove(&file_id) {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Closes all open files.
    pub fn close_all(&self) -> Result<()> {
        let mut files = self.files.lock();
        for (_, handle) in files.drain() {
            handle.file.sync_all()?;
        }
        Ok(())
    }
}

impl PageStore for DiskManager {
    fn create_file(&self, file_id: u32) -> Result<()> {
        let mut files = self.files.lock();
        if let Entry::Vacant(entry) = files.entry(file_id) {
            entry.insert(FileHandle::open(&self.file_path(file_id), true)?);
            trace!("opened file {} for writing", file_id);
        }
        Ok(())
    }

    fn allocate_page(&self, file_id: u32) -> Result<PageId> {
        let fsync = self.config.fsync_enabled;
        self.with_file(file_id, |handle| {
            let page_num = handle.num_pages;
            if page_num == u32::MAX {
                return Err(StrataError::StorageExhausted(format!(
                    "file {} has no page numbers left",
                    file_id
                )));
            }

            // Write an empty page to extend the file
            let offset = (page_num as u64) * (PAGE_SIZE as u64);
            let extend = handle
                .file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| handle.file.write_all(&[0u8; PAGE_SIZE]));
            if let Err(e) = extend {
                return Err(StrataError::StorageExhausted(format!(
                    "cannot extend file {}: {}",
                    file_id, e
                )));
            }

            if fsync {
                handle.file.sync_all()?;
            }

            handle.num_pages = page_num + 1;
            trace!("allocated page {} in file {}", page_num, file_id);
            Ok(PageId::new(file_id, page_num))
        })
    }

    fn read_page(&self, page_id: PageId) -> Result<Page> {
        self.with_file(page_id.file_id, |handle| {
            if page_id.page_num >= handle.num_pages {
                return Err(StrataError::PageNotFound {
                    page_id: page_id.as_u64(),
                });
            }

            let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
            handle.file.seek(SeekFrom::Start(offset))?;

            let mut buffer = [0u8; PAGE_SIZE];
            handle.file.read_exact(&mut buffer)?;

            Ok(Page::from_bytes(page_id, buffer))
        })
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        let page_id = page.page_id();
        let fsync = self.config.fsync_enabled;
        self.with_file(page_id.file_id, |handle| {
            if page_id.page_num >= handle.num_pages {
                return Err(StrataError::PageNotFound {
                    page_id: page_id.as_u64(),
                });
            }

            let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.write_all(page.as_bytes())?;

            if fsync {
                handle.file.sync_all()?;
            }
            Ok(())
        })
    }

    fn num_pages(&self, file_id: u32) -> Result<u32> {
        match self.with_file(file_id, |handle| Ok(handle.num_pages)) {
            Err(StrataError::FileNotFound(_)) => Ok(0),
            other => other,
        }
    }

    fn delete_file(&self, file_id: u32) -> Result<()> {
        self.close_file(file_id)?;
        let path = self.file_path(file_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
        };
        let dm = DiskManager::new(config).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_disk_manager_new() {
        let (dm, _dir) = create_test_disk_manager();
        assert!(dm.data_dir().exists());
    }

    #[test]
    fn test_disk_manager_allocate_page() {
        let (dm, _dir) = create_test_disk_manager();
        dm.create_file(0).unwrap();

        let page1 = dm.allocate_page(0).unwrap();
        assert_eq!(page1.file_id, 0);
        assert_eq!(page1.page_num, 0);

        let page2 = dm.allocate_page(0).unwrap();
        assert_eq!(page2.page_num, 1);

        assert_eq!(dm.num_pages(0).unwrap(), 2);
    }

    #[test]
    fn test_disk_manager_write_read() {
        let (dm, _dir) = create_test_disk_manager();
        dm.create_file(0).unwrap();

        let page_id = dm.allocate_page(0).unwrap();

        let mut page = Page::new(page_id);
        page.write_u8(0, 0xAB);
        page.write_u8(100, 0xCD);
        page.write_u8(PAGE_SIZE - 1, 0xEF);
        dm.write_page(&page).unwrap();

        let read = dm.read_page(page_id).unwrap();
        assert_eq!(read.read_u8(0), 0xAB);
        assert_eq!(read.read_u8(100), 0xCD);
        assert_eq!(read.read_u8(PAGE_SIZE - 1), 0xEF);
    }

    #[test]
    fn test_disk_manager_multiple_files() {
        let (dm, _dir) = create_test_disk_manager();
        dm.create_file(0).unwrap();
        dm.create_file(1).unwrap();

        let page_f0 = dm.allocate_page(0).unwrap();
        let page_f1 = dm.allocate_page(1).unwrap();

        let mut p0 = Page::new(page_f0);
        p0.write_u8(0, 0x11);
        dm.write_page(&p0).unwrap();

        let mut p1 = Page::new(page_f1);
        p1.write_u8(0, 0x22);
        dm.write_page(&p1).unwrap();

        assert_eq!(dm.read_page(page_f0).unwrap().read_u8(0), 0x11);
        assert_eq!(dm.read_page(page_f1).unwrap().read_u8(0), 0x22);
    }

    #[test]
    fn test_disk_manager_read_nonexistent_page() {
        let (dm, _dir) = create_test_disk_manager();
        dm.create_file(0).unwrap();
        dm.allocate_page(0).unwrap();

        let result = dm.read_page(PageId::new(0, 99));
        assert!(matches!(result, Err(StrataError::PageNotFound { .. })));
    }

    #[test]
    fn test_disk_manager_write_unallocated_page() {
        let (dm, _dir) = create_test_disk_manager();
        let page = Page::new(PageId::new(0, 4));
        assert!(dm.write_page(&page).is_err());
    }

    #[test]
    fn test_disk_manager_persistence() {
        let dir = tempdir().unwrap();
        let page_id;

        {
            let config = DiskManagerConfig {
                data_dir: dir.path().to_path_buf(),
                fsync_enabled: true,
            };
            let dm = DiskManager::new(config).unwrap();
            dm.create_file(0).unwrap();
            page_id = dm.allocate_page(0).unwrap();

            let mut page = Page::new(page_id);
            page.write_u8(0, 0xFF);
            dm.write_page(&page).unwrap();
        }

        {
            let config = DiskManagerConfig {
                data_dir: dir.path().to_path_buf(),
                fsync_enabled: true,
            };
            let dm = DiskManager::new(config).unwrap();
            assert_eq!(dm.num_pages(0).unwrap(), 1);
            assert_eq!(dm.read_page(page_id).unwrap().read_u8(0), 0xFF);
        }
    }

    #[test]
    fn test_disk_manager_delete_file() {
        let (dm, dir) = create_test_disk_manager();

        dm.create_file(0).unwrap();
        dm.allocate_page(0).unwrap();
        let file_path = dir.path().join("00000000.dat");
        assert!(file_path.exists());

        dm.delete_file(0).unwrap();
        assert!(!file_path.exists());
        assert_eq!(dm.num_pages(0).unwrap(), 0);
    }

    #[test]
    fn test_disk_manager_missing_file_is_not_recreated() {
        let (dm, dir) = create_test_disk_manager();
        let file_path = dir.path().join("00000003.dat");

        assert_eq!(dm.num_pages(3).unwrap(), 0);
        assert!(matches!(dm.allocate_page(3), Err(StrataError::FileNotFound(3))));
        assert!(matches!(
            dm.read_page(PageId::new(3, 0)),
            Err(StrataError::FileNotFound(3))
        ));
        assert!(matches!(
            dm.write_page(&Page::new(PageId::new(3, 0))),
            Err(StrataError::FileNotFound(3))
        ));
        assert!(!file_path.exists());

        // The same holds once a file has been deleted.
        dm.create_file(3).unwrap();
        dm.allocate_page(3).unwrap();
        dm.delete_file(3).unwrap();
        assert!(matches!(dm.allocate_page(3), Err(StrataError::FileNotFound(3))));
        assert!(!file_path.exists());
    }

    #[test]
    fn test_disk_manager_create_file_keeps_existing_pages() {
        let (dm, _dir) = create_test_disk_manager();
        dm.create_file(0).unwrap();
        dm.allocate_page(0).unwrap();
        dm.close_file(0).unwrap();

        dm.create_file(0).unwrap();
        assert_eq!(dm.num_pages(0).unwrap(), 1);
    }

    #[test]
    fn test_disk_manager_close_file() {
        let (dm, _dir) = create_test_disk_manager();

        dm.create_file(0).unwrap();
        dm.allocate_page(0).unwrap();
        dm.close_file(0).unwrap();

        // Can reopen and continue
        dm.allocate_page(0).unwrap();
        assert_eq!(dm.num_pages(0).unwrap(), 2);
        dm.flush().unwrap();
    }
}
