//! Disk I/O manager

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::StrataResult;
use crate::storage::{BlockId, Page};

/// Reads and writes whole blocks of the files under one data directory
pub struct DiskManager {
    data_files: Mutex<HashMap<String, File>>,
    data_dir: PathBuf,
    block_size: usize,
    is_new: bool,
}

impl DiskManager {
    /// Open the data directory, creating it if needed.
    ///
    /// Leftover transient files (`temp*`) from a previous run are removed.
    pub fn new<P: AsRef<Path>>(data_dir: P, block_size: usize) -> StrataResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let is_new = !data_dir.exists();
        std::fs::create_dir_all(&data_dir)?;

        for entry in std::fs::read_dir(&data_dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with("temp") {
                debug!("Removing transient file {:?}", entry.path());
                std::fs::remove_file(entry.path())?;
            }
        }

        Ok(Self {
            data_files: Mutex::new(HashMap::new()),
            data_dir,
            block_size,
            is_new,
        })
    }

    /// Open a data directory that must already exist, leaving its contents
    /// untouched.
    pub fn open_existing<P: AsRef<Path>>(data_dir: P, block_size: usize) -> StrataResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("data directory {} does not exist", data_dir.display()),
            )
            .into());
        }

        Ok(Self {
            data_files: Mutex::new(HashMap::new()),
            data_dir,
            block_size,
            is_new: false,
        })
    }

    /// Read a block into `page`. Blocks past the end of the file read as zeros.
    pub fn read(&self, block: &BlockId, page: &mut Page) -> StrataResult<()> {
        let mut files = self.data_files.lock();
        let file = self.get_or_create_file(&mut files, block.file_name())?;

        let offset = self.offset_of(block);
        let contents = page.contents_mut();
        contents.fill(0);
        if offset >= file.metadata()?.len() {
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < contents.len() {
            let n = file.read(&mut contents[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        Ok(())
    }

    /// Write `page` to a block and sync it
    pub fn write(&self, block: &BlockId, page: &Page) -> StrataResult<()> {
        let mut files = self.data_files.lock();
        let file = self.get_or_create_file(&mut files, block.file_name())?;

        file.seek(SeekFrom::Start(self.offset_of(block)))?;
        file.write_all(page.contents())?;
        file.sync_data()?;

        Ok(())
    }

    /// Write `page` as a new block at the end of the file
    pub fn append(&self, file_name: &str, page: &Page) -> StrataResult<BlockId> {
        let mut files = self.data_files.lock();
        let file = self.get_or_create_file(&mut files, file_name)?;

        let block_count = file.metadata()?.len() / self.block_size as u64;
        let block = BlockId::new(file_name, block_count as i32);

        file.seek(SeekFrom::Start(self.offset_of(&block)))?;
        file.write_all(page.contents())?;
        file.sync_data()?;

        Ok(block)
    }

    /// Number of blocks in the file
    pub fn length(&self, file_name: &str) -> StrataResult<i32> {
        let mut files = self.data_files.lock();
        let file = self.get_or_create_file(&mut files, file_name)?;
        Ok((file.metadata()?.len() / self.block_size as u64) as i32)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Whether the data directory was created by this manager
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn offset_of(&self, block: &BlockId) -> u64 {
        assert!(
            block.number() >= 0,
            "block {} has no position on disk",
            block
        );
        block.number() as u64 * self.block_size as u64
    }

    fn get_or_create_file<'a>(
        &self,
        files: &'a mut HashMap<String, File>,
        file_name: &str,
    ) -> StrataResult<&'a mut File> {
        match files.entry(file_name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let file = OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .read(true)
                    .write(true)
                    .open(self.data_dir.join(file_name))?;
                Ok(entry.insert(file))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_disk_manager() {
        let temp_dir = tempdir().unwrap();
        let disk = DiskManager::new(temp_dir.path().join("db"), 400).unwrap();
        assert!(disk.is_new());

        let block = BlockId::new("testfile", 2);
        let mut page = Page::new(disk.block_size());
        page.set_int(88, 345);
        page.set_string(20, "abcdefghijklm");
        disk.write(&block, &page).unwrap();

        let mut read_back = Page::new(disk.block_size());
        disk.read(&block, &mut read_back).unwrap();
        assert_eq!(read_back.get_int(88), 345);
        assert_eq!(read_back.get_string(20), "abcdefghijklm");
        assert_eq!(disk.length("testfile").unwrap(), 3);
    }

    #[test]
    fn test_append_and_read_past_end() {
        let temp_dir = tempdir().unwrap();
        let disk = DiskManager::new(temp_dir.path(), 128).unwrap();
        assert!(!disk.is_new());

        let mut page = Page::new(128);
        page.set_int(0, 7);
        let first = disk.append("numbers", &page).unwrap();
        let second = disk.append("numbers", &page).unwrap();
        assert_eq!(first.number(), 0);
        assert_eq!(second.number(), 1);

        let mut missing = Page::new(128);
        missing.set_int(0, 99);
        disk.read(&BlockId::new("numbers", 5), &mut missing).unwrap();
        assert_eq!(missing.get_int(0), 0);
    }

    #[test]
    fn test_temp_files_removed_on_open() {
        let temp_dir = tempdir().unwrap();
        {
            let disk = DiskManager::new(temp_dir.path(), 128).unwrap();
            disk.append("temp_sort", &Page::new(128)).unwrap();
            disk.append("keep", &Page::new(128)).unwrap();
        }

        DiskManager::new(temp_dir.path(), 128).unwrap();
        assert!(!temp_dir.path().join("temp_sort").exists());
        assert!(temp_dir.path().join("keep").exists());
    }

    #[test]
    fn test_open_existing_leaves_directory_alone() {
        let temp_dir = tempdir().unwrap();
        let missing = temp_dir.path().join("missing");
        assert!(DiskManager::open_existing(&missing, 128).is_err());
        assert!(!missing.exists());

        {
            let disk = DiskManager::new(temp_dir.path(), 128).unwrap();
            disk.append("temp_sort", &Page::new(128)).unwrap();
        }
        let disk = DiskManager::open_existing(temp_dir.path(), 128).unwrap();
        assert!(!disk.is_new());
        assert!(temp_dir.path().join("temp_sort").exists());
    }
}
