//! Write-Ahead Logging implementation
//!
//! The log is one file of fixed-size blocks. The first 4 bytes of each block
//! hold the offset of the last record written to it. Records are packed
//! after that header as `[length][bytes][previous record offset]`; a previous
//! offset of 0 means the chain continues in the preceding block.
//!
//! Only the tail block is kept in memory. Reverse iteration reads blocks
//! from disk through the [`DiskManager`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StrataResult;
use crate::storage::page::INT_SIZE;
use crate::storage::{BlockId, DiskManager, Page};

/// Offset of the "last record" pointer within a log block
const LAST_RECORD_OFFSET: usize = 0;

/// First usable byte of a log block
const HEADER_SIZE: usize = INT_SIZE;

/// Pointer value meaning "no record in this block before this one"
const NO_RECORD: i32 = 0;

/// Log Sequence Number
///
/// Identifies the log block a record was appended to, not the record itself.
/// Flushing up to an LSN forces the whole tail block it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub i32);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// In-memory tail of the log
struct LogTail {
    page: Page,
    block: BlockId,
    /// Next free offset in `page`
    boundary: usize,
    dirty: bool,
}

/// WAL manager
pub struct WalManager {
    disk: Arc<DiskManager>,
    log_file: String,
    tail: Mutex<LogTail>,
}

impl WalManager {
    /// Open the log, resuming after the last record of an existing tail block
    pub fn new(disk: Arc<DiskManager>, log_file: &str) -> StrataResult<Self> {
        let block_size = disk.block_size();
        let log_size = disk.length(log_file)?;

        if log_size == 0 {
            let page = Page::new(block_size);
            let block = disk.append(log_file, &page)?;
            let tail = LogTail {
                page,
                block,
                boundary: HEADER_SIZE,
                dirty: false,
            };
            return Ok(Self::with_tail(disk, log_file, tail));
        }

        let tail = read_tail(&disk, log_file, log_size)?;
        Ok(Self::with_tail(disk, log_file, tail))
    }

    /// Open a log that already holds at least one block, without writing
    /// to it.
    pub fn open_existing(disk: Arc<DiskManager>, log_file: &str) -> StrataResult<Self> {
        let path = disk.data_dir().join(log_file);
        if !path.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("log file {} does not exist", path.display()),
            )
            .into());
        }

        let log_size = disk.length(log_file)?;
        if log_size == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("log file {} holds no blocks", path.display()),
            )
            .into());
        }

        let tail = read_tail(&disk, log_file, log_size)?;
        Ok(Self::with_tail(disk, log_file, tail))
    }

    fn with_tail(disk: Arc<DiskManager>, log_file: &str, tail: LogTail) -> Self {
        debug!(
            "Opened log {} at {} (offset {})",
            log_file, tail.block, tail.boundary
        );

        Self {
            disk,
            log_file: log_file.to_string(),
            tail: Mutex::new(tail),
        }
    }

    /// Append a record and return its LSN.
    ///
    /// # Panics
    ///
    /// If the record cannot fit in a single log block.
    pub fn append(&self, record: &[u8]) -> StrataResult<Lsn> {
        let block_size = self.disk.block_size();
        let needed = frame_size(record.len());
        assert!(
            HEADER_SIZE + needed <= block_size,
            "log record of {} bytes does not fit in a {}-byte log block",
            record.len(),
            block_size
        );

        let mut tail = self.tail.lock();
        if tail.boundary + needed > block_size {
            self.write_tail(&mut tail)?;
            self.move_to_new_block(&mut tail)?;
        }

        let start = tail.boundary;
        let previous = tail.page.get_int(LAST_RECORD_OFFSET);
        tail.page.set_bytes(start, record);
        tail.page.set_int(start + INT_SIZE + record.len(), previous);
        tail.page.set_int(LAST_RECORD_OFFSET, start as i32);
        tail.boundary = start + needed;
        tail.dirty = true;

        Ok(Lsn(tail.block.number()))
    }

    /// Make every record up to `lsn` durable.
    ///
    /// Records in earlier blocks were written when the tail moved on, so only
    /// the tail block itself may need writing.
    pub fn flush(&self, lsn: Lsn) -> StrataResult<()> {
        let mut tail = self.tail.lock();
        if lsn.0 >= tail.block.number() {
            self.write_tail(&mut tail)?;
        }
        Ok(())
    }

    /// Iterate over all records, newest first. Flushes the tail beforehand.
    pub fn iter(&self) -> StrataResult<LogIterator> {
        let tail_block = {
            let mut tail = self.tail.lock();
            self.write_tail(&mut tail)?;
            tail.block.clone()
        };
        LogIterator::new(Arc::clone(&self.disk), tail_block)
    }

    /// LSN a record appended now would receive, unless it starts a new block
    pub fn current_lsn(&self) -> Lsn {
        Lsn(self.tail.lock().block.number())
    }

    /// Number of blocks in the log file
    pub fn block_count(&self) -> StrataResult<i32> {
        self.disk.length(&self.log_file)
    }

    /// Bytes of the tail block used so far
    pub fn tail_offset(&self) -> usize {
        self.tail.lock().boundary
    }

    pub fn log_file(&self) -> &str {
        &self.log_file
    }

    fn write_tail(&self, tail: &mut LogTail) -> StrataResult<()> {
        if tail.dirty {
            self.disk.write(&tail.block, &tail.page)?;
            tail.dirty = false;
        }
        Ok(())
    }

    fn move_to_new_block(&self, tail: &mut LogTail) -> StrataResult<()> {
        let page = Page::new(self.disk.block_size());
        let block = self.disk.append(&self.log_file, &page)?;
        debug!("Log rolled over to {}", block);

        tail.page = page;
        tail.block = block;
        tail.boundary = HEADER_SIZE;
        tail.dirty = false;
        Ok(())
    }
}

/// Bytes occupied by a record of `len` bytes, including its framing
fn frame_size(len: usize) -> usize {
    INT_SIZE + len + INT_SIZE
}

/// Last block of a non-empty log, positioned after its final record
fn read_tail(disk: &DiskManager, log_file: &str, log_size: i32) -> StrataResult<LogTail> {
    let block = BlockId::new(log_file, log_size - 1);
    let mut page = Page::new(disk.block_size());
    disk.read(&block, &mut page)?;
    let boundary = end_of_records(&page);
    Ok(LogTail {
        page,
        block,
        boundary,
        dirty: false,
    })
}

fn end_of_records(page: &Page) -> usize {
    let last = page.get_int(LAST_RECORD_OFFSET);
    if last == NO_RECORD {
        HEADER_SIZE
    } else {
        let last = last as usize;
        last + frame_size(page.get_int(last) as usize)
    }
}

/// Walks the log from the newest record back to the first one
pub struct LogIterator {
    disk: Arc<DiskManager>,
    block: BlockId,
    page: Page,
    /// Offset of the next record to yield in `page`, or `NO_RECORD`
    current: i32,
}

impl LogIterator {
    fn new(disk: Arc<DiskManager>, block: BlockId) -> StrataResult<Self> {
        let mut page = Page::new(disk.block_size());
        disk.read(&block, &mut page)?;
        let current = page.get_int(LAST_RECORD_OFFSET);
        Ok(Self {
            disk,
            block,
            page,
            current,
        })
    }

    fn move_to_previous_block(&mut self) -> StrataResult<()> {
        self.block = BlockId::new(self.block.file_name(), self.block.number() - 1);
        self.disk.read(&self.block, &mut self.page)?;
        self.current = self.page.get_int(LAST_RECORD_OFFSET);
        Ok(())
    }
}

impl Iterator for LogIterator {
    type Item = StrataResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current != NO_RECORD {
                let start = self.current as usize;
                let record = self.page.get_bytes(start).to_vec();
                self.current = self.page.get_int(start + INT_SIZE + record.len());
                return Some(Ok(record));
            }

            if self.block.number() == 0 {
                return None;
            }

            if let Err(e) = self.move_to_previous_block() {
                // stop after reporting the failure
                self.block = BlockId::new(self.block.file_name(), 0);
                self.current = NO_RECORD;
                return Some(Err(e));
            }
        }
    }
}
