//! Buffer pool implementation
//!
//! [`BufferPool`] is the non-blocking layer: a fixed arena of buffers that
//! either hands out a pinned buffer or reports that none is free.
//! [`BufferManager`] wraps it in a mutex and waits, up to the configured
//! maximum, for a buffer to be released.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{StrataError, StrataResult};
use crate::storage::{BlockId, DiskManager, Lsn, Page, WalManager};
use crate::sync::BoundedWait;
use crate::tx::TxId;

/// Index of a buffer in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub usize);

/// Initializes the page of a freshly appended block
pub trait PageFormatter {
    fn format(&self, page: &mut Page);
}

impl<F: Fn(&mut Page)> PageFormatter for F {
    fn format(&self, page: &mut Page) {
        self(page)
    }
}

/// One page-sized slot of the pool
pub struct Buffer {
    contents: Page,
    block: Option<BlockId>,
    pins: usize,
    modified_by: Option<TxId>,
    lsn: Option<Lsn>,
}

impl Buffer {
    fn new(block_size: usize) -> Self {
        Self {
            contents: Page::new(block_size),
            block: None,
            pins: 0,
            modified_by: None,
            lsn: None,
        }
    }

    pub fn contents(&self) -> &Page {
        &self.contents
    }

    pub fn contents_mut(&mut self) -> &mut Page {
        &mut self.contents
    }

    pub fn block(&self) -> Option<&BlockId> {
        self.block.as_ref()
    }

    /// Record that `tx` changed the page. A change without a log record
    /// (`lsn == None`) keeps the LSN of earlier logged changes.
    pub fn set_modified(&mut self, tx: TxId, lsn: Option<Lsn>) {
        self.modified_by = Some(tx);
        if lsn.is_some() {
            self.lsn = lsn;
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    pub fn modifying_tx(&self) -> Option<TxId> {
        self.modified_by
    }

    pub fn lsn(&self) -> Option<Lsn> {
        self.lsn
    }

    /// Write the page if dirty, forcing its log record first
    fn flush(&mut self, disk: &DiskManager, wal: &WalManager) -> StrataResult<()> {
        if let (Some(_), Some(block)) = (self.modified_by, self.block.as_ref()) {
            if let Some(lsn) = self.lsn {
                wal.flush(lsn)?;
            }
            disk.write(block, &self.contents)?;
            self.modified_by = None;
        }
        Ok(())
    }

    fn assign_to_block(
        &mut self,
        block: &BlockId,
        disk: &DiskManager,
        wal: &WalManager,
    ) -> StrataResult<()> {
        self.flush(disk, wal)?;
        self.block = None;
        disk.read(block, &mut self.contents)?;
        self.block = Some(block.clone());
        self.pins = 0;
        self.lsn = None;
        Ok(())
    }

    fn assign_to_new(
        &mut self,
        file_name: &str,
        formatter: &dyn PageFormatter,
        disk: &DiskManager,
        wal: &WalManager,
    ) -> StrataResult<BlockId> {
        self.flush(disk, wal)?;
        self.block = None;
        self.contents.contents_mut().fill(0);
        formatter.format(&mut self.contents);
        let block = disk.append(file_name, &self.contents)?;
        self.block = Some(block.clone());
        self.pins = 0;
        self.lsn = None;
        Ok(block)
    }
}

/// Fixed set of buffers with non-blocking pin operations
pub struct BufferPool {
    buffers: Vec<Buffer>,
    available: usize,
    disk: Arc<DiskManager>,
    wal: Arc<WalManager>,
}

impl BufferPool {
    /// Create a pool of `size` unassigned buffers
    pub fn new(size: usize, disk: Arc<DiskManager>, wal: Arc<WalManager>) -> Self {
        let buffers = (0..size)
            .map(|_| Buffer::new(disk.block_size()))
            .collect();

        Self {
            buffers,
            available: size,
            disk,
            wal,
        }
    }

    /// Pin a buffer holding `block`, loading it into an unpinned buffer if it
    /// is not cached. Returns `None` when every buffer is pinned.
    pub fn try_pin(&mut self, block: &BlockId) -> StrataResult<Option<FrameId>> {
        let index = match self.find_existing(block) {
            Some(index) => index,
            None => {
                let Some(index) = self.choose_unpinned() else {
                    return Ok(None);
                };
                if let Some(old) = self.buffers[index].block() {
                    debug!("Evicting {} for {}", old, block);
                }
                self.buffers[index].assign_to_block(block, &self.disk, &self.wal)?;
                index
            }
        };

        self.pin_index(index);
        Ok(Some(FrameId(index)))
    }

    /// Pin a buffer for a new block appended to `file_name` and formatted by
    /// `formatter`. Returns `None` when every buffer is pinned; the file is
    /// not extended in that case.
    pub fn try_pin_new(
        &mut self,
        file_name: &str,
        formatter: &dyn PageFormatter,
    ) -> StrataResult<Option<(BlockId, FrameId)>> {
        let Some(index) = self.choose_unpinned() else {
            return Ok(None);
        };

        let block =
            self.buffers[index].assign_to_new(file_name, formatter, &self.disk, &self.wal)?;
        self.pin_index(index);
        Ok(Some((block, FrameId(index))))
    }

    /// Release one pin. Returns true when the buffer became unpinned.
    ///
    /// # Panics
    ///
    /// If the buffer is not pinned.
    pub fn unpin(&mut self, id: FrameId) -> bool {
        let buffer = &mut self.buffers[id.0];
        assert!(buffer.is_pinned(), "unpinning buffer {} which is not pinned", id.0);

        buffer.pins -= 1;
        if buffer.pins == 0 {
            self.available += 1;
            true
        } else {
            false
        }
    }

    /// Flush every buffer last modified by `tx`
    pub fn flush_all(&mut self, tx: TxId) -> StrataResult<()> {
        for buffer in &mut self.buffers {
            if buffer.modifying_tx() == Some(tx) {
                buffer.flush(&self.disk, &self.wal)?;
            }
        }
        Ok(())
    }

    /// Flush every dirty buffer
    pub fn flush_all_buffers(&mut self) -> StrataResult<()> {
        for buffer in &mut self.buffers {
            buffer.flush(&self.disk, &self.wal)?;
        }
        Ok(())
    }

    /// Number of unpinned buffers
    pub fn available(&self) -> usize {
        self.available
    }

    pub fn buffer(&self, id: FrameId) -> &Buffer {
        &self.buffers[id.0]
    }

    pub fn buffer_mut(&mut self, id: FrameId) -> &mut Buffer {
        &mut self.buffers[id.0]
    }

    fn pin_index(&mut self, index: usize) {
        let buffer = &mut self.buffers[index];
        if !buffer.is_pinned() {
            self.available -= 1;
        }
        buffer.pins += 1;
    }

    fn find_existing(&self, block: &BlockId) -> Option<usize> {
        self.buffers
            .iter()
            .position(|buffer| buffer.block() == Some(block))
    }

    fn choose_unpinned(&self) -> Option<usize> {
        self.buffers.iter().position(|buffer| !buffer.is_pinned())
    }
}

/// Buffer pool that waits for a free buffer instead of failing at once
pub struct BufferManager {
    pool: Mutex<BufferPool>,
    freed: BoundedWait,
}

impl BufferManager {
    pub fn new(
        size: usize,
        disk: Arc<DiskManager>,
        wal: Arc<WalManager>,
        max_wait: Duration,
    ) -> Self {
        Self {
            pool: Mutex::new(BufferPool::new(size, disk, wal)),
            freed: BoundedWait::new(max_wait),
        }
    }

    /// Pin `block`, waiting for a buffer to be released if all are pinned
    pub fn pin(&self, block: &BlockId) -> StrataResult<FrameId> {
        let mut pool = self.pool.lock();
        match self.freed.wait_until(&mut pool, |pool| pool.try_pin(block))? {
            Some(id) => Ok(id),
            None => {
                warn!(
                    "No buffer for {} after {:?}",
                    block,
                    self.freed.max_wait()
                );
                Err(StrataError::BufferAbort {
                    block: block.clone(),
                })
            }
        }
    }

    /// Append a formatted block to `file_name` and pin it
    pub fn pin_new(
        &self,
        file_name: &str,
        formatter: &dyn PageFormatter,
    ) -> StrataResult<(BlockId, FrameId)> {
        let mut pool = self.pool.lock();
        match self
            .freed
            .wait_until(&mut pool, |pool| pool.try_pin_new(file_name, formatter))?
        {
            Some(pinned) => Ok(pinned),
            None => {
                warn!(
                    "No buffer for a new block of {} after {:?}",
                    file_name,
                    self.freed.max_wait()
                );
                Err(StrataError::BufferAbort {
                    block: BlockId::end_of_file(file_name),
                })
            }
        }
    }

    pub fn unpin(&self, id: FrameId) {
        let mut pool = self.pool.lock();
        if pool.unpin(id) {
            self.freed.notify_all();
        }
    }

    pub fn flush_all(&self, tx: TxId) -> StrataResult<()> {
        self.pool.lock().flush_all(tx)
    }

    pub fn flush_all_buffers(&self) -> StrataResult<()> {
        self.pool.lock().flush_all_buffers()
    }

    pub fn available(&self) -> usize {
        self.pool.lock().available()
    }

    /// Read access to a pinned buffer
    pub fn with_buffer<R>(&self, id: FrameId, f: impl FnOnce(&Buffer) -> R) -> R {
        f(self.pool.lock().buffer(id))
    }

    /// Write access to a pinned buffer
    pub fn with_buffer_mut<R>(&self, id: FrameId, f: impl FnOnce(&mut Buffer) -> R) -> R {
        f(self.pool.lock().buffer_mut(id))
    }
}
