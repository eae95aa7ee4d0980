//! Transaction facade over buffers, locks and recovery

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::StrataResult;
use crate::storage::{BlockId, BufferManager, DiskManager, FrameId, PageFormatter, WalManager};
use crate::tx::{BufferList, ConcurrencyManager, LockTable, RecoveryManager, TxId};

/// A unit of work with serializable isolation and undo-based atomicity.
///
/// Values are read and written through blocks the transaction has pinned.
/// Reads take shared locks and writes exclusive ones, all held until
/// [`commit`](Self::commit) or [`rollback`](Self::rollback). A transaction
/// dropped without finishing is rolled back.
#[must_use = "a transaction must be committed or rolled back"]
pub struct Transaction {
    id: TxId,
    recovery: RecoveryManager,
    concurrency: ConcurrencyManager,
    buffers: BufferList,
    buffer_manager: Arc<BufferManager>,
    disk: Arc<DiskManager>,
    finished: bool,
}

impl Transaction {
    /// Begin a transaction, logging its start record
    pub fn new(
        id: TxId,
        disk: Arc<DiskManager>,
        wal: Arc<WalManager>,
        buffer_manager: Arc<BufferManager>,
        locks: Arc<LockTable>,
    ) -> StrataResult<Self> {
        let recovery = RecoveryManager::new(id, wal, Arc::clone(&buffer_manager))?;
        debug!("Started transaction {}", id);
        Ok(Self {
            id,
            recovery,
            concurrency: ConcurrencyManager::new(locks),
            buffers: BufferList::new(Arc::clone(&buffer_manager)),
            buffer_manager,
            disk,
            finished: false,
        })
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    /// Force this transaction's changes and a commit record to disk, then
    /// release its pins and locks.
    pub fn commit(mut self) -> StrataResult<()> {
        self.finished = true;
        self.buffers.unpin_all();
        let result = self.recovery.commit();
        self.concurrency.release();
        match &result {
            Ok(()) => debug!("Committed transaction {}", self.id),
            Err(e) => error!("Commit of transaction {} failed: {}", self.id, e),
        }
        result
    }

    /// Undo this transaction's changes, log the rollback, then release its
    /// pins and locks.
    pub fn rollback(mut self) -> StrataResult<()> {
        self.finished = true;
        self.finish_rollback()
    }

    /// Undo every unfinished transaction and write a checkpoint.
    ///
    /// Only meaningful before any other transaction has started.
    pub fn recover(&mut self) -> StrataResult<()> {
        self.recovery.recover()
    }

    pub fn pin(&mut self, block: &BlockId) -> StrataResult<()> {
        self.buffers.pin(block).map(|_| ())
    }

    /// # Panics
    ///
    /// If the block is not pinned by this transaction.
    pub fn unpin(&mut self, block: &BlockId) {
        self.buffers.unpin(block);
    }

    pub fn get_int(&mut self, block: &BlockId, offset: usize) -> StrataResult<i32> {
        self.concurrency.s_lock(block)?;
        let frame = self.pinned_frame(block);
        Ok(self
            .buffer_manager
            .with_buffer(frame, |buffer| buffer.contents().get_int(offset)))
    }

    pub fn get_string(&mut self, block: &BlockId, offset: usize) -> StrataResult<String> {
        self.concurrency.s_lock(block)?;
        let frame = self.pinned_frame(block);
        Ok(self
            .buffer_manager
            .with_buffer(frame, |buffer| buffer.contents().get_string(offset)))
    }

    /// Log the old value, then write `value` at `offset`
    pub fn set_int(&mut self, block: &BlockId, offset: usize, value: i32) -> StrataResult<()> {
        self.concurrency.x_lock(block)?;
        let frame = self.pinned_frame(block);
        let lsn = self.recovery.set_int(block, frame, offset)?;
        let id = self.id;
        self.buffer_manager.with_buffer_mut(frame, |buffer| {
            buffer.contents_mut().set_int(offset, value);
            buffer.set_modified(id, lsn);
        });
        Ok(())
    }

    pub fn set_string(
        &mut self,
        block: &BlockId,
        offset: usize,
        value: &str,
    ) -> StrataResult<()> {
        self.concurrency.x_lock(block)?;
        let frame = self.pinned_frame(block);
        let lsn = self.recovery.set_string(block, frame, offset, value.len())?;
        let id = self.id;
        self.buffer_manager.with_buffer_mut(frame, |buffer| {
            buffer.contents_mut().set_string(offset, value);
            buffer.set_modified(id, lsn);
        });
        Ok(())
    }

    /// Number of blocks in `file_name`.
    ///
    /// Takes a shared lock on the end-of-file marker, so the size cannot
    /// change under this transaction.
    pub fn size(&mut self, file_name: &str) -> StrataResult<i32> {
        self.concurrency.s_lock(&BlockId::end_of_file(file_name))?;
        self.disk.length(file_name)
    }

    /// Append a block formatted by `formatter` to `file_name`.
    ///
    /// The new block is returned unpinned.
    pub fn append(
        &mut self,
        file_name: &str,
        formatter: &dyn PageFormatter,
    ) -> StrataResult<BlockId> {
        self.concurrency.x_lock(&BlockId::end_of_file(file_name))?;
        let block = self.buffers.pin_new(file_name, formatter)?;
        self.buffers.unpin(&block);
        Ok(block)
    }

    pub fn block_size(&self) -> usize {
        self.disk.block_size()
    }

    pub fn available_buffers(&self) -> usize {
        self.buffer_manager.available()
    }

    fn pinned_frame(&self, block: &BlockId) -> FrameId {
        self.buffers
            .frame(block)
            .unwrap_or_else(|| panic!("{} is not pinned by transaction {}", block, self.id))
    }

    fn finish_rollback(&mut self) -> StrataResult<()> {
        self.buffers.unpin_all();
        let result = self.recovery.rollback();
        self.concurrency.release();
        match &result {
            Ok(()) => debug!("Rolled back transaction {}", self.id),
            Err(e) => error!("Rollback of transaction {} failed: {}", self.id, e),
        }
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Transaction {} dropped unfinished, rolling back", self.id);
            let _ = self.finish_rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Page, page::INT_SIZE};
    use std::time::Duration;
    use tempfile::tempdir;

    struct Parts {
        disk: Arc<DiskManager>,
        wal: Arc<WalManager>,
        buffers: Arc<BufferManager>,
        locks: Arc<LockTable>,
    }

    impl Parts {
        fn new(dir: &std::path::Path, pool_size: usize) -> Self {
            let disk = Arc::new(DiskManager::new(dir, 400).unwrap());
            let wal = Arc::new(WalManager::new(Arc::clone(&disk), "tx.log").unwrap());
            let buffers = Arc::new(BufferManager::new(
                pool_size,
                Arc::clone(&disk),
                Arc::clone(&wal),
                Duration::from_millis(100),
            ));
            let locks = Arc::new(LockTable::new(Duration::from_millis(100)));
            Self {
                disk,
                wal,
                buffers,
                locks,
            }
        }

        fn begin(&self, id: i32) -> Transaction {
            Transaction::new(
                TxId(id),
                Arc::clone(&self.disk),
                Arc::clone(&self.wal),
                Arc::clone(&self.buffers),
                Arc::clone(&self.locks),
            )
            .unwrap()
        }
    }

    #[test]
    fn test_commit_then_read_back() {
        let dir = tempdir().unwrap();
        let parts = Parts::new(dir.path(), 8);
        let block = BlockId::new("testfile", 1);

        let mut t1 = parts.begin(1);
        t1.pin(&block).unwrap();
        t1.set_int(&block, 80, 1).unwrap();
        t1.set_string(&block, 40, "one").unwrap();
        t1.commit().unwrap();

        let mut t2 = parts.begin(2);
        t2.pin(&block).unwrap();
        assert_eq!(t2.get_int(&block, 80).unwrap(), 1);
        assert_eq!(t2.get_string(&block, 40).unwrap(), "one");
        t2.set_int(&block, 80, 2).unwrap();
        t2.set_string(&block, 40, "one!").unwrap();
        t2.commit().unwrap();

        let mut page = Page::new(400);
        parts.disk.read(&block, &mut page).unwrap();
        assert_eq!(page.get_int(80), 2);
        assert_eq!(page.get_string(40), "one!");
    }

    #[test]
    fn test_rollback_undoes_writes() {
        let dir = tempdir().unwrap();
        let parts = Parts::new(dir.path(), 8);
        let block = BlockId::new("testfile", 0);

        let mut t1 = parts.begin(1);
        t1.pin(&block).unwrap();
        t1.set_int(&block, 0, 7).unwrap();
        t1.commit().unwrap();

        let mut t2 = parts.begin(2);
        t2.pin(&block).unwrap();
        t2.set_int(&block, 0, 9999).unwrap();
        assert_eq!(t2.get_int(&block, 0).unwrap(), 9999);
        t2.rollback().unwrap();

        let mut t3 = parts.begin(3);
        t3.pin(&block).unwrap();
        assert_eq!(t3.get_int(&block, 0).unwrap(), 7);
        t3.commit().unwrap();
        assert_eq!(parts.locks.lock_state(&block), 0);
    }

    #[test]
    fn test_drop_rolls_back() {
        let dir = tempdir().unwrap();
        let parts = Parts::new(dir.path(), 8);
        let block = BlockId::new("testfile", 0);

        {
            let mut t1 = parts.begin(1);
            t1.pin(&block).unwrap();
            t1.set_int(&block, 0, 42).unwrap();
        }

        assert_eq!(parts.buffers.available(), 8);
        assert_eq!(parts.locks.lock_state(&block), 0);

        let mut t2 = parts.begin(2);
        t2.pin(&block).unwrap();
        assert_eq!(t2.get_int(&block, 0).unwrap(), 0);
        t2.commit().unwrap();
    }

    #[test]
    fn test_finishing_releases_pins_and_locks() {
        let dir = tempdir().unwrap();
        let parts = Parts::new(dir.path(), 3);
        let a = BlockId::new("testfile", 0);
        let b = BlockId::new("testfile", 1);

        let mut tx = parts.begin(1);
        tx.pin(&a).unwrap();
        tx.pin(&a).unwrap();
        tx.pin(&b).unwrap();
        tx.get_int(&a, 0).unwrap();
        tx.set_int(&b, 0, 1).unwrap();
        assert_eq!(tx.available_buffers(), 1);
        assert_eq!(parts.locks.lock_state(&a), 1);
        assert_eq!(parts.locks.lock_state(&b), -1);

        tx.commit().unwrap();
        assert_eq!(parts.buffers.available(), 3);
        assert_eq!(parts.locks.lock_state(&a), 0);
        assert_eq!(parts.locks.lock_state(&b), 0);
    }

    #[test]
    fn test_string_over_int_cell_rolls_back_exactly() {
        let dir = tempdir().unwrap();
        let parts = Parts::new(dir.path(), 4);

        let mut setup = parts.begin(1);
        let formatter = |page: &mut Page| page.set_int(0, -1);
        let block = setup.append("cells", &formatter).unwrap();
        setup.commit().unwrap();

        let mut tx = parts.begin(2);
        tx.pin(&block).unwrap();
        tx.set_string(&block, 0, "abc").unwrap();
        assert_eq!(tx.get_string(&block, 0).unwrap(), "abc");
        tx.rollback().unwrap();

        let mut check = parts.begin(3);
        check.pin(&block).unwrap();
        assert_eq!(check.get_int(&block, 0).unwrap(), -1);
        assert_eq!(check.get_int(&block, INT_SIZE).unwrap(), 0);
        check.commit().unwrap();
    }

    #[test]
    fn test_longer_string_rollback_restores_following_bytes() {
        let dir = tempdir().unwrap();
        let parts = Parts::new(dir.path(), 4);
        let block = BlockId::new("cells", 0);

        let mut setup = parts.begin(1);
        setup.pin(&block).unwrap();
        setup.set_string(&block, 40, "hi").unwrap();
        setup.set_int(&block, 48, 7).unwrap();
        setup.commit().unwrap();

        let mut tx = parts.begin(2);
        tx.pin(&block).unwrap();
        tx.set_string(&block, 40, "a much longer value").unwrap();
        assert_ne!(tx.get_int(&block, 48).unwrap(), 7);
        tx.rollback().unwrap();

        let mut check = parts.begin(3);
        check.pin(&block).unwrap();
        assert_eq!(check.get_string(&block, 40).unwrap(), "hi");
        assert_eq!(check.get_int(&block, 48).unwrap(), 7);
        check.commit().unwrap();
    }

    #[test]
    fn test_append_and_size() {
        let dir = tempdir().unwrap();
        let parts = Parts::new(dir.path(), 4);

        let mut tx = parts.begin(1);
        assert_eq!(tx.size("growing").unwrap(), 0);
        let formatter = |page: &mut Page| page.set_int(0, -1);
        let first = tx.append("growing", &formatter).unwrap();
        let second = tx.append("growing", &formatter).unwrap();
        assert_eq!(first, BlockId::new("growing", 0));
        assert_eq!(second, BlockId::new("growing", 1));
        assert_eq!(tx.size("growing").unwrap(), 2);
        assert_eq!(tx.available_buffers(), 4);

        tx.pin(&second).unwrap();
        assert_eq!(tx.get_int(&second, 0).unwrap(), -1);
        assert_eq!(tx.block_size(), 400);
        tx.commit().unwrap();
    }

    #[test]
    fn test_conflicting_writer_aborts() {
        let dir = tempdir().unwrap();
        let parts = Parts::new(dir.path(), 4);
        let block = BlockId::new("testfile", 0);

        let mut reader = parts.begin(1);
        reader.pin(&block).unwrap();
        reader.get_int(&block, INT_SIZE).unwrap();

        let mut writer = parts.begin(2);
        writer.pin(&block).unwrap();
        let err = writer.set_int(&block, INT_SIZE, 5).unwrap_err();
        assert!(err.is_abort());
        writer.rollback().unwrap();

        reader.commit().unwrap();
        assert_eq!(parts.locks.lock_state(&block), 0);
    }

    #[test]
    #[should_panic(expected = "is not pinned by transaction 1")]
    fn test_read_without_pin_panics() {
        let dir = tempdir().unwrap();
        let parts = Parts::new(dir.path(), 4);
        let mut tx = parts.begin(1);
        let _ = tx.get_int(&BlockId::new("testfile", 0), 0);
    }
}
