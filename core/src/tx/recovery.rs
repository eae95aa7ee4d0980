//! Undo-only recovery for one transaction

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::StrataResult;
use crate::storage::page::INT_SIZE;
use crate::storage::{BlockId, BufferManager, FrameId, Lsn, Page, WalManager};
use crate::tx::{LogRecord, TxId};

/// Writes a transaction's log records and undoes its changes.
///
/// Modified pages are forced to disk before a commit, rollback or checkpoint
/// record is written, so recovery never has to redo anything.
pub struct RecoveryManager {
    tx: TxId,
    wal: Arc<WalManager>,
    buffers: Arc<BufferManager>,
}

impl RecoveryManager {
    /// Log the start of `tx`. The record is not forced.
    pub fn new(
        tx: TxId,
        wal: Arc<WalManager>,
        buffers: Arc<BufferManager>,
    ) -> StrataResult<Self> {
        LogRecord::Start { tx }.write_to_log(&wal)?;
        Ok(Self { tx, wal, buffers })
    }

    pub fn commit(&self) -> StrataResult<()> {
        self.buffers.flush_all(self.tx)?;
        let lsn = LogRecord::Commit { tx: self.tx }.write_to_log(&self.wal)?;
        self.wal.flush(lsn)
    }

    pub fn rollback(&self) -> StrataResult<()> {
        self.undo_own_changes()?;
        self.buffers.flush_all(self.tx)?;
        let lsn = LogRecord::Rollback { tx: self.tx }.write_to_log(&self.wal)?;
        self.wal.flush(lsn)
    }

    /// Undo every unfinished transaction back to the last checkpoint, then
    /// write a new checkpoint.
    pub fn recover(&self) -> StrataResult<()> {
        self.undo_unfinished()?;
        self.buffers.flush_all(self.tx)?;
        let lsn = LogRecord::Checkpoint.write_to_log(&self.wal)?;
        self.wal.flush(lsn)
    }

    /// Log the integer about to be overwritten at `offset` in the pinned
    /// frame. Temporary blocks are not logged and yield `None`.
    pub fn set_int(
        &self,
        block: &BlockId,
        frame: FrameId,
        offset: usize,
    ) -> StrataResult<Option<Lsn>> {
        if block.is_temporary() {
            return Ok(None);
        }
        let old_value = self
            .buffers
            .with_buffer(frame, |buffer| buffer.contents().get_int(offset));
        let record = LogRecord::SetInt {
            tx: self.tx,
            block: block.clone(),
            offset,
            old_value,
        };
        record.write_to_log(&self.wal).map(Some)
    }

    /// Log what a string of `new_len` bytes written at `offset` is about to
    /// overwrite.
    ///
    /// A well-formed old string is logged as one string record. Bytes the new
    /// value covers beyond it, or the whole region when the cell does not
    /// hold a valid string, are logged as integer records so rollback
    /// restores them exactly.
    pub fn set_string(
        &self,
        block: &BlockId,
        frame: FrameId,
        offset: usize,
        new_len: usize,
    ) -> StrataResult<Option<Lsn>> {
        if block.is_temporary() {
            return Ok(None);
        }
        let (old_value, overwritten) = self.buffers.with_buffer(frame, |buffer| {
            let page = buffer.contents();
            let old_value = page.try_get_string(offset);
            let covered = old_value
                .as_ref()
                .map_or(offset, |old| offset + Page::max_length(old.len()));
            let end = (offset + Page::max_length(new_len)).min(page.len());
            let words: Vec<(usize, i32)> = (covered..end)
                .step_by(INT_SIZE)
                .map(|pos| pos.min(page.len() - INT_SIZE))
                .map(|pos| (pos, page.get_int(pos)))
                .collect();
            (old_value, words)
        });

        let mut lsn = None;
        if let Some(old_value) = old_value {
            let record = LogRecord::SetString {
                tx: self.tx,
                block: block.clone(),
                offset,
                old_value,
            };
            lsn = Some(record.write_to_log(&self.wal)?);
        }
        for (pos, old_value) in overwritten {
            let record = LogRecord::SetInt {
                tx: self.tx,
                block: block.clone(),
                offset: pos,
                old_value,
            };
            lsn = Some(record.write_to_log(&self.wal)?);
        }
        Ok(lsn)
    }

    fn undo_own_changes(&self) -> StrataResult<()> {
        let mut undone = 0;
        for bytes in self.wal.iter()? {
            let record = LogRecord::from_bytes(bytes?);
            if record.tx() != Some(self.tx) {
                continue;
            }
            if let LogRecord::Start { .. } = record {
                break;
            }
            record.undo(&self.buffers, self.tx)?;
            undone += 1;
        }
        debug!("Transaction {} undid {} changes", self.tx, undone);
        Ok(())
    }

    fn undo_unfinished(&self) -> StrataResult<()> {
        let mut finished = HashSet::new();
        let mut undone = 0;
        for bytes in self.wal.iter()? {
            let record = LogRecord::from_bytes(bytes?);
            match &record {
                LogRecord::Checkpoint => break,
                LogRecord::Commit { tx } | LogRecord::Rollback { tx } => {
                    finished.insert(*tx);
                }
                LogRecord::SetInt { tx, .. } | LogRecord::SetString { tx, .. }
                    if !finished.contains(tx) =>
                {
                    record.undo(&self.buffers, self.tx)?;
                    undone += 1;
                }
                _ => {}
            }
        }
        info!("Recovery undid {} unfinished changes", undone);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskManager;
    use crate::tx::log_record::read_log;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Fixture {
        wal: Arc<WalManager>,
        buffers: Arc<BufferManager>,
    }

    fn fixture(dir: &std::path::Path) -> Fixture {
        let disk = Arc::new(DiskManager::new(dir, 400).unwrap());
        let wal = Arc::new(WalManager::new(Arc::clone(&disk), "recovery.log").unwrap());
        let buffers = Arc::new(BufferManager::new(
            4,
            disk,
            Arc::clone(&wal),
            Duration::from_millis(100),
        ));
        Fixture { wal, buffers }
    }

    fn start(fx: &Fixture, tx: i32) -> RecoveryManager {
        RecoveryManager::new(TxId(tx), Arc::clone(&fx.wal), Arc::clone(&fx.buffers)).unwrap()
    }

    /// Log and apply an integer write the way a transaction does
    fn write_int(fx: &Fixture, rm: &RecoveryManager, tx: TxId, block: &BlockId, value: i32) {
        let frame = fx.buffers.pin(block).unwrap();
        let lsn = rm.set_int(block, frame, 0).unwrap();
        fx.buffers.with_buffer_mut(frame, |buffer| {
            buffer.contents_mut().set_int(0, value);
            buffer.set_modified(tx, lsn);
        });
        fx.buffers.unpin(frame);
    }

    fn read_int(fx: &Fixture, block: &BlockId) -> i32 {
        let frame = fx.buffers.pin(block).unwrap();
        let value = fx
            .buffers
            .with_buffer(frame, |buffer| buffer.contents().get_int(0));
        fx.buffers.unpin(frame);
        value
    }

    #[test]
    fn test_rollback_restores_old_values() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path());
        let block = BlockId::new("data", 0);

        let rm = start(&fx, 1);
        write_int(&fx, &rm, TxId(1), &block, 10);
        write_int(&fx, &rm, TxId(1), &block, 20);
        rm.rollback().unwrap();

        assert_eq!(read_int(&fx, &block), 0);
        let log: Vec<String> = read_log(&fx.wal)
            .unwrap()
            .iter()
            .map(|record| record.to_string())
            .collect();
        assert_eq!(
            log,
            vec![
                "<ROLLBACK 1>",
                "<SETINT 1 [file data, block 0] 0 10>",
                "<SETINT 1 [file data, block 0] 0 0>",
                "<START 1>",
            ]
        );
    }

    #[test]
    fn test_recover_skips_finished_transactions() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path());
        let committed = BlockId::new("data", 0);
        let rolled_back = BlockId::new("data", 1);
        let unfinished = BlockId::new("data", 2);

        let t1 = start(&fx, 1);
        write_int(&fx, &t1, TxId(1), &committed, 11);
        t1.commit().unwrap();

        let t2 = start(&fx, 2);
        write_int(&fx, &t2, TxId(2), &rolled_back, 22);
        t2.rollback().unwrap();

        let t3 = start(&fx, 3);
        write_int(&fx, &t3, TxId(3), &unfinished, 33);
        fx.buffers.flush_all_buffers().unwrap();

        let t4 = start(&fx, 4);
        t4.recover().unwrap();

        assert_eq!(read_int(&fx, &committed), 11);
        assert_eq!(read_int(&fx, &rolled_back), 0);
        assert_eq!(read_int(&fx, &unfinished), 0);
        assert_eq!(read_log(&fx.wal).unwrap()[0], LogRecord::Checkpoint);
    }

    #[test]
    fn test_recover_stops_at_checkpoint() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path());
        let block = BlockId::new("data", 0);

        // an unfinished write before the checkpoint is out of reach
        let t1 = start(&fx, 1);
        write_int(&fx, &t1, TxId(1), &block, 5);
        LogRecord::Checkpoint.write_to_log(&fx.wal).unwrap();

        let t2 = start(&fx, 2);
        t2.recover().unwrap();

        assert_eq!(read_int(&fx, &block), 5);
    }

    #[test]
    fn test_temporary_blocks_are_not_logged() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path());
        let rm = start(&fx, 1);
        let before = fx.wal.tail_offset();

        let block = BlockId::new("temp_sort", 0);
        let frame = fx.buffers.pin(&block).unwrap();
        assert_eq!(rm.set_int(&block, frame, 0).unwrap(), None);
        assert_eq!(rm.set_string(&block, frame, 8, 5).unwrap(), None);
        fx.buffers.unpin(frame);

        assert_eq!(fx.wal.tail_offset(), before);
    }
}
