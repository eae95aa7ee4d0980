//! Undo log records
//!
//! Every record starts with a 4-byte type tag followed by its fields in
//! declaration order, encoded like page fields. Only old values are logged.

use std::fmt;

use crate::error::StrataResult;
use crate::storage::page::INT_SIZE;
use crate::storage::{BlockId, BufferManager, Lsn, Page, WalManager};
use crate::tx::TxId;

/// On-disk type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RecordKind {
    Checkpoint = 0,
    Start = 1,
    Commit = 2,
    Rollback = 3,
    SetInt = 4,
    SetString = 5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Checkpoint,
    Start {
        tx: TxId,
    },
    Commit {
        tx: TxId,
    },
    Rollback {
        tx: TxId,
    },
    SetInt {
        tx: TxId,
        block: BlockId,
        offset: usize,
        old_value: i32,
    },
    SetString {
        tx: TxId,
        block: BlockId,
        offset: usize,
        old_value: String,
    },
}

type Decoder = fn(&mut FieldReader<'_>) -> LogRecord;

/// Decoders indexed by type tag
const DECODERS: [Decoder; 6] = [
    decode_checkpoint,
    decode_start,
    decode_commit,
    decode_rollback,
    decode_set_int,
    decode_set_string,
];

fn decode_checkpoint(_: &mut FieldReader<'_>) -> LogRecord {
    LogRecord::Checkpoint
}

fn decode_start(r: &mut FieldReader<'_>) -> LogRecord {
    LogRecord::Start { tx: r.tx() }
}

fn decode_commit(r: &mut FieldReader<'_>) -> LogRecord {
    LogRecord::Commit { tx: r.tx() }
}

fn decode_rollback(r: &mut FieldReader<'_>) -> LogRecord {
    LogRecord::Rollback { tx: r.tx() }
}

fn decode_set_int(r: &mut FieldReader<'_>) -> LogRecord {
    LogRecord::SetInt {
        tx: r.tx(),
        block: r.block(),
        offset: r.int() as usize,
        old_value: r.int(),
    }
}

fn decode_set_string(r: &mut FieldReader<'_>) -> LogRecord {
    LogRecord::SetString {
        tx: r.tx(),
        block: r.block(),
        offset: r.int() as usize,
        old_value: r.string(),
    }
}

impl LogRecord {
    /// Decode a record read from the log.
    ///
    /// # Panics
    ///
    /// On an unknown type tag.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let page = Page::from_bytes(bytes);
        let mut reader = FieldReader { page: &page, pos: 0 };
        let tag = reader.int();
        let decode = usize::try_from(tag)
            .ok()
            .and_then(|index| DECODERS.get(index))
            .unwrap_or_else(|| panic!("unknown log record type {}", tag));
        decode(&mut reader)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = FieldWriter::default();
        writer.int(self.kind() as i32);
        match self {
            LogRecord::Checkpoint => {}
            LogRecord::Start { tx } | LogRecord::Commit { tx } | LogRecord::Rollback { tx } => {
                writer.int(tx.0);
            }
            LogRecord::SetInt {
                tx,
                block,
                offset,
                old_value,
            } => {
                writer.int(tx.0);
                writer.block(block);
                writer.int(*offset as i32);
                writer.int(*old_value);
            }
            LogRecord::SetString {
                tx,
                block,
                offset,
                old_value,
            } => {
                writer.int(tx.0);
                writer.block(block);
                writer.int(*offset as i32);
                writer.string(old_value);
            }
        }
        writer.bytes
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            LogRecord::Checkpoint => RecordKind::Checkpoint,
            LogRecord::Start { .. } => RecordKind::Start,
            LogRecord::Commit { .. } => RecordKind::Commit,
            LogRecord::Rollback { .. } => RecordKind::Rollback,
            LogRecord::SetInt { .. } => RecordKind::SetInt,
            LogRecord::SetString { .. } => RecordKind::SetString,
        }
    }

    /// Transaction that wrote the record; checkpoints have none
    pub fn tx(&self) -> Option<TxId> {
        match self {
            LogRecord::Checkpoint => None,
            LogRecord::Start { tx }
            | LogRecord::Commit { tx }
            | LogRecord::Rollback { tx }
            | LogRecord::SetInt { tx, .. }
            | LogRecord::SetString { tx, .. } => Some(*tx),
        }
    }

    /// Append the record to the log without forcing it
    pub fn write_to_log(&self, wal: &WalManager) -> StrataResult<Lsn> {
        wal.append(&self.to_bytes())
    }

    /// Restore the logged old value, on behalf of transaction `undoing`.
    ///
    /// The block is pinned directly in the buffer manager and the write is
    /// not logged again. Records other than value changes have nothing to
    /// undo.
    pub fn undo(&self, buffers: &BufferManager, undoing: TxId) -> StrataResult<()> {
        match self {
            LogRecord::SetInt {
                block,
                offset,
                old_value,
                ..
            } => {
                let id = buffers.pin(block)?;
                buffers.with_buffer_mut(id, |buffer| {
                    buffer.contents_mut().set_int(*offset, *old_value);
                    buffer.set_modified(undoing, None);
                });
                buffers.unpin(id);
            }
            LogRecord::SetString {
                block,
                offset,
                old_value,
                ..
            } => {
                let id = buffers.pin(block)?;
                buffers.with_buffer_mut(id, |buffer| {
                    buffer.contents_mut().set_string(*offset, old_value);
                    buffer.set_modified(undoing, None);
                });
                buffers.unpin(id);
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogRecord::Checkpoint => write!(f, "<CHECKPOINT>"),
            LogRecord::Start { tx } => write!(f, "<START {}>", tx),
            LogRecord::Commit { tx } => write!(f, "<COMMIT {}>", tx),
            LogRecord::Rollback { tx } => write!(f, "<ROLLBACK {}>", tx),
            LogRecord::SetInt {
                tx,
                block,
                offset,
                old_value,
            } => write!(f, "<SETINT {} {} {} {}>", tx, block, offset, old_value),
            LogRecord::SetString {
                tx,
                block,
                offset,
                old_value,
            } => write!(f, "<SETSTRING {} {} {} {}>", tx, block, offset, old_value),
        }
    }
}

/// Decode every record in the log, newest first
pub fn read_log(wal: &WalManager) -> StrataResult<Vec<LogRecord>> {
    wal.iter()?
        .map(|bytes| bytes.map(LogRecord::from_bytes))
        .collect()
}

#[derive(Default)]
struct FieldWriter {
    bytes: Vec<u8>,
}

impl FieldWriter {
    fn int(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn string(&mut self, value: &str) {
        self.int(value.len() as i32);
        self.bytes.extend_from_slice(value.as_bytes());
    }

    fn block(&mut self, block: &BlockId) {
        self.string(block.file_name());
        self.int(block.number());
    }
}

struct FieldReader<'a> {
    page: &'a Page,
    pos: usize,
}

impl FieldReader<'_> {
    fn int(&mut self) -> i32 {
        let value = self.page.get_int(self.pos);
        self.pos += INT_SIZE;
        value
    }

    fn string(&mut self) -> String {
        let value = self.page.get_string(self.pos);
        self.pos += Page::max_length(self.page.get_int(self.pos) as usize);
        value
    }

    fn tx(&mut self) -> TxId {
        TxId(self.int())
    }

    fn block(&mut self) -> BlockId {
        let file_name = self.string();
        BlockId::new(file_name, self.int())
    }
}
