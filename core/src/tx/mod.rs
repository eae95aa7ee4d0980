//! Transactions: locking, undo logging and recovery

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use serde::{Deserialize, Serialize};

pub mod buffer_list;
pub mod concurrency;
pub mod lock_table;
pub mod log_record;
pub mod recovery;
pub mod transaction;

pub use buffer_list::BufferList;
pub use concurrency::{ConcurrencyManager, LockMode};
pub use lock_table::LockTable;
pub use log_record::{LogRecord, RecordKind, read_log};
pub use recovery::RecoveryManager;
pub use transaction::Transaction;

/// Transaction identifier, unique for the lifetime of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub i32);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out increasing transaction ids, starting at 1
#[derive(Debug)]
pub struct TxIdGenerator {
    next: AtomicI32,
}

impl TxIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicI32::new(1),
        }
    }

    pub fn next_id(&self) -> TxId {
        TxId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TxIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
