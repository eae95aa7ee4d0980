//! Strata - transactional block storage engine
//!
//! Fixed-size blocks are cached in a bounded buffer pool, changes are
//! undo-logged to a write-ahead log, and transactions are isolated with
//! strict two-phase locking on blocks.

pub mod config;
pub mod error;
pub mod storage;
pub mod sync;
pub mod tx;

pub use config::Config;
pub use error::{StrataError, StrataResult};
pub use storage::{BlockId, Page, StorageEngine};
pub use tx::{LogRecord, Transaction, TxId};
