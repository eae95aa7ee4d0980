//! Per-transaction lock bookkeeping

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StrataResult;
use crate::storage::BlockId;
use crate::tx::LockTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Locks held by one transaction.
///
/// Implements strict two-phase locking on top of the shared [`LockTable`]:
/// locks are only acquired until [`release`](Self::release) drops them all at
/// the end of the transaction.
pub struct ConcurrencyManager {
    table: Arc<LockTable>,
    locks: HashMap<BlockId, LockMode>,
}

impl ConcurrencyManager {
    pub fn new(table: Arc<LockTable>) -> Self {
        Self {
            table,
            locks: HashMap::new(),
        }
    }

    pub fn s_lock(&mut self, block: &BlockId) -> StrataResult<()> {
        if !self.locks.contains_key(block) {
            self.table.s_lock(block)?;
            self.locks.insert(block.clone(), LockMode::Shared);
        }
        Ok(())
    }

    /// Acquire an exclusive lock, always passing through a shared lock first
    pub fn x_lock(&mut self, block: &BlockId) -> StrataResult<()> {
        if !self.has_x_lock(block) {
            self.s_lock(block)?;
            self.table.x_lock(block)?;
            self.locks.insert(block.clone(), LockMode::Exclusive);
        }
        Ok(())
    }

    /// Release every lock this transaction holds
    pub fn release(&mut self) {
        for block in self.locks.keys() {
            self.table.unlock(block);
        }
        self.locks.clear();
    }

    pub fn lock_mode(&self, block: &BlockId) -> Option<LockMode> {
        self.locks.get(block).copied()
    }

    fn has_x_lock(&self, block: &BlockId) -> bool {
        self.locks.get(block) == Some(&LockMode::Exclusive)
    }
}
