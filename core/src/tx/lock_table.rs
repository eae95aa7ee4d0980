//! Global block lock table

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{StrataError, StrataResult};
use crate::storage::BlockId;
use crate::sync::BoundedWait;

/// Lock state of an exclusively locked block
const EXCLUSIVE: i32 = -1;

/// Shared/exclusive lock state of every locked block.
///
/// A block absent from the map is unlocked, a positive value counts its
/// shared holders, and `-1` marks it exclusively locked. Requests that cannot
/// be granted wait up to the maximum wait and then fail with
/// [`StrataError::LockAbort`]. There is no deadlock detection.
pub struct LockTable {
    locks: Mutex<HashMap<BlockId, i32>>,
    released: BoundedWait,
}

impl LockTable {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            released: BoundedWait::new(max_wait),
        }
    }

    /// Add a shared holder, waiting while the block is exclusively locked
    pub fn s_lock(&self, block: &BlockId) -> StrataResult<()> {
        let mut locks = self.locks.lock();
        let granted = self.released.wait_until(&mut locks, |locks| {
            let state = locks.get(block).copied().unwrap_or(0);
            if state == EXCLUSIVE {
                return Ok(None);
            }
            locks.insert(block.clone(), state + 1);
            Ok(Some(()))
        })?;

        self.granted_or_abort(granted, block, "shared")
    }

    /// Lock the block exclusively.
    ///
    /// The caller is expected to hold a shared lock already, so a single
    /// shared holder is taken to be the caller itself.
    pub fn x_lock(&self, block: &BlockId) -> StrataResult<()> {
        let mut locks = self.locks.lock();
        let granted = self.released.wait_until(&mut locks, |locks| {
            let state = locks.get(block).copied().unwrap_or(0);
            if state > 1 || state == EXCLUSIVE {
                return Ok(None);
            }
            locks.insert(block.clone(), EXCLUSIVE);
            Ok(Some(()))
        })?;

        self.granted_or_abort(granted, block, "exclusive")
    }

    /// Drop one shared holder, or the exclusive lock, and wake waiters.
    ///
    /// # Panics
    ///
    /// If the block is not locked.
    pub fn unlock(&self, block: &BlockId) {
        let mut locks = self.locks.lock();
        match locks.get(block).copied() {
            Some(state) if state > 1 => {
                locks.insert(block.clone(), state - 1);
            }
            Some(_) => {
                locks.remove(block);
            }
            None => panic!("unlocking {} which is not locked", block),
        }
        self.released.notify_all();
    }

    /// Current state: 0 unlocked, N shared holders, or -1 exclusive
    pub fn lock_state(&self, block: &BlockId) -> i32 {
        self.locks.lock().get(block).copied().unwrap_or(0)
    }

    fn granted_or_abort(
        &self,
        granted: Option<()>,
        block: &BlockId,
        mode: &str,
    ) -> StrataResult<()> {
        match granted {
            Some(()) => {
                debug!("Granted {} lock on {}", mode, block);
                Ok(())
            }
            None => {
                warn!(
                    "Timed out after {:?} waiting for {} lock on {}",
                    self.released.max_wait(),
                    mode,
                    block
                );
                Err(StrataError::LockAbort {
                    block: block.clone(),
                })
            }
        }
    }
}
