//! Buffers pinned by one transaction

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StrataResult;
use crate::storage::{BlockId, BufferManager, FrameId, PageFormatter};

/// Tracks every pin a transaction holds so they can all be released when it
/// finishes. A block pinned twice is recorded twice.
pub struct BufferList {
    frames: HashMap<BlockId, FrameId>,
    pins: Vec<BlockId>,
    manager: Arc<BufferManager>,
}

impl BufferList {
    pub fn new(manager: Arc<BufferManager>) -> Self {
        Self {
            frames: HashMap::new(),
            pins: Vec::new(),
            manager,
        }
    }

    /// Frame holding `block`, if this transaction has it pinned
    pub fn frame(&self, block: &BlockId) -> Option<FrameId> {
        self.frames.get(block).copied()
    }

    pub fn pin(&mut self, block: &BlockId) -> StrataResult<FrameId> {
        let id = self.manager.pin(block)?;
        self.frames.insert(block.clone(), id);
        self.pins.push(block.clone());
        Ok(id)
    }

    pub fn pin_new(
        &mut self,
        file_name: &str,
        formatter: &dyn PageFormatter,
    ) -> StrataResult<BlockId> {
        let (block, id) = self.manager.pin_new(file_name, formatter)?;
        self.frames.insert(block.clone(), id);
        self.pins.push(block.clone());
        Ok(block)
    }

    /// Release one pin on `block`.
    ///
    /// # Panics
    ///
    /// If this transaction does not have the block pinned.
    pub fn unpin(&mut self, block: &BlockId) {
        let Some(id) = self.frame(block) else {
            panic!("{} is not pinned by this transaction", block);
        };
        self.manager.unpin(id);
        if let Some(pos) = self.pins.iter().position(|pinned| pinned == block) {
            self.pins.remove(pos);
        }
        if !self.pins.contains(block) {
            self.frames.remove(block);
        }
    }

    /// Release every pin this transaction holds
    pub fn unpin_all(&mut self) {
        for block in self.pins.drain(..) {
            if let Some(id) = self.frames.get(&block) {
                self.manager.unpin(*id);
            }
        }
        self.frames.clear();
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }
}
