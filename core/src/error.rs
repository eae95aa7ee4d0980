use thiserror::Error;

use crate::storage::BlockId;

pub type StrataResult<T> = Result<T, StrataError>;

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No buffer became free within the maximum wait.
    #[error("Buffer abort: no buffer available for {block}")]
    BufferAbort { block: BlockId },

    /// A lock on the block could not be granted within the maximum wait.
    #[error("Lock abort: timed out waiting for a lock on {block}")]
    LockAbort { block: BlockId },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StrataError {
    /// True for the timeout errors after which the owning transaction must be
    /// rolled back.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            StrataError::BufferAbort { .. } | StrataError::LockAbort { .. }
        )
    }
}
