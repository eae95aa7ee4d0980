//! Database instance tying the shared storage parts together

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::StrataResult;
use crate::storage::{BufferManager, DiskManager, WalManager};
use crate::tx::{LockTable, LogRecord, Transaction, TxIdGenerator, read_log};

/// Main storage engine
pub struct StorageEngine {
    config: Config,
    disk: Arc<DiskManager>,
    wal: Arc<WalManager>,
    buffers: Arc<BufferManager>,
    locks: Arc<LockTable>,
    tx_ids: TxIdGenerator,
}

impl StorageEngine {
    /// Open the database in `config.data_dir`, recovering it unless it is
    /// new.
    pub fn open(config: Config) -> StrataResult<Self> {
        config.validate()?;

        let disk = Arc::new(DiskManager::new(&config.data_dir, config.block_size)?);
        let wal = Arc::new(WalManager::new(Arc::clone(&disk), &config.log_file)?);
        let buffers = Arc::new(BufferManager::new(
            config.buffer_pool_size,
            Arc::clone(&disk),
            Arc::clone(&wal),
            config.max_wait(),
        ));
        let locks = Arc::new(LockTable::new(config.max_wait()));

        let engine = Self {
            config,
            disk,
            wal,
            buffers,
            locks,
            tx_ids: TxIdGenerator::new(),
        };

        if engine.disk.is_new() {
            info!("Created new database in {}", engine.disk.data_dir().display());
        } else {
            info!(
                "Recovering existing database in {}",
                engine.disk.data_dir().display()
            );
            engine.recover()?;
            info!("Recovery complete");
        }

        Ok(engine)
    }

    /// Begin a transaction
    pub fn begin(&self) -> StrataResult<Transaction> {
        Transaction::new(
            self.tx_ids.next_id(),
            Arc::clone(&self.disk),
            Arc::clone(&self.wal),
            Arc::clone(&self.buffers),
            Arc::clone(&self.locks),
        )
    }

    /// Perform recovery in a transaction of its own.
    ///
    /// Must not run while other transactions are active.
    pub fn recover(&self) -> StrataResult<()> {
        let mut tx = self.begin()?;
        tx.recover()?;
        tx.commit()
    }

    /// Decoded log records, newest first
    pub fn read_log(&self) -> StrataResult<Vec<LogRecord>> {
        read_log(&self.wal)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.disk.block_size()
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.buffers
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.locks
    }
}
