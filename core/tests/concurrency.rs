//! Lock exclusion and buffer-pool limits between concurrent transactions.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use strata_core::{BlockId, Config, StorageEngine, StrataError};
use tempfile::tempdir;

// Helpers

fn open(dir: &Path, pool: usize, wait_ms: u64) -> Arc<StorageEngine> {
    let config = Config {
        block_size: 400,
        buffer_pool_size: pool,
        max_wait_ms: wait_ms,
        ..Config::new(dir)
    };
    Arc::new(StorageEngine::open(config).unwrap())
}

fn read_int(engine: &StorageEngine, block: &BlockId, offset: usize) -> i32 {
    let mut tx = engine.begin().unwrap();
    tx.pin(block).unwrap();
    let value = tx.get_int(block, offset).unwrap();
    tx.commit().unwrap();
    value
}

/// Add one to the integer at offset 0, reporting an abort instead of retrying
fn try_increment(engine: &StorageEngine, block: &BlockId) -> Result<(), StrataError> {
    let mut tx = engine.begin()?;
    let result = (|| {
        tx.pin(block)?;
        let value = tx.get_int(block, 0)?;
        tx.set_int(block, 0, value + 1)
    })();
    match result {
        Ok(()) => tx.commit(),
        Err(e) => {
            tx.rollback()?;
            Err(e)
        }
    }
}

// Locks

#[test]
fn writer_waits_for_reader_to_finish() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 8, 5_000);
    let block = BlockId::new("accounts", 0);

    let mut reader = engine.begin().unwrap();
    reader.pin(&block).unwrap();
    assert_eq!(reader.get_int(&block, 0).unwrap(), 0);

    let writer = {
        let engine = Arc::clone(&engine);
        let block = block.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let mut tx = engine.begin().unwrap();
            tx.pin(&block).unwrap();
            tx.set_int(&block, 0, 42).unwrap();
            tx.commit().unwrap();
            started.elapsed()
        })
    };

    thread::sleep(Duration::from_millis(100));
    // still blocked: the reader sees no change
    assert_eq!(reader.get_int(&block, 0).unwrap(), 0);
    reader.commit().unwrap();

    let waited = writer.join().unwrap();
    assert!(waited >= Duration::from_millis(50));
    assert_eq!(read_int(&engine, &block, 0), 42);
}

#[test]
fn readers_share_a_block() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 8, 100);
    let block = BlockId::new("accounts", 0);

    let mut first = engine.begin().unwrap();
    let mut second = engine.begin().unwrap();
    first.pin(&block).unwrap();
    second.pin(&block).unwrap();
    first.get_int(&block, 0).unwrap();
    second.get_int(&block, 0).unwrap();

    assert_eq!(engine.lock_table().lock_state(&block), 2);
    first.commit().unwrap();
    second.commit().unwrap();
}

#[test]
fn lock_timeout_aborts_and_rollback_restores() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 8, 100);
    let block = BlockId::new("accounts", 0);
    let other = BlockId::new("accounts", 1);

    let mut holder = engine.begin().unwrap();
    holder.pin(&block).unwrap();
    holder.set_int(&block, 0, 1).unwrap();

    let mut blocked = engine.begin().unwrap();
    blocked.pin(&other).unwrap();
    blocked.set_int(&other, 0, 99).unwrap();
    blocked.pin(&block).unwrap();
    let err = blocked.get_int(&block, 0).unwrap_err();
    assert!(matches!(err, StrataError::LockAbort { .. }));
    blocked.rollback().unwrap();

    holder.commit().unwrap();
    assert_eq!(read_int(&engine, &block, 0), 1);
    assert_eq!(read_int(&engine, &other, 0), 0);
}

#[test]
fn contending_increments_are_serialized() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 8, 50);
    let block = BlockId::new("counter", 0);
    let per_thread = 10;

    let workers: Vec<_> = (0..3u64)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let block = block.clone();
            thread::spawn(move || {
                let mut done = 0;
                while done < per_thread {
                    match try_increment(&engine, &block) {
                        Ok(()) => done += 1,
                        Err(e) if e.is_abort() => {
                            thread::sleep(Duration::from_millis(7 * (i + 1)));
                        }
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(read_int(&engine, &block, 0), 3 * per_thread);
}

#[test]
fn disjoint_blocks_do_not_interfere() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 8, 1_000);

    let workers: Vec<_> = (0..4)
        .map(|n| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let block = BlockId::new("slots", n);
                for _ in 0..20 {
                    try_increment(&engine, &block).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    for n in 0..4 {
        assert_eq!(read_int(&engine, &BlockId::new("slots", n), 0), 20);
    }
}

// Buffer pool

#[test]
fn exhausted_pool_aborts_pin() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 2, 100);

    let mut holder = engine.begin().unwrap();
    holder.pin(&BlockId::new("f", 0)).unwrap();
    holder.pin(&BlockId::new("f", 1)).unwrap();
    assert_eq!(holder.available_buffers(), 0);

    let mut waiter = engine.begin().unwrap();
    let err = waiter.pin(&BlockId::new("f", 2)).unwrap_err();
    assert!(matches!(err, StrataError::BufferAbort { .. }));
    assert!(err.is_abort());
    waiter.rollback().unwrap();

    holder.commit().unwrap();
    assert_eq!(engine.buffer_manager().available(), 2);

    let mut retry = engine.begin().unwrap();
    retry.pin(&BlockId::new("f", 2)).unwrap();
    retry.commit().unwrap();
}

#[test]
fn pin_waits_for_another_transaction_to_release() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 1, 5_000);

    let mut holder = engine.begin().unwrap();
    holder.pin(&BlockId::new("f", 0)).unwrap();

    let waiter = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let mut tx = engine.begin().unwrap();
            tx.pin(&BlockId::new("f", 1)).unwrap();
            tx.commit().unwrap();
        })
    };

    thread::sleep(Duration::from_millis(50));
    holder.commit().unwrap();
    waiter.join().unwrap();
    assert_eq!(engine.buffer_manager().available(), 1);
}
