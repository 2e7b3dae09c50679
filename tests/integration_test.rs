//! End-to-end crash and recovery scenarios.
//!
//! A "crash" here is dropping the `Database` without a checkpoint: dirty
//! pages and the registry are lost, and the next open must rebuild
//! everything from the page store and the log.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use quilldb::{ConcurrencyError, Database, DatabaseConfig, EngineError, RowId};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open_db(dir: &TempDir) -> Database {
    Database::open(DatabaseConfig::new(dir.path())).unwrap()
}

#[test]
fn committed_data_survives_crash_without_page_flush() {
    init_logging();
    let dir = TempDir::new().unwrap();

    {
        let db = open_db(&dir);
        let txn = db.begin().unwrap();
        db.write(txn, RowId(1), b"durable").unwrap();
        db.write(txn, RowId(40), b"second page").unwrap();
        db.commit(txn).unwrap();
        // Dropped with dirty pages still in the buffer cache.
    }

    let db = open_db(&dir);
    assert_eq!(
        db.read_committed(RowId(1)),
        Some(Bytes::from_static(b"durable"))
    );
    assert_eq!(
        db.read_committed(RowId(40)),
        Some(Bytes::from_static(b"second page"))
    );
}

#[test]
fn uncommitted_work_rolled_back_after_crash() {
    init_logging();
    let dir = TempDir::new().unwrap();

    {
        let db = open_db(&dir);

        let loser = db.begin().unwrap();
        db.write(loser, RowId(1), b"never committed").unwrap();

        // A later commit flushes the log, carrying the loser's records to
        // disk with it.
        let winner = db.begin().unwrap();
        db.write(winner, RowId(2), b"committed").unwrap();
        db.commit(winner).unwrap();
    }

    let db = open_db(&dir);
    assert_eq!(db.recovery_report().transactions_rolled_back, 1);
    assert_eq!(db.read_committed(RowId(1)), None);
    assert_eq!(
        db.read_committed(RowId(2)),
        Some(Bytes::from_static(b"committed"))
    );
}

#[test]
fn aborted_transaction_stays_rolled_back_after_crash() {
    init_logging();
    let dir = TempDir::new().unwrap();

    {
        let db = open_db(&dir);

        let setup = db.begin().unwrap();
        db.write(setup, RowId(1), b"original").unwrap();
        db.commit(setup).unwrap();

        let doomed = db.begin().unwrap();
        db.write(doomed, RowId(1), b"overwrite").unwrap();
        db.write(doomed, RowId(2), b"insert").unwrap();
        db.abort(doomed).unwrap();

        // Flush the log past the aborted transaction's records.
        let after = db.begin().unwrap();
        db.write(after, RowId(3), b"later").unwrap();
        db.commit(after).unwrap();
    }

    let db = open_db(&dir);
    assert_eq!(
        db.read_committed(RowId(1)),
        Some(Bytes::from_static(b"original"))
    );
    assert_eq!(db.read_committed(RowId(2)), None);
    assert_eq!(
        db.read_committed(RowId(3)),
        Some(Bytes::from_static(b"later"))
    );
}

#[test]
fn commit_of_aborted_transaction_leaves_no_trace_after_crash() {
    init_logging();
    let dir = TempDir::new().unwrap();

    {
        let db = open_db(&dir);

        let setup = db.begin().unwrap();
        db.write(setup, RowId(1), b"original").unwrap();
        db.commit(setup).unwrap();

        let doomed = db.begin().unwrap();
        db.write(doomed, RowId(1), b"came back wrong").unwrap();
        db.abort(doomed).unwrap();

        // Commit on an aborted transaction must fail without writing a
        // Commit record, or recovery would resurrect its updates.
        assert!(db.commit(doomed).is_err());

        // Flush the log past the aborted transaction's records.
        let after = db.begin().unwrap();
        db.write(after, RowId(2), b"later").unwrap();
        db.commit(after).unwrap();
    }

    let db = open_db(&dir);
    assert_eq!(
        db.read_committed(RowId(1)),
        Some(Bytes::from_static(b"original"))
    );
    assert_eq!(
        db.read_committed(RowId(2)),
        Some(Bytes::from_static(b"later"))
    );
}

#[test]
fn blocked_writer_proceeds_after_holder_aborts() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let db = Arc::new(open_db(&dir));

    let setup = db.begin().unwrap();
    db.write(setup, RowId(1), b"v1").unwrap();
    db.commit(setup).unwrap();

    let holder = db.begin().unwrap();
    db.write(holder, RowId(1), b"never lands").unwrap();

    let db2 = Arc::clone(&db);
    let blocked = thread::spawn(move || {
        let txn = db2.begin().unwrap();
        // Blocks on the row lock until the holder resolves; the abort
        // frees the row without committing anything, so no conflict.
        db2.write(txn, RowId(1), b"v2").unwrap();
        db2.commit(txn).unwrap();
    });

    thread::sleep(Duration::from_millis(50));
    db.abort(holder).unwrap();
    blocked.join().unwrap();

    assert_eq!(db.read_committed(RowId(1)), Some(Bytes::from_static(b"v2")));
}

#[test]
fn committed_delete_survives_crash() {
    init_logging();
    let dir = TempDir::new().unwrap();

    {
        let db = open_db(&dir);
        let t1 = db.begin().unwrap();
        db.write(t1, RowId(5), b"short lived").unwrap();
        db.commit(t1).unwrap();

        let t2 = db.begin().unwrap();
        db.delete(t2, RowId(5)).unwrap();
        db.commit(t2).unwrap();
    }

    let db = open_db(&dir);
    assert_eq!(db.read_committed(RowId(5)), None);
}

#[test]
fn recovery_is_idempotent() {
    init_logging();
    let dir = TempDir::new().unwrap();

    {
        let db = open_db(&dir);
        let loser = db.begin().unwrap();
        db.write(loser, RowId(1), b"loser").unwrap();

        let winner = db.begin().unwrap();
        db.write(winner, RowId(2), b"winner").unwrap();
        db.commit(winner).unwrap();
    }

    {
        let db = open_db(&dir);
        assert!(db.recovery_report().records_replayed > 0);
        // Dropped immediately: the fresh checkpoint cut at open is the
        // only thing that reached the log.
    }

    let db = open_db(&dir);
    // The first recovery checkpointed its result, so the second replays
    // nothing and rolls back nobody.
    assert_eq!(db.recovery_report().records_replayed, 0);
    assert_eq!(db.recovery_report().transactions_rolled_back, 0);
    assert_eq!(db.read_committed(RowId(1)), None);
    assert_eq!(
        db.read_committed(RowId(2)),
        Some(Bytes::from_static(b"winner"))
    );
}

#[test]
fn checkpoint_bounds_replay() {
    init_logging();
    let dir = TempDir::new().unwrap();

    {
        let db = open_db(&dir);
        for i in 0..20u64 {
            let txn = db.begin().unwrap();
            db.write(txn, RowId(i), format!("row {}", i).as_bytes())
                .unwrap();
            db.commit(txn).unwrap();
        }
        db.checkpoint().unwrap();

        let txn = db.begin().unwrap();
        db.write(txn, RowId(100), b"after the mark").unwrap();
        db.commit(txn).unwrap();
    }

    let db = open_db(&dir);
    // Only the single post-checkpoint update needed replaying.
    assert_eq!(db.recovery_report().records_replayed, 1);
    assert_eq!(
        db.read_committed(RowId(100)),
        Some(Bytes::from_static(b"after the mark"))
    );
    assert_eq!(db.read_committed(RowId(7)), Some(Bytes::from(format!("row {}", 7))));
}

#[test]
fn torn_log_tail_is_discarded() {
    init_logging();
    let dir = TempDir::new().unwrap();

    {
        let db = open_db(&dir);
        let txn = db.begin().unwrap();
        db.write(txn, RowId(1), b"intact").unwrap();
        db.commit(txn).unwrap();
    }

    // A frame header promising more bytes than the file holds: the tail of
    // a record that was being written when power failed.
    let mut wal = OpenOptions::new()
        .append(true)
        .open(dir.path().join("wal.log"))
        .unwrap();
    wal.write_all(&[64, 0, 0, 0, 0xde, 0xad, 0xbe, 0xef, 1, 2, 3])
        .unwrap();
    wal.sync_all().unwrap();
    drop(wal);

    let db = open_db(&dir);
    assert_eq!(
        db.read_committed(RowId(1)),
        Some(Bytes::from_static(b"intact"))
    );

    // The store keeps accepting work past the truncated tail.
    let txn = db.begin().unwrap();
    db.write(txn, RowId(2), b"new").unwrap();
    db.commit(txn).unwrap();
    assert_eq!(db.read_committed(RowId(2)), Some(Bytes::from_static(b"new")));
}

#[test]
fn missing_locator_falls_back_to_scan() {
    init_logging();
    let dir = TempDir::new().unwrap();

    {
        let db = open_db(&dir);
        let txn = db.begin().unwrap();
        db.write(txn, RowId(1), b"found by scan").unwrap();
        db.commit(txn).unwrap();
        db.checkpoint().unwrap();
    }

    std::fs::remove_file(dir.path().join("checkpoint.meta")).unwrap();

    let db = open_db(&dir);
    assert_eq!(
        db.read_committed(RowId(1)),
        Some(Bytes::from_static(b"found by scan"))
    );
}

#[test]
fn snapshot_isolation_with_conflicts() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let mut config = DatabaseConfig::new(dir.path());
    config.lock_wait_timeout = Duration::from_millis(50);
    let db = Database::open(config).unwrap();

    let setup = db.begin().unwrap();
    db.write(setup, RowId(1), b"base").unwrap();
    db.commit(setup).unwrap();

    let reader = db.begin().unwrap();
    let writer = db.begin().unwrap();

    db.write(writer, RowId(1), b"updated").unwrap();
    db.commit(writer).unwrap();

    // The reader's snapshot predates the writer's commit.
    assert_eq!(
        db.read(reader, RowId(1)).unwrap(),
        Some(Bytes::from_static(b"base"))
    );

    // And writing the same row from that older snapshot conflicts.
    let err = db.write(reader, RowId(1), b"stale write").unwrap_err();
    assert!(matches!(
        err,
        EngineError::Concurrency(ConcurrencyError::Conflict(RowId(1)))
    ));
    db.abort(reader).unwrap();
}

#[test]
fn vacuum_after_churn_keeps_latest_values() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    for round in 0..10u64 {
        let txn = db.begin().unwrap();
        db.write(txn, RowId(1), format!("round {}", round).as_bytes())
            .unwrap();
        db.write(txn, RowId(2), format!("other {}", round).as_bytes())
            .unwrap();
        db.commit(txn).unwrap();
    }

    let reclaimed = db.vacuum();
    assert_eq!(reclaimed, 18);

    assert_eq!(
        db.read_committed(RowId(1)),
        Some(Bytes::from(format!("round {}", 9)))
    );
    assert_eq!(
        db.read_committed(RowId(2)),
        Some(Bytes::from(format!("other {}", 9)))
    );
}
