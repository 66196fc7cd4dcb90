use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use lightning::{DbFlags, Environment, Error, WriteFlags, WriterPolicy};
use tempfile::TempDir;

fn setup_test_env(policy: WriterPolicy) -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::builder()
        .set_writer_policy(policy)
        .open(temp_dir.path())
        .unwrap();
    (temp_dir, env)
}

#[test]
fn test_second_writer_blocks_until_first_ends() {
    let (_dir, env) = setup_test_env(WriterPolicy::Block);
    let txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.put(db, b"first", b"1", WriteFlags::empty()).unwrap();

    let (began_tx, began_rx) = mpsc::channel();
    let waiter = {
        let env = env.clone();
        thread::spawn(move || {
            let txn = env.begin_rw_txn().unwrap();
            began_tx.send(()).unwrap();
            let seen = txn.get(db, b"first").unwrap();
            txn.put(db, b"second", b"2", WriteFlags::empty()).unwrap();
            txn.commit().unwrap();
            seen
        })
    };

    // the waiter cannot begin while the first writer is live
    assert!(began_rx.recv_timeout(Duration::from_millis(200)).is_err());
    txn.commit().unwrap();
    began_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), b"1");

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.get(db, b"second").unwrap().unwrap(), b"2");
}

#[test]
fn test_fail_fast_policy_reports_busy_writer() {
    let (_dir, env) = setup_test_env(WriterPolicy::FailFast);
    let txn = env.begin_rw_txn().unwrap();

    let other = env.clone();
    let err = thread::spawn(move || other.begin_rw_txn().unwrap_err())
        .join()
        .unwrap();
    assert_eq!(err, Error::WriterBusy);
    assert!(!err.is_programming());

    // readers are never blocked by the writer
    let other = env.clone();
    thread::spawn(move || other.begin_ro_txn().unwrap().abort())
        .join()
        .unwrap();

    txn.abort();
    let other = env.clone();
    thread::spawn(move || other.begin_rw_txn().unwrap().commit().unwrap())
        .join()
        .unwrap();
}

#[test]
fn test_same_thread_second_writer_is_busy() {
    let (_dir, env) = setup_test_env(WriterPolicy::Block);
    let txn = env.begin_rw_txn().unwrap();
    assert_eq!(env.begin_rw_txn().unwrap_err(), Error::WriterBusy);
    txn.commit().unwrap();
    env.begin_rw_txn().unwrap().abort();
}

#[test]
fn test_dropped_writer_wakes_waiter() {
    let (_dir, env) = setup_test_env(WriterPolicy::Block);
    let txn = env.begin_rw_txn().unwrap();

    let waiter = {
        let env = env.clone();
        thread::spawn(move || env.begin_rw_txn().map(|txn| txn.abort()))
    };
    thread::sleep(Duration::from_millis(50));
    drop(txn);
    waiter.join().unwrap().unwrap();
    assert!(!env.has_writer());
}

#[test]
fn test_close_with_concurrent_readers() {
    let (_dir, env) = setup_test_env(WriterPolicy::Block);
    let txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.put(db, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let env = env.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    match env.begin_ro_txn() {
                        Ok(txn) => match txn.get(db, b"k") {
                            Ok(value) => assert_eq!(value.unwrap(), b"v"),
                            Err(err) => assert!(err.is_programming()),
                        },
                        Err(err) => assert!(err.is_programming()),
                    }
                }
            })
        })
        .collect();
    env.close().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert!(!env.is_live());
}

#[test]
fn test_close_waits_for_foreign_writer() {
    let (_dir, env) = setup_test_env(WriterPolicy::Block);
    let txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.commit().unwrap();

    let committed = Arc::new(AtomicBool::new(false));
    let (began_tx, began_rx) = mpsc::channel();
    let writer = {
        let env = env.clone();
        let committed = committed.clone();
        thread::spawn(move || {
            let txn = env.begin_rw_txn().unwrap();
            began_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(200));
            txn.put(db, b"late", b"1", WriteFlags::empty()).unwrap();
            let outcome = txn.commit();
            committed.store(true, Ordering::SeqCst);
            outcome
        })
    };

    began_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    env.close().unwrap();
    // the writer finished on its own thread before the environment went away
    assert!(committed.load(Ordering::SeqCst));
    writer.join().unwrap().unwrap();
    assert!(!env.is_live());
    assert!(!env.has_writer());
}

#[test]
fn test_fail_fast_close_leaves_foreign_writer_alone() {
    let (_dir, env) = setup_test_env(WriterPolicy::FailFast);
    let txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.commit().unwrap();

    let (began_tx, began_rx) = mpsc::channel();
    let (finish_tx, finish_rx) = mpsc::channel::<()>();
    let writer = {
        let env = env.clone();
        thread::spawn(move || {
            let txn = env.begin_rw_txn().unwrap();
            began_tx.send(()).unwrap();
            finish_rx.recv().unwrap();
            txn.put(db, b"k", b"v", WriteFlags::empty()).unwrap();
            txn.commit()
        })
    };

    began_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(env.close().unwrap_err(), Error::WriterBusy);
    assert!(env.is_live());
    assert!(env.has_writer());

    finish_tx.send(()).unwrap();
    writer.join().unwrap().unwrap();
    env.close().unwrap();
    assert!(!env.is_live());
}
