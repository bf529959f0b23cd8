//! Concurrency tests for the dictionary

use common::{DbError, DbResult};
use dictionary::{DictionaryConfig, LockWait, PersistentDictionary, RetryPolicy};
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

type Dict = PersistentDictionary<String, String>;

fn open(path: &Path, retry: RetryPolicy) -> DbResult<Dict> {
    common::logging::init_test_tracing();
    PersistentDictionary::open_with_config(DictionaryConfig::new(path).with_retry(retry))
}

fn key() -> String {
    "shared".to_string()
}

#[test]
fn test_overlapping_writer_gives_up_after_retries() -> DbResult<()> {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let holder = Arc::new(open(temp_dir.path(), RetryPolicy::default())?);
    let contender = Arc::new(open(temp_dir.path(), RetryPolicy::new(3, LockWait::Try))?);

    let (locked_tx, locked_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let holder_thread = {
        let holder = Arc::clone(&holder);
        thread::spawn(move || -> DbResult<()> {
            holder.transaction(|tx| {
                tx.set(&key(), &"first".to_string())?;
                locked_tx.send(()).expect("contender gone");
                done_rx.recv().expect("contender gone");
                Ok(())
            })
        })
    };

    locked_rx.recv().expect("holder failed before locking");
    let contender_thread = {
        let contender = Arc::clone(&contender);
        thread::spawn(move || contender.set(&key(), &"second".to_string()))
    };
    let conflict = contender_thread.join().expect("contender panicked");
    done_tx.send(()).expect("holder gone");
    holder_thread.join().expect("holder panicked")?;

    assert!(matches!(conflict, Err(DbError::WriteConflict { attempts: 3 })));
    assert_eq!(holder.get(&key())?, "first");

    // With the lock free again the same call goes through.
    contender.set(&key(), &"second".to_string())?;
    assert_eq!(holder.get(&key())?, "second");
    assert_eq!(holder.len()?, 1);
    Ok(())
}

#[test]
fn test_blocking_writer_waits_for_holder() -> DbResult<()> {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let dict = Arc::new(open(temp_dir.path(), RetryPolicy::default())?);
    let (locked_tx, locked_rx) = mpsc::channel::<()>();

    let holder_thread = {
        let dict = Arc::clone(&dict);
        thread::spawn(move || -> DbResult<()> {
            dict.transaction(|tx| {
                tx.set(&key(), &"first".to_string())?;
                locked_tx.send(()).ok();
                thread::sleep(Duration::from_millis(50));
                Ok(())
            })
        })
    };

    locked_rx.recv().expect("holder failed before locking");
    let waiter_thread = {
        let dict = Arc::clone(&dict);
        thread::spawn(move || dict.set(&key(), &"second".to_string()))
    };

    holder_thread.join().expect("holder panicked")?;
    waiter_thread.join().expect("waiter panicked")?;

    // The waiter could only begin after the holder committed.
    assert_eq!(dict.get(&key())?, "second");
    assert_eq!(dict.len()?, 1);
    Ok(())
}

#[test]
fn test_concurrent_writes_to_distinct_keys() -> DbResult<()> {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let dict = Arc::new(PersistentDictionary::<u64, u64>::open(temp_dir.path())?);

    let mut handles = vec![];
    for t in 0..4u64 {
        let dict = Arc::clone(&dict);
        handles.push(thread::spawn(move || -> DbResult<()> {
            for i in 0..50u64 {
                dict.set(&(t * 1000 + i), &i)?;
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().expect("writer panicked")?;
    }

    assert_eq!(dict.len()?, 200);
    let keys: Vec<u64> = dict.keys().iter().collect::<DbResult<_>>()?;
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(dict.get(&3049)?, 49);
    Ok(())
}

#[test]
fn test_contended_key_ends_with_one_of_the_writes() -> DbResult<()> {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let dict = Arc::new(PersistentDictionary::<String, u32>::open(temp_dir.path())?);
    dict.set(&key(), &0)?;

    let writers: Vec<_> = (1..=4u32)
        .map(|t| {
            let dict = Arc::clone(&dict);
            thread::spawn(move || -> DbResult<()> {
                for _ in 0..25 {
                    dict.set(&key(), &t)?;
                }
                Ok(())
            })
        })
        .collect();
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let dict = Arc::clone(&dict);
            thread::spawn(move || -> DbResult<()> {
                for _ in 0..50 {
                    let seen = dict.get(&key())?;
                    assert!(seen <= 4, "unexpected value {}", seen);
                }
                Ok(())
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().expect("thread panicked")?;
    }
    let last = dict.get(&key())?;
    assert!((1..=4).contains(&last));
    assert_eq!(dict.len()?, 1);
    Ok(())
}

#[test]
fn test_read_modify_write_transactions_do_not_lose_updates() -> DbResult<()> {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let dict = Arc::new(PersistentDictionary::<String, u64>::open(temp_dir.path())?);
    dict.set(&key(), &0)?;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let dict = Arc::clone(&dict);
            thread::spawn(move || -> DbResult<()> {
                for _ in 0..25 {
                    dict.transaction(|tx| {
                        let current = tx.get(&key())?;
                        tx.set(&key(), &(current + 1))
                    })?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread panicked")?;
    }

    assert_eq!(dict.get(&key())?, 100);
    Ok(())
}
