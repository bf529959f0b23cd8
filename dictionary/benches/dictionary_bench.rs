//! BENCHMARK: Dictionary operation costs
//!
//! Measures:
//! - Point reads of an existing key (snapshot per call)
//! - Overwrites (write transaction + commit per call, lazy sync)
//! - Full ordered enumeration across batches

use criterion::{criterion_group, criterion_main, Criterion};
use dictionary::{DictionaryConfig, PersistentDictionary, SyncMode};
use std::hint::black_box;
use tempfile::TempDir;

fn create_benchmark_dictionary(rows: u64) -> (PersistentDictionary<u64, String>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = DictionaryConfig::new(temp_dir.path()).with_sync_mode(SyncMode::SafeNoSync);
    let dict = PersistentDictionary::open_with_config(config).unwrap();

    dict.transaction(|tx| {
        for i in 0..rows {
            tx.set(&i, &format!("value-{}", i))?;
        }
        Ok(())
    })
    .expect("Failed to load rows");
    assert_eq!(dict.len().unwrap(), rows as usize);

    (dict, temp_dir)
}

fn benchmark_get(c: &mut Criterion) {
    let (dict, _temp) = create_benchmark_dictionary(10_000);

    c.bench_function("get_existing_key", |b| {
        b.iter(|| {
            let value = dict.get(black_box(&4_242)).unwrap();
            black_box(value.len());
        });
    });
}

fn benchmark_set(c: &mut Criterion) {
    let (dict, _temp) = create_benchmark_dictionary(10_000);
    let value = "updated".to_string();

    c.bench_function("set_existing_key", |b| {
        b.iter(|| {
            dict.set(black_box(&4_242), &value).unwrap();
        });
    });
}

fn benchmark_iterate(c: &mut Criterion) {
    let (dict, _temp) = create_benchmark_dictionary(10_000);

    c.bench_function("iterate_10k", |b| {
        b.iter(|| {
            let count = dict.iter().filter(|entry| entry.is_ok()).count();
            black_box(count);
        });
    });
}

criterion_group!(benches, benchmark_get, benchmark_set, benchmark_iterate);
criterion_main!(benches);
