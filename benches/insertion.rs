//! # Insertion Benchmarks
//!
//! Measures the insert paths the engine is designed around:
//!
//! | Benchmark            | Stream               | What it shows                 |
//! |----------------------|----------------------|-------------------------------|
//! | sequential/sort      | 0..N ascending       | fast-path appends             |
//! | sequential/partition | 0..N ascending       | fast-path + cheap splits      |
//! | reverse              | N..0 descending      | constant hint misses          |
//! | near_sorted          | bounded local swaps  | the target workload           |
//! | random               | uniform shuffle      | worst case, O(log N) descents |
//!
//! ```bash
//! cargo bench --bench insertion
//! cargo bench --bench insertion -- sequential
//! ```

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use lastree::{
    Database, FieldType, LasTree, Schema, SplitPolicy, Tuple, TreeOptions, Value,
};

const N: i64 = 20_000;

fn schema() -> Schema {
    Schema::new(vec![FieldType::Long, FieldType::Text])
}

fn tuple(key: i64) -> Tuple {
    Tuple::new(vec![Value::Long(key), Value::Text("payload".into())])
}

fn fresh_tree(policy: SplitPolicy) -> (TempDir, Arc<Database>, LasTree<i64>) {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::new().unwrap());
    let tree = LasTree::create(
        Arc::clone(&db),
        dir.path().join("bench.idx"),
        schema(),
        0,
        TreeOptions {
            split_policy: policy,
            ..Default::default()
        },
    )
    .unwrap();
    (dir, db, tree)
}

fn insert_all(keys: &[i64], policy: SplitPolicy) {
    let (_dir, _db, tree) = fresh_tree(policy);
    for &key in keys {
        tree.insert(&tuple(key)).unwrap();
    }
}

fn near_sorted_keys(rng: &mut StdRng) -> Vec<i64> {
    let mut keys: Vec<i64> = (0..N).collect();
    for _ in 0..(N as usize / 5) {
        let i = rng.gen_range(0..keys.len());
        let j = (i + rng.gen_range(1..=16)).min(keys.len() - 1);
        keys.swap(i, j);
    }
    keys
}

fn bench_insertion(c: &mut Criterion) {
    let mut group = c.benchmark_group("insertion");
    group.throughput(Throughput::Elements(N as u64));
    group.sample_size(10);

    let ascending: Vec<i64> = (0..N).collect();
    let descending: Vec<i64> = (0..N).rev().collect();

    group.bench_function("sequential/sort_on_split", |b| {
        b.iter_batched(
            || ascending.clone(),
            |keys| insert_all(&keys, SplitPolicy::SortOnSplit),
            BatchSize::PerIteration,
        )
    });

    group.bench_function("sequential/quick_partition", |b| {
        b.iter_batched(
            || ascending.clone(),
            |keys| insert_all(&keys, SplitPolicy::QuickPartition),
            BatchSize::PerIteration,
        )
    });

    group.bench_function("reverse", |b| {
        b.iter_batched(
            || descending.clone(),
            |keys| insert_all(&keys, SplitPolicy::SortOnSplit),
            BatchSize::PerIteration,
        )
    });

    group.bench_function("near_sorted", |b| {
        let mut rng = StdRng::seed_from_u64(7);
        b.iter_batched(
            || near_sorted_keys(&mut rng),
            |keys| insert_all(&keys, SplitPolicy::SortOnSplit),
            BatchSize::PerIteration,
        )
    });

    group.bench_function("random", |b| {
        let mut rng = StdRng::seed_from_u64(11);
        b.iter_batched(
            || {
                let mut keys: Vec<i64> = (0..N).collect();
                keys.shuffle(&mut rng);
                keys
            },
            |keys| insert_all(&keys, SplitPolicy::SortOnSplit),
            BatchSize::PerIteration,
        )
    });

    group.finish();
}

fn bench_point_reads(c: &mut Criterion) {
    let (_dir, _db, tree) = fresh_tree(SplitPolicy::SortOnSplit);
    for key in 0..N {
        tree.insert(&tuple(key)).unwrap();
    }
    tree.wait_for_sorter();

    let mut group = c.benchmark_group("point_read");
    let mut rng = StdRng::seed_from_u64(13);
    group.bench_function("sorted_leaves", |b| {
        b.iter(|| {
            let key = rng.gen_range(0..N);
            tree.get(key).unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_insertion, bench_point_reads);
criterion_main!(benches);
