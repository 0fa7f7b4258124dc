//! Forward-pass throughput benchmarks on the CPU backend.
//!
//! - **batch_size_sweep**: full model forward (encode, attention, head) over
//!   increasing batch sizes.
//! - **table_encoder**: the encoding stage alone, to separate its cost from the
//!   attention stack.
//!
//! # Running
//!
//! ```sh
//! cargo bench --bench forward_throughput
//! ```

use burn::backend::NdArray;
use criterion::{BenchmarkId, Criterion, Throughput};
use rand::{SeedableRng, rngs::StdRng};
use tabformer::dataset::{InMemoryTable, synthetic_titanic};
use tabformer::model::{ModelConfig, TabTransformer};

type B = NdArray<f32>;

// ============================================================================
// Fixtures
// ============================================================================

fn fixture(num_rows: usize) -> (InMemoryTable, TabTransformer<B>) {
    let mut rng = StdRng::seed_from_u64(0);
    let (stats, table) = synthetic_titanic(num_rows, &mut rng).unwrap();
    let model = ModelConfig::new(2).init(&stats, &Default::default()).unwrap();
    (table, model)
}

fn bench_batch_size_sweep(c: &mut Criterion) {
    let device = Default::default();
    let (table, model) = fixture(1024);

    let mut group = c.benchmark_group("batch_size_sweep");
    group.sample_size(20);
    group.noise_threshold(0.05);

    for batch_size in [32, 128, 512, 1024] {
        let rows: Vec<usize> = (0..batch_size).collect();
        let (batch, _) = table.batch::<B>(&rows, &device);
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("forward", batch_size),
            &batch,
            |b, batch| {
                b.iter(|| model.forward(batch).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_table_encoder(c: &mut Criterion) {
    let device = Default::default();
    let (table, model) = fixture(512);
    let rows: Vec<usize> = (0..512).collect();
    let (batch, _) = table.batch::<B>(&rows, &device);

    let mut group = c.benchmark_group("table_encoder");
    group.sample_size(50);
    group.throughput(Throughput::Elements(rows.len() as u64));
    group.bench_function("encode_512", |b| {
        b.iter(|| model.encoder().forward(&batch).unwrap());
    });
    group.finish();
}

// ============================================================================
// Criterion main
// ============================================================================

fn main() {
    let mut criterion = Criterion::default()
        .warm_up_time(std::time::Duration::from_secs(3))
        .measurement_time(std::time::Duration::from_secs(10))
        .configure_from_args();

    bench_batch_size_sweep(&mut criterion);
    bench_table_encoder(&mut criterion);

    criterion.final_summary();
}
