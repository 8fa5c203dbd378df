use criterion::criterion_main;

mod bench_insert;

// Main entry point for running the benchmarks
criterion_main!(
    bench_delete::benches,
    bench_insert::benches,
    bench_nearest::benches,
    bench_query::benches
);
