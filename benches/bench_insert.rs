#![allow(dead_code)]
use shared::*;

use boxtree::geometry::Rectangle;
use boxtree::rstar_tree::{Config, RStarTree};
use criterion::{criterion_group, Criterion};
use std::hint::black_box;
use tracing::info;

fn insert_rects(rects: Vec<Rectangle>) {
    info!("Starting insertion benchmark pass");
    let mut tree = RStarTree::new(Config::default());
    for rect in rects {
        tree.insert(rect).expect("well-formed rectangle");
    }
    info!("Finished insertion benchmark pass");
}

fn benchmark_insert(cc: &mut Criterion) {
    let rects = bench_rects(BENCH_SIZE);
    cc.bench_function("rstar_tree_insert_1000", |b| {
        b.iter(|| insert_rects(black_box(rects.clone())))
    });
}

criterion_group!(benches, benchmark_insert);
