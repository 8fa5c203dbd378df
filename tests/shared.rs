#![allow(dead_code)]

//! Shared test utilities for Boxtree.
//!
//! This module provides common configurations, sample rectangle sets, and
//! helper functions that are used across multiple tests.

use boxtree::geometry::Rectangle;
use boxtree::rstar_tree::{Config, Entry, RStarTree};

//
// Configurations
//

/// The small configuration used by the structural tests: M = 4, m = 2,
/// two children reinserted per overflow.
pub fn small_config() -> Config {
    Config {
        max_entries: 4,
        min_entries: 2,
        reinsert_count: 2,
        ..Config::default()
    }
}

pub fn small_tree() -> RStarTree {
    RStarTree::new(small_config())
}

pub fn default_tree() -> RStarTree {
    RStarTree::new(Config::default())
}

//
// Sample Rectangles
//

/// `count` disjoint boxes in a row: `{i * 10, 0, 5, 5}`.
pub fn row_rects(count: usize) -> Vec<Rectangle> {
    (0..count)
        .map(|i| Rectangle::new(i as f64 * 10.0, 0.0, 5.0, 5.0))
        .collect()
}

/// `count` unit boxes along the diagonal: `{i, i, 1, 1}`.
pub fn diagonal_rects(count: usize) -> Vec<Rectangle> {
    (0..count)
        .map(|i| Rectangle::new(i as f64, i as f64, 1.0, 1.0))
        .collect()
}

/// A `columns x rows` grid of 4x4 boxes spaced 10 apart.
pub fn grid_rects(columns: usize, rows: usize) -> Vec<Rectangle> {
    let mut rects = Vec::with_capacity(columns * rows);
    for row in 0..rows {
        for column in 0..columns {
            rects.push(Rectangle::new(
                column as f64 * 10.0,
                row as f64 * 10.0,
                4.0,
                4.0,
            ));
        }
    }
    rects
}

//
// Helpers
//

pub fn insert_all(tree: &mut RStarTree, rects: &[Rectangle]) -> Vec<u64> {
    rects
        .iter()
        .map(|rect| tree.insert(rect.clone()).expect("well-formed rectangle"))
        .collect()
}

/// The ids of a query result, sorted for order-insensitive comparison.
pub fn sorted_ids(entries: &[Entry]) -> Vec<u64> {
    let mut ids: Vec<u64> = entries.iter().map(|e| e.id).collect();
    ids.sort_unstable();
    ids
}
