//! ## R*-tree Implementation
//!
//! This module implements a dynamic R*-tree over 2D axis-aligned rectangles.
//! Every inserted rectangle receives a stable `u64` handle that stays valid
//! until the entry is deleted; handles are never reused over the lifetime of
//! the tree. The tree supports window (rectangle) searches, point-stabbing
//! queries, circular range queries, and nearest-neighbor queries by handle or
//! by arbitrary rectangle.
//!
//! # Examples
//!
//! ```
//! use boxtree::geometry::Rectangle;
//! use boxtree::rstar_tree::{Config, RStarTree};
//!
//! let mut tree = RStarTree::new(Config::default());
//! let a = tree.insert(Rectangle::new(0.0, 0.0, 10.0, 10.0)).unwrap();
//! let b = tree.insert(Rectangle::new(20.0, 0.0, 5.0, 5.0)).unwrap();
//!
//! let mut hits = Vec::new();
//! tree.search(&Rectangle::new(5.0, 5.0, 2.0, 2.0), &mut hits);
//! assert_eq!(hits.len(), 1);
//! assert_eq!(hits[0].id, a);
//!
//! let nearest = tree.nearest(a, false).unwrap();
//! assert_eq!(nearest.id, b);
//!
//! assert_eq!(tree.delete(b), Some(Rectangle::new(20.0, 0.0, 5.0, 5.0)));
//! ```

use crate::errors::BoxTreeError;
use crate::geometry::{mbr_of, Circle, Rectangle};
use ordered_float::OrderedFloat;
use std::collections::{HashMap, HashSet, VecDeque};
use std::mem;
use tracing::{debug, info};

/// Reference point used to order children during forced reinsertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReinsertMethod {
    /// Distance from the center of the overflowing node's bounding box.
    #[default]
    Center,
    /// Distance from the arithmetic mean of the children's centers.
    Weighted,
}

/// Tuning parameters for an [`RStarTree`], fixed at construction.
///
/// Out-of-range values are silently clamped to their legal ranges, so any
/// `Config` produces a working tree.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of children per node (`M`). Clamped to at least 4.
    pub max_entries: usize,
    /// Minimum number of children per non-root node (`m`). Clamped to
    /// `[2, M / 2]`.
    pub min_entries: usize,
    /// Number of children forcibly reinserted on the first overflow at a
    /// level. Clamped to `[1, M - 1]`.
    pub reinsert_count: usize,
    /// Reference point for the reinsertion distance ordering.
    pub reinsert_method: ReinsertMethod,
    /// How many least-enlargement candidates are re-ranked by overlap cost
    /// when choosing a leaf for insertion. `None` means `M`; explicit values
    /// are clamped to `[1, M]`.
    pub choice_count: Option<usize>,
    /// Rank nearest-neighbor candidates by the true axis-aligned separation
    /// distance instead of the historical metric. See
    /// [`RStarTree::nearest`].
    pub corrected_metric: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_entries: 20,
            min_entries: 8,
            reinsert_count: 6,
            reinsert_method: ReinsertMethod::Center,
            choice_count: None,
            corrected_metric: false,
        }
    }
}

impl Config {
    fn clamp(&self) -> Params {
        let max_entries = self.max_entries.max(4);
        let min_entries = self.min_entries.clamp(2, max_entries / 2);
        Params {
            max_entries,
            min_entries,
            reinsert_count: self.reinsert_count.clamp(1, max_entries - 1),
            reinsert_method: self.reinsert_method,
            choice_count: self.choice_count.unwrap_or(max_entries).clamp(1, max_entries),
            corrected_metric: self.corrected_metric,
        }
    }
}

/// The clamped form of [`Config`] the tree actually runs with.
#[derive(Debug, Clone)]
struct Params {
    max_entries: usize,
    min_entries: usize,
    reinsert_count: usize,
    reinsert_method: ReinsertMethod,
    choice_count: usize,
    corrected_metric: bool,
}

/// A stored rectangle together with its stable handle.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: u64,
    pub rect: Rectangle,
}

/// Query target for [`RStarTree::nearest`]: either a live entry handle or an
/// arbitrary rectangle.
#[derive(Debug, Clone)]
pub enum NearestTarget {
    Handle(u64),
    Rect(Rectangle),
}

impl From<u64> for NearestTarget {
    fn from(id: u64) -> Self {
        NearestTarget::Handle(id)
    }
}

impl From<Rectangle> for NearestTarget {
    fn from(rect: Rectangle) -> Self {
        NearestTarget::Rect(rect)
    }
}

#[derive(Debug, Clone)]
enum NodeKind {
    Leaf(Vec<Entry>),
    Branch(Vec<usize>),
}

/// A node in the arena. `rect` caches the minimum bounding rectangle of the
/// children and is kept current by every mutation.
#[derive(Debug, Clone)]
struct Node {
    id: u64,
    parent: Option<usize>,
    rect: Rectangle,
    kind: NodeKind,
}

impl Node {
    fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    fn len(&self) -> usize {
        match &self.kind {
            NodeKind::Leaf(entries) => entries.len(),
            NodeKind::Branch(children) => children.len(),
        }
    }
}

/// Something that can be (re)inserted at a given level: a user entry or a
/// detached subtree.
enum TreeItem {
    Entry(Entry),
    Subtree(usize),
}

/// R*-tree over 2D axis-aligned rectangles with stable handles.
///
/// Nodes live in an arena indexed by slot; parent links are plain slot
/// indices. Arena slots are recycled through a free list, but entry and node
/// ids come from monotonic counters and are never reused.
#[derive(Debug, Clone)]
pub struct RStarTree {
    nodes: Vec<Option<Node>>,
    free_slots: Vec<usize>,
    root: Option<usize>,
    height: usize,
    entries: HashMap<u64, usize>,
    next_entry_id: u64,
    next_node_id: u64,
    /// Levels that already triggered a forced reinsertion during the current
    /// public insert. Cleared at the end of every public insert.
    overflowed_levels: HashSet<usize>,
    params: Params,
}

impl RStarTree {
    /// Creates a new, empty R*-tree with the given configuration.
    pub fn new(config: Config) -> Self {
        let params = config.clamp();
        info!("Creating new RStarTree with parameters: {:?}", params);
        RStarTree {
            nodes: Vec::new(),
            free_slots: Vec::new(),
            root: None,
            height: 0,
            entries: HashMap::new(),
            next_entry_id: 0,
            next_node_id: 0,
            overflowed_levels: HashSet::new(),
            params,
        }
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if `id` is a live handle.
    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Returns the rectangle stored under `id`, if the handle is live.
    pub fn get(&self, id: u64) -> Option<Rectangle> {
        let slot = *self.entries.get(&id)?;
        match &self.node(slot).kind {
            NodeKind::Leaf(entries) => entries.iter().find(|e| e.id == id).map(|e| e.rect.clone()),
            NodeKind::Branch(_) => unreachable!("handle map points at a branch node"),
        }
    }

    #[doc(hidden)]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Inserts a rectangle and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns [`BoxTreeError::MalformedRectangle`] when a coordinate is not
    /// finite or an extent is negative; the tree is left untouched.
    pub fn insert(&mut self, rect: Rectangle) -> Result<u64, BoxTreeError> {
        if !(rect.x.is_finite() && rect.y.is_finite() && rect.width.is_finite() && rect.height.is_finite())
            || rect.width < 0.0
            || rect.height < 0.0
        {
            return Err(BoxTreeError::MalformedRectangle {
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
            });
        }

        info!("Inserting rectangle into RStarTree: {:?}", rect);
        let id = self.next_entry_id;
        self.next_entry_id += 1;
        let entry = Entry { id, rect };

        match self.root {
            None => {
                let slot = self.alloc_node(NodeKind::Leaf(vec![entry]), None);
                self.recompute_rect(slot);
                self.entries.insert(id, slot);
                self.root = Some(slot);
                self.height = 1;
            }
            Some(_) => {
                self.insert_at(TreeItem::Entry(entry), 0);
                self.overflowed_levels.clear();
            }
        }
        Ok(id)
    }

    /// Deletes the entry stored under `id` and returns its rectangle, or
    /// `None` when the handle is unknown (the tree is left untouched).
    pub fn delete(&mut self, id: u64) -> Option<Rectangle> {
        let leaf_slot = self.entries.remove(&id)?;
        info!("Deleting entry {} from RStarTree", id);

        let removed = match &mut self.node_mut(leaf_slot).kind {
            NodeKind::Leaf(entries) => {
                let pos = entries
                    .iter()
                    .position(|e| e.id == id)
                    .unwrap_or_else(|| unreachable!("handle map points at a leaf without the entry"));
                entries.remove(pos)
            }
            NodeKind::Branch(_) => unreachable!("handle map points at a branch node"),
        };
        self.recompute_rect(leaf_slot);

        // Condense upward: detach every underfull non-root node on the path,
        // tagged with its level so its children can go back in at the same
        // depth. Parent boxes shrink along the way.
        let mut orphans: Vec<(usize, usize)> = Vec::new();
        let mut slot = leaf_slot;
        let mut level = 0usize;
        while let Some(parent) = self.node(slot).parent {
            if self.node(slot).len() < self.params.min_entries {
                match &mut self.node_mut(parent).kind {
                    NodeKind::Branch(children) => children.retain(|&c| c != slot),
                    NodeKind::Leaf(_) => unreachable!("parent link points at a leaf"),
                }
                self.node_mut(slot).parent = None;
                orphans.push((level, slot));
            }
            self.recompute_rect(parent);
            slot = parent;
            level += 1;
        }

        // Reinsert orphaned subtrees, highest level first, so leaves keep
        // their depth.
        while let Some((orphan_level, orphan)) = orphans.pop() {
            debug!(
                "Reinserting children of condensed node {} at level {}",
                self.node(orphan).id,
                orphan_level
            );
            let items: Vec<TreeItem> = match mem::replace(
                &mut self.node_mut(orphan).kind,
                NodeKind::Branch(Vec::new()),
            ) {
                NodeKind::Leaf(entries) => entries.into_iter().map(TreeItem::Entry).collect(),
                NodeKind::Branch(children) => {
                    children.into_iter().map(TreeItem::Subtree).collect()
                }
            };
            for item in items {
                self.insert_at(item, orphan_level);
            }
            self.free_node(orphan);
        }

        // Orphan reinsertion may have consumed per-level reinsertion budget;
        // the scratch set is per-operation state.
        self.overflowed_levels.clear();
        self.collapse_root();
        Some(removed.rect)
    }

    /// Appends every entry whose rectangle intersects `query` to `out`.
    /// The output vector is not cleared; result order is unspecified.
    pub fn search(&self, query: &Rectangle, out: &mut Vec<Entry>) {
        info!("Performing window search with query: {:?}", query);
        self.collect_matching(|rect| rect.intersects(query), out);
    }

    /// Appends every entry whose rectangle contains the point `(x, y)` to
    /// `out`. Containment is half-open, so entries touching the point with
    /// their right or bottom edge do not match.
    pub fn select(&self, x: f64, y: f64, out: &mut Vec<Entry>) {
        info!("Performing point selection at ({}, {})", x, y);
        self.collect_matching(|rect| rect.contains_point(x, y), out);
    }

    /// Appends every entry whose rectangle intersects the circle to `out`.
    pub fn range(&self, circle: &Circle, out: &mut Vec<Entry>) {
        info!("Performing circular range search with query: {:?}", circle);
        self.collect_matching(|rect| rect.intersects_circle(circle), out);
    }

    /// Returns the entry closest to `target` under the rectangle distance
    /// metric, or `None` when the tree holds fewer than two entries or the
    /// target handle is unknown. A handle target never returns its own entry.
    ///
    /// With `empty` set, containment between the query and a candidate is
    /// scored by the distance between their closest parallel edges instead
    /// of 0.
    ///
    /// The default metric mirrors the historical behavior of this index: the
    /// per-axis overlap lengths feed the reported distance even for
    /// intersecting rectangles. Construct the tree with
    /// [`Config::corrected_metric`] to rank candidates by the true
    /// axis-aligned separation distance instead.
    pub fn nearest<T: Into<NearestTarget>>(&self, target: T, empty: bool) -> Option<Entry> {
        if self.entries.len() < 2 {
            return None;
        }
        let (query, exclude, seed) = match target.into() {
            NearestTarget::Handle(id) => {
                let slot = *self.entries.get(&id)?;
                (self.get(id)?, Some(id), slot)
            }
            NearestTarget::Rect(rect) => {
                let slot = self.seed_leaf_for_rect(&rect);
                (rect, None, slot)
            }
        };
        info!("Performing nearest-neighbor search for query: {:?}", query);

        let mut best: Option<(f64, Entry)> = None;
        match &self.node(seed).kind {
            NodeKind::Leaf(entries) => {
                for entry in entries {
                    if Some(entry.id) == exclude {
                        continue;
                    }
                    let d = self.rect_distance(&query, &entry.rect, empty);
                    if best.as_ref().is_none_or(|(bd, _)| d < *bd) {
                        best = Some((d, entry.clone()));
                    }
                }
            }
            NodeKind::Branch(_) => unreachable!("seed must be a leaf"),
        }
        let (mut best_d, mut best_entry) = best?;

        // The seed leaf only gives an upper bound; rescan a window inflated
        // by that bound to rule out closer entries living in other leaves.
        if best_d > 0.0 {
            let window = Rectangle::new(
                query.x - best_d,
                query.y - best_d,
                query.width + 2.0 * best_d,
                query.height + 2.0 * best_d,
            );
            let mut candidates = Vec::new();
            self.search(&window, &mut candidates);
            for candidate in candidates {
                if Some(candidate.id) == exclude || self.entries.get(&candidate.id) == Some(&seed) {
                    continue;
                }
                let d = self.rect_distance(&query, &candidate.rect, empty);
                if d < best_d {
                    best_d = d;
                    best_entry = candidate;
                }
            }
        }
        Some(best_entry)
    }

    /// Asserts the structural invariants. This is a debugging aid for the
    /// test suites; it panics on the first violation.
    #[doc(hidden)]
    pub fn check_invariants(&self) {
        assert!(
            self.overflowed_levels.is_empty(),
            "overflow scratch state must be empty between operations"
        );
        let root = match self.root {
            None => {
                assert_eq!(self.height, 0, "empty tree must have height 0");
                assert!(self.entries.is_empty(), "empty tree must hold no entries");
                return;
            }
            Some(root) => root,
        };
        assert!(self.height >= 1, "non-empty tree must have height >= 1");
        assert_eq!(self.node(root).parent, None, "root must not have a parent");
        let mut seen = 0usize;
        self.check_node(root, self.height - 1, true, &mut seen);
        assert_eq!(
            seen,
            self.entries.len(),
            "handle map size must match the number of stored entries"
        );
    }

    fn check_node(&self, slot: usize, level: usize, is_root: bool, seen: &mut usize) {
        let node = self.node(slot);
        let len = node.len();
        if is_root {
            if self.height > 1 {
                assert!(len >= 2, "branch root must hold at least 2 children");
            }
        } else {
            assert!(
                len >= self.params.min_entries,
                "non-root node {} is underfull",
                node.id
            );
        }
        assert!(
            len <= self.params.max_entries,
            "node {} is overfull",
            node.id
        );
        match &node.kind {
            NodeKind::Leaf(entries) => {
                assert_eq!(level, 0, "leaf {} is not at leaf level", node.id);
                for entry in entries {
                    assert_eq!(
                        self.entries.get(&entry.id),
                        Some(&slot),
                        "handle map does not point at the leaf holding entry {}",
                        entry.id
                    );
                    *seen += 1;
                }
                if let Some(mbr) = mbr_of(entries.iter().map(|e| &e.rect)) {
                    assert_eq!(node.rect, mbr, "leaf {} has a stale bounding box", node.id);
                }
            }
            NodeKind::Branch(children) => {
                assert!(level > 0, "branch {} sits at leaf level", node.id);
                let boxes: Vec<Rectangle> =
                    children.iter().map(|&c| self.node(c).rect.clone()).collect();
                if let Some(mbr) = mbr_of(boxes.iter()) {
                    assert_eq!(node.rect, mbr, "branch {} has a stale bounding box", node.id);
                }
                for &child in children {
                    assert_eq!(
                        self.node(child).parent,
                        Some(slot),
                        "child {} does not point back at its parent",
                        self.node(child).id
                    );
                    self.check_node(child, level - 1, false, seen);
                }
            }
        }
    }

    //
    // Arena plumbing
    //

    fn node(&self, slot: usize) -> &Node {
        self.nodes[slot]
            .as_ref()
            .unwrap_or_else(|| unreachable!("stale node slot"))
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        self.nodes[slot]
            .as_mut()
            .unwrap_or_else(|| unreachable!("stale node slot"))
    }

    fn alloc_node(&mut self, kind: NodeKind, parent: Option<usize>) -> usize {
        let id = self.next_node_id;
        self.next_node_id += 1;
        let node = Node {
            id,
            parent,
            rect: Rectangle::new(0.0, 0.0, 0.0, 0.0),
            kind,
        };
        match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn free_node(&mut self, slot: usize) {
        self.nodes[slot] = None;
        self.free_slots.push(slot);
    }

    fn recompute_rect(&mut self, slot: usize) {
        let mbr = match &self.node(slot).kind {
            NodeKind::Leaf(entries) => mbr_of(entries.iter().map(|e| &e.rect)),
            NodeKind::Branch(children) => {
                let boxes: Vec<Rectangle> =
                    children.iter().map(|&c| self.node(c).rect.clone()).collect();
                mbr_of(boxes.iter())
            }
        };
        if let Some(mbr) = mbr {
            self.node_mut(slot).rect = mbr;
        }
    }

    fn root_slot(&self) -> usize {
        self.root
            .unwrap_or_else(|| unreachable!("operation requires a non-empty tree"))
    }

    //
    // Insertion engine
    //

    /// Inserts an entry (`level` 0) or a detached subtree (its parent-to-be's
    /// level) and repairs the path back to the root.
    fn insert_at(&mut self, item: TreeItem, level: usize) {
        let item_rect = match &item {
            TreeItem::Entry(entry) => entry.rect.clone(),
            TreeItem::Subtree(slot) => self.node(*slot).rect.clone(),
        };
        let target = self.choose_subtree(&item_rect, level);
        match item {
            TreeItem::Entry(entry) => {
                self.entries.insert(entry.id, target);
                match &mut self.node_mut(target).kind {
                    NodeKind::Leaf(entries) => entries.push(entry),
                    NodeKind::Branch(_) => unreachable!("entry insertion must target a leaf"),
                }
            }
            TreeItem::Subtree(slot) => {
                self.node_mut(slot).parent = Some(target);
                match &mut self.node_mut(target).kind {
                    NodeKind::Branch(children) => children.push(slot),
                    NodeKind::Leaf(_) => unreachable!("subtree insertion must target a branch"),
                }
            }
        }
        self.recompute_rect(target);
        self.ascend_repair(target, level);
    }

    /// Descends from the root to the node at `level` that should receive an
    /// item bounded by `rect`.
    fn choose_subtree(&self, rect: &Rectangle, level: usize) -> usize {
        let mut slot = self.root_slot();
        let mut current = self.height - 1;
        while current > level {
            slot = self.choose_child(slot, rect, current);
            current -= 1;
        }
        slot
    }

    fn choose_child(&self, slot: usize, rect: &Rectangle, level: usize) -> usize {
        let children = match &self.node(slot).kind {
            NodeKind::Branch(children) => children,
            NodeKind::Leaf(_) => unreachable!("cannot descend into a leaf"),
        };
        let boxes: Vec<Rectangle> = children.iter().map(|&c| self.node(c).rect.clone()).collect();

        let best = if level == 1 {
            // The children are leaves: re-rank the least-enlargement
            // candidates by how much extra overlap they would accumulate
            // against their siblings.
            let mut order: Vec<usize> = (0..boxes.len()).collect();
            order.sort_by_key(|&i| OrderedFloat(boxes[i].enlargement(rect)));
            let count = self.params.choice_count.min(order.len());
            let mut best = order[0];
            let mut best_cost = f64::INFINITY;
            for &candidate in &order[..count] {
                let grown = boxes[candidate].union(rect);
                let mut cost = 0.0;
                for (other, other_box) in boxes.iter().enumerate() {
                    if other == candidate {
                        continue;
                    }
                    cost += grown.overlap_area(other_box) - boxes[candidate].overlap_area(other_box);
                }
                if cost < best_cost {
                    best_cost = cost;
                    best = candidate;
                }
            }
            best
        } else {
            // The children are branches: least enlargement, then smaller
            // area, then lower index.
            let mut best = 0;
            let mut best_key = (OrderedFloat(f64::INFINITY), OrderedFloat(f64::INFINITY));
            for (i, b) in boxes.iter().enumerate() {
                let key = (OrderedFloat(b.enlargement(rect)), OrderedFloat(b.area()));
                if key < best_key {
                    best_key = key;
                    best = i;
                }
            }
            best
        };
        children[best]
    }

    /// Walks from `start` back to the root, repairing bounding boxes and
    /// resolving overflows.
    fn ascend_repair(&mut self, start: usize, start_level: usize) {
        let mut slot = start;
        let mut level = start_level;
        loop {
            if self.node(slot).len() > self.params.max_entries {
                if let Some(new_half) = self.resolve_overflow(slot, level) {
                    match self.node(slot).parent {
                        Some(parent) => {
                            self.node_mut(new_half).parent = Some(parent);
                            match &mut self.node_mut(parent).kind {
                                NodeKind::Branch(children) => children.push(new_half),
                                NodeKind::Leaf(_) => unreachable!("parent link points at a leaf"),
                            }
                            self.recompute_rect(parent);
                        }
                        None => {
                            self.grow_root(slot, new_half);
                            return;
                        }
                    }
                }
            }
            match self.node(slot).parent {
                Some(parent) => {
                    self.recompute_rect(parent);
                    slot = parent;
                    level += 1;
                }
                None => return,
            }
        }
    }

    /// Resolves an overfull node: the first overflow at a level within one
    /// public insert reinserts, any further one splits. The root always
    /// splits. Returns the new sibling when a split happened.
    fn resolve_overflow(&mut self, slot: usize, level: usize) -> Option<usize> {
        let at_root = self.node(slot).parent.is_none();
        if at_root || self.overflowed_levels.contains(&level) {
            Some(self.split_node(slot))
        } else {
            self.overflowed_levels.insert(level);
            self.forced_reinsert(slot, level);
            None
        }
    }

    fn grow_root(&mut self, left: usize, right: usize) {
        let new_root = self.alloc_node(NodeKind::Branch(vec![left, right]), None);
        self.node_mut(left).parent = Some(new_root);
        self.node_mut(right).parent = Some(new_root);
        self.recompute_rect(new_root);
        self.root = Some(new_root);
        self.height += 1;
        debug!("Root split increased tree height to {}", self.height);
    }

    /// Detaches the `reinsert_count` children farthest from the reference
    /// center and inserts them again at the same level. Per-level scratch
    /// state in `overflowed_levels` guarantees this runs at most once per
    /// level per public insert.
    fn forced_reinsert(&mut self, slot: usize, level: usize) {
        let reference = match self.params.reinsert_method {
            ReinsertMethod::Center => self.node(slot).rect.center(),
            ReinsertMethod::Weighted => {
                let centers: Vec<(f64, f64)> = match &self.node(slot).kind {
                    NodeKind::Leaf(entries) => entries.iter().map(|e| e.rect.center()).collect(),
                    NodeKind::Branch(children) => children
                        .iter()
                        .map(|&c| self.node(c).rect.center())
                        .collect(),
                };
                let n = centers.len() as f64;
                let (sx, sy) = centers
                    .iter()
                    .fold((0.0, 0.0), |(ax, ay), (cx, cy)| (ax + cx, ay + cy));
                (sx / n, sy / n)
            }
        };
        let distance = |rect: &Rectangle| {
            let (cx, cy) = rect.center();
            let dx = cx - reference.0;
            let dy = cy - reference.1;
            OrderedFloat(dx * dx + dy * dy)
        };

        let count = self.params.reinsert_count;
        debug!(
            "Forced reinsertion of {} children at level {}",
            count, level
        );
        let detached: Vec<TreeItem> = if self.node(slot).is_leaf() {
            match &mut self.node_mut(slot).kind {
                NodeKind::Leaf(entries) => {
                    entries.sort_by(|a, b| distance(&b.rect).cmp(&distance(&a.rect)));
                    entries.drain(0..count).map(TreeItem::Entry).collect()
                }
                NodeKind::Branch(_) => unreachable!(),
            }
        } else {
            let mut children = match &mut self.node_mut(slot).kind {
                NodeKind::Branch(children) => mem::take(children),
                NodeKind::Leaf(_) => unreachable!(),
            };
            children.sort_by(|&a, &b| {
                distance(&self.node(b).rect).cmp(&distance(&self.node(a).rect))
            });
            let detached: Vec<TreeItem> =
                children.drain(0..count).map(TreeItem::Subtree).collect();
            match &mut self.node_mut(slot).kind {
                NodeKind::Branch(slot_children) => *slot_children = children,
                NodeKind::Leaf(_) => unreachable!(),
            }
            detached
        };
        self.recompute_rect(slot);
        for item in detached {
            self.insert_at(item, level);
        }
    }

    /// Splits an overfull node and returns the freshly allocated sibling.
    /// The caller attaches the sibling to the tree.
    fn split_node(&mut self, slot: usize) -> usize {
        let min_entries = self.params.min_entries;
        let max_entries = self.params.max_entries;
        let sibling = if self.node(slot).is_leaf() {
            let mut entries = match &mut self.node_mut(slot).kind {
                NodeKind::Leaf(entries) => mem::take(entries),
                NodeKind::Branch(_) => unreachable!(),
            };
            let boxes: Vec<Rectangle> = entries.iter().map(|e| e.rect.clone()).collect();
            let choice = choose_split(&boxes, min_entries, max_entries);
            entries
                .sort_by_key(|e| OrderedFloat(split_key(&e.rect, choice.axis, choice.upper_edge)));
            let moved = entries.split_off(choice.first_len);
            let moved_ids: Vec<u64> = moved.iter().map(|e| e.id).collect();
            let sibling = self.alloc_node(NodeKind::Leaf(moved), None);
            for id in moved_ids {
                self.entries.insert(id, sibling);
            }
            match &mut self.node_mut(slot).kind {
                NodeKind::Leaf(slot_entries) => *slot_entries = entries,
                NodeKind::Branch(_) => unreachable!(),
            }
            sibling
        } else {
            let mut children = match &mut self.node_mut(slot).kind {
                NodeKind::Branch(children) => mem::take(children),
                NodeKind::Leaf(_) => unreachable!(),
            };
            let boxes: Vec<Rectangle> =
                children.iter().map(|&c| self.node(c).rect.clone()).collect();
            let choice = choose_split(&boxes, min_entries, max_entries);
            let mut indexed: Vec<(usize, Rectangle)> = children.drain(..).zip(boxes).collect();
            indexed.sort_by_key(|(_, rect)| {
                OrderedFloat(split_key(rect, choice.axis, choice.upper_edge))
            });
            let moved: Vec<usize> = indexed
                .split_off(choice.first_len)
                .into_iter()
                .map(|(child, _)| child)
                .collect();
            let kept: Vec<usize> = indexed.into_iter().map(|(child, _)| child).collect();
            let sibling = self.alloc_node(NodeKind::Branch(moved.clone()), None);
            for child in moved {
                self.node_mut(child).parent = Some(sibling);
            }
            match &mut self.node_mut(slot).kind {
                NodeKind::Branch(slot_children) => *slot_children = kept,
                NodeKind::Leaf(_) => unreachable!(),
            }
            sibling
        };
        self.recompute_rect(slot);
        self.recompute_rect(sibling);
        debug!(
            "Split node {} into sibling {}",
            self.node(slot).id,
            self.node(sibling).id
        );
        sibling
    }

    //
    // Deletion plumbing
    //

    fn collapse_root(&mut self) {
        let Some(root) = self.root else { return };
        if !self.node(root).is_leaf() && self.node(root).len() == 1 {
            let child = match &self.node(root).kind {
                NodeKind::Branch(children) => children[0],
                NodeKind::Leaf(_) => unreachable!(),
            };
            self.node_mut(child).parent = None;
            self.free_node(root);
            self.root = Some(child);
            self.height -= 1;
            debug!("Root collapse decreased tree height to {}", self.height);
        } else if self.node(root).is_leaf() && self.node(root).len() == 0 {
            self.free_node(root);
            self.root = None;
            self.height = 0;
            debug!("RStarTree is now empty");
        }
    }

    //
    // Query plumbing
    //

    fn collect_matching<F: Fn(&Rectangle) -> bool>(&self, matches: F, out: &mut Vec<Entry>) {
        let Some(root) = self.root else { return };
        let mut queue = VecDeque::from([root]);
        while let Some(slot) = queue.pop_front() {
            match &self.node(slot).kind {
                NodeKind::Leaf(entries) => {
                    for entry in entries {
                        if matches(&entry.rect) {
                            out.push(entry.clone());
                        }
                    }
                }
                NodeKind::Branch(children) => {
                    for &child in children {
                        if matches(&self.node(child).rect) {
                            queue.push_back(child);
                        }
                    }
                }
            }
        }
    }

    /// Picks the leaf to scan first for a rectangle target: follow every
    /// child that intersects the query while any does, otherwise fall back
    /// to the single child with the closest center. Among surviving leaves
    /// the one sharing the most area with the query wins.
    fn seed_leaf_for_rect(&self, query: &Rectangle) -> usize {
        let mut frontier = vec![self.root_slot()];
        let mut intersecting = true;
        loop {
            if self.node(frontier[0]).is_leaf() {
                break;
            }
            let children: Vec<usize> = frontier
                .iter()
                .flat_map(|&slot| match &self.node(slot).kind {
                    NodeKind::Branch(children) => children.clone(),
                    NodeKind::Leaf(_) => unreachable!("mixed levels in seed descent"),
                })
                .collect();
            if intersecting {
                let hits: Vec<usize> = children
                    .iter()
                    .copied()
                    .filter(|&c| self.node(c).rect.intersects(query))
                    .collect();
                if !hits.is_empty() {
                    frontier = hits;
                    continue;
                }
                intersecting = false;
            }
            let (qx, qy) = query.center();
            let mut best = children[0];
            let mut best_d = f64::INFINITY;
            for &child in &children {
                let (cx, cy) = self.node(child).rect.center();
                let d = (cx - qx) * (cx - qx) + (cy - qy) * (cy - qy);
                if d < best_d {
                    best_d = d;
                    best = child;
                }
            }
            frontier = vec![best];
        }
        if frontier.len() == 1 {
            return frontier[0];
        }
        let mut best = frontier[0];
        let mut best_overlap = -1.0;
        for &leaf in &frontier {
            let overlap = self.node(leaf).rect.overlap_area(query);
            if overlap > best_overlap {
                best_overlap = overlap;
                best = leaf;
            }
        }
        best
    }

    fn rect_distance(&self, query: &Rectangle, candidate: &Rectangle, empty: bool) -> f64 {
        if self.params.corrected_metric {
            corrected_rect_distance(query, candidate, empty)
        } else {
            legacy_rect_distance(query, candidate, empty)
        }
    }
}

/// Distance of the closest parallel edges, used when one rectangle contains
/// the other and `empty` is requested.
fn edge_distance(query: &Rectangle, candidate: &Rectangle) -> f64 {
    let right = (candidate.x + candidate.width - (query.x + query.width)).abs();
    let left = (candidate.x - query.x).abs();
    let bottom = (candidate.y + candidate.height - (query.y + query.height)).abs();
    let top = (candidate.y - query.y).abs();
    right.min(left).min(bottom.min(top))
}

/// The historical rectangle-to-rectangle metric of this index. The signed
/// per-axis overlaps (positive overlap length, negative gap) feed the result
/// directly, so intersecting rectangles score above zero while rectangles
/// separated on both axes score zero. Kept as the default for compatibility
/// with existing callers; see [`Config::corrected_metric`].
fn legacy_rect_distance(query: &Rectangle, candidate: &Rectangle, empty: bool) -> f64 {
    let (ox, oy) = query.overlap(candidate);
    if ox < 0.0 && oy >= 0.0 {
        oy
    } else if oy < 0.0 && ox >= 0.0 {
        ox
    } else if ox >= 0.0 && oy >= 0.0 {
        (ox * ox + oy * oy).sqrt()
    } else if empty
        && ((-ox == query.width && -oy == query.height)
            || (-ox == candidate.width && -oy == candidate.height))
    {
        edge_distance(query, candidate)
    } else {
        0.0
    }
}

/// True axis-aligned separation distance: zero for intersecting rectangles,
/// the gap along the single separated axis, or the corner-to-corner distance
/// when separated on both axes.
fn corrected_rect_distance(query: &Rectangle, candidate: &Rectangle, empty: bool) -> f64 {
    let contains = |outer: &Rectangle, inner: &Rectangle| {
        inner.x >= outer.x
            && inner.y >= outer.y
            && inner.x + inner.width <= outer.x + outer.width
            && inner.y + inner.height <= outer.y + outer.height
    };
    let (ox, oy) = query.overlap(candidate);
    if ox >= 0.0 && oy >= 0.0 {
        if empty && (contains(query, candidate) || contains(candidate, query)) {
            edge_distance(query, candidate)
        } else {
            0.0
        }
    } else if ox < 0.0 && oy < 0.0 {
        let gx = -ox;
        let gy = -oy;
        (gx * gx + gy * gy).sqrt()
    } else if ox < 0.0 {
        -ox
    } else {
        -oy
    }
}

#[derive(Debug, Clone, Copy)]
struct SplitChoice {
    axis: usize,
    upper_edge: bool,
    first_len: usize,
}

/// Sort key for one of the four axis/edge split orderings.
fn split_key(rect: &Rectangle, axis: usize, upper_edge: bool) -> f64 {
    match (axis, upper_edge) {
        (0, false) => rect.x,
        (0, true) => rect.x + rect.width,
        (1, false) => rect.y,
        (1, true) => rect.y + rect.height,
        _ => unreachable!("axis out of range"),
    }
}

fn sorted_indices(boxes: &[Rectangle], axis: usize, upper_edge: bool) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by_key(|&i| OrderedFloat(split_key(&boxes[i], axis, upper_edge)));
    order
}

fn group_mbr(boxes: &[Rectangle], indices: &[usize]) -> Rectangle {
    mbr_of(indices.iter().map(|&i| &boxes[i]))
        .unwrap_or_else(|| unreachable!("split groups are never empty"))
}

/// Picks the split axis, sort direction, and first-group size for an overfull
/// node holding `max_entries + 1` boxes. The axis with the smallest summed
/// perimeter over its candidate distributions wins; the distribution with the
/// smallest inter-group overlap (then total area) wins on that axis.
fn choose_split(boxes: &[Rectangle], min_entries: usize, max_entries: usize) -> SplitChoice {
    debug_assert_eq!(boxes.len(), max_entries + 1);
    let distributions = max_entries - 2 * min_entries + 2;

    let mut best_axis = 0;
    let mut best_edge = false;
    let mut best_margin = f64::INFINITY;
    for axis in 0..2 {
        for upper_edge in [false, true] {
            let order = sorted_indices(boxes, axis, upper_edge);
            let mut margin_sum = 0.0;
            for j in 1..=distributions {
                let first_len = min_entries - 1 + j;
                let first = group_mbr(boxes, &order[..first_len]);
                let second = group_mbr(boxes, &order[first_len..]);
                margin_sum += first.perimeter() + second.perimeter();
            }
            if margin_sum < best_margin {
                best_margin = margin_sum;
                best_axis = axis;
                best_edge = upper_edge;
            }
        }
    }

    let order = sorted_indices(boxes, best_axis, best_edge);
    let mut best_len = min_entries;
    let mut best_overlap = f64::INFINITY;
    let mut best_area = f64::INFINITY;
    for j in 1..=distributions {
        let first_len = min_entries - 1 + j;
        let first = group_mbr(boxes, &order[..first_len]);
        let second = group_mbr(boxes, &order[first_len..]);
        let overlap = first.overlap_area(&second);
        let area = first.area() + second.area();
        if overlap < best_overlap || (overlap == best_overlap && area < best_area) {
            best_overlap = overlap;
            best_area = area;
            best_len = first_len;
        }
    }

    SplitChoice {
        axis: best_axis,
        upper_edge: best_edge,
        first_len: best_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_clamping() {
        let params = Config {
            max_entries: 2,
            min_entries: 100,
            reinsert_count: 0,
            reinsert_method: ReinsertMethod::Weighted,
            choice_count: Some(99),
            corrected_metric: false,
        }
        .clamp();
        assert_eq!(params.max_entries, 4);
        assert_eq!(params.min_entries, 2);
        assert_eq!(params.reinsert_count, 1);
        assert_eq!(params.choice_count, 4);
    }

    #[test]
    fn test_config_default_choice_count_tracks_max() {
        let params = Config {
            max_entries: 40,
            ..Config::default()
        }
        .clamp();
        assert_eq!(params.choice_count, 40);
    }

    #[test]
    fn test_legacy_distance_branches() {
        // Separated on x, overlapping on y: the y overlap is reported.
        let a = Rectangle::new(0.0, 0.0, 10.0, 10.0);
        let b = Rectangle::new(20.0, 0.0, 5.0, 8.0);
        assert_eq!(legacy_rect_distance(&a, &b, false), 8.0);

        // Touching on x: the zero x overlap routes through the sqrt branch.
        let c = Rectangle::new(10.0, 0.0, 5.0, 5.0);
        assert_eq!(legacy_rect_distance(&a, &c, false), 5.0);

        // Separated on both axes scores zero.
        let d = Rectangle::new(20.0, 20.0, 5.0, 5.0);
        assert_eq!(legacy_rect_distance(&a, &d, false), 0.0);
    }

    #[test]
    fn test_legacy_distance_empty_containment_literal() {
        // Gaps matching the query extents trip the containment test of the
        // historical metric when `empty` is requested.
        let query = Rectangle::new(0.0, 0.0, 2.0, 2.0);
        let candidate = Rectangle::new(4.0, 4.0, 1.0, 1.0);
        assert_eq!(legacy_rect_distance(&query, &candidate, false), 0.0);
        assert_eq!(legacy_rect_distance(&query, &candidate, true), 3.0);
    }

    #[test]
    fn test_corrected_distance() {
        let a = Rectangle::new(0.0, 0.0, 10.0, 10.0);
        let overlapping = Rectangle::new(5.0, 5.0, 10.0, 10.0);
        assert_eq!(corrected_rect_distance(&a, &overlapping, false), 0.0);

        let right = Rectangle::new(13.0, 0.0, 5.0, 10.0);
        assert_eq!(corrected_rect_distance(&a, &right, false), 3.0);

        let diagonal = Rectangle::new(13.0, 14.0, 5.0, 5.0);
        assert_eq!(corrected_rect_distance(&a, &diagonal, false), 5.0);

        let inner = Rectangle::new(1.0, 2.0, 3.0, 3.0);
        assert_eq!(corrected_rect_distance(&a, &inner, false), 0.0);
        assert_eq!(corrected_rect_distance(&a, &inner, true), 1.0);
    }

    #[test]
    fn test_choose_split_row_of_boxes() {
        let boxes: Vec<Rectangle> = (0..5)
            .map(|i| Rectangle::new(i as f64 * 10.0, 0.0, 5.0, 5.0))
            .collect();
        let choice = choose_split(&boxes, 2, 4);
        assert_eq!(choice.axis, 0);
        assert_eq!(choice.first_len, 2);
    }

    #[test]
    fn test_handles_are_not_reused() {
        let mut tree = RStarTree::new(Config {
            max_entries: 4,
            min_entries: 2,
            reinsert_count: 2,
            ..Config::default()
        });
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(tree.insert(Rectangle::new(i as f64 * 10.0, 0.0, 5.0, 5.0)).unwrap());
        }
        for id in &ids {
            tree.delete(*id);
        }
        assert!(tree.is_empty());
        let fresh = tree.insert(Rectangle::new(0.0, 0.0, 1.0, 1.0)).unwrap();
        assert!(!ids.contains(&fresh));
    }
}
