//! Copy-on-write kd-tree.
//!
//! Nodes are shared behind `Arc`, so cloning a tree is O(1) and an insert
//! into a clone copies only the root-to-leaf path it touches. Every point
//! lives in exactly one leaf; each node keeps the bounding box of the points
//! below it, which is what queries prune on.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::error::{Result, ensure_dimension};
use crate::item::ItemId;
use crate::spatial::{Accept, CellScan, Neighbor, SpatialBackend, sort_neighbors};

#[derive(Debug, Clone)]
struct Entry {
    id: ItemId,
    point: Box<[f32]>,
}

#[derive(Debug, Clone)]
struct Bounds {
    min: Vec<f32>,
    max: Vec<f32>,
}

impl Bounds {
    fn of(entries: &[Entry], dimension: usize) -> Self {
        let mut bounds = Bounds {
            min: vec![f32::INFINITY; dimension],
            max: vec![f32::NEG_INFINITY; dimension],
        };
        for entry in entries {
            bounds.extend(&entry.point);
        }
        bounds
    }

    fn extend(&mut self, point: &[f32]) {
        for (axis, &v) in point.iter().enumerate() {
            self.min[axis] = self.min[axis].min(v);
            self.max[axis] = self.max[axis].max(v);
        }
    }

    /// Axis with the largest extent and that extent.
    fn widest_axis(&self) -> (usize, f32) {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| hi - lo)
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (axis, spread)| {
                if spread > best.1 { (axis, spread) } else { best }
            })
    }

    /// Squared distance from `point` to the nearest point of the box.
    fn min_distance_sq(&self, point: &[f32]) -> f32 {
        point
            .iter()
            .enumerate()
            .map(|(axis, &p)| {
                let gap = if p < self.min[axis] {
                    self.min[axis] - p
                } else if p > self.max[axis] {
                    p - self.max[axis]
                } else {
                    0.0
                };
                gap * gap
            })
            .sum()
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        entries: Vec<Entry>,
        bounds: Bounds,
    },
    Split {
        axis: usize,
        value: f32,
        left: Arc<Node>,
        right: Arc<Node>,
        bounds: Bounds,
    },
}

impl Node {
    fn bounds(&self) -> &Bounds {
        match self {
            Node::Leaf { bounds, .. } | Node::Split { bounds, .. } => bounds,
        }
    }
}

/// Heap element ordered by `(distance, order)`.
struct Ranked<T> {
    distance: f32,
    order: u64,
    value: T,
}

impl<T> Ord for Ranked<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.order.cmp(&other.order))
    }
}

impl<T> PartialOrd for Ranked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Ranked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Ranked<T> {}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// A kd-tree over points of one arity with a target leaf size.
#[derive(Debug, Clone)]
pub struct KdTree {
    dimension: usize,
    leaf_size: usize,
    root: Option<Arc<Node>>,
    len: usize,
}

impl KdTree {
    pub fn new(dimension: usize, leaf_size: usize) -> Self {
        Self {
            dimension,
            leaf_size: leaf_size.max(1),
            root: None,
            len: 0,
        }
    }

    /// Bulk-build a balanced tree.
    pub fn build<I, P>(dimension: usize, leaf_size: usize, points: I) -> Result<Self>
    where
        I: IntoIterator<Item = (ItemId, P)>,
        P: AsRef<[f32]>,
    {
        let mut entries = Vec::new();
        for (id, point) in points {
            let point = point.as_ref();
            ensure_dimension(dimension, point.len())?;
            entries.push(Entry {
                id,
                point: point.into(),
            });
        }
        let mut tree = Self::new(dimension, leaf_size);
        tree.len = entries.len();
        if !entries.is_empty() {
            tree.root = Some(Arc::new(build_node(entries, dimension, tree.leaf_size)));
        }
        Ok(tree)
    }

    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    /// Number of leaves (cells).
    pub fn leaf_count(&self) -> usize {
        fn count(node: &Node) -> usize {
            match node {
                Node::Leaf { .. } => 1,
                Node::Split { left, right, .. } => count(left) + count(right),
            }
        }
        self.root.as_deref().map(count).unwrap_or(0)
    }

    pub fn depth(&self) -> usize {
        fn depth(node: &Node) -> usize {
            match node {
                Node::Leaf { .. } => 1,
                Node::Split { left, right, .. } => 1 + depth(left).max(depth(right)),
            }
        }
        self.root.as_deref().map(depth).unwrap_or(0)
    }

    /// Ids stored in each leaf, in traversal order.
    pub fn leaves(&self) -> Vec<Vec<ItemId>> {
        fn walk(node: &Node, out: &mut Vec<Vec<ItemId>>) {
            match node {
                Node::Leaf { entries, .. } => out.push(entries.iter().map(|e| e.id).collect()),
                Node::Split { left, right, .. } => {
                    walk(left, out);
                    walk(right, out);
                }
            }
        }
        let mut out = Vec::new();
        if let Some(root) = self.root.as_deref() {
            walk(root, &mut out);
        }
        out
    }

    fn insert_into(node: &mut Arc<Node>, entry: Entry, dimension: usize, leaf_size: usize) {
        let split_leaf = match Arc::make_mut(node) {
            Node::Split {
                axis,
                value,
                left,
                right,
                bounds,
            } => {
                bounds.extend(&entry.point);
                let child = if entry.point[*axis] < *value { left } else { right };
                Self::insert_into(child, entry, dimension, leaf_size);
                false
            }
            Node::Leaf { entries, bounds } => {
                bounds.extend(&entry.point);
                entries.push(entry);
                entries.len() > 2 * leaf_size
            }
        };

        if split_leaf && let Node::Leaf { entries, .. } = Arc::make_mut(node) {
            let entries = std::mem::take(entries);
            *node = Arc::new(build_node(entries, dimension, leaf_size));
        }
    }
}

fn build_node(mut entries: Vec<Entry>, dimension: usize, leaf_size: usize) -> Node {
    let bounds = Bounds::of(&entries, dimension);
    if entries.len() <= leaf_size {
        return Node::Leaf { entries, bounds };
    }
    let (axis, spread) = bounds.widest_axis();
    if spread <= 0.0 {
        // All points coincide; no split can separate them.
        return Node::Leaf { entries, bounds };
    }

    let mid = entries.len() / 2;
    entries.select_nth_unstable_by(mid, |a, b| a.point[axis].total_cmp(&b.point[axis]));
    let value = entries[mid].point[axis];
    let right = entries.split_off(mid);

    Node::Split {
        axis,
        value,
        left: Arc::new(build_node(entries, dimension, leaf_size)),
        right: Arc::new(build_node(right, dimension, leaf_size)),
        bounds,
    }
}

impl SpatialBackend for KdTree {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        self.len
    }

    fn insert(&mut self, id: ItemId, point: &[f32]) -> Result<()> {
        ensure_dimension(self.dimension, point.len())?;
        let entry = Entry {
            id,
            point: point.into(),
        };
        match self.root.as_mut() {
            Some(root) => Self::insert_into(root, entry, self.dimension, self.leaf_size),
            None => {
                let bounds = Bounds::of(std::slice::from_ref(&entry), self.dimension);
                self.root = Some(Arc::new(Node::Leaf {
                    entries: vec![entry],
                    bounds,
                }));
            }
        }
        self.len += 1;
        Ok(())
    }

    fn nearest(&self, point: &[f32], k: usize, accept: Accept<'_>) -> Result<Vec<Neighbor>> {
        ensure_dimension(self.dimension, point.len())?;
        let Some(root) = self.root.as_deref() else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut frontier = BinaryHeap::new();
        let mut order = 0u64;
        frontier.push(Reverse(Ranked {
            distance: root.bounds().min_distance_sq(point),
            order,
            value: root,
        }));
        let mut best: BinaryHeap<Ranked<()>> = BinaryHeap::with_capacity(k + 1);

        while let Some(Reverse(next)) = frontier.pop() {
            if best.len() == k
                && let Some(worst) = best.peek()
                && next.distance > worst.distance
            {
                break;
            }
            match next.value {
                Node::Leaf { entries, .. } => {
                    for entry in entries.iter().filter(|e| accept(e.id)) {
                        best.push(Ranked {
                            distance: squared_distance(point, &entry.point),
                            order: entry.id,
                            value: (),
                        });
                        if best.len() > k {
                            best.pop();
                        }
                    }
                }
                Node::Split { left, right, .. } => {
                    for child in [left, right] {
                        order += 1;
                        frontier.push(Reverse(Ranked {
                            distance: child.bounds().min_distance_sq(point),
                            order,
                            value: child.as_ref(),
                        }));
                    }
                }
            }
        }

        let mut neighbors: Vec<Neighbor> = best
            .into_iter()
            .map(|r| Neighbor {
                id: r.order,
                distance: r.distance.sqrt(),
            })
            .collect();
        sort_neighbors(&mut neighbors);
        Ok(neighbors)
    }

    fn within_radius(
        &self,
        point: &[f32],
        radius: f32,
        accept: Accept<'_>,
    ) -> Result<Vec<Neighbor>> {
        ensure_dimension(self.dimension, point.len())?;
        let radius_sq = radius * radius;
        let mut found = Vec::new();
        let mut stack: Vec<&Node> = self.root.as_deref().into_iter().collect();

        while let Some(node) = stack.pop() {
            if node.bounds().min_distance_sq(point) > radius_sq {
                continue;
            }
            match node {
                Node::Leaf { entries, .. } => {
                    for entry in entries.iter().filter(|e| accept(e.id)) {
                        let distance_sq = squared_distance(point, &entry.point);
                        if distance_sq <= radius_sq {
                            found.push(Neighbor {
                                id: entry.id,
                                distance: distance_sq.sqrt(),
                            });
                        }
                    }
                }
                Node::Split { left, right, .. } => {
                    stack.push(left);
                    stack.push(right);
                }
            }
        }
        sort_neighbors(&mut found);
        Ok(found)
    }

    fn collect_cells(
        &self,
        point: &[f32],
        max_points: usize,
        max_cells: usize,
        accept: Accept<'_>,
    ) -> Result<CellScan> {
        ensure_dimension(self.dimension, point.len())?;
        let mut scan = CellScan::default();
        let Some(root) = self.root.as_deref() else {
            scan.exhausted = true;
            return Ok(scan);
        };

        let mut frontier = BinaryHeap::new();
        let mut order = 0u64;
        frontier.push(Reverse(Ranked {
            distance: root.bounds().min_distance_sq(point),
            order,
            value: root,
        }));

        while scan.candidates.len() < max_points && scan.cells_visited < max_cells {
            let Some(Reverse(next)) = frontier.pop() else {
                break;
            };
            match next.value {
                Node::Leaf { entries, .. } => {
                    scan.cells_visited += 1;
                    scan.candidates.extend(entries.iter().filter(|e| accept(e.id)).map(|e| {
                        Neighbor {
                            id: e.id,
                            distance: squared_distance(point, &e.point).sqrt(),
                        }
                    }));
                }
                Node::Split { left, right, .. } => {
                    for child in [left, right] {
                        order += 1;
                        frontier.push(Reverse(Ranked {
                            distance: child.bounds().min_distance_sq(point),
                            order,
                            value: child.as_ref(),
                        }));
                    }
                }
            }
        }

        scan.exhausted = frontier.is_empty();
        sort_neighbors(&mut scan.candidates);
        Ok(scan)
    }
}
