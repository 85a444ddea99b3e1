use std::{cmp::Ordering, collections::BinaryHeap};

use nalgebra::Vector3;

/// A neighbour returned by a k-nearest-neighbour query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f64,
}

/// Heap entry ordered by squared distance, ties broken by point index
#[derive(Debug, Clone, Copy)]
struct Candidate {
    dist2: f64,
    index: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist2
            .total_cmp(&other.dist2)
            .then(self.index.cmp(&other.index))
    }
}

/// Static k-d tree over a point cloud
///
/// The tree is stored implicitly as a permutation of the point indices: the
/// subtree over `order[lo..hi]` keeps its splitting point at the midpoint and
/// splits on axis `depth % 3`.
#[derive(Debug, Clone)]
pub struct KdTree {
    points: Vec<Vector3<f64>>,
    order: Vec<usize>,
}

impl KdTree {
    pub fn build(points: &[Vector3<f64>]) -> KdTree {
        let mut tree = KdTree {
            points: points.to_vec(),
            order: (0..points.len()).collect(),
        };
        tree.split(0, points.len(), 0);
        tree
    }

    fn split(&mut self, lo: usize, hi: usize, depth: usize) {
        if hi - lo <= 1 {
            return;
        }

        let axis = depth % 3;
        let mid = lo + (hi - lo) / 2;
        let points = &self.points;
        self.order[lo..hi]
            .select_nth_unstable_by(mid - lo, |&a, &b| points[a][axis].total_cmp(&points[b][axis]));

        self.split(lo, mid, depth + 1);
        self.split(mid + 1, hi, depth + 1);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Finds the `k` points closest to `query`
    ///
    /// Equal distances are resolved by the lower point index, so the result
    /// does not depend on tree layout. A point coinciding with `query` is
    /// returned with distance zero.
    ///
    /// # Arguments
    /// * `query` - The query location
    /// * `k` - The number of neighbours; clamped to the number of points
    ///
    /// # Returns
    /// The neighbours sorted by increasing distance
    pub fn nearest(&self, query: &Vector3<f64>, k: usize) -> Vec<Neighbor> {
        let k = k.min(self.points.len());
        if k == 0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        self.search(0, self.points.len(), 0, query, k, &mut heap);

        heap.into_sorted_vec()
            .into_iter()
            .map(|c| Neighbor {
                index: c.index,
                distance: c.dist2.sqrt(),
            })
            .collect()
    }

    fn search(
        &self,
        lo: usize,
        hi: usize,
        depth: usize,
        query: &Vector3<f64>,
        k: usize,
        heap: &mut BinaryHeap<Candidate>,
    ) {
        if lo >= hi {
            return;
        }

        let mid = lo + (hi - lo) / 2;
        let index = self.order[mid];
        let point = &self.points[index];

        let candidate = Candidate {
            dist2: (point - query).norm_squared(),
            index,
        };
        if heap.len() < k {
            heap.push(candidate);
        } else if heap.peek().is_some_and(|worst| candidate < *worst) {
            heap.pop();
            heap.push(candidate);
        }

        let axis = depth % 3;
        let diff = query[axis] - point[axis];
        let (near, far) = if diff < 0.0 {
            ((lo, mid), (mid + 1, hi))
        } else {
            ((mid + 1, hi), (lo, mid))
        };

        self.search(near.0, near.1, depth + 1, query, k, heap);

        // Ties on the splitting plane must still be visited
        let visit_far =
            heap.len() < k || heap.peek().is_some_and(|worst| diff * diff <= worst.dist2);
        if visit_far {
            self.search(far.0, far.1, depth + 1, query, k, heap);
        }
    }
}
