use nalgebra::Vector3;
use rayon::prelude::*;
use tracing::warn;

use crate::kdtree::KdTree;

/// Smallest denominator used when normalizing a filtered value.
///
/// Keeps isolated or near-void neighbourhoods from dividing by a vanishing
/// weight sum.
pub const MIN_FILTER_MASS: f64 = 0.001;

/// Distance-weighted averaging over the `k` nearest element centroids
///
/// The neighbour lists are computed once from the immutable centroids and
/// shared by every filtering pass of a run.
#[derive(Debug, Clone)]
pub struct NeighborFilter {
    k: usize,
    /// `k` neighbour indices per element, row-major, nearest first
    neighbors: Vec<usize>,
    distances: Vec<f64>,
    /// `max(0, rmin - distance)` per neighbour pair
    weights: Vec<f64>,
    weight_sums: Vec<f64>,
}

impl NeighborFilter {
    /// Finds the `k` nearest neighbours of every centroid, the centroid
    /// itself included.
    ///
    /// `k` is clamped to the number of elements. Weights are zero until
    /// [`NeighborFilter::compute_weights`] is called.
    ///
    /// # Arguments
    /// * `centers` - Element centroids
    /// * `k` - Neighbours per element
    pub fn build(centers: &[Vector3<f64>], k: usize) -> NeighborFilter {
        let k = if k > centers.len() {
            warn!(
                requested = k,
                elements = centers.len(),
                "number_of_neighbours exceeds element count, clamping"
            );
            centers.len()
        } else {
            k
        };

        let tree = KdTree::build(centers);
        let per_element: Vec<Vec<(usize, f64)>> = centers
            .par_iter()
            .map(|c| {
                tree.nearest(c, k)
                    .into_iter()
                    .map(|n| (n.index, n.distance))
                    .collect()
            })
            .collect();

        let mut neighbors = Vec::with_capacity(k * centers.len());
        let mut distances = Vec::with_capacity(k * centers.len());
        for row in per_element {
            for (index, distance) in row {
                neighbors.push(index);
                distances.push(distance);
            }
        }

        NeighborFilter {
            k,
            neighbors,
            distances,
            weights: vec![0.0; k * centers.len()],
            weight_sums: vec![0.0; centers.len()],
        }
    }

    /// Builds the neighbour lists and their weights for filter radius `rmin`
    pub fn with_radius(centers: &[Vector3<f64>], k: usize, rmin: f64) -> NeighborFilter {
        let mut filter = NeighborFilter::build(centers, k);
        filter.compute_weights(rmin);
        filter
    }

    /// Sets every pair weight to `max(0, rmin - distance)` and recomputes the
    /// per-element weight sums.
    pub fn compute_weights(&mut self, rmin: f64) {
        for (w, d) in self.weights.iter_mut().zip(&self.distances) {
            *w = (rmin - d).max(0.0);
        }
        for (sum, row) in self.weight_sums.iter_mut().zip(self.weights.chunks(self.k)) {
            *sum = row.iter().sum();
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn num_elements(&self) -> usize {
        self.weight_sums.len()
    }

    pub fn neighbors(&self, element: usize) -> &[usize] {
        &self.neighbors[element * self.k..(element + 1) * self.k]
    }

    pub fn weights(&self, element: usize) -> &[f64] {
        &self.weights[element * self.k..(element + 1) * self.k]
    }

    pub fn weight_sum(&self, element: usize) -> f64 {
        self.weight_sums[element]
    }

    /// Filters a per-element field
    ///
    /// Element `i` becomes `sum_j(w_ij * field[n_ij]) / W_i`, with `W_i`
    /// raised to [`MIN_FILTER_MASS`] when smaller.
    ///
    /// # Arguments
    /// * `field` - One value per element
    ///
    /// # Returns
    /// The filtered field
    pub fn apply(&self, field: &[f64]) -> Vec<f64> {
        (0..self.num_elements())
            .into_par_iter()
            .map(|i| {
                let total: f64 = self
                    .weights(i)
                    .iter()
                    .zip(self.neighbors(i))
                    .map(|(w, &j)| w * field[j])
                    .sum();
                total / self.weight_sum(i).max(MIN_FILTER_MASS)
            })
            .collect()
    }

    /// Density-weighted sensitivity filter
    ///
    /// Element `i` becomes
    /// `sum_j(w_ij * rho[n_ij] * s[n_ij]) / max(MIN_FILTER_MASS, rho_i * W_i)`.
    ///
    /// # Arguments
    /// * `densities` - Current element densities
    /// * `sensitivity` - Raw compliance sensitivities
    ///
    /// # Returns
    /// The filtered sensitivities
    pub fn apply_sensitivity(&self, densities: &[f64], sensitivity: &[f64]) -> Vec<f64> {
        (0..self.num_elements())
            .into_par_iter()
            .map(|i| {
                let total: f64 = self
                    .weights(i)
                    .iter()
                    .zip(self.neighbors(i))
                    .map(|(w, &j)| w * densities[j] * sensitivity[j])
                    .sum();
                total / (densities[i] * self.weight_sum(i)).max(MIN_FILTER_MASS)
            })
            .collect()
    }
}
