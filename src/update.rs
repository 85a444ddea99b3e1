use nalgebra::{DVector, SVector};
use rayon::prelude::*;
use tracing::warn;

use crate::{
    assembly::element_dofs,
    filter::NeighborFilter,
    kernel::{ElementMatrix, ELEMENT_DOF},
};

/// Initial bracket of the volume-constraint multiplier
pub const MULTIPLIER_LOWER: f64 = 0.001;
pub const MULTIPLIER_UPPER: f64 = 1e9;

/// Compliance sensitivity of every element
///
/// `s_e = -p * (E0 - Emin) * 0.5 * E0 / V_e * rho_e^(p-1) * (u_e^T K_e u_e)`
/// with `K_e` the unscaled element stiffness.
///
/// # Arguments
/// * `elements` - The mesh connectivity
/// * `element_matrices` - Unscaled element stiffness matrices
/// * `volumes` - Element volumes
/// * `displacement` - The global displacement vector
/// * `densities` - Current element densities
/// * `penalty` - The SIMP exponent
/// * `e0` - Young's modulus of solid material
/// * `emin` - Young's modulus of void material
///
/// # Returns
/// One sensitivity per element
#[allow(clippy::too_many_arguments)]
pub fn element_sensitivities(
    elements: &[[usize; 4]],
    element_matrices: &[ElementMatrix],
    volumes: &[f64],
    displacement: &DVector<f64>,
    densities: &[f64],
    penalty: f64,
    e0: f64,
    emin: f64,
) -> Vec<f64> {
    (0..elements.len())
        .into_par_iter()
        .map(|e| {
            let dofs = element_dofs(&elements[e]);
            let ue = SVector::<f64, ELEMENT_DOF>::from_fn(|i, _| displacement[dofs[i]]);
            let strain_energy = ue.dot(&(element_matrices[e] * ue));

            let prefactor = -penalty * (e0 - emin) * 0.5 * e0 * (1.0 / volumes[e]);
            prefactor * densities[e].powf(penalty - 1.0) * strain_energy
        })
        .collect()
}

/// Result of the multiplier bisection
#[derive(Debug, Clone)]
pub struct BisectionOutcome {
    /// Candidate densities at the last trial multiplier
    pub densities: Vec<f64>,
    pub multiplier: f64,
    pub steps: usize,
    /// False when the step cap was reached before the bracket closed
    pub converged: bool,
}

/// Limits on the density update
#[derive(Debug, Clone, Copy)]
pub struct UpdateLimits {
    pub volume_fraction: f64,
    pub density_change: f64,
    pub convergence: f64,
    pub max_steps: usize,
}

/// Candidate density of one element for a trial multiplier
///
/// `rho * sqrt(-s / lambda)`, clipped to within `density_change` of `rho`
/// and then to `[0, 1]`. Positive sensitivities, which filtering round-off
/// can produce, count as zero.
fn candidate_density(density: f64, sensitivity: f64, multiplier: f64, density_change: f64) -> f64 {
    let trial = density * ((-sensitivity).max(0.0) / multiplier).sqrt();
    trial
        .min(density + density_change)
        .min(1.0)
        .max(density - density_change)
        .max(0.0)
}

/// Bisects the volume-constraint multiplier
///
/// A mean candidate density above the target raises the lower bracket bound,
/// otherwise the upper bound drops. The search stops once
/// `(hi - lo) / (hi + lo)` is within `limits.convergence`, or after
/// `limits.max_steps` trials.
///
/// # Arguments
/// * `densities` - Current element densities
/// * `sensitivity` - Filtered sensitivities
/// * `non_design` - Elements pinned at full density
/// * `limits` - Volume target and step limits
///
/// # Returns
/// The candidate field at the last trial multiplier
pub fn bisect_densities(
    densities: &[f64],
    sensitivity: &[f64],
    non_design: &[bool],
    limits: &UpdateLimits,
) -> BisectionOutcome {
    let mut lo = MULTIPLIER_LOWER;
    let mut hi = MULTIPLIER_UPPER;
    let mut mid = 0.5 * (lo + hi);
    let mut candidate = densities.to_vec();
    let mut steps = 0;
    let mut converged = true;

    while (hi - lo) / (hi + lo) > limits.convergence {
        if steps == limits.max_steps {
            converged = false;
            warn!(
                steps,
                lower = lo,
                upper = hi,
                "multiplier bisection hit its step limit, keeping last candidate"
            );
            break;
        }

        mid = 0.5 * (hi + lo);
        candidate = densities
            .par_iter()
            .zip(sensitivity.par_iter())
            .zip(non_design.par_iter())
            .map(|((&d, &s), &pinned)| {
                if pinned {
                    1.0
                } else {
                    candidate_density(d, s, mid, limits.density_change)
                }
            })
            .collect();

        let mean = candidate.iter().sum::<f64>() / candidate.len() as f64;
        if mean > limits.volume_fraction {
            lo = mid;
        } else {
            hi = mid;
        }
        steps += 1;
    }

    BisectionOutcome {
        densities: candidate,
        multiplier: mid,
        steps,
        converged,
    }
}

/// One density update, from displacements to the next filtered field
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub sensitivity: Vec<f64>,
    pub filtered_sensitivity: Vec<f64>,
    pub bisection: BisectionOutcome,
    /// Filtered densities for the next iteration
    pub densities: Vec<f64>,
}

/// Optimality-criteria density update over a fixed mesh and filter
pub struct OptimalityCriteriaUpdater<'a> {
    pub elements: &'a [[usize; 4]],
    pub element_matrices: &'a [ElementMatrix],
    pub volumes: &'a [f64],
    pub filter: &'a NeighborFilter,
    pub non_design: &'a [bool],
    pub penalty: f64,
    pub e0: f64,
    pub emin: f64,
    pub limits: UpdateLimits,
}

impl<'a> OptimalityCriteriaUpdater<'a> {
    /// Runs sensitivity analysis, sensitivity filtering, bisection and
    /// density filtering for one iteration.
    ///
    /// # Arguments
    /// * `densities` - Densities the displacement was solved with
    /// * `displacement` - The global displacement vector
    pub fn update(&self, densities: &[f64], displacement: &DVector<f64>) -> UpdateOutcome {
        let sensitivity = element_sensitivities(
            self.elements,
            self.element_matrices,
            self.volumes,
            displacement,
            densities,
            self.penalty,
            self.e0,
            self.emin,
        );

        let filtered_sensitivity = self.filter.apply_sensitivity(densities, &sensitivity);
        let bisection = bisect_densities(
            densities,
            &filtered_sensitivity,
            self.non_design,
            &self.limits,
        );
        let next = self.filter.apply(&bisection.densities);

        UpdateOutcome {
            sensitivity,
            filtered_sensitivity,
            bisection,
            densities: next,
        }
    }
}
