use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use indicatif::{ProgressBar, ProgressStyle};
use nalgebra::{DVector, Vector3};
use tracing::{debug, info, warn};

use crate::{
    assembly::{Assembler, DOF},
    datatypes::{BoundaryConditions, MaterialParameters, Mesh, SolverParameters},
    error::TopoError,
    filter::NeighborFilter,
    input::Problem,
    kernel::{self, ElementMatrix},
    loads,
    solver::LinearSolver,
    update::{OptimalityCriteriaUpdater, UpdateLimits},
};

/// Iterations that must pass before the plateau test may stop a run
pub const PLATEAU_WARMUP: usize = 10;

/// Receives the results of a run as they are produced
pub trait DensitySink {
    /// Called once before the first iteration
    fn record_geometry(
        &mut self,
        _centers: &[Vector3<f64>],
        _volumes: &[f64],
    ) -> Result<(), TopoError> {
        Ok(())
    }

    /// Called with the filtered densities after each iteration; `iteration`
    /// starts at 1
    fn record(&mut self, iteration: usize, densities: &[f64]) -> Result<(), TopoError>;
}

/// Keeps every snapshot of a run in memory
#[derive(Debug, Clone, Default)]
pub struct DensityHistory {
    pub centers: Vec<Vector3<f64>>,
    pub volumes: Vec<f64>,
    pub snapshots: Vec<(usize, Vec<f64>)>,
}

impl DensityHistory {
    pub fn new() -> DensityHistory {
        DensityHistory::default()
    }

    /// Densities recorded after `iteration`
    pub fn get(&self, iteration: usize) -> Option<&[f64]> {
        self.snapshots
            .iter()
            .find(|(i, _)| *i == iteration)
            .map(|(_, d)| d.as_slice())
    }

    pub fn last(&self) -> Option<&[f64]> {
        self.snapshots.last().map(|(_, d)| d.as_slice())
    }
}

impl DensitySink for DensityHistory {
    fn record_geometry(
        &mut self,
        centers: &[Vector3<f64>],
        volumes: &[f64],
    ) -> Result<(), TopoError> {
        self.centers = centers.to_vec();
        self.volumes = volumes.to_vec();
        Ok(())
    }

    fn record(&mut self, iteration: usize, densities: &[f64]) -> Result<(), TopoError> {
        self.snapshots.push((iteration, densities.to_vec()));
        Ok(())
    }
}

/// Relative change of the compliance over the last four iterations
///
/// `|(c[-1] + c[-2] - c[-3] - c[-4]) / (c[-1] + c[-2])|`, or `None` with
/// fewer than four values or a zero denominator.
pub fn plateau_ratio(compliance: &[f64]) -> Option<f64> {
    let [.., c4, c3, c2, c1] = compliance else {
        return None;
    };
    let recent = c1 + c2;
    if recent == 0.0 {
        return None;
    }
    Some(((recent - c3 - c4) / recent).abs())
}

/// Diagnostics of one completed iteration
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iteration: usize,
    /// `F . u` at the densities the iteration started from
    pub compliance: f64,
    pub mean_density: f64,
    pub multiplier: f64,
    pub bisection_steps: usize,
    pub bisection_converged: bool,
    pub plateau_ratio: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Ran the configured number of iterations
    Completed,
    /// The compliance plateau ratio fell below the tolerance
    Plateau,
    Cancelled,
}

/// Result of an optimization run
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Densities after the last completed iteration
    pub densities: Vec<f64>,
    /// Displacement solved in the last completed iteration
    pub displacement: Option<DVector<f64>>,
    pub iterations: Vec<IterationReport>,
    pub stop_reason: StopReason,
    pub elapsed_seconds: f64,
}

impl RunSummary {
    pub fn compliance_history(&self) -> Vec<f64> {
        self.iterations.iter().map(|r| r.compliance).collect()
    }
}

/// Elements pinned at full density
///
/// Every element touching a non-design node, plus, when enabled, every
/// element touching a fixed or loaded node.
pub fn non_design_mask(
    mesh: &Mesh,
    boundary: &BoundaryConditions,
    include_fixed: bool,
    include_forced: bool,
) -> Vec<bool> {
    let mut pinned_nodes: BTreeSet<usize> = boundary.non_design_nodes.clone();
    if include_fixed {
        pinned_nodes.extend(boundary.fixed_nodes.iter().copied());
    }
    if include_forced {
        pinned_nodes.extend(loads::loaded_nodes(&boundary.loads));
    }

    let mut mask = vec![false; mesh.num_elements()];
    for e in mesh.elements_touching(&pinned_nodes) {
        mask[e] = true;
    }
    mask
}

/// Global load vector of length `3 * nq`
pub fn force_vector(num_nodes: usize, boundary: &BoundaryConditions) -> DVector<f64> {
    let mut forces = DVector::zeros(DOF * num_nodes);
    for (&node, load) in &boundary.loads {
        for axis in 0..DOF {
            forces[DOF * node + axis] = load[axis];
        }
    }
    forces
}

/// SIMP topology optimization over one mesh
///
/// Everything that does not depend on the density field is computed once in
/// [`Optimizer::new`]: volumes, centroids, the unscaled element matrices,
/// the assembly index arrays, the DOF partition and the neighbour filter.
pub struct Optimizer<'a> {
    mesh: &'a Mesh,
    material: MaterialParameters,
    params: SolverParameters,
    volumes: Vec<f64>,
    centers: Vec<Vector3<f64>>,
    element_matrices: Vec<ElementMatrix>,
    filter: NeighborFilter,
    assembler: Assembler,
    solver: LinearSolver,
    non_design: Vec<bool>,
    forces: DVector<f64>,
    show_progress: bool,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> Optimizer<'a> {
    /// Validates the inputs and precomputes the density-independent data
    ///
    /// # Arguments
    /// * `mesh` - The tetrahedral mesh
    /// * `boundary` - Fixed, loaded and non-design nodes
    /// * `material` - Solid material properties
    /// * `params` - Solver options
    pub fn new(
        mesh: &'a Mesh,
        boundary: &BoundaryConditions,
        material: MaterialParameters,
        params: SolverParameters,
    ) -> Result<Optimizer<'a>, TopoError> {
        boundary.validate(mesh.num_nodes())?;
        material.validate()?;
        params.validate(&material)?;

        let start = Instant::now();

        let volumes = kernel::element_volumes(mesh);
        let centers = kernel::element_centers(mesh);
        let element_matrices =
            kernel::element_stiffness_matrices(mesh, &volumes, 1.0, material.poisson_ratio);
        let assembler = Assembler::new(&mesh.elements, mesh.num_nodes())?;
        let solver =
            LinearSolver::new(mesh.num_nodes(), &boundary.fixed_nodes, params.linear_solver)?;
        let filter = NeighborFilter::with_radius(&centers, params.k_neighbors, params.rmin);
        let non_design =
            non_design_mask(mesh, boundary, params.include_fixed, params.include_forced);
        let forces = force_vector(mesh.num_nodes(), boundary);

        info!(
            elements = mesh.num_elements(),
            free_dofs = solver.partition().free.len(),
            non_design = non_design.iter().filter(|&&p| p).count(),
            "prepared optimization in {:.3} seconds",
            start.elapsed().as_secs_f32()
        );

        Ok(Optimizer {
            mesh,
            material,
            params,
            volumes,
            centers,
            element_matrices,
            filter,
            assembler,
            solver,
            non_design,
            forces,
            show_progress: false,
            cancel: None,
        })
    }

    /// Builds an optimizer for a parsed problem
    pub fn from_problem(problem: &'a Problem) -> Result<Optimizer<'a>, TopoError> {
        Optimizer::new(
            &problem.mesh,
            &problem.boundary,
            problem.material,
            problem.params.clone(),
        )
    }

    /// Draws a progress bar on stderr while running
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Stops the run before the next iteration once `cancel` is set
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn volumes(&self) -> &[f64] {
        &self.volumes
    }

    pub fn centers(&self) -> &[Vector3<f64>] {
        &self.centers
    }

    pub fn filter(&self) -> &NeighborFilter {
        &self.filter
    }

    pub fn non_design(&self) -> &[bool] {
        &self.non_design
    }

    pub fn params(&self) -> &SolverParameters {
        &self.params
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let bar = ProgressBar::new(self.params.iterations as u64);
        if let Ok(style) =
            ProgressStyle::with_template("{bar:40} {pos}/{len} iterations {msg} [{elapsed}]")
        {
            bar.set_style(style);
        }
        bar
    }

    /// Young's modulus of every element for a density field
    fn element_moduli(&self, densities: &[f64]) -> Vec<f64> {
        let (e0, emin, p) = (self.material.youngs_modulus, self.params.emin, self.params.penalty);
        densities
            .iter()
            .map(|rho| emin + (e0 - emin) * rho.powf(p))
            .collect()
    }

    /// Runs the optimization loop
    ///
    /// Each iteration assembles and solves the stiffness system at the
    /// current densities, then runs the optimality-criteria update and hands
    /// the filtered densities to `sink`. A sink failure is logged and the run
    /// continues; a solver failure aborts the run.
    ///
    /// # Arguments
    /// * `sink` - Receives geometry once and densities per iteration
    ///
    /// # Returns
    /// The final densities and per-iteration diagnostics
    pub fn run(&self, sink: &mut dyn DensitySink) -> Result<RunSummary, TopoError> {
        self.run_from(vec![1.0; self.mesh.num_elements()], 0, sink)
    }

    /// Continues a run from the densities saved after `start_iteration`
    ///
    /// Runs `params.iterations` further iterations numbered from
    /// `start_iteration + 1`, so a resumed run writes its snapshots after
    /// the ones it continues from. Compliance history restarts empty.
    ///
    /// # Arguments
    /// * `initial` - One density in `[0, 1]` per element
    /// * `start_iteration` - Iteration that produced `initial`
    /// * `sink` - Receives geometry once and densities per iteration
    pub fn run_from(
        &self,
        initial: Vec<f64>,
        start_iteration: usize,
        sink: &mut dyn DensitySink,
    ) -> Result<RunSummary, TopoError> {
        let start = Instant::now();
        let p = &self.params;

        if initial.len() != self.mesh.num_elements() {
            return Err(TopoError::Input(format!(
                "expected {} densities to resume from but got {}",
                self.mesh.num_elements(),
                initial.len()
            )));
        }
        if let Some(bad) = initial.iter().find(|d| !(0.0..=1.0).contains(*d)) {
            return Err(TopoError::Input(format!(
                "density {bad} to resume from is outside [0, 1]"
            )));
        }
        if start_iteration > 0 {
            info!(start_iteration, "resuming optimization");
        }

        if let Err(err) = sink.record_geometry(&self.centers, &self.volumes) {
            warn!("unable to persist element geometry: {err}");
        }

        let updater = OptimalityCriteriaUpdater {
            elements: &self.mesh.elements,
            element_matrices: &self.element_matrices,
            volumes: &self.volumes,
            filter: &self.filter,
            non_design: &self.non_design,
            penalty: p.penalty,
            e0: self.material.youngs_modulus,
            emin: p.emin,
            limits: UpdateLimits {
                volume_fraction: p.volume_fraction,
                density_change: p.density_change,
                convergence: p.convergence,
                max_steps: p.max_bisection_steps,
            },
        };

        let mut densities = initial;
        let mut displacement = None;
        let mut reports: Vec<IterationReport> = Vec::with_capacity(p.iterations);
        let mut compliance_history: Vec<f64> = Vec::with_capacity(p.iterations);
        let mut stop_reason = StopReason::Completed;

        let bar = self.progress_bar();
        for iteration in start_iteration + 1..=start_iteration + p.iterations {
            if self.cancelled() {
                info!(iteration, "optimization cancelled");
                stop_reason = StopReason::Cancelled;
                break;
            }

            let moduli = self.element_moduli(&densities);
            let values = self.assembler.scaled_values(&self.element_matrices, &moduli);
            let u = self.solver.solve(&self.assembler, &values, &self.forces)?;
            let compliance = self.forces.dot(&u);

            let outcome = updater.update(&densities, &u);
            densities = outcome.densities;
            displacement = Some(u);

            if let Err(err) = sink.record(iteration, &densities) {
                warn!(iteration, "unable to persist densities: {err}");
            }

            compliance_history.push(compliance);
            let report = IterationReport {
                iteration,
                compliance,
                mean_density: densities.iter().sum::<f64>() / densities.len() as f64,
                multiplier: outcome.bisection.multiplier,
                bisection_steps: outcome.bisection.steps,
                bisection_converged: outcome.bisection.converged,
                plateau_ratio: plateau_ratio(&compliance_history),
            };
            debug!(
                iteration,
                compliance = report.compliance,
                mean_density = report.mean_density,
                multiplier = report.multiplier,
                steps = report.bisection_steps,
                "completed iteration"
            );

            bar.inc(1);
            bar.set_message(format!("compliance {:.4e}", compliance));

            let plateaued = iteration > PLATEAU_WARMUP
                && matches!(
                    (p.plateau_tolerance, report.plateau_ratio),
                    (Some(tol), Some(ratio)) if ratio < tol
                );
            reports.push(report);

            if plateaued {
                info!(iteration, "compliance plateaued, stopping early");
                stop_reason = StopReason::Plateau;
                break;
            }
        }
        bar.finish_and_clear();

        let elapsed = start.elapsed().as_secs_f64();
        info!(
            iterations = reports.len(),
            "optimized densities in {:.3} seconds", elapsed
        );

        Ok(RunSummary {
            densities,
            displacement,
            iterations: reports,
            stop_reason,
            elapsed_seconds: elapsed,
        })
    }
}

/// Builds an optimizer for `problem` and runs it
pub fn optimize(problem: &Problem, sink: &mut dyn DensitySink) -> Result<RunSummary, TopoError> {
    Optimizer::from_problem(problem)?.run(sink)
}
