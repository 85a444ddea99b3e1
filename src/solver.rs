use std::collections::BTreeSet;

use argmin::{
    core::{
        observers::{Observe, ObserverMode},
        Error, Executor, Operator, State, KV,
    },
    solver::conjugategradient::ConjugateGradient,
};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{factorization::CscCholesky, CscMatrix};
use tracing::{debug, trace};

use crate::{
    assembly::{Assembler, DofPartition},
    datatypes::LinearSolverKind,
    error::TopoError,
};

pub const MAX_CG_ITER: u64 = 100_000;
/// Conjugate gradient stops once the residual norm falls below this
/// fraction of the load norm
pub const CG_RELATIVE_TOLERANCE: f64 = 1e-10;
/// Residual accepted after the conjugate gradient run, relative to the load
pub const CG_ACCEPT_TOLERANCE: f64 = 1e-6;
/// Cholesky pivots below this fraction of the largest diagonal entry are
/// treated as rigid-body modes
pub const PIVOT_TOLERANCE: f64 = 1e-13;

/// Runs multiplication for Conjugate Gradient Solver
struct ConjugateGradientOperator<'a> {
    a: &'a CscMatrix<f64>,
}

impl<'a> Operator for ConjugateGradientOperator<'a> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, x: &Self::Param) -> Result<Self::Output, Error> {
        Ok(csc_mul(self.a, x))
    }
}

/// Observer that traces the residual of each conjugate gradient step
struct ConjugateGradientObserver;

impl<I> Observe<I> for ConjugateGradientObserver
where
    I: State,
{
    fn observe_init(&mut self, _name: &str, _state: &I, _kv: &KV) -> Result<(), Error> {
        Ok(())
    }

    fn observe_iter(&mut self, state: &I, _kv: &KV) -> Result<(), Error> {
        trace!(
            iteration = state.get_iter(),
            squared_residual = ?state.get_cost(),
            "conjugate gradient step"
        );
        Ok(())
    }

    fn observe_final(&mut self, state: &I) -> Result<(), Error> {
        debug!(
            iterations = state.get_iter(),
            squared_residual = ?state.get_best_cost(),
            "conjugate gradient finished"
        );
        Ok(())
    }
}

/// Sparse matrix times dense vector
fn csc_mul(a: &CscMatrix<f64>, x: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; a.nrows()];
    for (j, col) in a.col_iter().enumerate() {
        let xj = x[j];
        for (&i, &v) in col.row_indices().iter().zip(col.values()) {
            y[i] += v * xj;
        }
    }
    y
}

/// Solves a system of equations using the conjugate gradient method.
///
/// This function returns an approximation for x in `Ax=b`, and fails if the
/// final residual is not small relative to `b`.
///
/// # Arguments
/// * `a` - A square positive definite matrix
/// * `b` - A vector of the solutions to the system
///
/// # Returns
/// A DVector that represents `x` from the system
pub fn run_conjugate_gradient(
    a: &CscMatrix<f64>,
    b: &DVector<f64>,
) -> Result<DVector<f64>, TopoError> {
    let b_norm = b.norm();
    if b_norm == 0.0 {
        return Ok(DVector::zeros(b.nrows()));
    }

    let b_flat: Vec<f64> = b.iter().copied().collect();
    let solver: ConjugateGradient<_, f64> = ConjugateGradient::new(b_flat);
    let initial_guess: Vec<f64> = vec![0.0; b.nrows()];

    let operator = ConjugateGradientOperator { a };

    let res = Executor::new(operator, solver)
        .configure(|state| {
            state
                .param(initial_guess)
                .max_iters(MAX_CG_ITER)
                // The solver's cost is the squared residual norm
                .target_cost((CG_RELATIVE_TOLERANCE * b_norm).powi(2))
        })
        .add_observer(ConjugateGradientObserver, ObserverMode::Always)
        .run()
        .map_err(|err| TopoError::Solver(format!("Conjugate Gradient error: {err}")))?;

    let x = match res.state().get_best_param() {
        Some(vec) => DVector::from_vec(vec.clone()),
        None => {
            return Err(TopoError::Solver(
                "Conjugate Gradient could not produce best parameter".to_owned(),
            ))
        }
    };

    let ax = DVector::from_vec(csc_mul(a, x.as_slice()));
    let residual = (b - ax).norm() / b_norm;
    if !residual.is_finite() || residual > CG_ACCEPT_TOLERANCE {
        return Err(TopoError::Solver(format!(
            "Conjugate Gradient did not converge (relative residual {residual:.3e}); \
             the reduced stiffness matrix is likely singular"
        )));
    }

    Ok(x)
}

/// Solves `Ax=b` by sparse Cholesky factorization.
///
/// Fails when `a` is not positive definite, including the semi-definite case
/// left by unconstrained rigid-body motion, which shows up as a vanishing
/// pivot.
///
/// # Arguments
/// * `a` - A square symmetric matrix
/// * `b` - The right-hand side
///
/// # Returns
/// The solution vector
pub fn solve_cholesky(a: &CscMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, TopoError> {
    let cholesky = CscCholesky::factor(a).map_err(|_| {
        TopoError::Solver(
            "reduced stiffness matrix is not positive definite; \
             check that the fixed nodes prevent rigid-body motion"
                .to_owned(),
        )
    })?;

    let max_diagonal = a
        .triplet_iter()
        .filter(|(i, j, _)| i == j)
        .map(|(_, _, v)| v.abs())
        .fold(0.0, f64::max);
    let min_pivot = cholesky
        .l()
        .triplet_iter()
        .filter(|(i, j, _)| i == j)
        .map(|(_, _, v)| v * v)
        .fold(f64::INFINITY, f64::min);

    if !(min_pivot > PIVOT_TOLERANCE * max_diagonal) {
        return Err(TopoError::Solver(format!(
            "reduced stiffness matrix is singular (pivot {min_pivot:.3e} against diagonal \
             {max_diagonal:.3e}); check for unconstrained rigid-body motion or a \
             disconnected mesh component"
        )));
    }

    let rhs = DMatrix::from_column_slice(b.nrows(), 1, b.as_slice());
    let x = cholesky.solve(&rhs);
    let x = DVector::from_column_slice(x.as_slice());

    if x.iter().any(|v| !v.is_finite()) {
        return Err(TopoError::Solver(
            "Cholesky solve produced non-finite displacements".to_owned(),
        ));
    }

    Ok(x)
}

/// Solves for nodal displacements with the fixed DOFs held at zero
#[derive(Debug, Clone)]
pub struct LinearSolver {
    partition: DofPartition,
    kind: LinearSolverKind,
}

impl LinearSolver {
    /// # Arguments
    /// * `num_nodes` - The number of mesh nodes
    /// * `fixed_nodes` - Nodes constrained in all three axes
    /// * `kind` - The backend for the reduced solve
    pub fn new(
        num_nodes: usize,
        fixed_nodes: &BTreeSet<usize>,
        kind: LinearSolverKind,
    ) -> Result<LinearSolver, TopoError> {
        if fixed_nodes.is_empty() {
            return Err(TopoError::Solver(
                "no fixed boundary nodes supplied; the stiffness matrix is singular".to_owned(),
            ));
        }
        if let Some(n) = fixed_nodes.iter().find(|&&n| n >= num_nodes) {
            return Err(TopoError::Solver(format!(
                "fixed node {n} is out of range for a mesh with {num_nodes} nodes"
            )));
        }

        Ok(LinearSolver {
            partition: DofPartition::new(num_nodes, fixed_nodes),
            kind,
        })
    }

    pub fn partition(&self) -> &DofPartition {
        &self.partition
    }

    /// Assembles `K[free, free]` from scaled element values and solves
    /// `K[free, free] u[free] = F[free]`.
    ///
    /// # Arguments
    /// * `assembler` - Index arrays for the mesh
    /// * `values` - Scaled triplet values, see [`Assembler::scaled_values`]
    /// * `forces` - The global load vector, length `3 * nq`
    ///
    /// # Returns
    /// The global displacement vector with zeros at the fixed DOFs
    pub fn solve(
        &self,
        assembler: &Assembler,
        values: &[f64],
        forces: &DVector<f64>,
    ) -> Result<DVector<f64>, TopoError> {
        let stiffness = assembler.reduced_matrix(values, &self.partition)?;
        let reduced_forces = DVector::from_iterator(
            self.partition.free.len(),
            self.partition.free.iter().map(|&d| forces[d]),
        );

        let reduced_displacement = match self.kind {
            LinearSolverKind::Cholesky => solve_cholesky(&stiffness, &reduced_forces)?,
            LinearSolverKind::ConjugateGradient => {
                run_conjugate_gradient(&stiffness, &reduced_forces)?
            }
        };

        let mut displacement = DVector::zeros(self.partition.num_dofs());
        for (&dof, &u) in self.partition.free.iter().zip(reduced_displacement.iter()) {
            displacement[dof] = u;
        }

        Ok(displacement)
    }
}
