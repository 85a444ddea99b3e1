//! SIMP topology optimization over linear tetrahedral meshes.
//!
//! A run assembles the elastic stiffness of a tetrahedral solid, solves for
//! nodal displacements, and redistributes per-element density with an
//! optimality-criteria update under a volume budget.

pub mod assembly;
pub mod datatypes;
pub mod error;
pub mod filter;
pub mod input;
pub mod kdtree;
pub mod kernel;
pub mod loads;
pub mod materials;
pub mod optimizer;
pub mod output;
pub mod solver;
pub mod update;

pub use datatypes::{
    BoundaryConditions, ForceSpec, LinearSolverKind, MaterialParameters, Mesh, SolverParameters,
};
pub use error::TopoError;
pub use input::Problem;
pub use optimizer::{optimize, DensityHistory, DensitySink, Optimizer, RunSummary, StopReason};
