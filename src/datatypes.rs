use std::collections::{BTreeMap, BTreeSet};

use nalgebra::Vector3;

use crate::{error::TopoError, kernel};

/// A tetrahedral solid: node coordinates and zero-based connectivity.
///
/// Both arrays are immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub nodes: Vec<Vector3<f64>>,
    pub elements: Vec<[usize; 4]>,
}

impl Mesh {
    /// Builds a mesh, checking that every element references existing nodes
    /// and has strictly positive volume.
    ///
    /// # Arguments
    /// * `nodes` - The node coordinates
    /// * `elements` - The tetrahedra, four node indices each
    ///
    /// # Returns
    /// The validated mesh
    pub fn new(nodes: Vec<Vector3<f64>>, elements: Vec<[usize; 4]>) -> Result<Mesh, TopoError> {
        if elements.is_empty() {
            return Err(TopoError::Mesh("mesh contains no elements".to_owned()));
        }

        for (e, element) in elements.iter().enumerate() {
            for &n in element {
                if n >= nodes.len() {
                    return Err(TopoError::Mesh(format!(
                        "element {e} references node {n} but the mesh has {} nodes",
                        nodes.len()
                    )));
                }
            }

            let volume = kernel::element_volume(&element.map(|n| nodes[n]));
            if !(volume > 0.0) {
                return Err(TopoError::Mesh(format!(
                    "element {e} has non-positive volume {volume}"
                )));
            }
        }

        Ok(Mesh { nodes, elements })
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_elements(&self) -> usize {
        self.elements.len()
    }

    /// Coordinates of the four corners of an element
    pub fn element_coords(&self, element: usize) -> [Vector3<f64>; 4] {
        self.elements[element].map(|n| self.nodes[n])
    }

    /// Indices of every element that touches at least one node of `nodes`.
    ///
    /// # Returns
    /// The element indices in ascending order
    pub fn elements_touching(&self, nodes: &BTreeSet<usize>) -> BTreeSet<usize> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, element)| element.iter().any(|n| nodes.contains(n)))
            .map(|(e, _)| e)
            .collect()
    }
}

/// A named distributed surface load, as tagged by the upstream meshing stage.
///
/// `reversed` carries the per-force direction flip explicitly with the
/// request.
#[derive(Debug, Clone)]
pub struct ForceSpec {
    pub id: String,
    pub nodes: BTreeSet<usize>,
    pub direction: Vector3<f64>,
    pub magnitude: f64,
    pub reversed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BoundaryConditions {
    /// Nodes with all three displacement components held at zero
    pub fixed_nodes: BTreeSet<usize>,
    /// Nodal force vectors, already distributed to node shares
    pub loads: BTreeMap<usize, Vector3<f64>>,
    /// Nodes whose adjacent elements are pinned at full density
    pub non_design_nodes: BTreeSet<usize>,
}

impl BoundaryConditions {
    /// Checks that every referenced node exists and that the problem is
    /// constrained at all.
    pub fn validate(&self, num_nodes: usize) -> Result<(), TopoError> {
        if self.fixed_nodes.is_empty() {
            return Err(TopoError::Input(
                "no fixed boundary nodes supplied".to_owned(),
            ));
        }

        let referenced = self
            .fixed_nodes
            .iter()
            .map(|n| ("fixed", n))
            .chain(self.loads.keys().map(|n| ("loaded", n)))
            .chain(self.non_design_nodes.iter().map(|n| ("non-design", n)));

        for (kind, &n) in referenced {
            if n >= num_nodes {
                return Err(TopoError::Input(format!(
                    "{kind} node {n} is out of range for a mesh with {num_nodes} nodes"
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialParameters {
    pub youngs_modulus: f64,
    pub poisson_ratio: f64,
}

impl MaterialParameters {
    pub fn validate(&self) -> Result<(), TopoError> {
        if !(self.youngs_modulus > 0.0) {
            return Err(TopoError::Input(format!(
                "youngs_modulus must be positive, got {}",
                self.youngs_modulus
            )));
        }
        if !(self.poisson_ratio > -1.0 && self.poisson_ratio < 0.5) {
            return Err(TopoError::Input(format!(
                "poisson_ratio must lie in (-1, 0.5), got {}",
                self.poisson_ratio
            )));
        }
        Ok(())
    }
}

/// Backend used for the reduced stiffness solve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinearSolverKind {
    #[default]
    Cholesky,
    ConjugateGradient,
}

impl std::str::FromStr for LinearSolverKind {
    type Err = TopoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cholesky" => Ok(LinearSolverKind::Cholesky),
            "conjugate_gradient" | "cg" => Ok(LinearSolverKind::ConjugateGradient),
            other => Err(TopoError::Input(format!(
                "Unrecognized linear solver '{other}'"
            ))),
        }
    }
}

/// Options that drive one optimization run
#[derive(Debug, Clone, PartialEq)]
pub struct SolverParameters {
    /// SIMP exponent
    pub penalty: f64,
    /// Target mean density
    pub volume_fraction: f64,
    /// Largest per-iteration density step of a single element
    pub density_change: f64,
    /// Filter radius
    pub rmin: f64,
    /// Neighbours per element in the filter, the element itself included
    pub k_neighbors: usize,
    /// Young's modulus of void material
    pub emin: f64,
    /// Relative bracket width at which the bisection stops
    pub convergence: f64,
    /// Hard cap on bisection steps per iteration
    pub max_bisection_steps: usize,
    pub iterations: usize,
    pub include_fixed: bool,
    pub include_forced: bool,
    /// Stop once the compliance plateau ratio drops below this value.
    /// `None` runs the fixed iteration count.
    pub plateau_tolerance: Option<f64>,
    pub linear_solver: LinearSolverKind,
}

impl Default for SolverParameters {
    fn default() -> Self {
        SolverParameters {
            penalty: 3.0,
            volume_fraction: 0.4,
            density_change: 0.2,
            rmin: 0.2,
            k_neighbors: 7,
            emin: 1.0,
            convergence: 0.001,
            max_bisection_steps: 200,
            iterations: 30,
            include_fixed: false,
            include_forced: false,
            plateau_tolerance: None,
            linear_solver: LinearSolverKind::Cholesky,
        }
    }
}

impl SolverParameters {
    /// Checks the options against each other and against the material.
    pub fn validate(&self, material: &MaterialParameters) -> Result<(), TopoError> {
        if !(self.volume_fraction > 0.0 && self.volume_fraction <= 1.0) {
            return Err(TopoError::Input(format!(
                "volume_fraction must lie in (0, 1], got {}",
                self.volume_fraction
            )));
        }
        if !(self.density_change > 0.0) {
            return Err(TopoError::Input(format!(
                "density_change must be positive, got {}",
                self.density_change
            )));
        }
        if !(self.rmin > 0.0) {
            return Err(TopoError::Input(format!(
                "rmin must be positive, got {}",
                self.rmin
            )));
        }
        if self.k_neighbors == 0 {
            return Err(TopoError::Input(
                "number_of_neighbours must be at least 1".to_owned(),
            ));
        }
        if !(self.penalty >= 1.0) {
            return Err(TopoError::Input(format!(
                "penalty_exponent must be at least 1, got {}",
                self.penalty
            )));
        }
        if !(self.emin >= 0.0 && self.emin < material.youngs_modulus) {
            return Err(TopoError::Input(format!(
                "emin must lie in [0, {}), got {}",
                material.youngs_modulus, self.emin
            )));
        }
        if !(self.convergence > 0.0) {
            return Err(TopoError::Input(format!(
                "convergence must be positive, got {}",
                self.convergence
            )));
        }
        if self.max_bisection_steps == 0 {
            return Err(TopoError::Input(
                "max_bisection_steps must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}
