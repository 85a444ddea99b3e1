use std::collections::BTreeSet;

use nalgebra_sparse::{CooMatrix, CscMatrix};
use rayon::prelude::*;

use crate::{
    error::TopoError,
    kernel::{ElementMatrix, ELEMENT_DOF},
};

/// Displacement components per node
pub const DOF: usize = 3;

/// Triplets contributed by one element
pub const ELEMENT_ENTRIES: usize = ELEMENT_DOF * ELEMENT_DOF;

/// Global DOF indices of an element's twelve local DOFs
///
/// Node `n` owns DOFs `3n, 3n+1, 3n+2`; local DOF `3*i + a` is axis `a` of
/// corner `i`.
pub fn element_dofs(element: &[usize; 4]) -> [usize; ELEMENT_DOF] {
    let mut dofs = [0; ELEMENT_DOF];
    for (i, &node) in element.iter().enumerate() {
        for axis in 0..DOF {
            dofs[DOF * i + axis] = DOF * node + axis;
        }
    }
    dofs
}

/// Builds the row and column index arrays for triplet assembly
///
/// Entry `144*e + 12*r + c` addresses local entry `(r, c)` of element `e`.
///
/// # Arguments
/// * `elements` - The mesh connectivity
/// * `num_nodes` - The number of mesh nodes
///
/// # Returns
/// The row index array `Ig` and the column index array `Jg`, in that order
pub fn build_ig_jg(
    elements: &[[usize; 4]],
    num_nodes: usize,
) -> Result<(Vec<usize>, Vec<usize>), TopoError> {
    let mut ig: Vec<usize> = Vec::with_capacity(ELEMENT_ENTRIES * elements.len());
    let mut jg: Vec<usize> = Vec::with_capacity(ELEMENT_ENTRIES * elements.len());

    for (e, element) in elements.iter().enumerate() {
        if let Some(n) = element.iter().find(|&&n| n >= num_nodes) {
            return Err(TopoError::Mesh(format!(
                "element {e} references node {n} but the mesh has {num_nodes} nodes"
            )));
        }

        let dofs = element_dofs(element);
        for row in dofs {
            for col in dofs {
                ig.push(row);
                jg.push(col);
            }
        }
    }

    Ok((ig, jg))
}

/// Split of the global DOFs into constrained and unconstrained sets
#[derive(Debug, Clone)]
pub struct DofPartition {
    /// Unconstrained global DOFs in ascending order
    pub free: Vec<usize>,
    /// All three DOFs of every fixed node
    pub fixed: Vec<usize>,
    /// Position of each global DOF within `free`, if free
    reduced_index: Vec<Option<usize>>,
}

impl DofPartition {
    pub fn new(num_nodes: usize, fixed_nodes: &BTreeSet<usize>) -> DofPartition {
        let num_dofs = DOF * num_nodes;
        let mut free = Vec::with_capacity(num_dofs);
        let mut fixed = Vec::with_capacity(DOF * fixed_nodes.len());
        let mut reduced_index = vec![None; num_dofs];

        for dof in 0..num_dofs {
            if fixed_nodes.contains(&(dof / DOF)) {
                fixed.push(dof);
            } else {
                reduced_index[dof] = Some(free.len());
                free.push(dof);
            }
        }

        DofPartition {
            free,
            fixed,
            reduced_index,
        }
    }

    pub fn num_dofs(&self) -> usize {
        self.reduced_index.len()
    }

    pub fn reduced_index(&self, dof: usize) -> Option<usize> {
        self.reduced_index[dof]
    }
}

/// Sparse assembler over a fixed connectivity
///
/// The index arrays are built once per mesh; every call only supplies new
/// element values.
#[derive(Debug, Clone)]
pub struct Assembler {
    ig: Vec<usize>,
    jg: Vec<usize>,
    num_dofs: usize,
}

impl Assembler {
    pub fn new(elements: &[[usize; 4]], num_nodes: usize) -> Result<Assembler, TopoError> {
        let (ig, jg) = build_ig_jg(elements, num_nodes)?;

        Ok(Assembler {
            ig,
            jg,
            num_dofs: DOF * num_nodes,
        })
    }

    pub fn num_dofs(&self) -> usize {
        self.num_dofs
    }

    /// Flattens `youngs[e] * element_matrices[e]` into the triplet value
    /// array matching the stored row and column indices.
    ///
    /// # Arguments
    /// * `element_matrices` - Unscaled element stiffness matrices
    /// * `youngs` - Young's modulus of each element
    ///
    /// # Returns
    /// A vector of `144 * nme` values
    pub fn scaled_values(&self, element_matrices: &[ElementMatrix], youngs: &[f64]) -> Vec<f64> {
        let mut values = vec![0.0; self.ig.len()];

        values
            .par_chunks_mut(ELEMENT_ENTRIES)
            .zip(element_matrices.par_iter().zip(youngs.par_iter()))
            .for_each(|(chunk, (ke, &e_modulus))| {
                for row in 0..ELEMENT_DOF {
                    for col in 0..ELEMENT_DOF {
                        chunk[ELEMENT_DOF * row + col] = e_modulus * ke[(row, col)];
                    }
                }
            });

        values
    }

    /// Assembles the full `3nq x 3nq` stiffness matrix; entries sharing a
    /// `(row, col)` pair are summed.
    pub fn global_matrix(&self, values: &[f64]) -> Result<CscMatrix<f64>, TopoError> {
        let coo = CooMatrix::try_from_triplets(
            self.num_dofs,
            self.num_dofs,
            self.ig.clone(),
            self.jg.clone(),
            values.to_vec(),
        )
        .map_err(|err| TopoError::Mesh(format!("Unable to assemble stiffness matrix: {err}")))?;

        Ok(CscMatrix::from(&coo))
    }

    /// Assembles the stiffness matrix restricted to the free DOFs, indexed
    /// by position within `partition.free`.
    pub fn reduced_matrix(
        &self,
        values: &[f64],
        partition: &DofPartition,
    ) -> Result<CscMatrix<f64>, TopoError> {
        let n = partition.free.len();
        let mut rows: Vec<usize> = Vec::with_capacity(values.len());
        let mut cols: Vec<usize> = Vec::with_capacity(values.len());
        let mut vals: Vec<f64> = Vec::with_capacity(values.len());

        for ((&i, &j), &v) in self.ig.iter().zip(&self.jg).zip(values) {
            if let (Some(r), Some(c)) = (partition.reduced_index(i), partition.reduced_index(j)) {
                rows.push(r);
                cols.push(c);
                vals.push(v);
            }
        }

        let coo = CooMatrix::try_from_triplets(n, n, rows, cols, vals).map_err(|err| {
            TopoError::Mesh(format!("Unable to assemble reduced stiffness matrix: {err}"))
        })?;

        Ok(CscMatrix::from(&coo))
    }
}
