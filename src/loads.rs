use std::collections::{BTreeMap, BTreeSet};

use nalgebra::Vector3;
use tracing::debug;

use crate::{
    datatypes::{ForceSpec, Mesh},
    error::TopoError,
};

/// Corner triples of the four faces of a tetrahedron
const FACE_TAGS: [[usize; 3]; 4] = [[0, 1, 2], [0, 3, 1], [1, 3, 2], [2, 3, 0]];

/// Calculates the area of a triangle
pub fn triangle_area(a: &Vector3<f64>, b: &Vector3<f64>, c: &Vector3<f64>) -> f64 {
    0.5 * (b - a).cross(&(c - a)).norm()
}

/// Finds the boundary faces of a tetrahedral mesh
///
/// A face is on the boundary when exactly one element owns it.
///
/// # Returns
/// Boundary faces as sorted node triples, in ascending order
pub fn surface_faces(elements: &[[usize; 4]]) -> Vec<[usize; 3]> {
    let mut counts: BTreeMap<[usize; 3], usize> = BTreeMap::new();

    for element in elements {
        for tag in FACE_TAGS {
            let mut face = tag.map(|i| element[i]);
            face.sort_unstable();
            *counts.entry(face).or_insert(0) += 1;
        }
    }

    counts
        .into_iter()
        .filter(|(_, count)| *count == 1)
        .map(|(face, _)| face)
        .collect()
}

/// Distributes one surface force to node shares
///
/// Every boundary face whose nodes all belong to the force's node set
/// carries `magnitude / total_area` per unit area; a face passes a third of
/// its share to each of its nodes.
///
/// # Arguments
/// * `mesh` - The mesh
/// * `surface` - Boundary faces, as returned by [`surface_faces`]
/// * `force` - The force to distribute
///
/// # Returns
/// Nodal force vectors keyed by node index
pub fn distribute_force(
    mesh: &Mesh,
    surface: &[[usize; 3]],
    force: &ForceSpec,
) -> Result<BTreeMap<usize, Vector3<f64>>, TopoError> {
    let direction_norm = force.direction.norm();
    if !(direction_norm > 0.0) {
        return Err(TopoError::Input(format!(
            "Force '{}' has a zero direction vector",
            force.id
        )));
    }

    let mut direction = force.direction / direction_norm;
    if force.reversed {
        direction = -direction;
    }

    let loaded: Vec<(&[usize; 3], f64)> = surface
        .iter()
        .filter(|face| face.iter().all(|n| force.nodes.contains(n)))
        .map(|face| {
            let [a, b, c] = face.map(|n| mesh.nodes[n]);
            (face, triangle_area(&a, &b, &c))
        })
        .collect();

    let total_area: f64 = loaded.iter().map(|(_, area)| area).sum();
    if loaded.is_empty() || !(total_area > 0.0) {
        return Err(TopoError::Input(format!(
            "Force '{}' does not cover any boundary face",
            force.id
        )));
    }

    let force_per_area = force.magnitude / total_area;
    let mut node_loads: BTreeMap<usize, Vector3<f64>> = BTreeMap::new();
    for (face, area) in &loaded {
        let share = force_per_area * area / 3.0;
        for &n in face.iter() {
            *node_loads.entry(n).or_insert_with(Vector3::zeros) += share * direction;
        }
    }

    debug!(
        force = force.id.as_str(),
        faces = loaded.len(),
        area = total_area,
        nodes = node_loads.len(),
        "distributed surface force"
    );

    Ok(node_loads)
}

/// Distributes every force and sums the contributions per node
pub fn distribute_loads(
    mesh: &Mesh,
    forces: &[ForceSpec],
) -> Result<BTreeMap<usize, Vector3<f64>>, TopoError> {
    let surface = surface_faces(&mesh.elements);
    let mut loads: BTreeMap<usize, Vector3<f64>> = BTreeMap::new();

    for force in forces {
        if let Some(n) = force.nodes.iter().find(|&&n| n >= mesh.num_nodes()) {
            return Err(TopoError::Input(format!(
                "Force '{}' references node {n} but the mesh has {} nodes",
                force.id,
                mesh.num_nodes()
            )));
        }

        for (node, f) in distribute_force(mesh, &surface, force)? {
            *loads.entry(node).or_insert_with(Vector3::zeros) += f;
        }
    }

    Ok(loads)
}

/// Nodes that carry any load
pub fn loaded_nodes(loads: &BTreeMap<usize, Vector3<f64>>) -> BTreeSet<usize> {
    loads.keys().copied().collect()
}
