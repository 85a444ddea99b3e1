use nalgebra::{SMatrix, Vector3};
use rayon::prelude::*;

use crate::datatypes::Mesh;

/// Local degrees of freedom of a linear tetrahedron
pub const ELEMENT_DOF: usize = 12;

/// One column per corner node; rows are the x, y, z components
pub type GradientMatrix = SMatrix<f64, 3, 4>;

pub type ElementMatrix = SMatrix<f64, ELEMENT_DOF, ELEMENT_DOF>;

/// Calculates the signed volume of a tetrahedron
///
/// Equivalent to `det([1 x y z])/6` over the four corners; positive for a
/// right-handed corner ordering.
///
/// # Arguments
/// * `coords` - The four corner coordinates
///
/// # Returns
/// The signed volume
pub fn element_volume(coords: &[Vector3<f64>; 4]) -> f64 {
    let e1 = coords[1] - coords[0];
    let e2 = coords[2] - coords[0];
    let e3 = coords[3] - coords[0];

    e1.dot(&e2.cross(&e3)) / 6.0
}

/// Calculates the centroid of a tetrahedron
pub fn element_center(coords: &[Vector3<f64>; 4]) -> Vector3<f64> {
    0.25 * (coords[0] + coords[1] + coords[2] + coords[3])
}

/// Signed volume of every element of the mesh
pub fn element_volumes(mesh: &Mesh) -> Vec<f64> {
    (0..mesh.num_elements())
        .into_par_iter()
        .map(|e| element_volume(&mesh.element_coords(e)))
        .collect()
}

/// Centroid of every element of the mesh
pub fn element_centers(mesh: &Mesh) -> Vec<Vector3<f64>> {
    (0..mesh.num_elements())
        .into_par_iter()
        .map(|e| element_center(&mesh.element_coords(e)))
        .collect()
}

/// Calculates the shape-function gradient operator of a tetrahedron
///
/// Each column is the cross product of two edge-difference vectors opposite
/// the corresponding node, normalized by `6*sqrt(volume)`. A zero or negative
/// volume yields non-finite entries.
///
/// # Arguments
/// * `coords` - The four corner coordinates
/// * `volume` - The element volume
///
/// # Returns
/// A 3x4 gradient matrix
pub fn gradient_matrix(coords: &[Vector3<f64>; 4], volume: f64) -> GradientMatrix {
    let d12 = coords[0] - coords[1];
    let d13 = coords[0] - coords[2];
    let d14 = coords[0] - coords[3];
    let d23 = coords[1] - coords[2];
    let d24 = coords[1] - coords[3];

    let mut g = GradientMatrix::zeros();

    g[(0, 0)] = d23.z * d24.y - d23.y * d24.z;
    g[(1, 0)] = d23.x * d24.z - d23.z * d24.x;
    g[(2, 0)] = d23.y * d24.x - d23.x * d24.y;

    g[(0, 1)] = d13.y * d14.z - d13.z * d14.y;
    g[(1, 1)] = d13.z * d14.x - d13.x * d14.z;
    g[(2, 1)] = d13.x * d14.y - d13.y * d14.x;

    g[(0, 2)] = d12.z * d14.y - d12.y * d14.z;
    g[(1, 2)] = d12.x * d14.z - d12.z * d14.x;
    g[(2, 2)] = d12.y * d14.x - d12.x * d14.y;

    g[(0, 3)] = d12.y * d13.z - d12.z * d13.y;
    g[(1, 3)] = d12.z * d13.x - d12.x * d13.z;
    g[(2, 3)] = d12.x * d13.y - d12.y * d13.x;

    g /= 6.0 * volume.sqrt();

    g
}

/// Computes the stiffness matrix of a linear tetrahedron in closed form
///
/// Local DOF `3*i + a` is axis `a` of corner `i`. With `g_i` the gradient
/// column of corner `i`, the entries of the isotropic bilinear form are
///
/// * same corner, same axis: `(la + mu)*g_ia*g_ia + mu*|g_i|^2`
/// * same corner, axes `a < b`: `(la + mu)*g_ia*g_ib`
/// * corners `i < j`, same axis: `(la + mu)*g_ia*g_ja + mu*(g_i . g_j)`
/// * corners `i < j`, axes `a != b`: `la*g_ia*g_jb + mu*g_ib*g_ja`
///
/// Only the upper triangle is evaluated; the lower triangle is a copy, so
/// mirrored entries are bit-identical.
///
/// # Arguments
/// * `g` - The element gradient matrix
/// * `la` - The first Lame parameter
/// * `mu` - The second Lame parameter
///
/// # Returns
/// A symmetric 12x12 stiffness matrix
pub fn element_stiffness(g: &GradientMatrix, la: f64, mu: f64) -> ElementMatrix {
    let mut k = ElementMatrix::zeros();

    for row in 0..ELEMENT_DOF {
        let (i, a) = (row / 3, row % 3);

        for col in row..ELEMENT_DOF {
            let (j, b) = (col / 3, col % 3);

            let value = if a == b {
                let t1 = g[(0, i)] * g[(0, j)];
                let t2 = g[(1, i)] * g[(1, j)];
                let t3 = g[(2, i)] * g[(2, j)];
                let c = mu * (t1 + t2 + t3);
                (la + mu) * (g[(a, i)] * g[(a, j)]) + c
            } else if i == j {
                (la + mu) * g[(a, i)] * g[(b, i)]
            } else {
                la * (g[(a, i)] * g[(b, j)]) + mu * (g[(b, i)] * g[(a, j)])
            };

            k[(row, col)] = value;
            k[(col, row)] = value;
        }
    }

    k
}

/// Builds the unscaled stiffness matrix of every element
///
/// # Arguments
/// * `mesh` - The mesh
/// * `volumes` - Element volumes, as returned by [`element_volumes`]
/// * `la` - The first Lame parameter
/// * `mu` - The second Lame parameter
///
/// # Returns
/// One 12x12 matrix per element, in element order
pub fn element_stiffness_matrices(
    mesh: &Mesh,
    volumes: &[f64],
    la: f64,
    mu: f64,
) -> Vec<ElementMatrix> {
    (0..mesh.num_elements())
        .into_par_iter()
        .map(|e| {
            let g = gradient_matrix(&mesh.element_coords(e), volumes[e]);
            element_stiffness(&g, la, mu)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::SVector;

    fn skewed_tet() -> [Vector3<f64>; 4] {
        [
            Vector3::new(0.1, -0.2, 0.05),
            Vector3::new(1.3, 0.1, -0.1),
            Vector3::new(0.2, 0.9, 0.3),
            Vector3::new(-0.1, 0.25, 1.1),
        ]
    }

    #[test]
    fn unit_tet_volume() {
        let coords = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        ];
        assert_relative_eq!(element_volume(&coords), 1.0 / 6.0);
        assert_relative_eq!(
            element_center(&coords),
            Vector3::new(0.25, 0.25, 0.25)
        );
    }

    #[test]
    fn swapping_first_corners_flips_volume() {
        let coords = skewed_tet();
        let v = element_volume(&coords);
        assert!(v > 0.0);

        let swapped = [coords[1], coords[0], coords[2], coords[3]];
        assert_relative_eq!(element_volume(&swapped), -v, epsilon = 1e-14);
    }

    #[test]
    fn gradient_columns_sum_to_zero() {
        let coords = skewed_tet();
        let g = gradient_matrix(&coords, element_volume(&coords));
        let sum = g.column_sum();
        assert_relative_eq!(sum, Vector3::<f64>::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn unit_tet_gradient_directions() {
        let coords = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        ];
        let g = gradient_matrix(&coords, 1.0 / 6.0);
        let scale = 1.0 / (6.0 * (1.0_f64 / 6.0).sqrt());

        assert_relative_eq!(g[(0, 0)], -scale);
        assert_relative_eq!(g[(1, 0)], -scale);
        assert_relative_eq!(g[(2, 0)], -scale);
        assert_relative_eq!(g[(0, 1)], scale);
        assert_relative_eq!(g[(1, 2)], scale);
        assert_relative_eq!(g[(2, 3)], scale);
        assert_eq!(g[(1, 1)], 0.0);
    }

    #[test]
    fn stiffness_is_bitwise_symmetric() {
        let coords = skewed_tet();
        let g = gradient_matrix(&coords, element_volume(&coords));
        let k = element_stiffness(&g, 1.0, 0.3);

        for i in 0..ELEMENT_DOF {
            for j in 0..ELEMENT_DOF {
                assert_eq!(k[(i, j)].to_bits(), k[(j, i)].to_bits(), "({i}, {j})");
            }
            assert!(k[(i, i)] > 0.0);
        }
    }

    #[test]
    fn rigid_motions_produce_no_force() {
        let coords = skewed_tet();
        let g = gradient_matrix(&coords, element_volume(&coords));
        let k = element_stiffness(&g, 1.0, 0.36);

        // Translation along each axis
        for axis in 0..3 {
            let mut u = SVector::<f64, ELEMENT_DOF>::zeros();
            for node in 0..4 {
                u[3 * node + axis] = 1.0;
            }
            assert_relative_eq!(k * u, SVector::<f64, ELEMENT_DOF>::zeros(), epsilon = 1e-12);
        }

        // Infinitesimal rotation about z: u = (-y, x, 0)
        let mut u = SVector::<f64, ELEMENT_DOF>::zeros();
        for (node, p) in coords.iter().enumerate() {
            u[3 * node] = -p.y;
            u[3 * node + 1] = p.x;
        }
        assert_relative_eq!(k * u, SVector::<f64, ELEMENT_DOF>::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn same_corner_off_axis_entry() {
        let coords = skewed_tet();
        let g = gradient_matrix(&coords, element_volume(&coords));
        let (la, mu) = (1.0, 0.25);
        let k = element_stiffness(&g, la, mu);

        assert_relative_eq!(k[(0, 1)], (la + mu) * g[(0, 0)] * g[(1, 0)]);
        assert_relative_eq!(
            k[(0, 4)],
            la * g[(0, 0)] * g[(1, 1)] + mu * g[(1, 0)] * g[(0, 1)],
            max_relative = 1e-12
        );
    }
}
