#![allow(dead_code)]

use std::{collections::BTreeSet, path::PathBuf};

use nalgebra::Vector3;
use topotet::{kernel, Mesh};

/// Structured box of `nx * ny * nz` unit cells, each split into six
/// tetrahedra along its main diagonal
pub fn box_mesh(nx: usize, ny: usize, nz: usize, size: [f64; 3]) -> Mesh {
    let node = |i: usize, j: usize, k: usize| i + (nx + 1) * (j + (ny + 1) * k);

    let mut nodes = Vec::with_capacity((nx + 1) * (ny + 1) * (nz + 1));
    for k in 0..=nz {
        for j in 0..=ny {
            for i in 0..=nx {
                nodes.push(Vector3::new(
                    size[0] * i as f64 / nx as f64,
                    size[1] * j as f64 / ny as f64,
                    size[2] * k as f64 / nz as f64,
                ));
            }
        }
    }

    // Paths from corner 0 to corner 7 through the cube, corner c = x + 2y + 4z
    const PATHS: [[usize; 4]; 6] = [
        [0, 1, 3, 7],
        [0, 2, 6, 7],
        [0, 4, 5, 7],
        [0, 1, 5, 7],
        [0, 2, 3, 7],
        [0, 4, 6, 7],
    ];

    let mut elements = Vec::with_capacity(6 * nx * ny * nz);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let corner = |c: usize| node(i + (c & 1), j + ((c >> 1) & 1), k + ((c >> 2) & 1));
                for path in PATHS {
                    let mut element = path.map(corner);
                    let coords = element.map(|n| nodes[n]);
                    if kernel::element_volume(&coords) < 0.0 {
                        element.swap(0, 1);
                    }
                    elements.push(element);
                }
            }
        }
    }

    Mesh::new(nodes, elements).expect("structured box mesh is valid")
}

/// Nodes whose coordinate along `axis` equals `value`
pub fn nodes_on_plane(mesh: &Mesh, axis: usize, value: f64) -> BTreeSet<usize> {
    mesh.nodes
        .iter()
        .enumerate()
        .filter(|(_, p)| (p[axis] - value).abs() < 1e-9)
        .map(|(n, _)| n)
        .collect()
}

/// Fresh per-test scratch directory under the system temp dir
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("topotet-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}
