mod common;

use std::collections::BTreeSet;

use approx::assert_relative_eq;
use nalgebra::Vector3;
use topotet::{
    filter::NeighborFilter,
    kernel, loads,
    optimizer::{DensityHistory, Optimizer, StopReason},
    BoundaryConditions, ForceSpec, LinearSolverKind, MaterialParameters, Mesh, SolverParameters,
    TopoError,
};

use common::{box_mesh, nodes_on_plane};

fn unit_material() -> MaterialParameters {
    MaterialParameters {
        youngs_modulus: 1.0,
        poisson_ratio: 0.3,
    }
}

/// Bottom face fixed, unit downward force spread over the top face
fn loaded_cube(mesh: &Mesh) -> BoundaryConditions {
    let top = nodes_on_plane(mesh, 2, 1.0);
    let force = ForceSpec {
        id: "FORCE_1".to_owned(),
        nodes: top,
        direction: Vector3::new(0.0, 0.0, -1.0),
        magnitude: 1.0,
        reversed: false,
    };

    BoundaryConditions {
        fixed_nodes: nodes_on_plane(mesh, 2, 0.0),
        loads: loads::distribute_loads(mesh, &[force]).unwrap(),
        non_design_nodes: BTreeSet::new(),
    }
}

fn cube_params(iterations: usize) -> SolverParameters {
    SolverParameters {
        penalty: 3.0,
        volume_fraction: 0.5,
        rmin: 100.0,
        k_neighbors: 6,
        emin: 1e-9,
        iterations,
        ..SolverParameters::default()
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[test]
fn unit_cube_end_to_end() {
    let mesh = box_mesh(1, 1, 1, [1.0, 1.0, 1.0]);
    assert_eq!(mesh.num_elements(), 6);
    let boundary = loaded_cube(&mesh);

    let optimizer = Optimizer::new(&mesh, &boundary, unit_material(), cube_params(5)).unwrap();
    let mut history = DensityHistory::new();
    let summary = optimizer.run(&mut history).unwrap();

    assert_eq!(summary.stop_reason, StopReason::Completed);
    assert_eq!(history.snapshots.len(), 5);

    // Loaded nodes move with the load
    let u = summary.displacement.unwrap();
    let mut work = 0.0;
    let mut vertical = 0.0;
    for (&n, f) in &boundary.loads {
        let un = Vector3::new(u[3 * n], u[3 * n + 1], u[3 * n + 2]);
        assert!(un.norm() > 0.0);
        work += f.dot(&un);
        vertical += un.z;
    }
    assert!(work > 0.0);
    assert!(vertical < 0.0);

    for &n in &boundary.fixed_nodes {
        assert_eq!(u[3 * n + 2], 0.0);
    }

    let final_mean = mean(&summary.densities);
    assert!((0.45..=0.55).contains(&final_mean), "mean density {final_mean}");
    assert!(summary.densities.iter().all(|d| (0.0..=1.0).contains(d)));
}

#[test]
fn densities_step_down_by_move_limit() {
    let mesh = box_mesh(1, 1, 1, [1.0, 1.0, 1.0]);
    let boundary = loaded_cube(&mesh);

    let optimizer = Optimizer::new(&mesh, &boundary, unit_material(), cube_params(2)).unwrap();
    let mut history = DensityHistory::new();
    optimizer.run(&mut history).unwrap();

    // The volume target is out of reach for two steps from a solid start
    for d in history.get(1).unwrap() {
        assert_relative_eq!(*d, 0.8, epsilon = 1e-9);
    }
    for d in history.get(2).unwrap() {
        assert_relative_eq!(*d, 0.6, epsilon = 1e-9);
    }
}

#[test]
fn zero_load_converges_to_flat_field() {
    let mesh = box_mesh(2, 1, 1, [2.0, 1.0, 1.0]);
    let boundary = BoundaryConditions {
        fixed_nodes: nodes_on_plane(&mesh, 0, 0.0),
        ..BoundaryConditions::default()
    };
    let params = SolverParameters {
        volume_fraction: 0.5,
        density_change: 0.1,
        emin: 1e-9,
        iterations: 5,
        ..SolverParameters::default()
    };

    let optimizer = Optimizer::new(&mesh, &boundary, unit_material(), params).unwrap();
    let summary = optimizer.run(&mut DensityHistory::new()).unwrap();

    for d in &summary.densities {
        assert_relative_eq!(*d, 0.5, epsilon = 1e-9);
    }
    assert!(summary.iterations.iter().all(|r| r.compliance == 0.0));
}

#[test]
fn solvers_agree_on_a_cantilever() {
    let mesh = box_mesh(3, 1, 1, [3.0, 1.0, 1.0]);
    let mut loads = std::collections::BTreeMap::new();
    for n in nodes_on_plane(&mesh, 0, 3.0) {
        loads.insert(n, Vector3::new(0.0, 0.0, -0.25));
    }
    let boundary = BoundaryConditions {
        fixed_nodes: nodes_on_plane(&mesh, 0, 0.0),
        loads,
        non_design_nodes: BTreeSet::new(),
    };

    let run = |kind: LinearSolverKind| {
        let params = SolverParameters {
            volume_fraction: 0.5,
            rmin: 1.5,
            emin: 1e-6,
            iterations: 2,
            linear_solver: kind,
            ..SolverParameters::default()
        };
        Optimizer::new(&mesh, &boundary, unit_material(), params)
            .unwrap()
            .run(&mut DensityHistory::new())
            .unwrap()
    };

    let direct = run(LinearSolverKind::Cholesky);
    let iterative = run(LinearSolverKind::ConjugateGradient);

    assert_relative_eq!(
        direct.iterations[0].compliance,
        iterative.iterations[0].compliance,
        max_relative = 1e-5
    );
    for (a, b) in direct.densities.iter().zip(&iterative.densities) {
        assert_relative_eq!(*a, *b, epsilon = 1e-2);
    }
}

#[test]
fn material_gathers_near_the_support() {
    let mesh = box_mesh(6, 1, 1, [6.0, 1.0, 1.0]);
    let mut loads = std::collections::BTreeMap::new();
    for n in nodes_on_plane(&mesh, 0, 2.0) {
        loads.insert(n, Vector3::new(0.0, 0.0, -0.25));
    }
    let boundary = BoundaryConditions {
        fixed_nodes: nodes_on_plane(&mesh, 0, 0.0),
        loads,
        non_design_nodes: BTreeSet::new(),
    };
    let params = SolverParameters {
        volume_fraction: 0.5,
        rmin: 1.5,
        emin: 1e-9,
        iterations: 5,
        ..SolverParameters::default()
    };

    let optimizer = Optimizer::new(&mesh, &boundary, unit_material(), params).unwrap();
    let summary = optimizer.run(&mut DensityHistory::new()).unwrap();

    let centers = kernel::element_centers(&mesh);
    let near: Vec<f64> = centers
        .iter()
        .zip(&summary.densities)
        .filter(|(c, _)| c.x < 2.0)
        .map(|(_, d)| *d)
        .collect();
    let far: Vec<f64> = centers
        .iter()
        .zip(&summary.densities)
        .filter(|(c, _)| c.x > 4.0)
        .map(|(_, d)| *d)
        .collect();

    assert!(!near.is_empty() && !far.is_empty());
    assert!(mean(&near) > mean(&far) + 0.5, "near {} far {}", mean(&near), mean(&far));
}

#[test]
fn plateau_tolerance_stops_after_warmup() {
    let mesh = box_mesh(1, 1, 1, [1.0, 1.0, 1.0]);
    let boundary = loaded_cube(&mesh);
    let params = SolverParameters {
        plateau_tolerance: Some(1e6),
        ..cube_params(20)
    };

    let optimizer = Optimizer::new(&mesh, &boundary, unit_material(), params).unwrap();
    let summary = optimizer.run(&mut DensityHistory::new()).unwrap();

    assert_eq!(summary.stop_reason, StopReason::Plateau);
    assert_eq!(summary.iterations.len(), 11);
}

#[test]
fn floating_component_fails_to_solve() {
    let mesh = Mesh::new(
        vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(5.0, 0.0, 0.0),
            Vector3::new(6.0, 0.0, 0.0),
            Vector3::new(5.0, 1.0, 0.0),
            Vector3::new(5.0, 0.0, 1.0),
        ],
        vec![[0, 1, 2, 3], [4, 5, 6, 7]],
    )
    .unwrap();

    let mut boundary = BoundaryConditions {
        fixed_nodes: [0, 1, 2].into_iter().collect(),
        ..BoundaryConditions::default()
    };
    boundary.loads.insert(7, Vector3::new(0.0, 0.0, -1.0));

    let params = SolverParameters {
        emin: 1e-9,
        iterations: 1,
        ..SolverParameters::default()
    };
    let optimizer = Optimizer::new(&mesh, &boundary, unit_material(), params).unwrap();
    let err = optimizer.run(&mut DensityHistory::new()).unwrap_err();
    assert!(matches!(err, TopoError::Solver(_)));
}

#[test]
fn filter_preserves_uniform_field_on_box() {
    let mesh = box_mesh(3, 2, 2, [3.0, 2.0, 2.0]);
    let centers = kernel::element_centers(&mesh);
    let filter = NeighborFilter::with_radius(&centers, 7, 0.8);

    for value in filter.apply(&vec![0.42; mesh.num_elements()]) {
        assert_relative_eq!(value, 0.42, epsilon = 1e-12);
    }
}

#[test]
fn box_volumes_sum_to_box_volume() {
    let mesh = box_mesh(2, 3, 2, [2.0, 1.5, 1.0]);
    let total: f64 = kernel::element_volumes(&mesh).iter().sum();
    assert_relative_eq!(total, 3.0, epsilon = 1e-12);
}
