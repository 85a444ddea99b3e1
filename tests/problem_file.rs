mod common;

use topotet::{
    input,
    materials::MaterialCatalog,
    optimize,
    optimizer::Optimizer,
    output::{read_densities, CsvDensitySink, OutputPaths},
    StopReason,
};

use common::{box_mesh, nodes_on_plane, scratch_dir};

fn json_list<T: std::fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    let parts: Vec<String> = items.into_iter().map(|i| i.to_string()).collect();
    format!("[{}]", parts.join(","))
}

/// A 2x1x1 bar clamped at x = 0 with a surface force on the x = 2 end
fn bar_problem(solver: &str) -> String {
    let mesh = box_mesh(2, 1, 1, [2.0, 1.0, 1.0]);
    let nodes = json_list(
        mesh.nodes
            .iter()
            .map(|p| format!("[{},{},{}]", p.x, p.y, p.z)),
    );
    let elements = json_list(
        mesh.elements
            .iter()
            .map(|e| format!("[{},{},{},{}]", e[0], e[1], e[2], e[3])),
    );
    let fixed = json_list(nodes_on_plane(&mesh, 0, 0.0));
    let loaded = json_list(nodes_on_plane(&mesh, 0, 2.0));

    format!(
        r#"{{
            "mesh": {{"nodes": {nodes}, "elements": {elements}}},
            "boundary": {{
                "fixed": {fixed},
                "forces": {{
                    "FORCE_1": {{"nodes": {loaded}, "direction": [0, 0, 1],
                                 "magnitude": 5.0, "reversed": true}}
                }}
            }},
            "material": {{"name": "PLA-Generic"}},
            "solver": {solver}
        }}"#
    )
}

#[test]
fn problem_file_runs_and_persists_csv() {
    let dir = scratch_dir("problem-file");
    let problem_path = dir.join("bar.json");
    std::fs::write(
        &problem_path,
        bar_problem(r#"{"number_of_iterations": 3, "volume_fraction": 0.6, "rmin": 1.0}"#),
    )
    .unwrap();

    let catalog = MaterialCatalog::builtin().unwrap();
    let problem = input::load_problem(&problem_path, &catalog).unwrap();
    assert_eq!(problem.mesh.num_elements(), 12);
    assert_eq!(problem.params.iterations, 3);

    // Reversed force points down
    let total_z: f64 = problem.boundary.loads.values().map(|f| f.z).sum();
    assert!((total_z + 5.0).abs() < 1e-9);

    let paths = OutputPaths::new(dir.join("out"), "bar");
    let mut sink = CsvDensitySink::new(paths.clone()).unwrap();
    let summary = optimize(&problem, &mut sink).unwrap();
    assert_eq!(summary.stop_reason, StopReason::Completed);

    let ecenters = std::fs::read_to_string(paths.element_centers()).unwrap();
    assert_eq!(ecenters.lines().count(), 1 + 12);
    let volumes = std::fs::read_to_string(paths.element_volumes()).unwrap();
    assert_eq!(volumes.lines().count(), 1 + 12);

    for iteration in 1..=3 {
        let densities = read_densities(&paths.densities(iteration)).unwrap();
        assert_eq!(densities.len(), 12);
        assert!(densities.iter().all(|d| (0.0..=1.0).contains(d)));
    }
    assert!(!paths.densities(4).exists());

    let last = read_densities(&paths.densities(3)).unwrap();
    for (written, kept) in last.iter().zip(&summary.densities) {
        assert!((written - kept).abs() <= 1e-12 * kept.abs().max(1.0));
    }

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn run_continues_from_saved_densities() {
    let dir = scratch_dir("continue");
    let catalog = MaterialCatalog::builtin().unwrap();
    let text = bar_problem(r#"{"number_of_iterations": 2, "volume_fraction": 0.6, "rmin": 1.0}"#);
    let mut problem = input::parse_problem(&text, &catalog).unwrap();

    let paths = OutputPaths::new(dir.join("out"), "bar");
    let mut sink = CsvDensitySink::new(paths.clone()).unwrap();
    optimize(&problem, &mut sink).unwrap();
    assert!(!paths.densities(3).exists());

    problem.params.iterations = 2;
    let initial = read_densities(&paths.densities(2)).unwrap();
    let summary = Optimizer::from_problem(&problem)
        .unwrap()
        .run_from(initial, 2, &mut sink)
        .unwrap();

    assert_eq!(summary.iterations.first().unwrap().iteration, 3);
    assert!(paths.densities(3).exists());
    let last = read_densities(&paths.densities(4)).unwrap();
    assert_eq!(last, summary.densities);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn missing_problem_file_is_an_input_error() {
    let dir = scratch_dir("missing-problem");
    let catalog = MaterialCatalog::builtin().unwrap();
    let err = input::load_problem(&dir.join("absent.json"), &catalog).unwrap_err();
    assert!(err.to_string().starts_with("Input error"));
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn unknown_material_is_reported() {
    let text = bar_problem("{}").replace("PLA-Generic", "Vibranium");
    let err = input::parse_problem(&text, &MaterialCatalog::builtin().unwrap()).unwrap_err();
    assert!(err.to_string().contains("Unknown material 'Vibranium'"));
}
