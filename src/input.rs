use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use json::JsonValue;
use nalgebra::Vector3;
use tracing::info;

use crate::{
    datatypes::{
        BoundaryConditions, ForceSpec, MaterialParameters, Mesh, SolverParameters,
    },
    error::TopoError,
    loads,
    materials::MaterialCatalog,
};

/// Everything a run needs, as read from a problem file
#[derive(Debug, Clone)]
pub struct Problem {
    pub mesh: Mesh,
    /// Boundary conditions with surface forces already distributed to nodes
    pub boundary: BoundaryConditions,
    pub forces: Vec<ForceSpec>,
    pub material: MaterialParameters,
    pub params: SolverParameters,
}

/// Parses the problem file into a JsonValue object
///
/// # Arguments
/// * `input_file` - The path to the problem file
///
/// # Returns
/// A JsonValue object with the required sections present
pub fn load_input_file(input_file: &Path) -> Result<JsonValue, TopoError> {
    let file_string = match std::fs::read_to_string(input_file) {
        Ok(f) => f,
        Err(err) => {
            return Err(TopoError::Input(format!(
                "Unable to open input file {}: {err}",
                input_file.display()
            )))
        }
    };

    parse_input_json(&file_string)
}

fn parse_input_json(contents: &str) -> Result<JsonValue, TopoError> {
    let input_json = match json::parse(contents) {
        Ok(f) => f,
        Err(err) => {
            return Err(TopoError::Input(format!(
                "Error in input file json: {err}"
            )))
        }
    };

    if !input_json.has_key("mesh") {
        return Err(TopoError::Input(
            "Input json missing mesh field".to_owned(),
        ));
    }
    if !input_json["mesh"].has_key("nodes") {
        return Err(TopoError::Input(
            "Input json missing nodes field in mesh section".to_owned(),
        ));
    }
    if !input_json["mesh"].has_key("elements") {
        return Err(TopoError::Input(
            "Input json missing elements field in mesh section".to_owned(),
        ));
    }
    if !input_json.has_key("boundary") {
        return Err(TopoError::Input(
            "Input json missing boundary field".to_owned(),
        ));
    }
    if !input_json.has_key("material") {
        return Err(TopoError::Input(
            "Input json missing material field".to_owned(),
        ));
    }

    Ok(input_json)
}

fn parse_vector3(value: &JsonValue, what: &str) -> Result<Vector3<f64>, TopoError> {
    let components: Vec<Option<f64>> = value.members().map(|c| c.as_f64()).collect();
    match components.as_slice() {
        [Some(x), Some(y), Some(z)] => Ok(Vector3::new(*x, *y, *z)),
        _ => Err(TopoError::Input(format!(
            "{what} must be an array of three numbers"
        ))),
    }
}

fn parse_node_set(value: &JsonValue, what: &str) -> Result<BTreeSet<usize>, TopoError> {
    if value.is_null() {
        return Ok(BTreeSet::new());
    }
    if !value.is_array() {
        return Err(TopoError::Input(format!("{what} must be an array of node indices")));
    }

    value
        .members()
        .map(|n| {
            n.as_usize().ok_or_else(|| {
                TopoError::Input(format!("{what} contains a non-index value {n}"))
            })
        })
        .collect()
}

/// Reads node coordinates and connectivity, then validates the mesh
///
/// # Arguments
/// * `input_json` - The problem file as a JsonValue object
pub fn parse_mesh(input_json: &JsonValue) -> Result<Mesh, TopoError> {
    let mesh_json = &input_json["mesh"];

    let mut nodes = Vec::with_capacity(mesh_json["nodes"].len());
    for (i, node) in mesh_json["nodes"].members().enumerate() {
        nodes.push(parse_vector3(node, &format!("Node {i}"))?);
    }

    let mut elements = Vec::with_capacity(mesh_json["elements"].len());
    for (e, element) in mesh_json["elements"].members().enumerate() {
        let indices: Vec<Option<usize>> = element.members().map(|n| n.as_usize()).collect();
        match indices.as_slice() {
            [Some(a), Some(b), Some(c), Some(d)] => elements.push([*a, *b, *c, *d]),
            _ => {
                return Err(TopoError::Mesh(format!(
                    "element {e} must list exactly four node indices"
                )))
            }
        }
    }

    Mesh::new(nodes, elements)
}

/// Reads fixed, non-design and loaded nodes
///
/// Named surface forces are distributed over the boundary faces they cover;
/// explicit per-node `loads` are added on top.
///
/// # Arguments
/// * `input_json` - The problem file as a JsonValue object
/// * `mesh` - The parsed mesh
///
/// # Returns
/// The boundary conditions and the surface forces they were built from
pub fn parse_boundary(
    input_json: &JsonValue,
    mesh: &Mesh,
) -> Result<(BoundaryConditions, Vec<ForceSpec>), TopoError> {
    let boundary_json = &input_json["boundary"];

    let fixed_nodes = parse_node_set(&boundary_json["fixed"], "Fixed node list")?;
    let non_design_nodes = parse_node_set(&boundary_json["non_design"], "Non-design node list")?;

    let mut forces = Vec::new();
    for (id, force_json) in boundary_json["forces"].entries() {
        if !force_json.has_key("nodes") {
            return Err(TopoError::Input(format!(
                "Force '{id}' is missing nodes field"
            )));
        }
        if !force_json.has_key("direction") {
            return Err(TopoError::Input(format!(
                "Force '{id}' is missing direction field"
            )));
        }

        let magnitude = force_json["magnitude"].as_f64().ok_or_else(|| {
            TopoError::Input(format!("Force '{id}' needs a numeric magnitude"))
        })?;

        forces.push(ForceSpec {
            id: id.to_owned(),
            nodes: parse_node_set(&force_json["nodes"], &format!("Force '{id}' node list"))?,
            direction: parse_vector3(&force_json["direction"], &format!("Force '{id}' direction"))?,
            magnitude,
            reversed: force_json["reversed"].as_bool().unwrap_or(false),
        });
    }

    let mut node_loads: BTreeMap<usize, Vector3<f64>> = loads::distribute_loads(mesh, &forces)?;
    for (key, load_json) in boundary_json["loads"].entries() {
        let node: usize = key.parse().map_err(|_| {
            TopoError::Input(format!("Load key '{key}' is not a node index"))
        })?;
        let load = parse_vector3(load_json, &format!("Load on node {node}"))?;
        *node_loads.entry(node).or_insert_with(Vector3::zeros) += load;
    }

    let boundary = BoundaryConditions {
        fixed_nodes,
        loads: node_loads,
        non_design_nodes,
    };
    boundary.validate(mesh.num_nodes())?;

    info!(
        fixed = boundary.fixed_nodes.len(),
        loaded = boundary.loads.len(),
        non_design = boundary.non_design_nodes.len(),
        forces = forces.len(),
        "loaded boundary conditions from input file"
    );

    Ok((boundary, forces))
}

/// Reads the material, either inline or by catalog name
pub fn parse_material(
    input_json: &JsonValue,
    catalog: &MaterialCatalog,
) -> Result<MaterialParameters, TopoError> {
    let material_json = &input_json["material"];

    let material = if let Some(name) = material_json["name"].as_str() {
        catalog.get(name)?
    } else {
        let youngs_modulus = material_json["youngs_modulus"].as_f64();
        let poisson_ratio = material_json["poisson_ratio"].as_f64();

        if youngs_modulus.is_none() {
            return Err(TopoError::Input(
                "Input json missing youngs_modulus in material section".to_owned(),
            ));
        }
        if poisson_ratio.is_none() {
            return Err(TopoError::Input(
                "Input json missing poisson_ratio in material section".to_owned(),
            ));
        }

        MaterialParameters {
            youngs_modulus: youngs_modulus.unwrap_or_default(),
            poisson_ratio: poisson_ratio.unwrap_or_default(),
        }
    };

    material.validate()?;
    Ok(material)
}

fn optional_f64(section: &JsonValue, key: &str, default: f64) -> Result<f64, TopoError> {
    if section[key].is_null() {
        return Ok(default);
    }
    section[key]
        .as_f64()
        .ok_or_else(|| TopoError::Input(format!("Bad value for {key} in solver section")))
}

fn optional_usize(section: &JsonValue, key: &str, default: usize) -> Result<usize, TopoError> {
    if section[key].is_null() {
        return Ok(default);
    }
    section[key]
        .as_usize()
        .ok_or_else(|| TopoError::Input(format!("Bad value for {key} in solver section")))
}

fn optional_bool(section: &JsonValue, key: &str, default: bool) -> Result<bool, TopoError> {
    if section[key].is_null() {
        return Ok(default);
    }
    section[key]
        .as_bool()
        .ok_or_else(|| TopoError::Input(format!("Bad value for {key} in solver section")))
}

/// Reads the solver section; absent keys keep their defaults
pub fn parse_solver_parameters(input_json: &JsonValue) -> Result<SolverParameters, TopoError> {
    let solver_json = &input_json["solver"];
    let defaults = SolverParameters::default();

    let plateau_tolerance = if solver_json["plateau_tolerance"].is_null() {
        None
    } else {
        Some(optional_f64(solver_json, "plateau_tolerance", 0.0)?)
    };

    let linear_solver = match solver_json["linear_solver"].as_str() {
        Some(name) => name.parse()?,
        None if solver_json["linear_solver"].is_null() => defaults.linear_solver,
        None => {
            return Err(TopoError::Input(
                "Bad value for linear_solver in solver section".to_owned(),
            ))
        }
    };

    Ok(SolverParameters {
        penalty: optional_f64(solver_json, "penalty_exponent", defaults.penalty)?,
        volume_fraction: optional_f64(solver_json, "volume_fraction", defaults.volume_fraction)?,
        density_change: optional_f64(solver_json, "density_change", defaults.density_change)?,
        rmin: optional_f64(solver_json, "rmin", defaults.rmin)?,
        k_neighbors: optional_usize(solver_json, "number_of_neighbours", defaults.k_neighbors)?,
        emin: optional_f64(solver_json, "emin", defaults.emin)?,
        convergence: optional_f64(solver_json, "convergence", defaults.convergence)?,
        max_bisection_steps: optional_usize(
            solver_json,
            "max_bisection_steps",
            defaults.max_bisection_steps,
        )?,
        iterations: optional_usize(solver_json, "number_of_iterations", defaults.iterations)?,
        include_fixed: optional_bool(solver_json, "include_fixed", defaults.include_fixed)?,
        include_forced: optional_bool(solver_json, "include_forced", defaults.include_forced)?,
        plateau_tolerance,
        linear_solver,
    })
}

/// Parses and validates a problem from json text
pub fn parse_problem(contents: &str, catalog: &MaterialCatalog) -> Result<Problem, TopoError> {
    let input_json = parse_input_json(contents)?;
    problem_from_json(&input_json, catalog)
}

/// Reads and validates a problem file
///
/// # Arguments
/// * `input_file` - The path to the problem file
/// * `catalog` - Materials available by name
pub fn load_problem(input_file: &Path, catalog: &MaterialCatalog) -> Result<Problem, TopoError> {
    let input_json = load_input_file(input_file)?;
    problem_from_json(&input_json, catalog)
}

fn problem_from_json(
    input_json: &JsonValue,
    catalog: &MaterialCatalog,
) -> Result<Problem, TopoError> {
    let mesh = parse_mesh(input_json)?;
    info!(
        nodes = mesh.num_nodes(),
        elements = mesh.num_elements(),
        "loaded mesh"
    );

    let (boundary, forces) = parse_boundary(input_json, &mesh)?;
    let material = parse_material(input_json, catalog)?;
    let params = parse_solver_parameters(input_json)?;
    params.validate(&material)?;

    Ok(Problem {
        mesh,
        boundary,
        forces,
        material,
        params,
    })
}
