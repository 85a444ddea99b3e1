use std::{collections::BTreeMap, path::Path};

use json::JsonValue;
use tracing::debug;

use crate::{datatypes::MaterialParameters, error::TopoError};

const BUILTIN_MATERIALS: &str = include_str!("../data/materials.json");

/// Named material presets, selectable from a problem file by name
#[derive(Debug, Clone, Default)]
pub struct MaterialCatalog {
    entries: BTreeMap<String, MaterialParameters>,
}

impl MaterialCatalog {
    /// The catalog shipped with the crate
    pub fn builtin() -> Result<MaterialCatalog, TopoError> {
        MaterialCatalog::parse(BUILTIN_MATERIALS)
    }

    /// Loads a catalog from a json file
    ///
    /// # Arguments
    /// * `path` - A json array of `{name, youngs_modulus, poisson_ratio}`
    pub fn from_file(path: &Path) -> Result<MaterialCatalog, TopoError> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            TopoError::Input(format!(
                "Unable to open material file {}: {err}",
                path.display()
            ))
        })?;
        MaterialCatalog::parse(&contents)
    }

    /// Parses a catalog from json text
    pub fn parse(contents: &str) -> Result<MaterialCatalog, TopoError> {
        let parsed = json::parse(contents)
            .map_err(|err| TopoError::Input(format!("Error in material json: {err}")))?;

        if !parsed.is_array() {
            return Err(TopoError::Input(
                "Material json must be an array of materials".to_owned(),
            ));
        }

        let mut entries = BTreeMap::new();
        for (i, entry) in parsed.members().enumerate() {
            let (name, material) = parse_entry(i, entry)?;
            if entries.insert(name.clone(), material).is_some() {
                return Err(TopoError::Input(format!(
                    "Material '{name}' is defined more than once"
                )));
            }
        }

        debug!(count = entries.len(), "loaded material catalog");
        Ok(MaterialCatalog { entries })
    }

    /// Looks up a material by name
    pub fn get(&self, name: &str) -> Result<MaterialParameters, TopoError> {
        self.entries
            .get(name)
            .copied()
            .ok_or_else(|| TopoError::Input(format!("Unknown material '{name}'")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_entry(index: usize, entry: &JsonValue) -> Result<(String, MaterialParameters), TopoError> {
    let name = entry["name"].as_str().ok_or_else(|| {
        TopoError::Input(format!("Material entry {index} is missing a name"))
    })?;

    let youngs_modulus = entry["youngs_modulus"].as_f64();
    let poisson_ratio = entry["poisson_ratio"].as_f64();

    let (Some(youngs_modulus), Some(poisson_ratio)) = (youngs_modulus, poisson_ratio) else {
        return Err(TopoError::Input(format!(
            "Material '{name}' needs numeric youngs_modulus and poisson_ratio"
        )));
    };

    let material = MaterialParameters {
        youngs_modulus,
        poisson_ratio,
    };
    material
        .validate()
        .map_err(|err| TopoError::Input(format!("Material '{name}': {err}")))?;

    Ok((name.to_owned(), material))
}
