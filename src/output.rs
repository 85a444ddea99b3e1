use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use nalgebra::Vector3;
use tracing::info;

use crate::{error::TopoError, optimizer::DensitySink};

/// File names of one run's results: `<stem>.ecenters.csv`,
/// `<stem>.volumes.csv` and `<stem>_i<N>.densities.csv`
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub dir: PathBuf,
    pub stem: String,
}

impl OutputPaths {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> OutputPaths {
        OutputPaths {
            dir: dir.into(),
            stem: stem.into(),
        }
    }

    pub fn element_centers(&self) -> PathBuf {
        self.dir.join(format!("{}.ecenters.csv", self.stem))
    }

    pub fn element_volumes(&self) -> PathBuf {
        self.dir.join(format!("{}.volumes.csv", self.stem))
    }

    /// Densities after the 1-based iteration `iteration`
    pub fn densities(&self, iteration: usize) -> PathBuf {
        self.dir
            .join(format!("{}_i{iteration}.densities.csv", self.stem))
    }
}

fn create(path: &Path) -> Result<BufWriter<File>, TopoError> {
    match File::create(path) {
        Ok(f) => Ok(BufWriter::new(f)),
        Err(err) => Err(TopoError::Output(format!(
            "Failed to create {}: {err}",
            path.display()
        ))),
    }
}

fn write_failed(path: &Path, err: std::io::Error) -> TopoError {
    TopoError::Output(format!("Failed to write {}: {err}", path.display()))
}

/// Writes element centroids to a CSV file
///
/// # Arguments
/// * `path` - The output file
/// * `centers` - One centroid per element
pub fn write_element_centers(path: &Path, centers: &[Vector3<f64>]) -> Result<(), TopoError> {
    let mut file = create(path)?;

    writeln!(file, "x,y,z").map_err(|err| write_failed(path, err))?;
    for c in centers {
        writeln!(file, "{},{},{}", c.x, c.y, c.z).map_err(|err| write_failed(path, err))?;
    }
    file.flush().map_err(|err| write_failed(path, err))
}

fn write_column(path: &Path, header: &str, values: &[f64]) -> Result<(), TopoError> {
    let mut file = create(path)?;

    writeln!(file, "{header}").map_err(|err| write_failed(path, err))?;
    for v in values {
        writeln!(file, "{v}").map_err(|err| write_failed(path, err))?;
    }
    file.flush().map_err(|err| write_failed(path, err))
}

pub fn write_element_volumes(path: &Path, volumes: &[f64]) -> Result<(), TopoError> {
    write_column(path, "volume", volumes)
}

pub fn write_densities(path: &Path, densities: &[f64]) -> Result<(), TopoError> {
    write_column(path, "density", densities)
}

/// Reads back a densities file written by [`write_densities`]
pub fn read_densities(path: &Path) -> Result<Vec<f64>, TopoError> {
    let file = File::open(path).map_err(|err| {
        TopoError::Output(format!("Unable to open {}: {err}", path.display()))
    })?;

    let mut densities = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate().skip(1) {
        let line = line.map_err(|err| {
            TopoError::Output(format!("Failed to read {}: {err}", path.display()))
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let value: f64 = line.trim().parse().map_err(|_| {
            TopoError::Output(format!(
                "Non-float density '{line}' on line {} of {}",
                i + 1,
                path.display()
            ))
        })?;
        densities.push(value);
    }

    Ok(densities)
}

/// Persists a run's densities as CSV files in one directory
#[derive(Debug, Clone)]
pub struct CsvDensitySink {
    paths: OutputPaths,
}

impl CsvDensitySink {
    /// Creates the output directory when it does not exist yet
    pub fn new(paths: OutputPaths) -> Result<CsvDensitySink, TopoError> {
        std::fs::create_dir_all(&paths.dir).map_err(|err| {
            TopoError::Output(format!(
                "Failed to create output directory {}: {err}",
                paths.dir.display()
            ))
        })?;
        Ok(CsvDensitySink { paths })
    }

    pub fn paths(&self) -> &OutputPaths {
        &self.paths
    }
}

impl DensitySink for CsvDensitySink {
    fn record_geometry(
        &mut self,
        centers: &[Vector3<f64>],
        volumes: &[f64],
    ) -> Result<(), TopoError> {
        write_element_centers(&self.paths.element_centers(), centers)?;
        write_element_volumes(&self.paths.element_volumes(), volumes)?;
        info!(
            dir = %self.paths.dir.display(),
            stem = self.paths.stem.as_str(),
            "wrote element centroids and volumes"
        );
        Ok(())
    }

    fn record(&mut self, iteration: usize, densities: &[f64]) -> Result<(), TopoError> {
        write_densities(&self.paths.densities(iteration), densities)
    }
}
