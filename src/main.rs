use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use topotet::{
    input,
    materials::MaterialCatalog,
    optimizer::Optimizer,
    output::{read_densities, CsvDensitySink, OutputPaths},
    LinearSolverKind, TopoError,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliSolver {
    Cholesky,
    Cg,
}

impl From<CliSolver> for LinearSolverKind {
    fn from(solver: CliSolver) -> Self {
        match solver {
            CliSolver::Cholesky => LinearSolverKind::Cholesky,
            CliSolver::Cg => LinearSolverKind::ConjugateGradient,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "topotet")]
#[command(about = "SIMP topology optimization on tetrahedral meshes")]
struct Args {
    /// Path to the json problem file
    problem: PathBuf,

    /// Directory for the csv results
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Json material catalog used instead of the built-in one
    #[arg(short, long)]
    materials: Option<PathBuf>,

    /// Overrides number_of_iterations from the problem file
    #[arg(short, long)]
    iterations: Option<usize>,

    /// Overrides linear_solver from the problem file
    #[arg(short, long)]
    solver: Option<CliSolver>,

    /// Continue from the densities written after this iteration
    #[arg(short = 'c', long = "continue", value_name = "ITERATION")]
    resume: Option<usize>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> Result<(), TopoError> {
    let catalog = match &args.materials {
        Some(path) => MaterialCatalog::from_file(path)?,
        None => MaterialCatalog::builtin()?,
    };

    let mut problem = input::load_problem(&args.problem, &catalog)?;
    if let Some(iterations) = args.iterations {
        problem.params.iterations = iterations;
    }
    if let Some(solver) = args.solver {
        problem.params.linear_solver = solver.into();
    }

    let stem = args
        .problem
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "topotet".to_owned());
    let mut sink = CsvDensitySink::new(OutputPaths::new(&args.output_dir, stem))?;

    let optimizer = Optimizer::from_problem(&problem)?.with_progress(true);
    let summary = match args.resume {
        Some(iteration) => {
            let initial = read_densities(&sink.paths().densities(iteration))?;
            optimizer.run_from(initial, iteration, &mut sink)?
        }
        None => optimizer.run(&mut sink)?,
    };

    let final_compliance = summary.iterations.last().map(|r| r.compliance);
    info!(
        iterations = summary.iterations.len(),
        stop = ?summary.stop_reason,
        compliance = ?final_compliance,
        output = %args.output_dir.display(),
        "finished in {:.3} seconds",
        summary.elapsed_seconds
    );

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
