use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, Level};

use damflow::{
    error::{DamflowError, Result},
    export,
    gmsh::GmshMesher,
    mesher::{Mesher, StructuredMesher},
    model::{self, FlowResult},
    params::{InputParameters, ParameterStudy},
    persistence::{self, ModelRecord},
    progress::{ProgressBarSink, ProgressSink},
    solver::{SolverMethod, SolverSettings, TARGET_CG_RESIDUAL},
    study::{self, StudyAbort, StudyOptions},
};

#[derive(Parser)]
#[command(name = "damflow")]
#[command(about = "Groundwater flow beneath a dam", long_about = None)]
struct Cli {
    /// Increase log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a model file with default parameters
    Init {
        /// Path of the model file to create
        model_path: PathBuf,
    },
    /// Solve the model once
    Solve {
        /// Path to the model json file
        model_path: PathBuf,
        #[command(flatten)]
        run: RunArgs,
        /// Store the nodal results in the model file
        #[arg(long)]
        save_results: bool,
    },
    /// Run the parameter study stored in the model file
    Study {
        /// Path to the model json file
        model_path: PathBuf,
        #[command(flatten)]
        run: RunArgs,
        /// Solve the steps on all cores
        #[arg(long)]
        parallel: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, value_enum, default_value_t = MesherChoice::Structured)]
    mesher: MesherChoice,
    /// Path to the gmsh executable
    #[arg(long, default_value = "gmsh")]
    gmsh: PathBuf,
    #[arg(long, value_enum, default_value_t = SolverChoice::Direct)]
    solver: SolverChoice,
    /// Relative residual of the conjugate gradient solver
    #[arg(long, default_value_t = TARGET_CG_RESIDUAL)]
    tolerance: f64,
    /// Directory receiving csv and vtk result files
    #[arg(short, long)]
    export: Option<PathBuf>,
    /// Hide the progress bar
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum MesherChoice {
    /// Built-in rectilinear triangulation
    Structured,
    /// External gmsh binary
    Gmsh,
}

#[derive(Clone, Copy, ValueEnum)]
enum SolverChoice {
    Direct,
    Cg,
}

impl RunArgs {
    fn mesher(&self) -> Box<dyn Mesher> {
        match self.mesher {
            MesherChoice::Structured => Box::new(StructuredMesher::default()),
            MesherChoice::Gmsh => Box::new(GmshMesher {
                executable: self.gmsh.clone(),
                ..Default::default()
            }),
        }
    }

    fn settings(&self) -> SolverSettings {
        SolverSettings {
            method: match self.solver {
                SolverChoice::Direct => SolverMethod::Direct,
                SolverChoice::Cg => SolverMethod::ConjugateGradient,
            },
            cg_tolerance: self.tolerance,
            ..Default::default()
        }
    }

    fn progress(&self) -> Option<ProgressBarSink> {
        (!self.quiet).then(ProgressBarSink::new)
    }
}

fn log_level(verbose: u8) -> Level {
    match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(log_level(cli.verbose))
        .with_writer(std::io::stderr)
        .init();

    let outcome = match cli.command {
        Commands::Init { model_path } => cmd_init(&model_path),
        Commands::Solve {
            model_path,
            run,
            save_results,
        } => cmd_solve(&model_path, &run, save_results),
        Commands::Study {
            model_path,
            run,
            parallel,
        } => cmd_study(&model_path, &run, parallel),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_init(model_path: &Path) -> Result<()> {
    let params = InputParameters::default();
    let record = ModelRecord {
        study: Some(ParameterStudy::Depth {
            end: 8.0,
            steps: 10,
        }),
        params,
        results: None,
    };
    persistence::save_model(model_path, &record)?;
    println!("Wrote default model to {}", model_path.display());
    Ok(())
}

fn load_record(model_path: &Path) -> Result<ModelRecord> {
    let loaded = persistence::load_model(model_path)?;
    loaded.record.ok_or_else(|| {
        DamflowError::Input(format!(
            "{} holds no usable model: {}",
            model_path.display(),
            loaded.warnings.join("; ")
        ))
    })
}

/// Path prefix inside the export directory, named after the model file
fn export_base(dir: &Path, model_path: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stem = model_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "damflow".to_owned());
    Ok(dir.join(stem))
}

fn print_report(result: &FlowResult) {
    let params = &result.params;
    println!("Groundwater flow | model version {}", persistence::MODEL_VERSION);
    println!(
        "  w = {} m, h = {} m, d = {} m, t = {} m, p = {} m",
        params.width, params.height, params.depth, params.thickness, params.pressure
    );
    println!(
        "  kx = {} m/day, ky = {} m/day, ep = {} m, element size = {}",
        params.permeability.kx,
        params.permeability.ky,
        params.slice_thickness,
        params.element_size
    );
    println!(
        "  {} nodes, {} elements",
        result.mesh.vertices.len(),
        result.mesh.elements.len()
    );
    println!("  Maximal effective flux: {:.4}", result.max_effective_flux());
    println!("  Discharge: {:.4}", result.discharge());
    println!("  Solved in {:.3} s", result.timings.total().as_secs_f64());
}

fn cmd_solve(model_path: &Path, run: &RunArgs, save_results: bool) -> Result<()> {
    let mut record = load_record(model_path)?;
    let mesher = run.mesher();
    let progress = run.progress();

    let result = model::run(
        &record.params,
        &*mesher,
        &run.settings(),
        progress.as_ref().map(|p| p as &dyn ProgressSink),
    );
    if let Some(bar) = &progress {
        bar.finish();
    }
    let result = result?;

    print_report(&result);

    if let Some(dir) = &run.export {
        let base = export_base(dir, model_path)?;
        export::write_csv(
            &result.mesh,
            &result.solution,
            &result.elemental,
            &export::output_path(&base, ".nodes.csv"),
            &export::output_path(&base, ".elements.csv"),
        )?;
        export::write_vtk(
            &export::output_path(&base, ".vtk"),
            &result.mesh,
            &result.solution,
            &result.elemental,
        )?;
    }

    if save_results {
        record.results = Some(result.solution);
        persistence::save_model(model_path, &record)?;
    }

    Ok(())
}

fn cmd_study(model_path: &Path, run: &RunArgs, parallel: bool) -> Result<()> {
    let record = load_record(model_path)?;
    let Some(sweep) = record.study else {
        return Err(DamflowError::Input(format!(
            "{} defines no parameter study",
            model_path.display()
        )));
    };

    let mesher = run.mesher();
    let progress = run.progress();
    let step_base = match &run.export {
        Some(dir) => Some(export_base(dir, model_path)?),
        None => None,
    };
    let variable = sweep.variable();

    let export_step = |step: usize, result: &FlowResult| -> Result<()> {
        match &step_base {
            Some(base) => export::write_vtk(
                &export::step_path(base, variable, step),
                &result.mesh,
                &result.solution,
                &result.elemental,
            ),
            None => Ok(()),
        }
    };

    let options = StudyOptions {
        parallel,
        progress: progress.as_ref().map(|p| p as &dyn ProgressSink),
        cancel: None,
        on_step: Some(&export_step),
    };

    let outcome = study::run_study(&record.params, &sweep, &*mesher, &run.settings(), &options);
    if let Some(bar) = &progress {
        bar.finish();
    }
    let outcome = outcome?;

    println!("{:>10} {:>22}", variable.symbol(), "max effective flux");
    for point in &outcome.points {
        println!("{:>10.4} {:>22.6}", point.value, point.max_effective_flux);
    }

    if let Some(base) = &step_base {
        export::write_study_csv(&export::output_path(base, ".study.csv"), &outcome)?;
    }

    match outcome.abort {
        None => {
            info!("parameter study finished with {} steps", outcome.points.len());
            Ok(())
        }
        Some(StudyAbort::Cancelled { step }) => {
            println!("Study cancelled before step {step}");
            Ok(())
        }
        Some(StudyAbort::Failed { step, value, error }) => {
            eprintln!(
                "Step {step} ({} = {value}) failed, {} earlier steps kept",
                variable.symbol(),
                outcome.points.len()
            );
            Err(error)
        }
    }
}
