//! Parameter studies: repeats the full pipeline while sweeping the dam
//! thickness or depth and records the maximal effective flux of every step.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    error::{DamflowError, Result},
    mesher::Mesher,
    model::{self, FlowResult},
    params::{InputParameters, ParameterStudy, SweptVariable},
    progress::ProgressSink,
    solver::SolverSettings,
};

/// One finished step of a study
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StudyPoint {
    pub value: f64,
    pub max_effective_flux: f64,
}

/// Why a study stopped before its last step
#[derive(Debug)]
pub enum StudyAbort {
    Failed {
        step: usize,
        value: f64,
        error: DamflowError,
    },
    Cancelled {
        step: usize,
    },
}

/// Ordered study results. Points before an abort stay valid.
#[derive(Debug)]
pub struct StudyResult {
    pub variable: SweptVariable,
    pub points: Vec<StudyPoint>,
    pub abort: Option<StudyAbort>,
}

impl StudyResult {
    pub fn is_complete(&self) -> bool {
        self.abort.is_none()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn max_fluxes(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.max_effective_flux).collect()
    }
}

/// Shared flag to stop a running study before its next step
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Called with the step index and full result of every successful step,
/// e.g. to export it. An error aborts the study like a failed solve.
pub type StepObserver<'a> = &'a (dyn Fn(usize, &FlowResult) -> Result<()> + Sync);

#[derive(Default)]
pub struct StudyOptions<'a> {
    /// Run steps on the rayon thread pool
    pub parallel: bool,
    pub progress: Option<&'a dyn ProgressSink>,
    pub cancel: Option<CancelToken>,
    pub on_step: Option<StepObserver<'a>>,
}

impl StudyOptions<'_> {
    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    fn report(&self, done: usize, total: usize, label: &str) {
        if let Some(sink) = self.progress {
            let percent = (done * 100 / total.max(1)).min(100) as u8;
            sink.set(percent, label);
        }
    }
}

enum StepOutcome {
    Done(StudyPoint),
    Failed(DamflowError),
    Cancelled,
    Skipped,
}

struct StepContext<'a> {
    base: &'a InputParameters,
    variable: SweptVariable,
    mesher: &'a dyn Mesher,
    settings: &'a SolverSettings,
    on_step: Option<StepObserver<'a>>,
}

impl StepContext<'_> {
    /// Rebuilds geometry and mesh from scratch for the swept value
    fn run(&self, step: usize, value: f64) -> Result<StudyPoint> {
        let params = self.base.with(self.variable, value);
        let result = model::run(&params, self.mesher, self.settings, None)?;

        if let Some(observer) = self.on_step {
            observer(step, &result)?;
        }

        Ok(StudyPoint {
            value,
            max_effective_flux: result.max_effective_flux(),
        })
    }
}

fn step_label(variable: SweptVariable, value: f64) -> String {
    format!("Executing for {} = {value:.2}...", variable.symbol())
}

/// Runs a parameter study.
///
/// Generates `steps + 1` equally spaced values from the base value to the
/// end value, both inclusive, and solves each one independently. Invalid
/// base or sweep parameters are reported as an error before any step runs.
/// A failing step or a cancellation stops the study; the points gathered
/// before it are returned together with the reason in `StudyResult::abort`.
///
/// # Arguments
/// * `base` - Parameters of step 0; the swept one starts from its value here
/// * `study` - Swept variable, end value and number of intervals
/// * `mesher` - Mesh generator used for every step
/// * `settings` - Solver settings shared by every step
/// * `options` - Parallelism, progress, cancellation and per-step observer
pub fn run_study(
    base: &InputParameters,
    study: &ParameterStudy,
    mesher: &dyn Mesher,
    settings: &SolverSettings,
    options: &StudyOptions,
) -> Result<StudyResult> {
    base.validate()?;
    study.validate(base)?;

    let variable = study.variable();
    let values = study.values(base);
    let context = StepContext {
        base,
        variable,
        mesher,
        settings,
        on_step: options.on_step,
    };

    info!(
        "parameter study of {variable} from {} to {} in {} steps",
        values[0],
        study.end(),
        study.steps()
    );

    let outcomes = if options.parallel {
        run_parallel(&context, &values, options)
    } else {
        run_sequential(&context, &values, options)
    };

    let mut points = Vec::with_capacity(values.len());
    let mut abort = None;

    for (step, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            StepOutcome::Done(point) => points.push(point),
            StepOutcome::Failed(error) => {
                warn!("study step {step} ({} = {}) failed: {error}", variable.symbol(), values[step]);
                abort = Some(StudyAbort::Failed {
                    step,
                    value: values[step],
                    error,
                });
                break;
            }
            StepOutcome::Cancelled => {
                info!("study cancelled before step {step}");
                abort = Some(StudyAbort::Cancelled { step });
                break;
            }
            StepOutcome::Skipped => break,
        }
    }

    options.report(values.len(), values.len(), "Parameter study is done.");

    Ok(StudyResult {
        variable,
        points,
        abort,
    })
}

fn run_sequential(
    context: &StepContext,
    values: &[f64],
    options: &StudyOptions,
) -> Vec<StepOutcome> {
    let mut outcomes = Vec::with_capacity(values.len());

    for (step, &value) in values.iter().enumerate() {
        if options.cancelled() {
            outcomes.push(StepOutcome::Cancelled);
            break;
        }

        options.report(step, values.len(), &step_label(context.variable, value));
        info!("executing for {} = {value}", context.variable.symbol());

        match context.run(step, value) {
            Ok(point) => outcomes.push(StepOutcome::Done(point)),
            Err(error) => {
                outcomes.push(StepOutcome::Failed(error));
                break;
            }
        }
    }

    outcomes
}

fn run_parallel(
    context: &StepContext,
    values: &[f64],
    options: &StudyOptions,
) -> Vec<StepOutcome> {
    let first_failure = AtomicUsize::new(usize::MAX);
    let completed = AtomicUsize::new(0);

    values
        .par_iter()
        .enumerate()
        .map(|(step, &value)| {
            if options.cancelled() {
                return StepOutcome::Cancelled;
            }
            // later steps are dropped anyway once an earlier one failed
            if first_failure.load(Ordering::SeqCst) < step {
                return StepOutcome::Skipped;
            }

            info!("executing for {} = {value}", context.variable.symbol());
            let outcome = match context.run(step, value) {
                Ok(point) => StepOutcome::Done(point),
                Err(error) => {
                    first_failure.fetch_min(step, Ordering::SeqCst);
                    StepOutcome::Failed(error)
                }
            };

            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            options.report(done, values.len(), &step_label(context.variable, value));

            outcome
        })
        .collect()
}
