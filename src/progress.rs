use std::fmt::Display;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

/// Receives `(percent complete, label)` notifications at fixed checkpoints.
/// Must be shareable across the worker threads of a parallel study.
pub trait ProgressSink: Send + Sync {
    fn set(&self, percent: u8, label: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(u8, &str) + Send + Sync,
{
    fn set(&self, percent: u8, label: &str) {
        self(percent, label)
    }
}

/// Terminal progress bar for the command line front end
pub struct ProgressBarSink {
    bar: ProgressBar,
}

impl ProgressBarSink {
    pub fn new() -> ProgressBarSink {
        let bar = ProgressBar::new(100);
        if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos:>3}% {msg}") {
            bar.set_style(style);
        }
        ProgressBarSink { bar }
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}

impl Default for ProgressBarSink {
    fn default() -> Self {
        ProgressBarSink::new()
    }
}

impl ProgressSink for ProgressBarSink {
    fn set(&self, percent: u8, label: &str) {
        self.bar.set_position(u64::from(percent.min(100)));
        self.bar.set_message(label.to_owned());
    }
}

/// Checkpoints of a single solve, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Geometry,
    Meshing,
    BoundaryConditions,
    Assembly,
    Solve,
    ElementVariables,
    EffectiveFlux,
    Done,
}

impl Stage {
    /// Share of a typical solve completed when the stage starts
    pub fn percent(self) -> u8 {
        match self {
            Stage::Geometry => 1,
            Stage::Meshing => 3,
            Stage::BoundaryConditions => 18,
            Stage::Assembly => 20,
            Stage::Solve => 70,
            Stage::ElementVariables => 80,
            Stage::EffectiveFlux => 97,
            Stage::Done => 100,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Geometry => "Building geometry...",
            Stage::Meshing => "Generating mesh...",
            Stage::BoundaryConditions => "Applying boundary conditions...",
            Stage::Assembly => "Assembling conductivity matrix...",
            Stage::Solve => "Solving equation system...",
            Stage::ElementVariables => "Computing element variables...",
            Stage::EffectiveFlux => "Calculating effective flux...",
            Stage::Done => "Solver is done.",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Geometry => "geometry",
            Stage::Meshing => "meshing",
            Stage::BoundaryConditions => "boundary conditions",
            Stage::Assembly => "assembly",
            Stage::Solve => "solve",
            Stage::ElementVariables => "element variables",
            Stage::EffectiveFlux => "effective flux",
            Stage::Done => "done",
        };
        write!(f, "{name}")
    }
}

pub(crate) fn notify(progress: Option<&dyn ProgressSink>, stage: Stage) {
    if let Some(sink) = progress {
        sink.set(stage.percent(), stage.label());
    }
}

/// Wall time spent in each stage of a solve
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageTimings {
    pub laps: Vec<(Stage, Duration)>,
}

impl StageTimings {
    pub fn total(&self) -> Duration {
        self.laps.iter().map(|(_, d)| *d).sum()
    }

    pub fn get(&self, stage: Stage) -> Option<Duration> {
        self.laps.iter().find(|(s, _)| *s == stage).map(|(_, d)| *d)
    }

    /// Logs each stage with its share of the total at debug level
    pub fn log(&self, num_elements: usize) {
        let total = self.total().as_secs_f64();
        debug!("stage timings for {num_elements} elements:");
        for (stage, duration) in &self.laps {
            let seconds = duration.as_secs_f64();
            let share = if total > 0.0 { seconds / total * 100.0 } else { 0.0 };
            debug!("  {:<20} {:>8.3} s {:>6.2} %", stage.to_string(), seconds, share);
        }
    }
}

/// Stopwatch that attributes the time since the previous lap to a stage
pub struct StageTimer {
    reference: Instant,
    timings: StageTimings,
}

impl StageTimer {
    pub fn start() -> StageTimer {
        StageTimer {
            reference: Instant::now(),
            timings: StageTimings::default(),
        }
    }

    pub fn lap(&mut self, stage: Stage) {
        let now = Instant::now();
        self.timings.laps.push((stage, now - self.reference));
        self.reference = now;
    }

    pub fn finish(self) -> StageTimings {
        self.timings
    }
}
