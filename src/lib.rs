//! Steady-state groundwater flow beneath a dam, solved with linear
//! triangular finite elements.
//!
//! A single solve runs geometry, meshing, assembly, the linear solve and
//! post-processing through [`model::run`]; [`study::run_study`] repeats it
//! while sweeping the dam thickness or depth.

pub mod assembler;
pub mod datatypes;
pub mod error;
pub mod export;
pub mod geometry;
pub mod gmsh;
pub mod mesher;
pub mod model;
pub mod params;
pub mod persistence;
pub mod post_processor;
pub mod progress;
pub mod solver;
pub mod study;

pub use error::{DamflowError, Result};
pub use model::{run, FlowResult};
pub use params::{InputParameters, ParameterStudy, Permeability};
pub use study::{run_study, StudyOptions, StudyResult};
