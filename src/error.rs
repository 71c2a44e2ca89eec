use thiserror::Error;

pub type Result<T> = std::result::Result<T, DamflowError>;

#[derive(Error, Debug)]
pub enum DamflowError {
    #[error("Invalid geometry: {parameter} {reason}")]
    InvalidGeometry {
        parameter: &'static str,
        reason: String,
    },

    #[error("Mesher error: {0}")]
    MeshGeneration(String),

    #[error("Singular system: {reason}")]
    SingularSystem { reason: String },

    #[error("Resource exhaustion: {what} needs {requested}, limit is {limit}")]
    ResourceExhaustion {
        what: &'static str,
        requested: usize,
        limit: usize,
    },

    #[error("Solver did not converge after {iterations} iterations (residual {residual:e})")]
    NonConvergence { iterations: u64, residual: f64 },

    #[error("Input error: {0}")]
    Input(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DamflowError {
    pub(crate) fn invalid(parameter: &'static str, reason: impl Into<String>) -> Self {
        DamflowError::InvalidGeometry {
            parameter,
            reason: reason.into(),
        }
    }

    pub(crate) fn singular(reason: impl Into<String>) -> Self {
        DamflowError::SingularSystem {
            reason: reason.into(),
        }
    }
}
