use std::fmt::Display;

use nalgebra::{matrix, SMatrix};

use crate::error::{DamflowError, Result};

/// Permeability coefficients along the coordinate axes [m/day]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Permeability {
    pub kx: f64,
    pub ky: f64,
}

impl Permeability {
    pub fn isotropic(k: f64) -> Permeability {
        Permeability { kx: k, ky: k }
    }

    /// Constitutive matrix `D` of Darcy's law, `q = -D grad(phi)`
    pub fn matrix(&self) -> SMatrix<f64, 2, 2> {
        matrix![
            self.kx, 0.0;
            0.0, self.ky;
        ]
    }
}

/// Dam and soil description for a single solve.
///
/// The ground is the rectangle `[0, width] x [0, height]`; the dam body of
/// `thickness` is centred horizontally and cut `depth` down from the top edge.
#[derive(Debug, Clone, PartialEq)]
pub struct InputParameters {
    /// Width of the ground `w` [m]
    pub width: f64,
    /// Height of the ground `h` [m]
    pub height: f64,
    /// Depth of the dam body `d` [m]
    pub depth: f64,
    /// Thickness of the dam body `t` [m]
    pub thickness: f64,
    /// Piezometric head held back on the upstream side `p` [m]
    pub pressure: f64,
    pub permeability: Permeability,
    /// Out-of-plane thickness of the modelled slice `ep` [m]
    pub slice_thickness: f64,
    /// Maximal element size factor `e`
    pub element_size: f64,
}

impl Default for InputParameters {
    fn default() -> Self {
        InputParameters {
            width: 50.0,
            height: 10.0,
            depth: 2.0,
            thickness: 1.0,
            pressure: 10.0,
            permeability: Permeability::isotropic(20.0),
            slice_thickness: 1.0,
            element_size: 1.0,
        }
    }
}

fn ensure_positive(parameter: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(DamflowError::invalid(
            parameter,
            format!("must be a positive number, got {value}"),
        ))
    }
}

impl InputParameters {
    /// Checks positivity of every value and the ordering `w > t`, `h > d`
    pub fn validate(&self) -> Result<()> {
        ensure_positive("w", self.width)?;
        ensure_positive("h", self.height)?;
        ensure_positive("d", self.depth)?;
        ensure_positive("t", self.thickness)?;
        ensure_positive("p", self.pressure)?;
        ensure_positive("kx", self.permeability.kx)?;
        ensure_positive("ky", self.permeability.ky)?;
        ensure_positive("ep", self.slice_thickness)?;
        ensure_positive("el_size_factor", self.element_size)?;

        if self.width <= self.thickness {
            return Err(DamflowError::invalid(
                "t",
                format!(
                    "must be smaller than the width w = {}, got {}",
                    self.width, self.thickness
                ),
            ));
        }
        if self.height <= self.depth {
            return Err(DamflowError::invalid(
                "d",
                format!(
                    "must be smaller than the height h = {}, got {}",
                    self.height, self.depth
                ),
            ));
        }

        Ok(())
    }

    pub fn value_of(&self, variable: SweptVariable) -> f64 {
        match variable {
            SweptVariable::Thickness => self.thickness,
            SweptVariable::Depth => self.depth,
        }
    }

    /// Copy of these parameters with the swept variable replaced
    pub fn with(&self, variable: SweptVariable, value: f64) -> InputParameters {
        let mut params = self.clone();
        match variable {
            SweptVariable::Thickness => params.thickness = value,
            SweptVariable::Depth => params.depth = value,
        }
        params
    }

    /// Non-fatal warnings about models known to need a lot of memory
    pub fn advisories(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.element_size <= 0.5 && (self.width > 100.0 || self.height > 50.0) {
            notes.push(format!(
                "w = {} m, h = {} m with element size {} may exceed available memory \
                 (known to work up to w = 100 m, h = 50 m at element size 0.5)",
                self.width, self.height, self.element_size
            ));
        }
        notes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweptVariable {
    Thickness,
    Depth,
}

impl SweptVariable {
    /// Short symbol used in labels and file names
    pub fn symbol(self) -> &'static str {
        match self {
            SweptVariable::Thickness => "t",
            SweptVariable::Depth => "d",
        }
    }
}

impl Display for SweptVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweptVariable::Thickness => write!(f, "thickness"),
            SweptVariable::Depth => write!(f, "depth"),
        }
    }
}

/// Which dam dimension a parameter study sweeps, with its end value and
/// number of steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterStudy {
    Thickness { end: f64, steps: usize },
    Depth { end: f64, steps: usize },
}

impl ParameterStudy {
    pub fn variable(&self) -> SweptVariable {
        match self {
            ParameterStudy::Thickness { .. } => SweptVariable::Thickness,
            ParameterStudy::Depth { .. } => SweptVariable::Depth,
        }
    }

    pub fn end(&self) -> f64 {
        match *self {
            ParameterStudy::Thickness { end, .. } | ParameterStudy::Depth { end, .. } => end,
        }
    }

    pub fn steps(&self) -> usize {
        match *self {
            ParameterStudy::Thickness { steps, .. } | ParameterStudy::Depth { steps, .. } => steps,
        }
    }

    /// Checks `w > t_end > t` or `h > d_end > d` against the base parameters
    pub fn validate(&self, base: &InputParameters) -> Result<()> {
        if self.steps() == 0 {
            return Err(DamflowError::invalid("steps", "must be at least 1"));
        }

        let (parameter, start, limit) = match self {
            ParameterStudy::Thickness { .. } => ("tEnd", base.thickness, base.width),
            ParameterStudy::Depth { .. } => ("dEnd", base.depth, base.height),
        };
        let end = self.end();

        if !end.is_finite() || end <= start || end >= limit {
            return Err(DamflowError::invalid(
                parameter,
                format!("must lie strictly between {start} and {limit}, got {end}"),
            ));
        }

        Ok(())
    }

    /// `steps + 1` equally spaced values from the base value to the end value,
    /// both inclusive
    pub fn values(&self, base: &InputParameters) -> Vec<f64> {
        let start = base.value_of(self.variable());
        let end = self.end();
        let steps = self.steps();

        if steps == 0 {
            return vec![start];
        }

        let delta = (end - start) / steps as f64;
        let mut values: Vec<f64> = (0..=steps).map(|i| start + i as f64 * delta).collect();
        values[steps] = end;
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn default_model_is_valid() {
        InputParameters::default().validate().unwrap();
    }

    #[test]
    fn rejects_thickness_wider_than_ground() {
        let params = InputParameters {
            width: 1.0,
            thickness: 2.0,
            ..Default::default()
        };
        match params.validate() {
            Err(DamflowError::InvalidGeometry { parameter, .. }) => assert_eq!(parameter, "t"),
            other => panic!("expected invalid geometry, got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_positive_values() {
        let params = InputParameters {
            permeability: Permeability { kx: 1.0, ky: 0.0 },
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(DamflowError::InvalidGeometry { parameter: "ky", .. })
        ));

        let params = InputParameters {
            pressure: f64::NAN,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn study_values_include_both_ends() {
        let base = InputParameters::default();
        let study = ParameterStudy::Depth { end: 8.0, steps: 3 };
        let values = study.values(&base);

        assert_eq!(values.len(), 4);
        assert_relative_eq!(values[0], 2.0);
        assert_relative_eq!(values[1], 4.0);
        assert_relative_eq!(values[2], 6.0);
        assert_eq!(values[3], 8.0);
    }

    #[test]
    fn study_end_must_stay_inside_ground() {
        let base = InputParameters::default();

        assert!(ParameterStudy::Thickness { end: 10.0, steps: 4 }
            .validate(&base)
            .is_ok());
        assert!(ParameterStudy::Thickness { end: 50.0, steps: 4 }
            .validate(&base)
            .is_err());
        assert!(ParameterStudy::Depth { end: 1.0, steps: 4 }
            .validate(&base)
            .is_err());
        assert!(ParameterStudy::Depth { end: 8.0, steps: 0 }
            .validate(&base)
            .is_err());
    }

    #[test]
    fn with_replaces_only_swept_variable() {
        let base = InputParameters::default();
        let moved = base.with(SweptVariable::Thickness, 4.0);
        assert_eq!(moved.thickness, 4.0);
        assert_eq!(moved.depth, base.depth);
    }

    #[test]
    fn fine_large_models_get_an_advisory() {
        let params = InputParameters {
            width: 150.0,
            element_size: 0.5,
            ..Default::default()
        };
        assert_eq!(params.advisories().len(), 1);
        assert!(InputParameters::default().advisories().is_empty());
    }
}
