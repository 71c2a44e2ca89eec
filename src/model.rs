use tracing::{info, warn};

use crate::{
    assembler::{assemble, BoundaryConditions},
    datatypes::Mesh,
    error::Result,
    geometry::{build_geometry_from, PlanarRegion},
    mesher::Mesher,
    params::InputParameters,
    post_processor::{derive, ElementalFields},
    progress::{notify, ProgressSink, Stage, StageTimer, StageTimings},
    solver::{solve_with, SolutionField, SolverSettings},
};

/// Everything one pass of the pipeline produces. Read-only once built.
#[derive(Debug, Clone)]
pub struct FlowResult {
    pub params: InputParameters,
    pub region: PlanarRegion,
    pub mesh: Mesh,
    pub boundary_conditions: BoundaryConditions,
    pub solution: SolutionField,
    pub elemental: ElementalFields,
    pub timings: StageTimings,
}

impl FlowResult {
    pub fn max_effective_flux(&self) -> f64 {
        self.elemental.max_effective_flux()
    }

    /// Total flow entering through the prescribed boundaries per unit time
    pub fn discharge(&self) -> f64 {
        self.solution.reaction.iter().filter(|r| **r > 0.0).sum()
    }
}

/// Runs geometry, meshing, assembly, solve and post-processing for one set
/// of parameters
///
/// # Arguments
/// * `params` - The dam and soil description, validated before any work
/// * `mesher` - Triangulates the dam cross-section
/// * `settings` - Linear solver configuration
/// * `progress` - Optional sink notified at every stage
pub fn run(
    params: &InputParameters,
    mesher: &dyn Mesher,
    settings: &SolverSettings,
    progress: Option<&dyn ProgressSink>,
) -> Result<FlowResult> {
    params.validate()?;
    for advisory in params.advisories() {
        warn!("{advisory}");
    }

    let mut timer = StageTimer::start();

    notify(progress, Stage::Geometry);
    let region = build_geometry_from(params)?;
    timer.lap(Stage::Geometry);

    notify(progress, Stage::Meshing);
    let mesh = mesher.mesh(&region, params.element_size)?;
    info!(
        "meshed with {} nodes and {} elements",
        mesh.vertices.len(),
        mesh.elements.len()
    );
    timer.lap(Stage::Meshing);

    notify(progress, Stage::BoundaryConditions);
    let boundary_conditions = BoundaryConditions::for_dam(&mesh, params.pressure);
    timer.lap(Stage::BoundaryConditions);

    notify(progress, Stage::Assembly);
    let system = assemble(
        &mesh,
        &params.permeability,
        &boundary_conditions,
        params.slice_thickness,
    )?;
    timer.lap(Stage::Assembly);

    notify(progress, Stage::Solve);
    let solution = solve_with(&system, &boundary_conditions.essential, settings)?;
    timer.lap(Stage::Solve);

    notify(progress, Stage::ElementVariables);
    let elemental = derive(&mesh, &solution, &params.permeability)?;
    timer.lap(Stage::ElementVariables);

    notify(progress, Stage::EffectiveFlux);
    let max_flux = elemental.max_effective_flux();
    timer.lap(Stage::EffectiveFlux);

    notify(progress, Stage::Done);
    let timings = timer.finish();
    timings.log(mesh.elements.len());
    info!("solve complete, maximal effective flux {max_flux:.4}");

    Ok(FlowResult {
        params: params.clone(),
        region,
        mesh,
        boundary_conditions,
        solution,
        elemental,
        timings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::DamflowError, mesher::StructuredMesher};
    use std::sync::Mutex;

    fn small_model() -> InputParameters {
        InputParameters {
            width: 10.0,
            height: 4.0,
            depth: 2.0,
            thickness: 2.0,
            pressure: 5.0,
            element_size: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn reports_every_stage_in_order() {
        let percents: Mutex<Vec<u8>> = Mutex::new(Vec::new());
        let sink = |percent: u8, _label: &str| percents.lock().unwrap().push(percent);

        let result = run(
            &small_model(),
            &StructuredMesher::default(),
            &SolverSettings::default(),
            Some(&sink),
        )
        .unwrap();

        let percents = percents.into_inner().unwrap();
        assert_eq!(percents, vec![1, 3, 18, 20, 70, 80, 97, 100]);
        assert_eq!(result.timings.laps.len(), 7);
    }

    #[test]
    fn invalid_parameters_stop_before_meshing() {
        let calls: Mutex<usize> = Mutex::new(0);
        let sink = |_percent: u8, _label: &str| *calls.lock().unwrap() += 1;
        let params = InputParameters {
            depth: 5.0,
            height: 4.0,
            ..small_model()
        };

        let result = run(
            &params,
            &StructuredMesher::default(),
            &SolverSettings::default(),
            Some(&sink),
        );
        assert!(matches!(result, Err(DamflowError::InvalidGeometry { parameter: "d", .. })));
        assert_eq!(calls.into_inner().unwrap(), 0);
    }

    #[test]
    fn inflow_matches_outflow() {
        let result = run(
            &small_model(),
            &StructuredMesher::default(),
            &SolverSettings::default(),
            None,
        )
        .unwrap();

        let total: f64 = result.solution.reaction.iter().sum();
        assert!(result.discharge() > 0.0);
        assert!(total.abs() < 1e-9 * result.discharge());
    }
}
