use approx::assert_abs_diff_eq;
use damflow::{
    error::DamflowError,
    gmsh::GmshMesher,
    mesher::StructuredMesher,
    model::{run, FlowResult},
    params::{InputParameters, Permeability},
    solver::{SolverMethod, SolverSettings},
};
use proptest::prelude::*;

fn dam(element_size: f64) -> InputParameters {
    InputParameters {
        width: 10.0,
        height: 5.0,
        depth: 2.0,
        thickness: 2.0,
        pressure: 5.0,
        permeability: Permeability::isotropic(1.0),
        slice_thickness: 1.0,
        element_size,
    }
}

fn solve(params: &InputParameters) -> FlowResult {
    run(
        params,
        &StructuredMesher::default(),
        &SolverSettings::default(),
        None,
    )
    .unwrap()
}

fn prescribed(result: &FlowResult, node: usize) -> bool {
    result
        .boundary_conditions
        .essential
        .iter()
        .any(|bc| bc.node == node)
}

#[test]
fn free_nodes_carry_no_reaction() {
    let result = solve(&dam(0.5));
    let scale = result.discharge();

    for (node, reaction) in result.solution.reaction.iter().enumerate() {
        if !prescribed(&result, node) {
            assert!(
                reaction.abs() <= 1e-9 * scale,
                "node {node} has reaction {reaction}"
            );
        }
    }
}

#[test]
fn heads_stay_between_the_water_levels() {
    let result = solve(&dam(0.5));
    let p = result.params.pressure;

    for head in result.solution.head.iter() {
        assert!(*head >= -1e-9 * p && *head <= p * (1.0 + 1e-9), "head {head}");
    }
}

#[test]
fn water_flows_downstream_beneath_the_dam() {
    let result = solve(&dam(0.5));
    let params = &result.params;
    let dam_left = (params.width - params.thickness) / 2.0;
    let dam_right = (params.width + params.thickness) / 2.0;

    let mut checked = 0;
    for (element, flux) in result.mesh.elements.iter().zip(&result.elemental.flux) {
        let c = result.mesh.centroid(element);
        if c.x > dam_left && c.x < dam_right {
            assert!(flux.x > 0.0, "element at ({}, {}) has qx {}", c.x, c.y, flux.x);
            checked += 1;
        }
    }
    assert!(checked > 0);
}

#[test]
fn discharge_converges_under_refinement() {
    let coarse = solve(&dam(1.0));
    let medium = solve(&dam(0.5));
    let fine = solve(&dam(0.25));

    let (q1, q2, q3) = (coarse.discharge(), medium.discharge(), fine.discharge());

    // nested meshes: the discrete discharge decreases towards the exact one
    assert!(q2 <= q1 * (1.0 + 1e-9));
    assert!(q3 <= q2 * (1.0 + 1e-9));
    assert!((q2 - q3).abs() < (q1 - q2).abs());

    // the flux is singular at the dam corners, so its maximum grows slowly
    let growth = medium.max_effective_flux() / coarse.max_effective_flux();
    assert!(growth > 0.0 && growth < 2.0, "max flux grew by {growth}");
}

#[test]
fn discharge_scales_with_permeability_and_slice_thickness() {
    let base = solve(&dam(1.0));
    let scaled = solve(&InputParameters {
        permeability: Permeability::isotropic(3.0),
        slice_thickness: 2.0,
        ..dam(1.0)
    });

    assert_abs_diff_eq!(
        scaled.discharge(),
        6.0 * base.discharge(),
        epsilon = 1e-8 * base.discharge()
    );
    for i in 0..base.solution.head.len() {
        assert_abs_diff_eq!(scaled.solution.head[i], base.solution.head[i], epsilon = 1e-9);
    }
}

#[test]
fn iterative_solver_agrees_with_direct() {
    let params = dam(0.5);
    let direct = solve(&params);
    let iterative = run(
        &params,
        &StructuredMesher::default(),
        &SolverSettings {
            method: SolverMethod::ConjugateGradient,
            ..Default::default()
        },
        None,
    )
    .unwrap();

    for i in 0..direct.solution.head.len() {
        assert_abs_diff_eq!(iterative.solution.head[i], direct.solution.head[i], epsilon = 1e-6);
    }
}

#[test]
fn oversized_model_is_reported_not_truncated() {
    let result = run(
        &dam(0.25),
        &StructuredMesher::default(),
        &SolverSettings {
            max_direct_dofs: 100,
            ..Default::default()
        },
        None,
    );
    assert!(matches!(result, Err(DamflowError::ResourceExhaustion { .. })));
}

#[test]
fn largest_documented_model_solves_with_default_settings() {
    let params = InputParameters {
        width: 100.0,
        height: 50.0,
        element_size: 0.5,
        ..Default::default()
    };
    let result = solve(&params);

    // well above the dense limit, so the sparse factorisation is used
    assert!(result.mesh.vertices.len() > 20_000);
    let total: f64 = result.solution.reaction.iter().sum();
    assert!(total.abs() <= 1e-8 * result.discharge());
    for head in result.solution.head.iter() {
        assert!(*head >= -1e-8 && *head <= params.pressure * (1.0 + 1e-8));
    }
}

#[test]
fn missing_gmsh_is_a_mesh_generation_error() {
    let mesher = GmshMesher {
        executable: "damflow-test-no-such-gmsh".into(),
        ..Default::default()
    };
    let result = run(&dam(1.0), &mesher, &SolverSettings::default(), None);
    assert!(matches!(result, Err(DamflowError::MeshGeneration(_))));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn any_valid_dam_conserves_flow(
        width in 4.0_f64..16.0,
        height in 2.0_f64..8.0,
        thickness_share in 0.1_f64..0.8,
        depth_share in 0.1_f64..0.8,
        pressure in 0.5_f64..20.0,
        k in 0.1_f64..50.0,
    ) {
        let params = InputParameters {
            width,
            height,
            depth: depth_share * height,
            thickness: thickness_share * width,
            pressure,
            permeability: Permeability::isotropic(k),
            slice_thickness: 1.0,
            element_size: 1.0,
        };
        let result = solve(&params);

        let total: f64 = result.solution.reaction.iter().sum();
        prop_assert!(total.abs() <= 1e-8 * result.discharge().max(1.0));
        prop_assert!(result.discharge() > 0.0);
        for head in result.solution.head.iter() {
            prop_assert!(*head >= -1e-8 * pressure && *head <= pressure * (1.0 + 1e-8));
        }
    }
}
