use std::collections::BTreeMap;

use nalgebra::{matrix, DVector, SMatrix};
use nalgebra_sparse::{coo::CooMatrix, csc::CscMatrix};
use tracing::debug;

use crate::{
    datatypes::{BoundaryMarker, Element, Mesh},
    error::{DamflowError, Result},
    params::Permeability,
};

/// Relative area below which a triangle counts as collapsed
const DEGENERATE_AREA: f64 = 1e-12;

/// Prescribed piezometric head at a node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EssentialBc {
    pub node: usize,
    pub head: f64,
}

/// Prescribed nodal flux (load). Boundaries without one carry zero flux.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NaturalBc {
    pub node: usize,
    pub flux: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundaryConditions {
    /// Sorted by node, one entry per node
    pub essential: Vec<EssentialBc>,
    pub natural: Vec<NaturalBc>,
}

impl BoundaryConditions {
    /// Prescribes `head` on every node carrying one of the given labels. A node
    /// on several labelled boundaries keeps the head of the last matching one.
    pub fn from_markers(mesh: &Mesh, heads: &[(BoundaryMarker, f64)]) -> BoundaryConditions {
        let mut prescribed: BTreeMap<usize, f64> = BTreeMap::new();
        for (marker, head) in heads {
            for &node in mesh.nodes_on(*marker) {
                prescribed.insert(node, *head);
            }
        }

        BoundaryConditions {
            essential: prescribed
                .into_iter()
                .map(|(node, head)| EssentialBc { node, head })
                .collect(),
            natural: Vec::new(),
        }
    }

    /// Dam loading: head `pressure` on the upstream water level, zero on the
    /// downstream one
    pub fn for_dam(mesh: &Mesh, pressure: f64) -> BoundaryConditions {
        BoundaryConditions::from_markers(
            mesh,
            &[
                (BoundaryMarker::Downstream, 0.0),
                (BoundaryMarker::Upstream, pressure),
            ],
        )
    }
}

/// Global conductivity matrix `K` and load vector `f` of `K a = f`
#[derive(Debug, Clone)]
pub struct LinearSystem {
    pub stiffness: CscMatrix<f64>,
    pub load: DVector<f64>,
}

impl LinearSystem {
    pub fn num_dofs(&self) -> usize {
        self.load.len()
    }
}

/// Signed area of the element, positive for counter-clockwise nodes
pub fn compute_element_area(element: &Element, mesh: &Mesh) -> f64 {
    let [v0, v1, v2] = mesh.element_vertices(element);

    0.5 * (v0.x * (v1.y - v2.y) + v1.x * (v2.y - v0.y) + v2.x * (v0.y - v1.y))
}

/// Gradient operator `B` of the linear shape functions, so that
/// `grad(phi) = B * [phi0, phi1, phi2]`
pub fn compute_gradient_matrix(element: &Element, mesh: &Mesh, element_area: f64) -> SMatrix<f64, 2, 3> {
    let [v0, v1, v2] = mesh.element_vertices(element);

    let beta_1 = v1.y - v2.y;
    let beta_2 = v2.y - v0.y;
    let beta_3 = v0.y - v1.y;

    let gamma_1 = v2.x - v1.x;
    let gamma_2 = v0.x - v2.x;
    let gamma_3 = v1.x - v0.x;

    let mut gradient_mat: SMatrix<f64, 2, 3> = matrix![
        beta_1, beta_2, beta_3;
        gamma_1, gamma_2, gamma_3;
    ];

    gradient_mat /= 2.0 * element_area;

    gradient_mat
}

/// Checks that the element is a proper triangle and returns its signed area
pub fn checked_element_area(index: usize, element: &Element, mesh: &Mesh) -> Result<f64> {
    let area = compute_element_area(element, mesh);
    let [v0, v1, v2] = mesh.element_vertices(element);
    let scale = f64::max(
        v0.distance(&v1).max(v1.distance(&v2)),
        v2.distance(&v0),
    );

    if !area.is_finite() || area.abs() <= DEGENERATE_AREA * scale * scale {
        return Err(DamflowError::singular(format!(
            "element {index} with nodes {:?} has no area",
            element.nodes
        )));
    }

    Ok(area)
}

/// Element conductivity matrix `Ke = B^T D B * area * thickness`
pub fn compute_element_conductivity_matrix(
    element: &Element,
    mesh: &Mesh,
    element_area: f64,
    constitutive: &SMatrix<f64, 2, 2>,
    thickness: f64,
) -> SMatrix<f64, 3, 3> {
    let gradient_mat = compute_gradient_matrix(element, mesh, element_area);

    (gradient_mat.transpose() * constitutive) * gradient_mat * element_area.abs() * thickness
}

fn check_node(node: usize, num_dofs: usize, what: &str) -> Result<()> {
    if node >= num_dofs {
        return Err(DamflowError::Input(format!(
            "{what} refers to node {node}, mesh has {num_dofs} nodes"
        )));
    }
    Ok(())
}

/// Assembles the global conductivity matrix and load vector.
///
/// Each element contributes its 3x3 conductivity matrix at its three node
/// indices (one dof per node). Natural boundary conditions become nodal
/// loads; essential ones are only checked here and applied by the solver.
///
/// # Arguments
/// * `mesh` - Triangles and vertices of the flow region
/// * `permeability` - Hydraulic conductivity tensor of the soil
/// * `boundary_conditions` - Prescribed heads and nodal fluxes
/// * `thickness` - Out-of-plane slice thickness scaling every element
pub fn assemble(
    mesh: &Mesh,
    permeability: &Permeability,
    boundary_conditions: &BoundaryConditions,
    thickness: f64,
) -> Result<LinearSystem> {
    let num_dofs = mesh.num_dofs();
    let constitutive = permeability.matrix();

    for element in &mesh.elements {
        for &node in &element.nodes {
            check_node(node, num_dofs, "element")?;
        }
    }
    for bc in &boundary_conditions.essential {
        check_node(bc.node, num_dofs, "essential boundary condition")?;
    }
    for bc in &boundary_conditions.natural {
        check_node(bc.node, num_dofs, "natural boundary condition")?;
    }

    let mut triplets: CooMatrix<f64> = CooMatrix::new(num_dofs, num_dofs);

    for (index, element) in mesh.elements.iter().enumerate() {
        let element_area = checked_element_area(index, element, mesh)?;
        let conductivity_mat = compute_element_conductivity_matrix(
            element,
            mesh,
            element_area,
            &constitutive,
            thickness,
        );

        for (local_row, global_row) in element.nodes.iter().enumerate() {
            for (local_col, global_col) in element.nodes.iter().enumerate() {
                triplets.push(*global_row, *global_col, conductivity_mat[(local_row, local_col)]);
            }
        }
    }

    let stiffness = CscMatrix::from(&triplets);

    let mut load: DVector<f64> = DVector::zeros(num_dofs);
    for bc in &boundary_conditions.natural {
        load[bc.node] += bc.flux;
    }

    debug!(
        "assembled {} element matrices into a {}x{} system with {} non-zeros",
        mesh.elements.len(),
        num_dofs,
        num_dofs,
        stiffness.nnz()
    );

    Ok(LinearSystem { stiffness, load })
}
