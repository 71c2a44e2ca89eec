use nalgebra::{Vector2, Vector3};

use crate::{
    assembler::{checked_element_area, compute_gradient_matrix},
    datatypes::Mesh,
    error::{DamflowError, Result},
    params::Permeability,
    solver::SolutionField,
};

/// Constant-per-element results derived from the nodal heads
#[derive(Debug, Clone, PartialEq)]
pub struct ElementalFields {
    /// Heads at the three corners of each element
    pub head: Vec<[f64; 3]>,
    /// Hydraulic gradient `grad(phi)`
    pub gradient: Vec<Vector2<f64>>,
    /// Darcy flux `q = -D grad(phi)`
    pub flux: Vec<Vector2<f64>>,
    /// Euclidean norm of the flux
    pub effective_flux: Vec<f64>,
}

impl ElementalFields {
    /// Largest effective flux over all elements, zero for an empty mesh
    pub fn max_effective_flux(&self) -> f64 {
        self.effective_flux.iter().copied().fold(0.0, f64::max)
    }
}

/// Computes gradient, flux and effective flux of every element
///
/// # Arguments
/// * `mesh` - The mesh the solution was computed on
/// * `solution` - Nodal heads of the solve
/// * `permeability` - Permeability used to assemble the system
pub fn derive(
    mesh: &Mesh,
    solution: &SolutionField,
    permeability: &Permeability,
) -> Result<ElementalFields> {
    if solution.head.len() != mesh.num_dofs() {
        return Err(DamflowError::Input(format!(
            "solution has {} heads, mesh has {} nodes",
            solution.head.len(),
            mesh.num_dofs()
        )));
    }

    let constitutive = permeability.matrix();
    let num_elements = mesh.elements.len();

    let mut fields = ElementalFields {
        head: Vec::with_capacity(num_elements),
        gradient: Vec::with_capacity(num_elements),
        flux: Vec::with_capacity(num_elements),
        effective_flux: Vec::with_capacity(num_elements),
    };

    for (index, element) in mesh.elements.iter().enumerate() {
        let element_head = element.nodes.map(|i| solution.head[i]);

        let element_area = checked_element_area(index, element, mesh)?;
        let gradient = compute_gradient_matrix(element, mesh, element_area)
            * Vector3::from(element_head);
        let flux = -(constitutive * gradient);

        fields.head.push(element_head);
        fields.gradient.push(gradient);
        fields.effective_flux.push(flux.norm());
        fields.flux.push(flux);
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::{Element, Vertex};
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn square() -> Mesh {
        Mesh::new(
            vec![
                Vertex::new(0.0, 0.0),
                Vertex::new(2.0, 0.0),
                Vertex::new(2.0, 2.0),
                Vertex::new(0.0, 2.0),
            ],
            vec![Element { nodes: [0, 1, 2] }, Element { nodes: [0, 3, 2] }],
        )
    }

    fn field_of(f: impl Fn(&Vertex) -> f64, mesh: &Mesh) -> SolutionField {
        SolutionField {
            head: DVector::from_iterator(mesh.vertices.len(), mesh.vertices.iter().map(f)),
            reaction: DVector::zeros(mesh.vertices.len()),
        }
    }

    #[test]
    fn recovers_linear_field_exactly() {
        let mesh = square();
        let solution = field_of(|v| 3.0 * v.x - 2.0 * v.y + 1.0, &mesh);
        let fields = derive(&mesh, &solution, &Permeability { kx: 2.0, ky: 0.5 }).unwrap();

        for i in 0..2 {
            assert_relative_eq!(fields.gradient[i], Vector2::new(3.0, -2.0), epsilon = 1e-12);
            assert_relative_eq!(fields.flux[i], Vector2::new(-6.0, 1.0), epsilon = 1e-12);
            assert_relative_eq!(fields.effective_flux[i], f64::sqrt(37.0), epsilon = 1e-12);
        }
        assert_eq!(fields.head[0], [1.0, 7.0, 3.0]);
    }

    #[test]
    fn max_effective_flux_picks_the_largest_element() {
        let mesh = square();
        // zero at every node except node 1, so only the first element sees a gradient
        let solution = field_of(|v| if v.x == 2.0 && v.y == 0.0 { 4.0 } else { 0.0 }, &mesh);
        let fields = derive(&mesh, &solution, &Permeability::isotropic(1.0)).unwrap();

        assert_relative_eq!(fields.effective_flux[1], 0.0);
        assert!(fields.max_effective_flux() > 0.0);
        assert_eq!(fields.max_effective_flux(), fields.effective_flux[0]);
    }

    #[test]
    fn rejects_mismatched_solution() {
        let mesh = square();
        let solution = SolutionField {
            head: DVector::zeros(3),
            reaction: DVector::zeros(3),
        };
        assert!(derive(&mesh, &solution, &Permeability::isotropic(1.0)).is_err());
    }
}
