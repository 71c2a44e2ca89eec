use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::{
    datatypes::Mesh,
    error::{DamflowError, Result},
    params::SweptVariable,
    post_processor::ElementalFields,
    solver::SolutionField,
    study::StudyResult,
};

fn create(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path)?))
}

fn check_sizes(mesh: &Mesh, solution: &SolutionField, elemental: &ElementalFields) -> Result<()> {
    if solution.head.len() != mesh.vertices.len()
        || elemental.effective_flux.len() != mesh.elements.len()
    {
        return Err(DamflowError::Input(
            "Results do not belong to the mesh being exported".to_owned(),
        ));
    }
    Ok(())
}

/// Writes nodal and elemental results into two csv files
///
/// # Arguments
/// * `nodes_output` - Receives `x,y,head,reaction` per node
/// * `elements_output` - Receives `n0,n1,n2,qx,qy,effective_flux` per element
pub fn write_csv(
    mesh: &Mesh,
    solution: &SolutionField,
    elemental: &ElementalFields,
    nodes_output: &Path,
    elements_output: &Path,
) -> Result<()> {
    check_sizes(mesh, solution, elemental)?;

    let mut nodes_file = create(nodes_output)?;
    writeln!(nodes_file, "x,y,head,reaction")?;
    for (i, vertex) in mesh.vertices.iter().enumerate() {
        writeln!(
            nodes_file,
            "{x},{y},{head},{reaction}",
            x = vertex.x,
            y = vertex.y,
            head = solution.head[i],
            reaction = solution.reaction[i],
        )?;
    }
    nodes_file.flush()?;

    let mut elements_file = create(elements_output)?;
    writeln!(elements_file, "n0,n1,n2,qx,qy,effective_flux")?;
    for (i, element) in mesh.elements.iter().enumerate() {
        let flux = elemental.flux[i];
        writeln!(
            elements_file,
            "{n0},{n1},{n2},{qx},{qy},{q}",
            n0 = element.nodes[0],
            n1 = element.nodes[1],
            n2 = element.nodes[2],
            qx = flux.x,
            qy = flux.y,
            q = elemental.effective_flux[i],
        )?;
    }
    elements_file.flush()?;

    info!(
        "wrote output to {} and {}",
        nodes_output.display(),
        elements_output.display()
    );

    Ok(())
}

/// Writes the mesh with head, reaction and flux fields as a legacy ascii
/// VTK polydata file
pub fn write_vtk(
    path: &Path,
    mesh: &Mesh,
    solution: &SolutionField,
    elemental: &ElementalFields,
) -> Result<()> {
    check_sizes(mesh, solution, elemental)?;

    let num_nodes = mesh.vertices.len();
    let num_elements = mesh.elements.len();
    let mut file = create(path)?;

    writeln!(file, "# vtk DataFile Version 2.0")?;
    writeln!(file, "Groundwater flow beneath a dam")?;
    writeln!(file, "ASCII")?;
    writeln!(file, "DATASET POLYDATA")?;

    writeln!(file, "POINTS {num_nodes} double")?;
    for vertex in &mesh.vertices {
        writeln!(file, "{} {} 0", vertex.x, vertex.y)?;
    }

    writeln!(file, "POLYGONS {num_elements} {}", num_elements * 4)?;
    for element in &mesh.elements {
        let [a, b, c] = element.nodes;
        writeln!(file, "3 {a} {b} {c}")?;
    }

    writeln!(file, "POINT_DATA {num_nodes}")?;
    writeln!(file, "SCALARS Piezometric_head double 1")?;
    writeln!(file, "LOOKUP_TABLE default")?;
    for head in solution.head.iter() {
        writeln!(file, "{head}")?;
    }
    writeln!(file, "SCALARS Reaction_flux double 1")?;
    writeln!(file, "LOOKUP_TABLE default")?;
    for reaction in solution.reaction.iter() {
        writeln!(file, "{reaction}")?;
    }

    writeln!(file, "CELL_DATA {num_elements}")?;
    writeln!(file, "SCALARS Effective_flux double 1")?;
    writeln!(file, "LOOKUP_TABLE default")?;
    for q in &elemental.effective_flux {
        writeln!(file, "{q}")?;
    }
    writeln!(file, "VECTORS Flux double")?;
    for flux in &elemental.flux {
        writeln!(file, "{} {} 0", flux.x, flux.y)?;
    }

    file.flush()?;
    info!("exported results to {}", path.display());
    Ok(())
}

/// Swept values and maximal effective flux of a study, one row per step
pub fn write_study_csv(path: &Path, study: &StudyResult) -> Result<()> {
    let mut file = create(path)?;
    writeln!(file, "{},max_effective_flux", study.variable.symbol())?;
    for point in &study.points {
        writeln!(file, "{},{}", point.value, point.max_effective_flux)?;
    }
    file.flush()?;
    Ok(())
}

/// Appends `suffix` to the file name of `base`, keeping any dots already in it
pub fn output_path(base: &Path, suffix: &str) -> PathBuf {
    let name = base
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "damflow".to_owned());
    base.with_file_name(format!("{name}{suffix}"))
}

/// File of a single study step, `<base>_d001.vtk` for the first depth step
pub fn step_path(base: &Path, variable: SweptVariable, step: usize) -> PathBuf {
    output_path(base, &format!("_{}{:03}.vtk", variable.symbol(), step + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datatypes::{Element, Vertex},
        params::Permeability,
        post_processor::derive,
        study::StudyPoint,
    };
    use nalgebra::DVector;

    fn triangle_results() -> (Mesh, SolutionField, ElementalFields) {
        let mesh = Mesh::new(
            vec![
                Vertex::new(0.0, 0.0),
                Vertex::new(1.0, 0.0),
                Vertex::new(0.0, 1.0),
            ],
            vec![Element { nodes: [0, 1, 2] }],
        );
        let solution = SolutionField {
            head: DVector::from_vec(vec![2.0, 0.0, 2.0]),
            reaction: DVector::from_vec(vec![1.0, -1.0, 0.0]),
        };
        let elemental = derive(&mesh, &solution, &Permeability::isotropic(1.0)).unwrap();
        (mesh, solution, elemental)
    }

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("damflow-{}-{name}", std::process::id()))
    }

    #[test]
    fn csv_lists_nodes_and_elements() {
        let (mesh, solution, elemental) = triangle_results();
        let nodes_path = scratch("nodes.csv");
        let elements_path = scratch("elements.csv");

        write_csv(&mesh, &solution, &elemental, &nodes_path, &elements_path).unwrap();

        let nodes = std::fs::read_to_string(&nodes_path).unwrap();
        let elements = std::fs::read_to_string(&elements_path).unwrap();
        std::fs::remove_file(&nodes_path).unwrap();
        std::fs::remove_file(&elements_path).unwrap();

        assert_eq!(nodes.lines().count(), 4);
        assert_eq!(nodes.lines().nth(2), Some("1,0,0,-1"));
        let row = elements.lines().nth(1).unwrap();
        assert!(row.starts_with("0,1,2,2,"));
        assert!(row.ends_with(",2"));
    }

    #[test]
    fn vtk_contains_every_section() {
        let (mesh, solution, elemental) = triangle_results();
        let path = scratch("result.vtk");

        write_vtk(&path, &mesh, &solution, &elemental).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        for section in [
            "POINTS 3 double",
            "POLYGONS 1 4",
            "3 0 1 2",
            "POINT_DATA 3",
            "SCALARS Piezometric_head double 1",
            "CELL_DATA 1",
            "VECTORS Flux double",
        ] {
            assert!(contents.contains(section), "missing {section}");
        }
    }

    #[test]
    fn mismatched_results_are_rejected() {
        let (mesh, _, elemental) = triangle_results();
        let solution = SolutionField {
            head: DVector::zeros(2),
            reaction: DVector::zeros(2),
        };
        assert!(write_vtk(&scratch("bad.vtk"), &mesh, &solution, &elemental).is_err());
    }

    #[test]
    fn unwritable_target_is_an_io_error() {
        let (mesh, solution, elemental) = triangle_results();
        let path = scratch("no-such-dir").join("result.vtk");
        assert!(matches!(
            write_vtk(&path, &mesh, &solution, &elemental),
            Err(DamflowError::Io(_))
        ));
    }

    #[test]
    fn study_csv_has_one_row_per_point() {
        let study = StudyResult {
            variable: SweptVariable::Depth,
            points: vec![
                StudyPoint { value: 2.0, max_effective_flux: 1.5 },
                StudyPoint { value: 5.0, max_effective_flux: 0.75 },
            ],
            abort: None,
        };
        let path = scratch("study.csv");

        write_study_csv(&path, &study).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(contents, "d,max_effective_flux\n2,1.5\n5,0.75\n");
    }

    #[test]
    fn output_names_keep_dotted_stems() {
        let base = Path::new("out/dam.v2");
        assert_eq!(output_path(base, ".vtk"), Path::new("out/dam.v2.vtk"));
        assert_eq!(output_path(base, ".nodes.csv"), Path::new("out/dam.v2.nodes.csv"));
        assert_ne!(
            output_path(Path::new("out/dam.v1"), ".vtk"),
            output_path(base, ".vtk")
        );
        assert_eq!(
            step_path(base, SweptVariable::Depth, 0),
            Path::new("out/dam.v2_d001.vtk")
        );
    }

    #[test]
    fn step_files_are_numbered_from_one() {
        let path = step_path(Path::new("out/dam"), SweptVariable::Thickness, 0);
        assert_eq!(path, Path::new("out/dam_t001.vtk"));
    }
}
