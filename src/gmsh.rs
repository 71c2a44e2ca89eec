use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use crate::{
    datatypes::{BoundaryMarker, Element, Mesh, Vertex},
    error::{DamflowError, Result},
    geometry::PlanarRegion,
    mesher::Mesher,
};

const SURFACE_TAG: usize = 1;

static RUN_COUNTER: AtomicUsize = AtomicUsize::new(0);

enum MeshParseState {
    Nodes,
    Elements,
    Entities,
    Limbo,
}

/// Mesher that shells out to the Gmsh executable
#[derive(Debug, Clone)]
pub struct GmshMesher {
    /// Gmsh executable, looked up on `PATH` when relative
    pub executable: PathBuf,
    /// Directory for the intermediate `.geo` and `.msh` files
    pub work_dir: PathBuf,
}

impl Default for GmshMesher {
    fn default() -> Self {
        GmshMesher {
            executable: PathBuf::from("gmsh"),
            work_dir: std::env::temp_dir(),
        }
    }
}

/// Writes the `.geo` script for a labelled region.
///
/// Every corner gets a unit characteristic length and the element size is
/// applied as a global scaling factor. Labelled segments become physical
/// curves tagged with `BoundaryMarker::tag`.
pub fn build_geo(region: &PlanarRegion, element_size: f64) -> String {
    let mut geo = String::new();

    geo.push_str("// Define points\n");
    for (i, vertex) in region.points.iter().enumerate() {
        let _ = writeln!(geo, "Point({}) = {{ {}, {}, 0, 1.0 }};", i + 1, vertex.x, vertex.y);
    }

    geo.push_str("\n// Connect points\n");
    for (i, segment) in region.segments.iter().enumerate() {
        let _ = writeln!(
            geo,
            "Line({}) = {{ {}, {} }};",
            i + 1,
            segment.start + 1,
            segment.end + 1
        );
    }

    geo.push_str("\n// Register loop\n");
    let line_ids: Vec<String> = (1..=region.segments.len()).map(|i| i.to_string()).collect();
    let _ = writeln!(geo, "Line Loop(1) = {{ {} }};", line_ids.join(", "));
    let _ = writeln!(geo, "Plane Surface({SURFACE_TAG}) = {{ 1 }};");

    geo.push_str("\n// Boundary labels\n");
    for marker in BoundaryMarker::ALL {
        let lines: Vec<String> = region
            .segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.marker == Some(marker))
            .map(|(i, _)| (i + 1).to_string())
            .collect();
        if !lines.is_empty() {
            let _ = writeln!(
                geo,
                "Physical Line({}) = {{ {} }};",
                marker.tag(),
                lines.join(", ")
            );
        }
    }
    let _ = writeln!(geo, "Physical Surface({SURFACE_TAG}) = {{ 1 }};");

    let _ = write!(
        geo,
        "\n// Define Mesh Settings\n\
         Mesh.ElementOrder = 1;\n\
         Mesh.Algorithm = 1;\n\
         Mesh.MshFileVersion = 4.1;\n\
         Mesh.CharacteristicLengthFactor = {element_size};\n"
    );

    geo
}

fn parse_numbers<T: std::str::FromStr>(line: &str, what: &str) -> Result<Vec<T>> {
    line.split_whitespace()
        .map(|token| {
            token.parse().map_err(|_| {
                DamflowError::MeshGeneration(format!("unexpected value '{token}' in {what}"))
            })
        })
        .collect()
}

fn next_line<'a>(lines: &mut impl Iterator<Item = &'a str>, what: &str) -> Result<&'a str> {
    lines
        .next()
        .ok_or_else(|| DamflowError::MeshGeneration(format!("mesh file ends inside {what}")))
}

fn field<T: Copy>(values: &[T], index: usize, what: &str) -> Result<T> {
    values
        .get(index)
        .copied()
        .ok_or_else(|| DamflowError::MeshGeneration(format!("truncated record in {what}")))
}

/// Parses an ASCII `.msh` (format 4.1) into a mesh. Triangles become
/// elements; line elements on physical curves tagged with a boundary marker
/// label their nodes.
pub fn parse_mesh(contents: &str) -> Result<Mesh> {
    let mut parser_state = MeshParseState::Limbo;
    let mut parsed_section_metadata = false;
    let mut lines = contents.lines().map(str::trim).filter(|l| !l.is_empty());

    // curve entity tag -> physical tags
    let mut curve_groups: HashMap<usize, Vec<usize>> = HashMap::new();
    // node tag -> index into vertices
    let mut node_indexes: HashMap<usize, usize> = HashMap::new();
    let mut vertices: Vec<Vertex> = Vec::new();
    let mut triangles: Vec<[usize; 3]> = Vec::new();
    let mut labelled: Vec<(BoundaryMarker, usize)> = Vec::new();

    while let Some(line) = lines.next() {
        if line.starts_with("$End") {
            parser_state = MeshParseState::Limbo;
            continue;
        }

        match parser_state {
            MeshParseState::Limbo => {
                parsed_section_metadata = false;

                if line.starts_with("$Entities") {
                    parser_state = MeshParseState::Entities;
                } else if line.starts_with("$Nodes") {
                    parser_state = MeshParseState::Nodes;
                } else if line.starts_with("$Elements") {
                    parser_state = MeshParseState::Elements;
                }
            }
            MeshParseState::Entities => {
                if parsed_section_metadata {
                    continue;
                }
                parsed_section_metadata = true;

                let counts: Vec<usize> = parse_numbers(line, "entity counts")?;
                let num_points = field(&counts, 0, "entity counts")?;
                let num_curves = field(&counts, 1, "entity counts")?;

                for _ in 0..num_points {
                    next_line(&mut lines, "point entities")?;
                }
                for _ in 0..num_curves {
                    let record: Vec<f64> =
                        parse_numbers(next_line(&mut lines, "curve entities")?, "curve entities")?;
                    let tag = field(&record, 0, "curve entities")? as usize;
                    let num_physical = field(&record, 7, "curve entities")? as usize;
                    let physical = (0..num_physical)
                        .map(|k| field(&record, 8 + k, "curve entities").map(|t| t.abs() as usize))
                        .collect::<Result<Vec<usize>>>()?;
                    curve_groups.insert(tag, physical);
                }
            }
            MeshParseState::Nodes => {
                if !parsed_section_metadata {
                    parsed_section_metadata = true;
                    continue;
                }

                let block: Vec<usize> = parse_numbers(line, "node block header")?;
                let num_nodes_local = field(&block, 3, "node block header")?;

                let mut node_tags: Vec<usize> = Vec::with_capacity(num_nodes_local);
                for _ in 0..num_nodes_local {
                    let tag: Vec<usize> =
                        parse_numbers(next_line(&mut lines, "node tags")?, "node tags")?;
                    node_tags.push(field(&tag, 0, "node tags")?);
                }

                for tag in node_tags {
                    let coords: Vec<f64> = parse_numbers(
                        next_line(&mut lines, "node coordinates")?,
                        "node coordinates",
                    )?;
                    node_indexes.insert(tag, vertices.len());
                    vertices.push(Vertex::new(
                        field(&coords, 0, "node coordinates")?,
                        field(&coords, 1, "node coordinates")?,
                    ));
                }
            }
            MeshParseState::Elements => {
                if !parsed_section_metadata {
                    parsed_section_metadata = true;
                    continue;
                }

                let block: Vec<usize> = parse_numbers(line, "element block header")?;
                let entity_dim = field(&block, 0, "element block header")?;
                let entity_tag = field(&block, 1, "element block header")?;
                let element_type = field(&block, 2, "element block header")?;
                let num_elements = field(&block, 3, "element block header")?;

                let markers: Vec<BoundaryMarker> = if entity_dim == 1 {
                    curve_groups
                        .get(&entity_tag)
                        .map(|tags| {
                            tags.iter()
                                .filter_map(|t| BoundaryMarker::from_tag(*t))
                                .collect()
                        })
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };

                for _ in 0..num_elements {
                    let record: Vec<usize> =
                        parse_numbers(next_line(&mut lines, "elements")?, "elements")?;

                    match (entity_dim, element_type) {
                        // 3-node triangle
                        (2, 2) => triangles.push([
                            field(&record, 1, "triangle")?,
                            field(&record, 2, "triangle")?,
                            field(&record, 3, "triangle")?,
                        ]),
                        // 2-node line
                        (1, 1) => {
                            for marker in &markers {
                                labelled.push((*marker, field(&record, 1, "line")?));
                                labelled.push((*marker, field(&record, 2, "line")?));
                            }
                        }
                        (2, other) => {
                            return Err(DamflowError::MeshGeneration(format!(
                                "unsupported surface element type {other}, expected linear triangles"
                            )))
                        }
                        _ => continue,
                    }
                }
            }
        }
    }

    let lookup = |tag: usize| {
        node_indexes.get(&tag).copied().ok_or_else(|| {
            DamflowError::MeshGeneration(format!("element refers to unknown node {tag}"))
        })
    };

    let elements = triangles
        .into_iter()
        .map(|tags| {
            Ok(Element {
                nodes: [lookup(tags[0])?, lookup(tags[1])?, lookup(tags[2])?],
            })
        })
        .collect::<Result<Vec<Element>>>()?;

    let mut boundary_nodes: BTreeMap<BoundaryMarker, Vec<usize>> = BTreeMap::new();
    for (marker, tag) in labelled {
        boundary_nodes.entry(marker).or_default().push(lookup(tag)?);
    }
    for nodes in boundary_nodes.values_mut() {
        nodes.sort_unstable();
        nodes.dedup();
    }

    if elements.is_empty() {
        return Err(DamflowError::MeshGeneration(
            "mesh file contains no triangles".to_owned(),
        ));
    }

    Ok(Mesh {
        vertices,
        elements,
        boundary_nodes,
    })
}

impl GmshMesher {
    fn scratch_paths(&self) -> (PathBuf, PathBuf) {
        let run = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let stem = format!("damflow-{}-{}", std::process::id(), run);
        (
            self.work_dir.join(format!("{stem}.geo")),
            self.work_dir.join(format!("{stem}.msh")),
        )
    }
}

impl Mesher for GmshMesher {
    fn mesh(&self, region: &PlanarRegion, element_size: f64) -> Result<Mesh> {
        if !(element_size.is_finite() && element_size > 0.0) {
            return Err(DamflowError::MeshGeneration(format!(
                "element size must be a positive number, got {element_size}"
            )));
        }

        let (geo_path, msh_path) = self.scratch_paths();
        std::fs::write(&geo_path, build_geo(region, element_size)).map_err(|err| {
            DamflowError::MeshGeneration(format!("failed to write {}: {err}", geo_path.display()))
        })?;

        info!("running gmsh with element size factor {element_size}...");
        let output = std::process::Command::new(&self.executable)
            .arg(&geo_path)
            .arg("-2")
            .arg("-o")
            .arg(&msh_path)
            .output();

        if let Err(err) = std::fs::remove_file(&geo_path) {
            warn!("failed to delete {}: {err}", geo_path.display());
        }

        let output =
            output.map_err(|err| DamflowError::MeshGeneration(format!("Gmsh failed: {err}")))?;
        if !output.status.success() {
            let _ = std::fs::remove_file(&msh_path);
            return Err(DamflowError::MeshGeneration(format!(
                "Gmsh exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let contents = std::fs::read_to_string(&msh_path).map_err(|err| {
            DamflowError::MeshGeneration(format!("Unable to open generated mesh file: {err}"))
        })?;
        if let Err(err) = std::fs::remove_file(&msh_path) {
            warn!("failed to delete {}: {err}", msh_path.display());
        }

        let mesh = parse_mesh(&contents)?;
        debug!(
            "loaded {} nodes and {} elements from gmsh",
            mesh.vertices.len(),
            mesh.elements.len()
        );

        Ok(mesh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::build_geometry;

    // Unit square split along its diagonal, bottom edge tagged 20, top edge 30
    const SQUARE_MSH: &str = "\
$MeshFormat
4.1 0 8
$EndMeshFormat
$Entities
4 4 1 0
1 0 0 0 0
2 1 0 0 0
3 1 1 0 0
4 0 1 0 0
1 0 0 0 1 0 0 1 20 2 1 -2
2 1 0 0 1 1 0 0 2 2 -3
3 0 1 0 1 1 0 1 30 2 3 -4
4 0 0 0 0 1 0 0 2 4 -1
1 0 0 0 1 1 0 1 1 4 1 2 3 4
$EndEntities
$Nodes
2 4 1 4
0 1 0 2
1
2
0 0 0
1 0 0
0 3 0 2
3
4
1 1 0
0 1 0
$EndNodes
$Elements
3 4 1 4
1 1 1 1
1 1 2
1 3 1 1
2 3 4
2 1 2 2
3 1 2 3
4 1 3 4
$EndElements
";

    #[test]
    fn parses_triangles_and_labels() {
        let mesh = parse_mesh(SQUARE_MSH).unwrap();

        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.elements.len(), 2);
        assert_eq!(mesh.elements[0].nodes, [0, 1, 2]);
        assert_eq!(mesh.elements[1].nodes, [0, 2, 3]);

        assert_eq!(mesh.nodes_on(BoundaryMarker::Downstream), &[0, 1]);
        assert_eq!(mesh.nodes_on(BoundaryMarker::Upstream), &[2, 3]);
    }

    #[test]
    fn rejects_meshes_without_triangles() {
        let contents = "$MeshFormat\n4.1 0 8\n$EndMeshFormat\n";
        assert!(matches!(
            parse_mesh(contents),
            Err(DamflowError::MeshGeneration(_))
        ));
    }

    #[test]
    fn rejects_dangling_node_references() {
        let contents = SQUARE_MSH.replace("3 1 2 3\n", "3 1 2 9\n");
        assert!(parse_mesh(&contents).is_err());
    }

    #[test]
    fn geo_script_labels_water_levels() {
        let region = build_geometry(10.0, 2.0, 5.0, 1.0).unwrap();
        let geo = build_geo(&region, 0.5);

        assert!(geo.contains("Point(8) = { 0, 5, 0, 1.0 };"));
        assert!(geo.contains("Line(8) = { 8, 1 };"));
        assert!(geo.contains("Physical Line(20) = { 3 };"));
        assert!(geo.contains("Physical Line(30) = { 7 };"));
        assert!(geo.contains("Mesh.CharacteristicLengthFactor = 0.5;"));
    }
}
