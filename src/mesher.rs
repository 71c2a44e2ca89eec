use std::collections::BTreeMap;

use tracing::debug;

use crate::{
    datatypes::{BoundaryMarker, Element, Mesh, Vertex},
    error::{DamflowError, Result},
    geometry::PlanarRegion,
};

/// Anything that turns a labelled region into a triangle mesh.
///
/// Implementations must keep the boundary labels: every node lying on a
/// labelled segment ends up in `Mesh::boundary_nodes` under that label.
pub trait Mesher: Send + Sync {
    /// Triangulates `region`; smaller `element_size` gives a finer mesh
    fn mesh(&self, region: &PlanarRegion, element_size: f64) -> Result<Mesh>;
}

pub const DEFAULT_MAX_GRID_NODES: usize = 4_000_000;

/// Built-in mesher for regions whose boundary segments are all horizontal or
/// vertical. Lays a rectilinear grid through every corner of the region,
/// subdivides it to the element size and splits each grid cell inside the
/// region into two right triangles.
#[derive(Debug, Clone)]
pub struct StructuredMesher {
    pub max_nodes: usize,
}

impl Default for StructuredMesher {
    fn default() -> Self {
        StructuredMesher {
            max_nodes: DEFAULT_MAX_GRID_NODES,
        }
    }
}

/// Sorted, de-duplicated coordinates
fn breakpoints(mut coords: Vec<f64>) -> Vec<f64> {
    coords.sort_by(f64::total_cmp);
    let scale = coords
        .iter()
        .fold(1.0_f64, |acc, c| acc.max(c.abs()));
    coords.dedup_by(|a, b| (*a - *b).abs() <= 1e-12 * scale);
    coords
}

fn subdivision_count(a: f64, b: f64, element_size: f64) -> f64 {
    ((b - a) / element_size).ceil().max(1.0)
}

/// Splits every interval between consecutive breakpoints into pieces no
/// longer than `element_size`
fn subdivide(breaks: &[f64], element_size: f64) -> Vec<f64> {
    let mut coords = Vec::new();
    for pair in breaks.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let n = subdivision_count(a, b, element_size) as usize;
        for k in 0..n {
            coords.push(a + k as f64 * (b - a) / n as f64);
        }
    }
    if let Some(last) = breaks.last() {
        coords.push(*last);
    }
    coords
}

fn grid_size(breaks: &[f64], element_size: f64) -> f64 {
    1.0 + breaks
        .windows(2)
        .map(|pair| subdivision_count(pair[0], pair[1], element_size))
        .sum::<f64>()
}

impl Mesher for StructuredMesher {
    fn mesh(&self, region: &PlanarRegion, element_size: f64) -> Result<Mesh> {
        if !(element_size.is_finite() && element_size > 0.0) {
            return Err(DamflowError::MeshGeneration(format!(
                "element size must be a positive number, got {element_size}"
            )));
        }
        if region.points.len() < 3 || region.segments.len() < 3 {
            return Err(DamflowError::MeshGeneration(
                "region needs at least three corners".to_owned(),
            ));
        }

        for segment in &region.segments {
            let (a, b) = region.segment_vertices(segment);
            if a.x != b.x && a.y != b.y {
                return Err(DamflowError::MeshGeneration(format!(
                    "structured mesher needs axis-aligned boundaries, segment {} -> {} is slanted",
                    segment.start, segment.end
                )));
            }
        }

        let x_breaks = breakpoints(region.points.iter().map(|p| p.x).collect());
        let y_breaks = breakpoints(region.points.iter().map(|p| p.y).collect());

        let requested = grid_size(&x_breaks, element_size) * grid_size(&y_breaks, element_size);
        if requested > self.max_nodes as f64 {
            return Err(DamflowError::ResourceExhaustion {
                what: "structured grid nodes",
                requested: requested.min(usize::MAX as f64) as usize,
                limit: self.max_nodes,
            });
        }

        let xs = subdivide(&x_breaks, element_size);
        let ys = subdivide(&y_breaks, element_size);
        let (nx, ny) = (xs.len(), ys.len());
        let grid_index = |i: usize, j: usize| j * nx + i;

        // Cells whose centre falls inside the region
        let mut cells: Vec<(usize, usize)> = Vec::new();
        for j in 0..ny - 1 {
            for i in 0..nx - 1 {
                let centre = Vertex::new(0.5 * (xs[i] + xs[i + 1]), 0.5 * (ys[j] + ys[j + 1]));
                if region.contains(&centre) {
                    cells.push((i, j));
                }
            }
        }

        if cells.is_empty() {
            return Err(DamflowError::MeshGeneration(
                "region does not cover any grid cell".to_owned(),
            ));
        }

        let mut used = vec![false; nx * ny];
        for &(i, j) in &cells {
            for (di, dj) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                used[grid_index(i + di, j + dj)] = true;
            }
        }

        let mut node_index: Vec<Option<usize>> = vec![None; nx * ny];
        let mut vertices: Vec<Vertex> = Vec::new();
        for j in 0..ny {
            for i in 0..nx {
                if used[grid_index(i, j)] {
                    node_index[grid_index(i, j)] = Some(vertices.len());
                    vertices.push(Vertex::new(xs[i], ys[j]));
                }
            }
        }

        let mut elements: Vec<Element> = Vec::with_capacity(2 * cells.len());
        for &(i, j) in &cells {
            let corner = |di: usize, dj: usize| node_index[grid_index(i + di, j + dj)];
            if let (Some(bl), Some(br), Some(tl), Some(tr)) =
                (corner(0, 0), corner(1, 0), corner(0, 1), corner(1, 1))
            {
                elements.push(Element { nodes: [bl, br, tr] });
                elements.push(Element { nodes: [bl, tr, tl] });
            }
        }

        let boundary_nodes = label_boundary_nodes(region, &vertices);

        debug!(
            "structured mesh: {} nodes, {} elements on a {}x{} grid",
            vertices.len(),
            elements.len(),
            nx,
            ny
        );

        Ok(Mesh {
            vertices,
            elements,
            boundary_nodes,
        })
    }
}

/// Collects the nodes lying on each labelled segment of the region
pub fn label_boundary_nodes(
    region: &PlanarRegion,
    vertices: &[Vertex],
) -> BTreeMap<BoundaryMarker, Vec<usize>> {
    let mut boundary_nodes: BTreeMap<BoundaryMarker, Vec<usize>> = BTreeMap::new();

    for segment in &region.segments {
        let Some(marker) = segment.marker else {
            continue;
        };
        let nodes = boundary_nodes.entry(marker).or_default();
        for (n, vertex) in vertices.iter().enumerate() {
            if region.on_segment(segment, vertex) {
                nodes.push(n);
            }
        }
    }

    for nodes in boundary_nodes.values_mut() {
        nodes.sort_unstable();
        nodes.dedup();
    }

    boundary_nodes
}
