use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub x: f64,
    pub y: f64,
}

impl Vertex {
    pub fn new(x: f64, y: f64) -> Vertex {
        Vertex { x, y }
    }

    pub fn distance(&self, other: &Vertex) -> f64 {
        f64::sqrt(f64::powi(self.x - other.x, 2) + f64::powi(self.y - other.y, 2))
    }
}

/// Linear triangle, node indices into `Mesh::vertices`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    pub nodes: [usize; 3],
}

/// Label carried by a boundary segment. Unlabelled segments are impermeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BoundaryMarker {
    /// Water surface on the open side of the dam
    Downstream,
    /// Water surface held back by the dam
    Upstream,
}

impl BoundaryMarker {
    pub const ALL: [BoundaryMarker; 2] = [BoundaryMarker::Downstream, BoundaryMarker::Upstream];

    /// Physical group tag used when talking to external meshers
    pub fn tag(self) -> usize {
        match self {
            BoundaryMarker::Downstream => 20,
            BoundaryMarker::Upstream => 30,
        }
    }

    pub fn from_tag(tag: usize) -> Option<BoundaryMarker> {
        BoundaryMarker::ALL.into_iter().find(|m| m.tag() == tag)
    }
}

/// Triangulated region. One degree of freedom (piezometric head) per vertex.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub elements: Vec<Element>,
    /// Sorted node indices lying on each labelled boundary
    pub boundary_nodes: BTreeMap<BoundaryMarker, Vec<usize>>,
}

impl Mesh {
    pub fn new(vertices: Vec<Vertex>, elements: Vec<Element>) -> Mesh {
        Mesh {
            vertices,
            elements,
            boundary_nodes: BTreeMap::new(),
        }
    }

    pub fn num_dofs(&self) -> usize {
        self.vertices.len()
    }

    pub fn nodes_on(&self, marker: BoundaryMarker) -> &[usize] {
        self.boundary_nodes
            .get(&marker)
            .map(|nodes| nodes.as_slice())
            .unwrap_or(&[])
    }

    /// Corner vertices of an element
    pub fn element_vertices(&self, element: &Element) -> [Vertex; 3] {
        element.nodes.map(|i| self.vertices[i])
    }

    pub fn centroid(&self, element: &Element) -> Vertex {
        let [v0, v1, v2] = self.element_vertices(element);
        Vertex::new((v0.x + v1.x + v2.x) / 3.0, (v0.y + v1.y + v2.y) / 3.0)
    }
}
