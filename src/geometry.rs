use crate::{
    datatypes::{BoundaryMarker, Vertex},
    error::{DamflowError, Result},
    params::InputParameters,
};

const ON_SEGMENT_TOLERANCE: f64 = 1e-9;

/// Straight boundary piece between two polygon corners
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
    /// `None` marks an impermeable boundary (zero natural flux)
    pub marker: Option<BoundaryMarker>,
}

/// Closed polygon with labelled boundary segments. Segment `i` joins corner
/// `i` to corner `i + 1`, the last one closing the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanarRegion {
    pub points: Vec<Vertex>,
    pub segments: Vec<Segment>,
}

impl PlanarRegion {
    pub fn segment_vertices(&self, segment: &Segment) -> (Vertex, Vertex) {
        (self.points[segment.start], self.points[segment.end])
    }

    /// Even-odd rule point in polygon test. Points exactly on the boundary
    /// may land on either side.
    pub fn contains(&self, point: &Vertex) -> bool {
        let mut inside = false;
        for segment in &self.segments {
            let (a, b) = self.segment_vertices(segment);
            if (a.y > point.y) != (b.y > point.y) {
                let x_cross = a.x + (point.y - a.y) * (b.x - a.x) / (b.y - a.y);
                if point.x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Whether the point lies on the given segment, ends included
    pub fn on_segment(&self, segment: &Segment, point: &Vertex) -> bool {
        let (a, b) = self.segment_vertices(segment);
        let length = a.distance(&b);
        let tolerance = ON_SEGMENT_TOLERANCE * f64::max(1.0, length);

        let cross = (b.x - a.x) * (point.y - a.y) - (b.y - a.y) * (point.x - a.x);
        if cross.abs() > tolerance * length {
            return false;
        }

        let dot = (point.x - a.x) * (b.x - a.x) + (point.y - a.y) * (b.y - a.y);
        dot >= -tolerance * length && dot <= length * length + tolerance * length
    }
}

/// Builds the dam cross-section: ground of width `w` and height `h` with a
/// dam body of thickness `t` reaching depth `d` below the top edge, centred
/// horizontally.
///
/// The top edge left of the dam holds the upstream water level, the top edge
/// right of it the downstream level. Every other segment is impermeable.
pub fn build_geometry(w: f64, t: f64, h: f64, d: f64) -> Result<PlanarRegion> {
    for (parameter, value) in [("w", w), ("t", t), ("h", h), ("d", d)] {
        if !(value.is_finite() && value > 0.0) {
            return Err(DamflowError::invalid(
                parameter,
                format!("must be a positive number, got {value}"),
            ));
        }
    }
    if w <= t {
        return Err(DamflowError::invalid(
            "t",
            format!("must be smaller than the width w = {w}, got {t}"),
        ));
    }
    if h <= d {
        return Err(DamflowError::invalid(
            "d",
            format!("must be smaller than the height h = {h}, got {d}"),
        ));
    }

    let points = vec![
        Vertex::new(0.0, 0.0),
        Vertex::new(w, 0.0),
        Vertex::new(w, h),
        Vertex::new((w + t) / 2.0, h),
        Vertex::new((w + t) / 2.0, h - d),
        Vertex::new((w - t) / 2.0, h - d),
        Vertex::new((w - t) / 2.0, h),
        Vertex::new(0.0, h),
    ];

    let markers = [
        None,
        None,
        Some(BoundaryMarker::Downstream),
        None,
        None,
        None,
        Some(BoundaryMarker::Upstream),
        None,
    ];

    let segments = markers
        .iter()
        .enumerate()
        .map(|(i, marker)| Segment {
            start: i,
            end: (i + 1) % points.len(),
            marker: *marker,
        })
        .collect();

    Ok(PlanarRegion { points, segments })
}

pub fn build_geometry_from(params: &InputParameters) -> Result<PlanarRegion> {
    build_geometry(params.width, params.thickness, params.height, params.depth)
}
