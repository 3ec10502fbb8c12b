//! Footprint extraction with an alpha shape.
//!
//! The cloud is projected to XY, normalized per axis, randomly subsampled and
//! triangulated (Delaunay). Triangles with a circumradius below `1 / alpha`
//! form the alpha shape; its boundary edges are chained into rings, split at
//! vertices where the boundary touches itself. Counter-clockwise rings are
//! outer rings, clockwise ones are holes. The extraction succeeds only if
//! exactly one outer ring results; holes are dropped.

use std::collections::{BTreeMap, HashMap, HashSet};

use geo::{Coord, LineString, Polygon};
use log::debug;
use rand::Rng;
use spade::{DelaunayTriangulation, Point2, Triangulation};
use thiserror::Error;

use crate::core::cloud::PointCloudData;
use crate::core::transforms::{normalize_xy, project_xy, subsample_indices};

/// Errors raised while extracting a footprint.
#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("alpha shape is not a single simple polygon: {reason}")]
    DegenerateBoundary { reason: String },

    #[error("triangulation failed: {0}")]
    Triangulation(String),
}

impl BoundaryError {
    fn degenerate(reason: impl Into<String>) -> Self {
        BoundaryError::DegenerateBoundary {
            reason: reason.into(),
        }
    }
}

type Edge = (usize, usize);

/// Circumradius of a triangle, or `None` for a collinear one.
fn circumradius(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> Option<f64> {
    let dist = |p: [f64; 2], q: [f64; 2]| ((p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2)).sqrt();
    let area2 = ((b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])).abs();
    if area2 == 0.0 {
        return None;
    }
    Some(dist(a, b) * dist(b, c) * dist(c, a) / (2.0 * area2))
}

/// Twice the signed area of a triangle; positive for counter-clockwise order.
#[inline]
fn orientation(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

/// Shoelace signed area of a closed ring given without its closing vertex.
fn signed_area(ring: &[[f64; 2]]) -> f64 {
    let n = ring.len();
    (0..n)
        .map(|i| {
            let p = ring[i];
            let q = ring[(i + 1) % n];
            p[0] * q[1] - q[0] * p[1]
        })
        .sum::<f64>()
        / 2.0
}

/// Alpha shape of a point set as a list of rings (outer rings counter-clockwise).
fn alpha_shape_rings(points: &[[f64; 2]], alpha: f64) -> Result<Vec<Vec<[f64; 2]>>, BoundaryError> {
    let vertices: Vec<Point2<f64>> = points.iter().map(|p| Point2::new(p[0], p[1])).collect();
    let triangulation = DelaunayTriangulation::<Point2<f64>>::bulk_load(vertices)
        .map_err(|e| BoundaryError::Triangulation(format!("{:?}", e)))?;

    let max_radius = if alpha > 0.0 { 1.0 / alpha } else { f64::INFINITY };

    let mut positions: HashMap<usize, [f64; 2]> = HashMap::new();
    let mut edges: HashSet<Edge> = HashSet::new();
    let mut kept = 0usize;

    for face in triangulation.inner_faces() {
        let handles = face.vertices();
        let mut ids = handles.map(|v| v.fix().index());
        let mut pos = handles.map(|v| {
            let p = v.position();
            [p.x, p.y]
        });

        match circumradius(pos[0], pos[1], pos[2]) {
            Some(r) if r < max_radius => {}
            _ => continue,
        }

        if orientation(pos[0], pos[1], pos[2]) < 0.0 {
            ids.swap(1, 2);
            pos.swap(1, 2);
        }

        for k in 0..3 {
            positions.insert(ids[k], pos[k]);
            edges.insert((ids[k], ids[(k + 1) % 3]));
        }
        kept += 1;
    }

    if kept == 0 {
        return Err(BoundaryError::degenerate("no triangle satisfies the alpha criterion"));
    }
    debug!("Alpha shape keeps {} triangles", kept);

    // Boundary edges are those whose reverse belongs to no kept triangle
    let mut next: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &(u, v) in &edges {
        if !edges.contains(&(v, u)) {
            next.entry(u).or_default().push(v);
        }
    }
    for outgoing in next.values_mut() {
        outgoing.sort_unstable();
    }

    // Walk the edges and cut a ring off whenever the walk revisits a vertex,
    // so rings touching at a vertex come out separately.
    let mut rings = Vec::new();
    while let Some(start) = next.keys().next().copied() {
        let mut path = vec![start];
        let mut on_path: HashMap<usize, usize> = HashMap::from([(start, 0)]);
        loop {
            let current = path[path.len() - 1];
            let Some(to) = take_outgoing(&mut next, current) else {
                return Err(BoundaryError::degenerate("open boundary chain"));
            };
            let Some(&i) = on_path.get(&to) else {
                on_path.insert(to, path.len());
                path.push(to);
                continue;
            };

            let ring: Vec<[f64; 2]> = path
                .split_off(i + 1)
                .into_iter()
                .map(|v| {
                    on_path.remove(&v);
                    positions[&v]
                })
                .collect();
            rings.push(std::iter::once(positions[&to]).chain(ring).collect::<Vec<_>>());

            if path.len() == 1 {
                break;
            }
        }
    }

    Ok(rings)
}

/// Removes and returns one outgoing boundary edge of `v`.
fn take_outgoing(next: &mut BTreeMap<usize, Vec<usize>>, v: usize) -> Option<usize> {
    let outgoing = next.get_mut(&v)?;
    let to = outgoing.pop();
    if outgoing.is_empty() {
        next.remove(&v);
    }
    to
}

/// Extract the 2-D footprint polygon of a cloud.
///
/// # Arguments
///
/// * `cloud` - Cloud to outline (not modified)
/// * `alpha` - Alpha-shape parameter on normalized coordinates; 0 yields the convex hull
/// * `sample_size` - Maximum number of points fed to the triangulation
/// * `rng` - Random source for subsampling; seed it for repeatable results
///
/// # Returns
///
/// A polygon in the cloud's coordinates with a closed exterior ring and no
/// interior rings.
///
/// # Errors
///
/// Returns [`BoundaryError::DegenerateBoundary`] if the cloud has fewer than
/// three points or no extent on an axis, or if the alpha shape is empty or
/// split into several parts (including parts that touch at a vertex).
pub fn extract_boundary<R: Rng + ?Sized>(
    cloud: &PointCloudData,
    alpha: f64,
    sample_size: usize,
    rng: &mut R,
) -> Result<Polygon<f64>, BoundaryError> {
    if cloud.len() < 3 {
        return Err(BoundaryError::degenerate(format!(
            "{} point(s) cannot enclose an area",
            cloud.len()
        )));
    }

    let projected = project_xy(cloud);
    let (normalized, norm) = normalize_xy(&projected)
        .ok_or_else(|| BoundaryError::degenerate("points have no extent along x or y"))?;

    let indices = subsample_indices(normalized.len(), sample_size, rng);
    let sample: Vec<[f64; 2]> = indices.iter().map(|&i| normalized[i]).collect();
    debug!(
        "Alpha shape on {} of {} points (alpha = {})",
        sample.len(),
        normalized.len(),
        alpha
    );

    let rings = alpha_shape_rings(&sample, alpha)?;

    let mut outer = rings.into_iter().filter(|ring| signed_area(ring) > 0.0);
    let exterior = match (outer.next(), outer.next()) {
        (Some(ring), None) => ring,
        (None, _) => return Err(BoundaryError::degenerate("alpha shape has no outer ring")),
        (Some(_), Some(_)) => {
            let parts = 2 + outer.count();
            return Err(BoundaryError::degenerate(format!(
                "alpha shape has {} disconnected parts",
                parts
            )));
        }
    };

    let coords: Vec<Coord<f64>> = exterior
        .into_iter()
        .map(|p| {
            let [x, y] = norm.invert(p);
            Coord { x, y }
        })
        .collect();

    // Polygon::new closes the ring
    Ok(Polygon::new(LineString::new(coords), vec![]))
}
