//! Intersection of two footprints and the coordinate offset derived from it.

use std::fmt;

use geo::{Area, BooleanOps, Centroid, Polygon};
use log::debug;
use thiserror::Error;

/// Errors raised by footprint intersection.
#[derive(Debug, Error)]
pub enum FootprintError {
    #[error("footprints do not overlap: no common analysis region")]
    NoOverlap,

    #[error("footprint overlap is split into {parts} disconnected parts")]
    DisconnectedOverlap { parts: usize },

    #[error("footprint ring has no vertices")]
    EmptyRing,
}

/// Overlap parts smaller than this fraction of the smaller footprint are
/// numerical slivers and are dropped.
const SLIVER_FRACTION: f64 = 1e-9;

/// Intersect two footprint polygons.
///
/// # Errors
///
/// Returns [`FootprintError::NoOverlap`] if the polygons share no area and
/// [`FootprintError::DisconnectedOverlap`] if the overlap consists of more
/// than one polygon.
pub fn intersect(a: &Polygon<f64>, b: &Polygon<f64>) -> Result<Polygon<f64>, FootprintError> {
    let overlap = a.intersection(b);
    let min_area = a.unsigned_area().min(b.unsigned_area()) * SLIVER_FRACTION;

    let mut parts: Vec<Polygon<f64>> = overlap
        .into_iter()
        .filter(|p| {
            let area = p.unsigned_area();
            area > 0.0 && area > min_area
        })
        .collect();

    match parts.len() {
        0 => Err(FootprintError::NoOverlap),
        1 => {
            let common = parts.remove(0);
            debug!(
                "Footprint overlap: {:.3} of {:.3} / {:.3}",
                common.unsigned_area(),
                a.unsigned_area(),
                b.unsigned_area()
            );
            Ok(common)
        }
        n => Err(FootprintError::DisconnectedOverlap { parts: n }),
    }
}

/// An integer-valued XY translation applied to coordinates passed to
/// external tools.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CoordinateOffset {
    pub x: f64,
    pub y: f64,
}

impl CoordinateOffset {
    #[inline]
    pub fn apply(&self, p: [f64; 2]) -> [f64; 2] {
        [p[0] + self.x, p[1] + self.y]
    }
}

impl fmt::Display for CoordinateOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3})", self.x, self.y)
    }
}

/// Rounds half away from zero and folds `-0.0` into `0.0`.
fn round_offset(v: f64) -> f64 {
    let r = v.round();
    if r == 0.0 {
        0.0
    } else {
        r
    }
}

/// Negated, integer-rounded centroid of the polygon's exterior ring.
///
/// The centroid is the length-weighted centroid of the ring (its vertices and
/// edges), not of the enclosed area.
pub fn derive_offset(polygon: &Polygon<f64>) -> Result<CoordinateOffset, FootprintError> {
    let centroid = polygon
        .exterior()
        .centroid()
        .ok_or(FootprintError::EmptyRing)?;

    Ok(CoordinateOffset {
        x: round_offset(-centroid.x()),
        y: round_offset(-centroid.y()),
    })
}
