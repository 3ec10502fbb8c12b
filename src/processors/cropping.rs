//! Axis-aligned box cropping to the region shared by several clouds.

use log::{debug, info};
use rayon::prelude::*;

use crate::core::cloud::{CloudError, PointCloudData};

/// An axis-aligned 3-D box. `min > max` on any axis denotes an empty box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundingBox {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self { min, max }
    }

    /// Bounding box of a cloud's coordinates, or `None` for an empty cloud.
    pub fn of(cloud: &PointCloudData) -> Option<Self> {
        if cloud.is_empty() {
            return None;
        }

        let (min, max) = cloud
            .xyz()
            .par_iter()
            .fold(
                || ([f64::INFINITY; 3], [f64::NEG_INFINITY; 3]),
                |(mut min, mut max), p| {
                    for axis in 0..3 {
                        min[axis] = min[axis].min(p[axis]);
                        max[axis] = max[axis].max(p[axis]);
                    }
                    (min, max)
                },
            )
            .reduce(
                || ([f64::INFINITY; 3], [f64::NEG_INFINITY; 3]),
                |(amin, amax), (bmin, bmax)| {
                    (
                        std::array::from_fn(|a| amin[a].min(bmin[a])),
                        std::array::from_fn(|a| amax[a].max(bmax[a])),
                    )
                },
            );

        Some(Self { min, max })
    }

    /// Component-wise intersection: larger of the minima, smaller of the maxima.
    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            min: std::array::from_fn(|a| self.min[a].max(other.min[a])),
            max: std::array::from_fn(|a| self.max[a].min(other.max[a])),
        }
    }

    /// Per-axis extent `max - min` (negative for an empty axis).
    pub fn span(&self) -> [f64; 3] {
        std::array::from_fn(|a| self.max[a] - self.min[a])
    }

    /// Grows the box symmetrically by `margin` times its span on each axis.
    pub fn expand(&self, margin: f64) -> Self {
        let span = self.span();
        Self {
            min: std::array::from_fn(|a| self.min[a] - span[a] * margin),
            max: std::array::from_fn(|a| self.max[a] + span[a] * margin),
        }
    }

    /// True if some axis has `min > max`.
    pub fn is_empty(&self) -> bool {
        (0..3).any(|a| self.min[a] > self.max[a])
    }

    /// Containment test with inclusive bounds. Axes with zero span are not
    /// constrained.
    #[inline]
    pub fn contains(&self, p: &[f64; 3]) -> bool {
        (0..3).all(|a| {
            self.min[a] == self.max[a] || (self.min[a] <= p[a] && p[a] <= self.max[a])
        })
    }
}

/// Compute the box shared by all clouds, expanded by `margin`.
///
/// The margin is applied to the intersected box, not to each cloud's box.
///
/// # Errors
///
/// Returns [`CloudError::EmptyInput`] if there are no clouds or any cloud has
/// no points, since an empty cloud has no bounding box.
pub fn common_box<'a, I>(clouds: I, margin: f64) -> Result<BoundingBox, CloudError>
where
    I: IntoIterator<Item = &'a PointCloudData>,
{
    let mut common: Option<BoundingBox> = None;

    for cloud in clouds {
        let bbox = BoundingBox::of(cloud).ok_or(CloudError::EmptyInput)?;
        common = Some(match common {
            Some(acc) => acc.intersection(&bbox),
            None => bbox,
        });
    }

    let common = common.ok_or(CloudError::EmptyInput)?;
    Ok(common.expand(margin.max(0.0)))
}

/// Reduce a cloud to the points inside `bbox` (inclusive).
///
/// An axis where `bbox.min == bbox.max` is ignored. An empty box crops every
/// point away; detecting that is up to the caller.
pub fn crop(cloud: PointCloudData, bbox: &BoundingBox) -> Result<PointCloudData, CloudError> {
    let mask: Vec<bool> = cloud.xyz().par_iter().map(|p| bbox.contains(p)).collect();

    let before = cloud.len();
    let cropped = cloud.reduce(&mask)?;
    debug!("Crop kept {} of {} points", cropped.len(), before);

    Ok(cropped)
}

/// Crop every cloud to the common box of all of them.
///
/// # Returns
///
/// The cropped clouds in input order, together with the box used.
pub fn cut_to_common_box(
    clouds: Vec<PointCloudData>,
    margin: f64,
) -> Result<(Vec<PointCloudData>, BoundingBox), CloudError> {
    let bbox = common_box(&clouds, margin)?;
    info!("Common box: min {:?}, max {:?}", bbox.min, bbox.max);

    let cropped = clouds
        .into_iter()
        .map(|cloud| crop(cloud, &bbox))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((cropped, bbox))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cloud::AttributeValues;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_cloud(rng: &mut StdRng, n: usize, lo: f64, hi: f64) -> PointCloudData {
        let xyz = (0..n)
            .map(|_| {
                [
                    rng.random_range(lo..=hi),
                    rng.random_range(lo..=hi),
                    rng.random_range(lo..=hi),
                ]
            })
            .collect();
        PointCloudData::from_xyz(xyz)
    }

    #[test]
    fn test_bounding_box_of() {
        let cloud = PointCloudData::from_xyz(vec![[1.0, -2.0, 3.0], [-1.0, 5.0, 0.0]]);
        let bbox = BoundingBox::of(&cloud).unwrap();

        assert_eq!(bbox.min, [-1.0, -2.0, 0.0]);
        assert_eq!(bbox.max, [1.0, 5.0, 3.0]);
        assert!(BoundingBox::of(&PointCloudData::default()).is_none());
    }

    #[test]
    fn test_common_box_margin_applied_after_intersection() {
        let a = PointCloudData::from_xyz(vec![[0.0, 0.0, 0.0], [10.0, 10.0, 10.0]]);
        let b = PointCloudData::from_xyz(vec![[5.0, 5.0, 5.0], [20.0, 20.0, 20.0]]);

        let exact = common_box([&a, &b], 0.0).unwrap();
        assert_eq!(exact, BoundingBox::new([5.0; 3], [10.0; 3]));

        let grown = common_box([&a, &b], 0.1).unwrap();
        assert_eq!(grown, BoundingBox::new([4.5; 3], [10.5; 3]));
    }

    #[test]
    fn test_common_box_empty_input() {
        let none: Vec<&PointCloudData> = Vec::new();
        assert!(matches!(common_box(none, 0.0), Err(CloudError::EmptyInput)));

        let a = PointCloudData::from_xyz(vec![[0.0; 3]]);
        let empty = PointCloudData::default();
        assert!(matches!(common_box([&a, &empty], 0.0), Err(CloudError::EmptyInput)));
    }

    #[test]
    fn test_crop_keeps_channels_aligned() {
        let cloud = PointCloudData::from_xyz(vec![[0.0, 0.0, 0.0], [5.0, 5.0, 5.0], [9.0, 9.0, 9.0]])
            .with_attribute("intensity", AttributeValues::U16(vec![1, 2, 3]))
            .unwrap();

        let cropped = crop(cloud, &BoundingBox::new([1.0; 3], [9.0; 3])).unwrap();

        assert_eq!(cropped.xyz(), &[[5.0, 5.0, 5.0], [9.0, 9.0, 9.0]]);
        assert_eq!(cropped.attribute("intensity"), Some(&AttributeValues::U16(vec![2, 3])));
    }

    #[test]
    fn test_crop_zero_span_axis_is_unconstrained() {
        let cloud = PointCloudData::from_xyz(vec![[0.0, 0.0, 0.0], [1.0, 1.0, 7.0], [2.0, 2.0, -3.0]]);

        // z has zero span: no point may be removed because of z
        let cropped = crop(cloud, &BoundingBox::new([0.0, 0.0, 4.0], [2.0, 2.0, 4.0])).unwrap();

        assert_eq!(cropped.len(), 3);
    }

    #[test]
    fn test_crop_empty_box_removes_everything() {
        let cloud = PointCloudData::from_xyz(vec![[0.0; 3], [1.0; 3]]);
        let bbox = BoundingBox::new([5.0, 0.0, 0.0], [4.0, 1.0, 1.0]);

        assert!(bbox.is_empty());
        assert!(crop(cloud, &bbox).unwrap().is_empty());
    }

    #[test]
    fn test_crop_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(3);
        let cloud = random_cloud(&mut rng, 500, 0.0, 100.0);
        let bbox = BoundingBox::new([20.0; 3], [70.0; 3]);

        let once = crop(cloud, &bbox).unwrap();
        let twice = crop(once.clone(), &bbox).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_cut_to_common_box_overlapping_epochs() {
        let mut rng = StdRng::seed_from_u64(11);
        let e1 = random_cloud(&mut rng, 1000, 0.0, 100.0);
        let e2 = random_cloud(&mut rng, 1000, 50.0, 150.0);

        let (cropped, bbox) = cut_to_common_box(vec![e1.clone(), e2.clone()], 0.0).unwrap();

        let inside = |p: &[f64; 3]| p.iter().all(|&v| (50.0..=100.0).contains(&v));
        for (original, result) in [e1, e2].iter().zip(&cropped) {
            assert!(result.xyz().iter().all(inside));
            let expected = original.xyz().iter().filter(|p| bbox.contains(p)).count();
            assert_eq!(result.len(), expected);
        }

        assert!(bbox.min.iter().all(|&v| v >= 50.0));
        assert!(bbox.max.iter().all(|&v| v <= 100.0));
    }
}
