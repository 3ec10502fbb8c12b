//! Concatenation of several clouds into one.
//!
//! Optional data survives a merge only where every input provides it:
//! colors and normals are kept if all inputs carry them, and an attribute
//! channel is kept if every input has it. A channel whose element type
//! differs between inputs is widened to `f64`. Anything else is dropped for
//! all points, never filled. A provenance channel with the 1-based source
//! index of each point is always added.

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::core::cloud::{AttributeValues, CloudError, CloudParts, PointCloudData, ScalarType};

/// Name of the channel recording which input a merged point came from.
pub const PROVENANCE_CHANNEL: &str = "point_cloud_merge";

/// Channels present in every input, with the element type of the merged column.
///
/// Inputs that disagree on a channel's type merge into `F64`.
fn shared_channels(clouds: &[PointCloudData]) -> Vec<(String, ScalarType)> {
    let Some((first, rest)) = clouds.split_first() else {
        return Vec::new();
    };

    first
        .attributes()
        .iter()
        .filter_map(|(name, values)| {
            if name.as_str() == PROVENANCE_CHANNEL {
                warn!("Input channel '{}' is replaced by merge provenance", name);
                return None;
            }

            let mut ty = values.scalar_type();
            for other in rest {
                let Some(v) = other.attribute(name) else {
                    debug!("Channel '{}' is not present in every input, dropped", name);
                    return None;
                };
                if v.scalar_type() != ty {
                    ty = ScalarType::F64;
                }
            }
            if ty != values.scalar_type() {
                debug!("Channel '{}' has mixed element types, widened to f64", name);
            }
            Some((name.clone(), ty))
        })
        .collect()
}

/// Merge clouds in order into a single cloud.
///
/// The points of `clouds[0]` come first, then those of `clouds[1]`, and so on.
/// The inputs are consumed and their buffers reused.
///
/// # Arguments
///
/// * `clouds` - Clouds to concatenate
///
/// # Returns
///
/// The merged cloud, carrying the [`PROVENANCE_CHANNEL`] attribute.
///
/// # Errors
///
/// Returns [`CloudError::EmptyInput`] if `clouds` is empty.
pub fn merge(clouds: Vec<PointCloudData>) -> Result<PointCloudData, CloudError> {
    if clouds.is_empty() {
        return Err(CloudError::EmptyInput);
    }

    let keep_color = clouds.iter().all(|c| c.color().is_some());
    let keep_normals = clouds.iter().all(|c| c.normals().is_some());
    let channels = shared_channels(&clouds);

    if !keep_color && clouds.iter().any(|c| c.color().is_some()) {
        debug!("Colors are not present in every input, dropped");
    }
    if !keep_normals && clouds.iter().any(|c| c.normals().is_some()) {
        debug!("Normals are not present in every input, dropped");
    }

    // Calculate total size for pre-allocation
    let total_size: usize = clouds.iter().map(PointCloudData::len).sum();
    let num_inputs = clouds.len();

    let mut all_xyz = Vec::with_capacity(total_size);
    let mut all_colors = Vec::with_capacity(if keep_color { total_size } else { 0 });
    let mut all_normals = Vec::with_capacity(if keep_normals { total_size } else { 0 });
    let mut all_attributes: BTreeMap<String, AttributeValues> = BTreeMap::new();
    let mut provenance: Vec<u32> = Vec::with_capacity(total_size);

    for (index, cloud) in clouds.into_iter().enumerate() {
        let CloudParts {
            xyz,
            color,
            normals,
            mut attributes,
        } = cloud.into_parts();

        provenance.extend(std::iter::repeat(index as u32 + 1).take(xyz.len()));
        all_xyz.extend(xyz);

        if keep_color {
            all_colors.extend(color.unwrap_or_default());
        }
        if keep_normals {
            all_normals.extend(normals.unwrap_or_default());
        }

        for (name, ty) in &channels {
            let Some(mut values) = attributes.remove(name) else {
                continue;
            };
            if values.scalar_type() != *ty {
                values = values.into_f64();
            }
            match all_attributes.get_mut(name) {
                Some(column) => column.append(values).map_err(|_| CloudError::ShapeMismatch {
                    field: name.clone(),
                    reason: "element type differs between merged clouds".to_string(),
                })?,
                None => {
                    all_attributes.insert(name.clone(), values);
                }
            }
        }
    }

    all_attributes.insert(PROVENANCE_CHANNEL.to_string(), AttributeValues::U32(provenance));

    let merged = PointCloudData::from_parts(CloudParts {
        xyz: all_xyz,
        color: keep_color.then_some(all_colors),
        normals: keep_normals.then_some(all_normals),
        attributes: all_attributes,
    })?;

    debug!("Merged {} clouds into {}", num_inputs, merged);
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::filtering::AttributeFilter;

    fn cloud_a() -> PointCloudData {
        PointCloudData::from_xyz(vec![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]])
            .with_color(vec![[10, 10, 10], [20, 20, 20]])
            .unwrap()
            .with_normals(vec![[0.0, 0.0, 1.0], [0.0, 0.0, 1.0]])
            .unwrap()
            .with_attribute("intensity", AttributeValues::U16(vec![100, 200]))
            .unwrap()
            .with_attribute("classification", AttributeValues::U8(vec![2, 3]))
            .unwrap()
    }

    fn cloud_b() -> PointCloudData {
        PointCloudData::from_xyz(vec![[5.0, 5.0, 5.0], [6.0, 6.0, 6.0], [7.0, 7.0, 7.0]])
            .with_color(vec![[1, 2, 3], [4, 5, 6], [7, 8, 9]])
            .unwrap()
            .with_attribute("intensity", AttributeValues::U16(vec![1, 2, 3]))
            .unwrap()
            .with_attribute("classification", AttributeValues::F32(vec![2.0, 2.0, 2.0]))
            .unwrap()
    }

    #[test]
    fn test_merge_empty_input() {
        assert!(matches!(merge(Vec::new()), Err(CloudError::EmptyInput)));
    }

    #[test]
    fn test_merge_keeps_source_order() {
        let merged = merge(vec![cloud_a(), cloud_b()]).unwrap();

        assert_eq!(merged.len(), 5);
        assert_eq!(merged.xyz()[0], [0.0, 0.0, 0.0]);
        assert_eq!(merged.xyz()[2], [5.0, 5.0, 5.0]);
        assert_eq!(merged.color().unwrap()[4], [7, 8, 9]);
        assert_eq!(
            merged.attribute("intensity"),
            Some(&AttributeValues::U16(vec![100, 200, 1, 2, 3]))
        );
        assert_eq!(
            merged.attribute(PROVENANCE_CHANNEL),
            Some(&AttributeValues::U32(vec![1, 1, 2, 2, 2]))
        );
    }

    #[test]
    fn test_merge_drops_partial_fields() {
        let b = cloud_b();
        let c = PointCloudData::from_xyz(vec![[9.0; 3]])
            .with_color(vec![[0, 0, 0]])
            .unwrap()
            .with_attribute("intensity", AttributeValues::U16(vec![7]))
            .unwrap();

        let merged = merge(vec![cloud_a(), b, c]).unwrap();

        // Normals only in cloud_a; classification missing from the third input
        assert!(merged.normals().is_none());
        assert!(merged.attribute("classification").is_none());
        assert_eq!(
            merged.channel_names().collect::<Vec<_>>(),
            vec!["intensity", PROVENANCE_CHANNEL]
        );
    }

    #[test]
    fn test_merge_widens_mixed_types() {
        let merged = merge(vec![cloud_a(), cloud_b()]).unwrap();

        assert_eq!(
            merged.attribute("classification"),
            Some(&AttributeValues::F64(vec![2.0, 3.0, 2.0, 2.0, 2.0]))
        );
        // Same type everywhere stays native
        assert_eq!(merged.attribute("intensity").map(|v| v.scalar_type()), Some(ScalarType::U16));
    }

    #[test]
    fn test_merge_keeps_intensity_across_formats() {
        let las_like = PointCloudData::from_xyz(vec![[0.0; 3], [1.0; 3]])
            .with_attribute("intensity", AttributeValues::U16(vec![100, 200]))
            .unwrap();
        let ply_like = PointCloudData::from_xyz(vec![[2.0; 3]])
            .with_attribute("intensity", AttributeValues::F32(vec![300.0]))
            .unwrap();

        let merged = merge(vec![las_like, ply_like]).unwrap();

        assert_eq!(
            merged.attribute("intensity"),
            Some(&AttributeValues::F64(vec![100.0, 200.0, 300.0]))
        );
    }

    #[test]
    fn test_merge_single_cloud_adds_provenance() {
        let merged = merge(vec![cloud_a()]).unwrap();

        assert!(merged.normals().is_some());
        assert_eq!(merged.attribute(PROVENANCE_CHANNEL), Some(&AttributeValues::U32(vec![1, 1])));
    }

    #[test]
    fn test_merge_then_filter_provenance_recovers_first_input() {
        let merged = merge(vec![cloud_a(), cloud_b()]).unwrap();
        let first = AttributeFilter::equals(PROVENANCE_CHANNEL, 1.0).apply(merged).unwrap();

        let original = cloud_a();
        assert_eq!(first.xyz(), original.xyz());
        assert_eq!(first.color(), original.color());
        assert_eq!(first.attribute("intensity"), original.attribute("intensity"));
    }

    #[test]
    fn test_merge_replaces_existing_provenance_channel() {
        let a = PointCloudData::from_xyz(vec![[0.0; 3]])
            .with_attribute(PROVENANCE_CHANNEL, AttributeValues::U32(vec![9]))
            .unwrap();
        let b = PointCloudData::from_xyz(vec![[1.0; 3]])
            .with_attribute(PROVENANCE_CHANNEL, AttributeValues::U32(vec![9]))
            .unwrap();

        let merged = merge(vec![a, b]).unwrap();
        assert_eq!(merged.attribute(PROVENANCE_CHANNEL), Some(&AttributeValues::U32(vec![1, 2])));
    }
}
