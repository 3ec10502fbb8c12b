//! In-memory point cloud representation with per-point attribute channels.
//!
//! A [`PointCloudData`] owns its coordinate array, optional colors and normals,
//! and a set of named scalar channels. Every array has exactly one entry per
//! point; this is checked on construction and preserved by every reducing
//! operation, which consumes the cloud and returns a new one.

use std::collections::BTreeMap;
use std::fmt;

use rayon::prelude::*;
use thiserror::Error;

/// Errors raised by the point cloud data model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CloudError {
    /// An array length or channel layout violates the one-entry-per-point invariant.
    #[error("shape mismatch in '{field}': {reason}")]
    ShapeMismatch { field: String, reason: String },

    /// An operation that needs at least one cloud received none.
    #[error("no point clouds given")]
    EmptyInput,
}

impl CloudError {
    fn length(field: &str, expected: usize, found: usize) -> Self {
        CloudError::ShapeMismatch {
            field: field.to_string(),
            reason: format!("expected {} elements, found {}", expected, found),
        }
    }
}

/// Result type for data model operations.
pub type Result<T> = std::result::Result<T, CloudError>;

/// Native element type of an attribute channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Bool,
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F32,
    F64,
}

impl ScalarType {
    /// Property type name used in PLY headers. Booleans are stored as `uchar`.
    pub fn ply_name(self) -> &'static str {
        match self {
            ScalarType::Bool | ScalarType::U8 => "uchar",
            ScalarType::U16 => "ushort",
            ScalarType::U32 => "uint",
            ScalarType::I8 => "char",
            ScalarType::I16 => "short",
            ScalarType::I32 => "int",
            ScalarType::F32 => "float",
            ScalarType::F64 => "double",
        }
    }

    /// Parse a PLY property type, accepting both the classic and sized names.
    pub fn from_ply_name(name: &str) -> Option<Self> {
        let ty = match name {
            "char" | "int8" => ScalarType::I8,
            "uchar" | "uint8" => ScalarType::U8,
            "short" | "int16" => ScalarType::I16,
            "ushort" | "uint16" => ScalarType::U16,
            "int" | "int32" => ScalarType::I32,
            "uint" | "uint32" => ScalarType::U32,
            "float" | "float32" => ScalarType::F32,
            "double" | "float64" => ScalarType::F64,
            _ => return None,
        };
        Some(ty)
    }

    /// Size in bytes of one binary value.
    pub fn size(self) -> usize {
        match self {
            ScalarType::Bool | ScalarType::U8 | ScalarType::I8 => 1,
            ScalarType::U16 | ScalarType::I16 => 2,
            ScalarType::U32 | ScalarType::I32 | ScalarType::F32 => 4,
            ScalarType::F64 => 8,
        }
    }
}

/// Conversion between a channel's native element type and `f64`.
pub trait Scalar: Copy + Send + Sync + 'static {
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_numeric_scalar {
    ($($t:ty),*) => {
        $(
            impl Scalar for $t {
                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn from_f64(value: f64) -> Self {
                    value as $t
                }
            }
        )*
    };
}

impl_numeric_scalar!(u8, u16, u32, i8, i16, i32, f32, f64);

impl Scalar for bool {
    #[inline]
    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value != 0.0
    }
}

/// One attribute channel: a typed column with one value per point.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValues {
    Bool(Vec<bool>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Runs `$body` with `$v` bound to the inner vector of any variant.
macro_rules! with_column {
    ($self:expr, $v:ident => $body:expr) => {
        match $self {
            AttributeValues::Bool($v) => $body,
            AttributeValues::U8($v) => $body,
            AttributeValues::U16($v) => $body,
            AttributeValues::U32($v) => $body,
            AttributeValues::I8($v) => $body,
            AttributeValues::I16($v) => $body,
            AttributeValues::I32($v) => $body,
            AttributeValues::F32($v) => $body,
            AttributeValues::F64($v) => $body,
        }
    };
}

/// Like `with_column!`, but wraps the resulting vector back into the same variant.
macro_rules! map_column {
    ($self:expr, $v:ident => $body:expr) => {
        match $self {
            AttributeValues::Bool($v) => AttributeValues::Bool($body),
            AttributeValues::U8($v) => AttributeValues::U8($body),
            AttributeValues::U16($v) => AttributeValues::U16($body),
            AttributeValues::U32($v) => AttributeValues::U32($body),
            AttributeValues::I8($v) => AttributeValues::I8($body),
            AttributeValues::I16($v) => AttributeValues::I16($body),
            AttributeValues::I32($v) => AttributeValues::I32($body),
            AttributeValues::F32($v) => AttributeValues::F32($body),
            AttributeValues::F64($v) => AttributeValues::F64($body),
        }
    };
}

impl AttributeValues {
    /// Creates an empty column of the given type.
    pub fn with_capacity(ty: ScalarType, capacity: usize) -> Self {
        match ty {
            ScalarType::Bool => AttributeValues::Bool(Vec::with_capacity(capacity)),
            ScalarType::U8 => AttributeValues::U8(Vec::with_capacity(capacity)),
            ScalarType::U16 => AttributeValues::U16(Vec::with_capacity(capacity)),
            ScalarType::U32 => AttributeValues::U32(Vec::with_capacity(capacity)),
            ScalarType::I8 => AttributeValues::I8(Vec::with_capacity(capacity)),
            ScalarType::I16 => AttributeValues::I16(Vec::with_capacity(capacity)),
            ScalarType::I32 => AttributeValues::I32(Vec::with_capacity(capacity)),
            ScalarType::F32 => AttributeValues::F32(Vec::with_capacity(capacity)),
            ScalarType::F64 => AttributeValues::F64(Vec::with_capacity(capacity)),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            AttributeValues::Bool(_) => ScalarType::Bool,
            AttributeValues::U8(_) => ScalarType::U8,
            AttributeValues::U16(_) => ScalarType::U16,
            AttributeValues::U32(_) => ScalarType::U32,
            AttributeValues::I8(_) => ScalarType::I8,
            AttributeValues::I16(_) => ScalarType::I16,
            AttributeValues::I32(_) => ScalarType::I32,
            AttributeValues::F32(_) => ScalarType::F32,
            AttributeValues::F64(_) => ScalarType::F64,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        with_column!(self, v => v.len())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at `index` widened to `f64` (booleans map to 0.0 / 1.0).
    #[inline]
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        with_column!(self, v => v.get(index).map(|x| x.to_f64()))
    }

    /// Appends a value, narrowing it to the column's native type.
    #[inline]
    pub fn push_f64(&mut self, value: f64) {
        with_column!(self, v => v.push(Scalar::from_f64(value)))
    }

    /// Evaluates `predicate` on every value (widened to `f64`) and returns the mask.
    pub fn mask_where<F>(&self, predicate: F) -> Vec<bool>
    where
        F: Fn(f64) -> bool + Sync,
    {
        with_column!(self, v => v.par_iter().map(|x| predicate(x.to_f64())).collect())
    }

    /// Converts the column to `F64`. An `F64` column is returned as is.
    pub fn into_f64(self) -> Self {
        match self {
            AttributeValues::F64(v) => AttributeValues::F64(v),
            other => AttributeValues::F64(with_column!(&other, v => v.iter().map(|x| x.to_f64()).collect())),
        }
    }

    /// Keeps the values whose mask entry is `true`, preserving order.
    ///
    /// The caller guarantees `mask.len() == self.len()`.
    fn select(&self, mask: &[bool]) -> Self {
        map_column!(self, v => select_masked(v, mask))
    }

    /// Moves all values of `other` to the end of this column.
    ///
    /// Returns `other` back unchanged if the element types differ.
    pub(crate) fn append(&mut self, other: AttributeValues) -> std::result::Result<(), AttributeValues> {
        match (self, other) {
            (AttributeValues::Bool(a), AttributeValues::Bool(mut b)) => a.append(&mut b),
            (AttributeValues::U8(a), AttributeValues::U8(mut b)) => a.append(&mut b),
            (AttributeValues::U16(a), AttributeValues::U16(mut b)) => a.append(&mut b),
            (AttributeValues::U32(a), AttributeValues::U32(mut b)) => a.append(&mut b),
            (AttributeValues::I8(a), AttributeValues::I8(mut b)) => a.append(&mut b),
            (AttributeValues::I16(a), AttributeValues::I16(mut b)) => a.append(&mut b),
            (AttributeValues::I32(a), AttributeValues::I32(mut b)) => a.append(&mut b),
            (AttributeValues::F32(a), AttributeValues::F32(mut b)) => a.append(&mut b),
            (AttributeValues::F64(a), AttributeValues::F64(mut b)) => a.append(&mut b),
            (_, other) => return Err(other),
        }
        Ok(())
    }
}

/// Order-preserving parallel mask selection shared by every column kind.
pub(crate) fn select_masked<T: Copy + Send + Sync>(values: &[T], mask: &[bool]) -> Vec<T> {
    values
        .par_iter()
        .zip(mask.par_iter())
        .filter_map(|(value, &keep)| keep.then_some(*value))
        .collect()
}

/// One point cloud with coordinates, optional colors/normals and attribute channels.
///
/// The fields are private: a cloud can only be built through [`PointCloudData::new`]
/// (or the `with_*` builders), which validate that every array holds exactly one
/// entry per point. Reducing operations take the cloud by value and hand back the
/// reduced cloud, so a cloud has a single owner at any time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloudData {
    xyz: Vec<[f64; 3]>,
    color: Option<Vec<[u8; 3]>>,
    normals: Option<Vec<[f64; 3]>>,
    attributes: BTreeMap<String, AttributeValues>,
}

/// Owned components of a cloud, handed to the merger.
pub(crate) struct CloudParts {
    pub xyz: Vec<[f64; 3]>,
    pub color: Option<Vec<[u8; 3]>>,
    pub normals: Option<Vec<[f64; 3]>>,
    pub attributes: BTreeMap<String, AttributeValues>,
}

impl PointCloudData {
    /// Creates a validated point cloud.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::ShapeMismatch`] if `color`, `normals` or any
    /// attribute does not hold exactly `xyz.len()` entries, or if an attribute
    /// name is given twice.
    pub fn new(
        xyz: Vec<[f64; 3]>,
        color: Option<Vec<[u8; 3]>>,
        normals: Option<Vec<[f64; 3]>>,
        attributes: Vec<(String, AttributeValues)>,
    ) -> Result<Self> {
        let n = xyz.len();

        if let Some(ref c) = color {
            if c.len() != n {
                return Err(CloudError::length("color", n, c.len()));
            }
        }
        if let Some(ref nv) = normals {
            if nv.len() != n {
                return Err(CloudError::length("normals", n, nv.len()));
            }
        }

        let mut map = BTreeMap::new();
        for (name, values) in attributes {
            if values.len() != n {
                return Err(CloudError::length(&name, n, values.len()));
            }
            if map.contains_key(&name) {
                return Err(CloudError::ShapeMismatch {
                    reason: "attribute name is used more than once".to_string(),
                    field: name,
                });
            }
            map.insert(name, values);
        }

        Ok(Self {
            xyz,
            color,
            normals,
            attributes: map,
        })
    }

    /// Creates a cloud holding only coordinates.
    pub fn from_xyz(xyz: Vec<[f64; 3]>) -> Self {
        Self {
            xyz,
            ..Self::default()
        }
    }

    /// Attaches colors; fails if the length does not match the point count.
    pub fn with_color(mut self, color: Vec<[u8; 3]>) -> Result<Self> {
        if color.len() != self.len() {
            return Err(CloudError::length("color", self.len(), color.len()));
        }
        self.color = Some(color);
        Ok(self)
    }

    /// Attaches normals; fails if the length does not match the point count.
    pub fn with_normals(mut self, normals: Vec<[f64; 3]>) -> Result<Self> {
        if normals.len() != self.len() {
            return Err(CloudError::length("normals", self.len(), normals.len()));
        }
        self.normals = Some(normals);
        Ok(self)
    }

    /// Attaches a new attribute channel; fails on a length mismatch or a reused name.
    pub fn with_attribute(mut self, name: impl Into<String>, values: AttributeValues) -> Result<Self> {
        let name = name.into();
        if values.len() != self.len() {
            return Err(CloudError::length(&name, self.len(), values.len()));
        }
        if self.attributes.contains_key(&name) {
            return Err(CloudError::ShapeMismatch {
                reason: "attribute name is used more than once".to_string(),
                field: name,
            });
        }
        self.attributes.insert(name, values);
        Ok(self)
    }

    /// Returns the number of points in the cloud.
    #[inline]
    pub fn len(&self) -> usize {
        self.xyz.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.xyz.is_empty()
    }

    #[inline]
    pub fn xyz(&self) -> &[[f64; 3]] {
        &self.xyz
    }

    #[inline]
    pub fn color(&self) -> Option<&[[u8; 3]]> {
        self.color.as_deref()
    }

    #[inline]
    pub fn normals(&self) -> Option<&[[f64; 3]]> {
        self.normals.as_deref()
    }

    /// All attribute channels, ordered by name.
    #[inline]
    pub fn attributes(&self) -> &BTreeMap<String, AttributeValues> {
        &self.attributes
    }

    #[inline]
    pub fn attribute(&self, name: &str) -> Option<&AttributeValues> {
        self.attributes.get(name)
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Keeps the points whose mask entry is `true`.
    ///
    /// The same mask is applied to coordinates, colors, normals and every
    /// attribute channel, preserving relative order. The channel set is never
    /// changed.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::ShapeMismatch`] if `mask.len()` differs from the
    /// point count; the cloud is dropped in that case since the error is a
    /// programming fault.
    pub fn reduce(self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.len() {
            return Err(CloudError::length("mask", self.len(), mask.len()));
        }

        let xyz = select_masked(&self.xyz, mask);
        let color = self.color.as_ref().map(|c| select_masked(c, mask));
        let normals = self.normals.as_ref().map(|nv| select_masked(nv, mask));
        let attributes = self
            .attributes
            .iter()
            .map(|(name, values)| (name.clone(), values.select(mask)))
            .collect();

        Ok(Self {
            xyz,
            color,
            normals,
            attributes,
        })
    }

    pub(crate) fn into_parts(self) -> CloudParts {
        CloudParts {
            xyz: self.xyz,
            color: self.color,
            normals: self.normals,
            attributes: self.attributes,
        }
    }

    /// Rebuilds a cloud from parts already known to be consistent.
    pub(crate) fn from_parts(parts: CloudParts) -> Result<Self> {
        Self::new(
            parts.xyz,
            parts.color,
            parts.normals,
            parts.attributes.into_iter().collect(),
        )
    }
}

impl fmt::Display for PointCloudData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "point cloud with {} point(s)", self.len())?;
        if !self.attributes.is_empty() {
            let names: Vec<&str> = self.channel_names().collect();
            write!(f, " [{}]", names.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cloud() -> PointCloudData {
        PointCloudData::new(
            vec![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0], [2.0, 2.0, 2.0], [3.0, 3.0, 3.0]],
            Some(vec![[10, 0, 0], [20, 0, 0], [30, 0, 0], [40, 0, 0]]),
            Some(vec![[0.0, 0.0, 1.0]; 4]),
            vec![
                ("intensity".to_string(), AttributeValues::U16(vec![100, 200, 300, 400])),
                ("flag".to_string(), AttributeValues::Bool(vec![true, false, true, false])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_short_color() {
        let result = PointCloudData::new(
            vec![[0.0; 3], [1.0; 3]],
            Some(vec![[0, 0, 0]]),
            None,
            Vec::new(),
        );
        assert!(matches!(result, Err(CloudError::ShapeMismatch { ref field, .. }) if field == "color"));
    }

    #[test]
    fn test_new_rejects_short_normals() {
        let result = PointCloudData::new(vec![[0.0; 3]; 3], None, Some(vec![[0.0; 3]; 2]), Vec::new());
        assert!(matches!(result, Err(CloudError::ShapeMismatch { ref field, .. }) if field == "normals"));
    }

    #[test]
    fn test_new_rejects_attribute_length() {
        let result = PointCloudData::new(
            vec![[0.0; 3]; 3],
            None,
            None,
            vec![("classification".to_string(), AttributeValues::U8(vec![2, 2]))],
        );
        assert!(matches!(
            result,
            Err(CloudError::ShapeMismatch { ref field, .. }) if field == "classification"
        ));
    }

    #[test]
    fn test_new_rejects_reused_name() {
        let result = PointCloudData::new(
            vec![[0.0; 3]; 2],
            None,
            None,
            vec![
                ("intensity".to_string(), AttributeValues::U16(vec![1, 2])),
                ("intensity".to_string(), AttributeValues::F32(vec![1.0, 2.0])),
            ],
        );
        assert!(matches!(result, Err(CloudError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_with_attribute_rejects_reused_name() {
        let cloud = sample_cloud();
        let result = cloud.with_attribute("intensity", AttributeValues::U16(vec![0; 4]));
        assert!(result.is_err());
    }

    #[test]
    fn test_reduce_applies_mask_to_every_channel() {
        let cloud = sample_cloud();
        let mask = [true, false, false, true];

        let reduced = cloud.clone().reduce(&mask).unwrap();

        assert_eq!(reduced.len(), 2);
        assert_eq!(reduced.xyz(), &[[0.0, 0.0, 0.0], [3.0, 3.0, 3.0]]);
        assert_eq!(reduced.color().unwrap(), &[[10, 0, 0], [40, 0, 0]]);
        assert_eq!(reduced.normals().unwrap().len(), 2);
        assert_eq!(
            reduced.attribute("intensity"),
            Some(&AttributeValues::U16(vec![100, 400]))
        );
        assert_eq!(reduced.attribute("flag"), Some(&AttributeValues::Bool(vec![true, false])));
    }

    #[test]
    fn test_reduce_matches_original_indices() {
        let n = 50;
        let xyz: Vec<[f64; 3]> = (0..n).map(|i| [i as f64, 2.0 * i as f64, 0.5]).collect();
        let values = AttributeValues::F64((0..n).map(|i| i as f64 * 10.0).collect());
        let cloud = PointCloudData::from_xyz(xyz).with_attribute("v", values).unwrap();

        let mask: Vec<bool> = (0..n).map(|i| i % 3 == 0).collect();
        let kept: Vec<usize> = (0..n).filter(|i| mask[*i]).collect();
        let original = cloud.clone();

        let reduced = cloud.reduce(&mask).unwrap();

        assert_eq!(reduced.len(), kept.len());
        for (out_idx, &src_idx) in kept.iter().enumerate() {
            assert_eq!(reduced.xyz()[out_idx], original.xyz()[src_idx]);
            assert_eq!(
                reduced.attribute("v").unwrap().get_f64(out_idx),
                original.attribute("v").unwrap().get_f64(src_idx)
            );
        }
    }

    #[test]
    fn test_reduce_rejects_wrong_mask_length() {
        let cloud = sample_cloud();
        let result = cloud.reduce(&[true, false]);
        assert!(matches!(result, Err(CloudError::ShapeMismatch { ref field, .. }) if field == "mask"));
    }

    #[test]
    fn test_reduce_keeps_channel_set() {
        let cloud = sample_cloud();
        let reduced = cloud.reduce(&[false; 4]).unwrap();

        assert!(reduced.is_empty());
        assert!(reduced.color().is_some());
        assert!(reduced.normals().is_some());
        assert_eq!(reduced.channel_names().collect::<Vec<_>>(), vec!["flag", "intensity"]);
    }

    #[test]
    fn test_attribute_values_append_same_type() {
        let mut a = AttributeValues::U8(vec![1, 2]);
        assert!(a.append(AttributeValues::U8(vec![3])).is_ok());
        assert_eq!(a, AttributeValues::U8(vec![1, 2, 3]));
    }

    #[test]
    fn test_attribute_values_append_type_mismatch() {
        let mut a = AttributeValues::U8(vec![1, 2]);
        let rejected = a.append(AttributeValues::U16(vec![3])).unwrap_err();
        assert_eq!(rejected, AttributeValues::U16(vec![3]));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_mask_where_and_push() {
        let mut values = AttributeValues::with_capacity(ScalarType::Bool, 3);
        values.push_f64(1.0);
        values.push_f64(0.0);
        values.push_f64(5.0);

        assert_eq!(values.mask_where(|v| v == 1.0), vec![true, false, true]);
        assert_eq!(values.scalar_type(), ScalarType::Bool);
    }

    #[test]
    fn test_scalar_type_ply_names() {
        assert_eq!(ScalarType::from_ply_name("uint8"), Some(ScalarType::U8));
        assert_eq!(ScalarType::from_ply_name("double"), Some(ScalarType::F64));
        assert_eq!(ScalarType::from_ply_name("list"), None);
        assert_eq!(ScalarType::Bool.ply_name(), "uchar");
        assert_eq!(ScalarType::I16.size(), 2);
    }

    #[test]
    fn test_display() {
        let cloud = sample_cloud();
        assert_eq!(cloud.to_string(), "point cloud with 4 point(s) [flag, intensity]");
    }
}
