//! Data writers for PLY and CSV formats.
//!
//! This module provides functions for persisting pipeline artifacts:
//! - PLY with double coordinates, 8-bit colors, double normals and every
//!   attribute channel in its native type (ASCII or binary little endian)
//! - CSV with the vertices of a footprint polygon

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use geo::Polygon;
use thiserror::Error;

use super::cloud::{AttributeValues, PointCloudData};

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Body encoding of a written PLY file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlyFormat {
    Ascii,
    #[default]
    BinaryLittleEndian,
}

impl PlyFormat {
    fn header_name(self) -> &'static str {
        match self {
            PlyFormat::Ascii => "ascii",
            PlyFormat::BinaryLittleEndian => "binary_little_endian",
        }
    }
}

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Creates a buffered writer for the given path.
fn create_buffered_writer(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(BufWriter::new(file))
}

/// One scalar as written into the PLY body.
#[derive(Debug, Clone, Copy)]
enum PlyValue {
    U8(u8),
    U16(u16),
    U32(u32),
    I8(i8),
    I16(i16),
    I32(i32),
    F32(f32),
    F64(f64),
}

impl PlyValue {
    fn write_binary<W: Write>(self, w: &mut W) -> io::Result<()> {
        match self {
            PlyValue::U8(v) => w.write_u8(v),
            PlyValue::U16(v) => w.write_u16::<LittleEndian>(v),
            PlyValue::U32(v) => w.write_u32::<LittleEndian>(v),
            PlyValue::I8(v) => w.write_i8(v),
            PlyValue::I16(v) => w.write_i16::<LittleEndian>(v),
            PlyValue::I32(v) => w.write_i32::<LittleEndian>(v),
            PlyValue::F32(v) => w.write_f32::<LittleEndian>(v),
            PlyValue::F64(v) => w.write_f64::<LittleEndian>(v),
        }
    }

    fn write_ascii<W: Write>(self, w: &mut W) -> io::Result<()> {
        match self {
            PlyValue::U8(v) => write!(w, "{}", v),
            PlyValue::U16(v) => write!(w, "{}", v),
            PlyValue::U32(v) => write!(w, "{}", v),
            PlyValue::I8(v) => write!(w, "{}", v),
            PlyValue::I16(v) => write!(w, "{}", v),
            PlyValue::I32(v) => write!(w, "{}", v),
            PlyValue::F32(v) => write!(w, "{}", v),
            PlyValue::F64(v) => write!(w, "{}", v),
        }
    }
}

fn attribute_value(values: &AttributeValues, i: usize) -> PlyValue {
    match values {
        AttributeValues::Bool(v) => PlyValue::U8(v[i] as u8),
        AttributeValues::U8(v) => PlyValue::U8(v[i]),
        AttributeValues::U16(v) => PlyValue::U16(v[i]),
        AttributeValues::U32(v) => PlyValue::U32(v[i]),
        AttributeValues::I8(v) => PlyValue::I8(v[i]),
        AttributeValues::I16(v) => PlyValue::I16(v[i]),
        AttributeValues::I32(v) => PlyValue::I32(v[i]),
        AttributeValues::F32(v) => PlyValue::F32(v[i]),
        AttributeValues::F64(v) => PlyValue::F64(v[i]),
    }
}

fn write_ply_header<W: Write>(w: &mut W, cloud: &PointCloudData, format: PlyFormat) -> io::Result<()> {
    writeln!(w, "ply")?;
    writeln!(w, "format {} 1.0", format.header_name())?;
    writeln!(w, "element vertex {}", cloud.len())?;
    for axis in ["x", "y", "z"] {
        writeln!(w, "property double {}", axis)?;
    }
    if cloud.color().is_some() {
        for channel in ["red", "green", "blue"] {
            writeln!(w, "property uchar {}", channel)?;
        }
    }
    if cloud.normals().is_some() {
        for axis in ["nx", "ny", "nz"] {
            writeln!(w, "property double {}", axis)?;
        }
    }
    for (name, values) in cloud.attributes() {
        writeln!(w, "property {} {}", values.scalar_type().ply_name(), name)?;
    }
    writeln!(w, "end_header")
}

fn write_ply_body<W: Write>(w: &mut W, cloud: &PointCloudData, format: PlyFormat) -> io::Result<()> {
    let mut row: Vec<PlyValue> = Vec::with_capacity(9 + cloud.attributes().len());

    for i in 0..cloud.len() {
        row.clear();
        row.extend(cloud.xyz()[i].map(PlyValue::F64));
        if let Some(color) = cloud.color() {
            row.extend(color[i].map(PlyValue::U8));
        }
        if let Some(normals) = cloud.normals() {
            row.extend(normals[i].map(PlyValue::F64));
        }
        row.extend(cloud.attributes().values().map(|values| attribute_value(values, i)));

        match format {
            PlyFormat::BinaryLittleEndian => {
                for value in &row {
                    value.write_binary(w)?;
                }
            }
            PlyFormat::Ascii => {
                for (k, value) in row.iter().enumerate() {
                    if k > 0 {
                        w.write_all(b" ")?;
                    }
                    value.write_ascii(w)?;
                }
                w.write_all(b"\n")?;
            }
        }
    }

    Ok(())
}

/// Write a point cloud to a PLY file.
///
/// The single `vertex` element holds `double x, y, z`, then `uchar red,
/// green, blue` and `double nx, ny, nz` when present, then every attribute
/// channel in name order with its native type (booleans as `uchar`).
///
/// # Arguments
///
/// * `path` - Output file path (parent directories will be created if needed)
/// * `cloud` - Point cloud to persist
/// * `format` - ASCII or binary little endian body
///
/// # Errors
///
/// Returns an error if:
/// - Parent directories cannot be created
/// - File cannot be created or written to
///
/// # Example
///
/// ```no_run
/// use despan::core::cloud::PointCloudData;
/// use despan::core::writers::{write_ply, PlyFormat};
/// use std::path::Path;
///
/// let cloud = PointCloudData::from_xyz(vec![[1.0, 2.0, 3.0]]);
/// write_ply(Path::new("output.ply"), &cloud, PlyFormat::Ascii).unwrap();
/// ```
pub fn write_ply(path: &Path, cloud: &PointCloudData, format: PlyFormat) -> Result<()> {
    ensure_parent_dirs(path)?;
    let mut writer = create_buffered_writer(path)?;

    let write_err = |e: io::Error| WriteError::WriteFile {
        path: path.display().to_string(),
        source: e,
    };

    write_ply_header(&mut writer, cloud, format).map_err(write_err)?;
    write_ply_body(&mut writer, cloud, format).map_err(write_err)?;
    writer.flush().map_err(write_err)?;

    Ok(())
}

/// Write the exterior ring of a polygon to CSV.
///
/// Creates a CSV file with headers "x,y" and one row per ring vertex,
/// including the closing vertex.
pub fn write_polygon_csv(path: &Path, polygon: &Polygon<f64>) -> Result<()> {
    ensure_parent_dirs(path)?;

    let buf_writer = create_buffered_writer(path)?;
    let mut csv_writer = csv::Writer::from_writer(buf_writer);

    let path_str = path.display().to_string();

    csv_writer
        .write_record(["x", "y"])
        .map_err(|e| WriteError::Csv {
            path: path_str.clone(),
            source: e,
        })?;

    for coord in polygon.exterior().coords() {
        csv_writer
            .write_record(&[format!("{:.6}", coord.x), format!("{:.6}", coord.y)])
            .map_err(|e| WriteError::Csv {
                path: path_str.clone(),
                source: e,
            })?;
    }

    csv_writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;

    Ok(())
}
