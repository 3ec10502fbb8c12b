//! Data loaders for PLY and LAS/LAZ point cloud files.
//!
//! This module provides:
//! - A PLY parser for ASCII and binary (little/big endian) vertex data
//! - A LAS/LAZ reader built on the `las` crate
//! - Directory discovery of point cloud files by extension
//!
//! Both readers produce a [`PointCloudData`] with coordinates always
//! populated, colors and normals when all three components exist, and the
//! requested attribute channels (case-insensitive, stored lower-cased).

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use log::debug;
use thiserror::Error;

use super::cloud::{AttributeValues, CloudError, PointCloudData, ScalarType};

/// Errors that can occur during file loading.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported point cloud format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("path does not exist: {0}")]
    NotFound(PathBuf),

    #[error("Invalid PLY file: {0}")]
    InvalidPly(String),

    #[error("Missing required properties: {0}")]
    MissingColumns(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("LAS error: {0}")]
    Las(#[from] las::Error),

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Point cloud file formats understood by [`load_point_cloud`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudFormat {
    Ply,
    Las,
}

impl CloudFormat {
    /// Detects the format from a file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "ply" => Some(CloudFormat::Ply),
            "las" | "laz" => Some(CloudFormat::Las),
            _ => None,
        }
    }
}

/// Load a point cloud file, dispatching on its extension.
///
/// # Arguments
///
/// * `path` - Path to a `.ply`, `.las` or `.laz` file
/// * `channels` - Attribute channels to keep; `None` keeps every available channel
///
/// # Errors
///
/// Returns [`LoaderError::UnsupportedFormat`] for any other extension, or the
/// underlying reader error.
pub fn load_point_cloud<P: AsRef<Path>>(path: P, channels: Option<&[String]>) -> Result<PointCloudData> {
    let path = path.as_ref();
    let cloud = match CloudFormat::from_path(path) {
        Some(CloudFormat::Ply) => load_ply(path, channels)?,
        Some(CloudFormat::Las) => load_las(path, channels)?,
        None => return Err(LoaderError::UnsupportedFormat(path.to_path_buf())),
    };

    debug!("Loaded {} from {}", cloud, path.display());
    Ok(cloud)
}

/// Returns true if `name` (any case) was requested, or if no selection was given.
fn channel_wanted(name: &str, channels: Option<&[String]>) -> bool {
    match channels {
        None => true,
        Some(list) => list.iter().any(|c| c.eq_ignore_ascii_case(name)),
    }
}

// ---------------------------------------------------------------------------
// PLY
// ---------------------------------------------------------------------------

/// Encoding of the PLY body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlyEncoding {
    Ascii,
    BinaryLittleEndian,
    BinaryBigEndian,
}

#[derive(Debug, Clone)]
struct PlyProperty {
    name: String,
    /// `None` for list properties.
    ty: Option<ScalarType>,
}

#[derive(Debug, Clone)]
struct PlyElement {
    name: String,
    count: usize,
    properties: Vec<PlyProperty>,
}

impl PlyElement {
    fn has_lists(&self) -> bool {
        self.properties.iter().any(|p| p.ty.is_none())
    }

    /// Size of one binary record; only meaningful without list properties.
    fn record_size(&self) -> usize {
        self.properties
            .iter()
            .filter_map(|p| p.ty)
            .map(ScalarType::size)
            .sum()
    }
}

#[derive(Debug, Clone)]
struct PlyHeader {
    encoding: PlyEncoding,
    elements: Vec<PlyElement>,
}

fn parse_ply_header<R: BufRead>(reader: &mut R, path: &Path) -> Result<PlyHeader> {
    let mut line = String::new();

    // Check PLY magic number
    reader.read_line(&mut line)?;
    if line.trim() != "ply" {
        return Err(LoaderError::InvalidPly(format!(
            "{} is not a PLY file",
            path.display()
        )));
    }

    let mut encoding = None;
    let mut elements: Vec<PlyElement> = Vec::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(LoaderError::InvalidPly("Missing end_header".to_string()));
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["end_header"] => break,
            ["format", fmt, _version] => {
                encoding = Some(match *fmt {
                    "ascii" => PlyEncoding::Ascii,
                    "binary_little_endian" => PlyEncoding::BinaryLittleEndian,
                    "binary_big_endian" => PlyEncoding::BinaryBigEndian,
                    other => {
                        return Err(LoaderError::InvalidPly(format!("Unknown format '{}'", other)))
                    }
                });
            }
            ["element", name, count] => {
                let count = count
                    .parse()
                    .map_err(|_| LoaderError::InvalidPly(format!("Invalid element count: {}", count)))?;
                elements.push(PlyElement {
                    name: name.to_string(),
                    count,
                    properties: Vec::new(),
                });
            }
            ["property", "list", _, _, name] => {
                let element = elements
                    .last_mut()
                    .ok_or_else(|| LoaderError::InvalidPly("Property before element".to_string()))?;
                element.properties.push(PlyProperty {
                    name: name.to_string(),
                    ty: None,
                });
            }
            ["property", ty, name] => {
                let ty = ScalarType::from_ply_name(ty)
                    .ok_or_else(|| LoaderError::InvalidPly(format!("Unknown property type '{}'", ty)))?;
                let element = elements
                    .last_mut()
                    .ok_or_else(|| LoaderError::InvalidPly("Property before element".to_string()))?;
                element.properties.push(PlyProperty {
                    name: name.to_string(),
                    ty: Some(ty),
                });
            }
            ["comment", ..] | ["obj_info", ..] | [] => {}
            _ => {
                return Err(LoaderError::InvalidPly(format!(
                    "Unexpected header line: {}",
                    line.trim()
                )))
            }
        }
    }

    let encoding =
        encoding.ok_or_else(|| LoaderError::InvalidPly("No format line in header".to_string()))?;

    Ok(PlyHeader { encoding, elements })
}

/// Load a point cloud from a PLY file.
///
/// Supports ASCII and binary encodings. The `vertex` element must carry `x`,
/// `y`, `z`; colors are read from `red/green/blue` (or `r/g/b`) and normals
/// from `nx/ny/nz` when all three exist. Other scalar properties become
/// attribute channels, subject to `channels`.
///
/// # Errors
///
/// Returns an error if the file is not a valid PLY, the vertex element is
/// missing or carries list properties, or a required property is absent.
pub fn load_ply<P: AsRef<Path>>(path: P, channels: Option<&[String]>) -> Result<PointCloudData> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let header = parse_ply_header(&mut reader, path)?;

    let vertex_pos = header
        .elements
        .iter()
        .position(|e| e.name == "vertex")
        .ok_or_else(|| LoaderError::InvalidPly("No vertex element in header".to_string()))?;
    let vertex = &header.elements[vertex_pos];

    if vertex.has_lists() {
        return Err(LoaderError::InvalidPly(
            "List properties on the vertex element are not supported".to_string(),
        ));
    }

    // Skip elements stored ahead of the vertices
    for element in &header.elements[..vertex_pos] {
        skip_ply_element(&mut reader, element, header.encoding)?;
    }

    let columns = match header.encoding {
        PlyEncoding::Ascii => read_ascii_vertices(&mut reader, vertex)?,
        PlyEncoding::BinaryLittleEndian => read_binary_vertices::<LittleEndian, _>(&mut reader, vertex)?,
        PlyEncoding::BinaryBigEndian => read_binary_vertices::<BigEndian, _>(&mut reader, vertex)?,
    };

    assemble_cloud(vertex, columns, channels)
}

fn skip_ply_element<R: BufRead>(reader: &mut R, element: &PlyElement, encoding: PlyEncoding) -> Result<()> {
    match encoding {
        PlyEncoding::Ascii => {
            let mut line = String::new();
            for _ in 0..element.count {
                line.clear();
                if reader.read_line(&mut line)? == 0 {
                    return Err(LoaderError::InvalidPly(format!(
                        "Unexpected end of file in element '{}'",
                        element.name
                    )));
                }
            }
        }
        _ => {
            if element.has_lists() {
                return Err(LoaderError::InvalidPly(format!(
                    "Cannot skip binary element '{}' with list properties",
                    element.name
                )));
            }
            let bytes = element
                .count
                .checked_mul(element.record_size())
                .and_then(|b| u64::try_from(b).ok())
                .ok_or_else(|| {
                    LoaderError::InvalidPly(format!("Element '{}' is too large", element.name))
                })?;
            let skipped = io::copy(&mut reader.by_ref().take(bytes), &mut io::sink())?;
            if skipped != bytes {
                return Err(LoaderError::InvalidPly(format!(
                    "Unexpected end of file in element '{}'",
                    element.name
                )));
            }
        }
    }
    Ok(())
}

/// Upper bound on the vertices reserved up front; larger clouds grow as read.
const MAX_RESERVED_VERTICES: usize = 1 << 20;

fn read_ascii_vertices<R: BufRead>(reader: &mut R, vertex: &PlyElement) -> Result<Vec<AttributeValues>> {
    let mut columns: Vec<AttributeValues> = vertex
        .properties
        .iter()
        .filter_map(|p| p.ty)
        .map(|ty| AttributeValues::with_capacity(ty, vertex.count.min(MAX_RESERVED_VERTICES)))
        .collect();

    let mut line = String::new();
    let mut vertex_count = 0;
    while vertex_count < vertex.count {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }

        let values: Vec<&str> = line.split_whitespace().collect();
        if values.is_empty() {
            continue;
        }
        if values.len() < columns.len() {
            return Err(LoaderError::ParseError(format!(
                "Vertex {} has {} values, expected {}",
                vertex_count,
                values.len(),
                columns.len()
            )));
        }

        for ((column, raw), prop) in columns.iter_mut().zip(&values).zip(&vertex.properties) {
            let value: f64 = raw
                .parse()
                .map_err(|_| LoaderError::ParseError(format!("Invalid {} value: {}", prop.name, raw)))?;
            column.push_f64(value);
        }

        vertex_count += 1;
    }

    if vertex_count < vertex.count {
        return Err(LoaderError::InvalidPly(format!(
            "Expected {} vertices, found {}",
            vertex.count, vertex_count
        )));
    }

    Ok(columns)
}

fn read_binary_value<B: ByteOrder, R: Read>(reader: &mut R, ty: ScalarType) -> io::Result<f64> {
    let value = match ty {
        ScalarType::Bool | ScalarType::U8 => reader.read_u8()? as f64,
        ScalarType::I8 => reader.read_i8()? as f64,
        ScalarType::U16 => reader.read_u16::<B>()? as f64,
        ScalarType::I16 => reader.read_i16::<B>()? as f64,
        ScalarType::U32 => reader.read_u32::<B>()? as f64,
        ScalarType::I32 => reader.read_i32::<B>()? as f64,
        ScalarType::F32 => reader.read_f32::<B>()? as f64,
        ScalarType::F64 => reader.read_f64::<B>()?,
    };
    Ok(value)
}

fn read_binary_vertices<B: ByteOrder, R: Read>(
    reader: &mut R,
    vertex: &PlyElement,
) -> Result<Vec<AttributeValues>> {
    let types: Vec<ScalarType> = vertex.properties.iter().filter_map(|p| p.ty).collect();
    let mut columns: Vec<AttributeValues> = types
        .iter()
        .map(|&ty| AttributeValues::with_capacity(ty, vertex.count.min(MAX_RESERVED_VERTICES)))
        .collect();

    for i in 0..vertex.count {
        for (column, &ty) in columns.iter_mut().zip(&types) {
            let value = read_binary_value::<B, _>(reader, ty).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    LoaderError::InvalidPly(format!(
                        "Expected {} vertices, found {}",
                        vertex.count, i
                    ))
                } else {
                    LoaderError::Io(e)
                }
            })?;
            column.push_f64(value);
        }
    }

    Ok(columns)
}

const PLY_COLOR_NAMES: [[&str; 3]; 2] = [["red", "green", "blue"], ["r", "g", "b"]];
const PLY_NORMAL_NAMES: [&str; 3] = ["nx", "ny", "nz"];

/// Maps a color column to 8-bit values; 16-bit colors are scaled down.
fn color_component(column: &AttributeValues, i: usize) -> u8 {
    let value = column.get_f64(i).unwrap_or(0.0);
    let value = if column.scalar_type() == ScalarType::U16 {
        value / 256.0
    } else {
        value
    };
    value.clamp(0.0, 255.0) as u8
}

fn assemble_cloud(
    vertex: &PlyElement,
    columns: Vec<AttributeValues>,
    channels: Option<&[String]>,
) -> Result<PointCloudData> {
    let mut by_name: HashMap<String, AttributeValues> = vertex
        .properties
        .iter()
        .map(|p| p.name.clone())
        .zip(columns)
        .collect();

    let mut take = |name: &str| {
        by_name
            .remove(name)
            .ok_or_else(|| LoaderError::MissingColumns(name.to_string()))
    };
    let xs = take("x")?;
    let ys = take("y")?;
    let zs = take("z")?;

    let n = vertex.count;
    let xyz: Vec<[f64; 3]> = (0..n)
        .map(|i| {
            [
                xs.get_f64(i).unwrap_or(0.0),
                ys.get_f64(i).unwrap_or(0.0),
                zs.get_f64(i).unwrap_or(0.0),
            ]
        })
        .collect();

    let mut color = None;
    for names in PLY_COLOR_NAMES {
        if names.iter().all(|name| by_name.contains_key(*name)) {
            let [r, g, b] = names.map(|name| by_name.remove(name).unwrap_or_else(|| AttributeValues::U8(Vec::new())));
            color = Some(
                (0..n)
                    .map(|i| [color_component(&r, i), color_component(&g, i), color_component(&b, i)])
                    .collect(),
            );
            break;
        }
    }

    let mut normals = None;
    if PLY_NORMAL_NAMES.iter().all(|name| by_name.contains_key(*name)) {
        let [nx, ny, nz] =
            PLY_NORMAL_NAMES.map(|name| by_name.remove(name).unwrap_or_else(|| AttributeValues::F64(Vec::new())));
        normals = Some(
            (0..n)
                .map(|i| {
                    [
                        nx.get_f64(i).unwrap_or(0.0),
                        ny.get_f64(i).unwrap_or(0.0),
                        nz.get_f64(i).unwrap_or(0.0),
                    ]
                })
                .collect(),
        );
    }

    // Keep header order for the remaining channels
    let mut attributes = Vec::new();
    for prop in &vertex.properties {
        if !channel_wanted(&prop.name, channels) {
            continue;
        }
        if let Some(values) = by_name.remove(&prop.name) {
            attributes.push((prop.name.to_lowercase(), values));
        }
    }

    Ok(PointCloudData::new(xyz, color, normals, attributes)?)
}

// ---------------------------------------------------------------------------
// LAS / LAZ
// ---------------------------------------------------------------------------

/// Which point formats carry a given LAS dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LasAvailability {
    Always,
    GpsTime,
    Extended,
}

/// A per-point LAS dimension exposed as an attribute channel.
struct LasDimension {
    name: &'static str,
    ty: ScalarType,
    availability: LasAvailability,
    extract: fn(&las::Point) -> f64,
}

const LAS_DIMENSIONS: &[LasDimension] = &[
    LasDimension {
        name: "intensity",
        ty: ScalarType::U16,
        availability: LasAvailability::Always,
        extract: |p| p.intensity as f64,
    },
    LasDimension {
        name: "return_number",
        ty: ScalarType::U8,
        availability: LasAvailability::Always,
        extract: |p| p.return_number as f64,
    },
    LasDimension {
        name: "number_of_returns",
        ty: ScalarType::U8,
        availability: LasAvailability::Always,
        extract: |p| p.number_of_returns as f64,
    },
    LasDimension {
        name: "scan_direction_flag",
        ty: ScalarType::Bool,
        availability: LasAvailability::Always,
        extract: |p| {
            if matches!(p.scan_direction, las::point::ScanDirection::LeftToRight) {
                1.0
            } else {
                0.0
            }
        },
    },
    LasDimension {
        name: "edge_of_flight_line",
        ty: ScalarType::Bool,
        availability: LasAvailability::Always,
        extract: |p| p.is_edge_of_flight_line as u8 as f64,
    },
    LasDimension {
        name: "classification",
        ty: ScalarType::U8,
        availability: LasAvailability::Always,
        extract: |p| u8::from(p.classification) as f64,
    },
    LasDimension {
        name: "synthetic",
        ty: ScalarType::Bool,
        availability: LasAvailability::Always,
        extract: |p| p.is_synthetic as u8 as f64,
    },
    LasDimension {
        name: "key_point",
        ty: ScalarType::Bool,
        availability: LasAvailability::Always,
        extract: |p| p.is_key_point as u8 as f64,
    },
    LasDimension {
        name: "withheld",
        ty: ScalarType::Bool,
        availability: LasAvailability::Always,
        extract: |p| p.is_withheld as u8 as f64,
    },
    LasDimension {
        name: "overlap",
        ty: ScalarType::Bool,
        availability: LasAvailability::Extended,
        extract: |p| p.is_overlap as u8 as f64,
    },
    LasDimension {
        name: "scanner_channel",
        ty: ScalarType::U8,
        availability: LasAvailability::Extended,
        extract: |p| p.scanner_channel as f64,
    },
    LasDimension {
        name: "scan_angle",
        ty: ScalarType::F32,
        availability: LasAvailability::Always,
        extract: |p| p.scan_angle as f64,
    },
    LasDimension {
        name: "user_data",
        ty: ScalarType::U8,
        availability: LasAvailability::Always,
        extract: |p| p.user_data as f64,
    },
    LasDimension {
        name: "point_source_id",
        ty: ScalarType::U16,
        availability: LasAvailability::Always,
        extract: |p| p.point_source_id as f64,
    },
    LasDimension {
        name: "gps_time",
        ty: ScalarType::F64,
        availability: LasAvailability::GpsTime,
        extract: |p| p.gps_time.unwrap_or(0.0),
    },
];

/// Load a point cloud from a LAS or LAZ file.
///
/// Coordinates are returned with the header's scale and offset applied.
/// 16-bit colors are reduced to 8 bits.
pub fn load_las<P: AsRef<Path>>(path: P, channels: Option<&[String]>) -> Result<PointCloudData> {
    let path = path.as_ref();
    let mut reader = las::Reader::from_path(path)?;

    let (capacity, format) = {
        let header = reader.header();
        (header.number_of_points() as usize, header.point_format().clone())
    };

    let dimensions: Vec<&LasDimension> = LAS_DIMENSIONS
        .iter()
        .filter(|d| match d.availability {
            LasAvailability::Always => true,
            LasAvailability::GpsTime => format.has_gps_time,
            LasAvailability::Extended => format.is_extended,
        })
        .filter(|d| channel_wanted(d.name, channels))
        .collect();

    let mut xyz = Vec::with_capacity(capacity);
    let mut colors = if format.has_color {
        Vec::with_capacity(capacity)
    } else {
        Vec::new()
    };
    let mut columns: Vec<AttributeValues> = dimensions
        .iter()
        .map(|d| AttributeValues::with_capacity(d.ty, capacity))
        .collect();

    for point in reader.points() {
        let point = point?;
        xyz.push([point.x, point.y, point.z]);

        if format.has_color {
            let rgb = point
                .color
                .map(|c| [(c.red / 256) as u8, (c.green / 256) as u8, (c.blue / 256) as u8])
                .unwrap_or([0, 0, 0]);
            colors.push(rgb);
        }

        for (column, dim) in columns.iter_mut().zip(&dimensions) {
            column.push_f64((dim.extract)(&point));
        }
    }

    let attributes = dimensions
        .iter()
        .map(|d| d.name.to_string())
        .zip(columns)
        .collect();
    let color = format.has_color.then_some(colors);

    debug!("{} points read from '{}'", xyz.len(), path.display());

    Ok(PointCloudData::new(xyz, color, None, attributes)?)
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Returns true if the file extension is in `extensions` (case-insensitive,
/// with or without a leading dot).
pub fn has_accepted_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|accepted| accepted.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

/// Find point cloud files in a directory.
///
/// # Arguments
///
/// * `directory` - Directory to search
/// * `extensions` - Accepted file extensions, e.g. `[".las", ".ply"]`
/// * `greedy` - Also search subdirectories, recursively
///
/// # Returns
///
/// Sorted paths of every matching file.
pub fn find_point_cloud_files(directory: &Path, extensions: &[String], greedy: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut subdirs = Vec::new();

    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if has_accepted_extension(&path, extensions) {
            files.push(path);
        }
    }

    if greedy {
        for subdir in subdirs {
            files.extend(find_point_cloud_files(&subdir, extensions, greedy)?);
        }
    }

    files.sort();
    Ok(files)
}
