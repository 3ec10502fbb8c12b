//! Core data types and I/O operations.

pub mod cloud;
pub mod loaders;
pub mod transforms;
pub mod writers;

pub use cloud::{AttributeValues, CloudError, PointCloudData, ScalarType};
pub use loaders::{find_point_cloud_files, load_point_cloud, LoaderError};
pub use writers::{write_ply, write_polygon_csv, PlyFormat, WriteError};
