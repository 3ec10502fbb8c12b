//! Epoch preparation for point cloud change detection.
//!
//! Two surveys ("epochs") of the same scene are reduced to their shared
//! region before an external M3C2 distance computation runs on them:
//! - Loading PLY, LAS and LAZ files, optionally filtered to ground points
//! - Merging the files of an epoch with a per-point provenance channel
//! - Cropping both epochs to their common bounding box
//! - Alpha-shape footprints and their intersection
//! - Building and running the CloudCompare command lines
//!
//! # Example
//!
//! ```no_run
//! use despan::pipeline::{run_pipeline, RunOptions};
//! use despan::RunConfig;
//!
//! let config = RunConfig::from_yaml("despan.yaml")?.resolve()?;
//! config.validate()?;
//! let summary = run_pipeline(&config, &RunOptions { dry_run: true }, |_| {})?;
//! println!("offset {}", summary.prepared.offset);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod pipeline;
pub mod processors;

pub use config::{ConfigError, RunConfig};
pub use core::cloud::{AttributeValues, PointCloudData};
pub use pipeline::{load_epoch, prepare_epochs, run_pipeline, Stage};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
