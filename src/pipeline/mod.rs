//! Epoch preparation pipeline.
//!
//! Stages run strictly in order and each one aborts the run on failure:
//!
//! ```text
//! LOAD → MERGE → PERSIST_MERGED → BOX_CROP → PERSIST_BOXCROP
//!      → EXTRACT_BOUNDARY (×2) → INTERSECT_BOUNDARY → INVOKE_EXTERNAL (×3)
//! ```
//!
//! Artifacts written by completed stages are left on disk when a later stage
//! fails.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use geo::{Area, Polygon};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::RunConfig;
use crate::core::cloud::{CloudError, PointCloudData};
use crate::core::loaders::{find_point_cloud_files, load_point_cloud, LoaderError};
use crate::core::writers::{write_ply, write_polygon_csv, PlyFormat};
use crate::processors::boundary::extract_boundary;
use crate::processors::cropping::{cut_to_common_box, BoundingBox};
use crate::processors::external::{self, CloudCompare, Invocation};
use crate::processors::filtering::AttributeFilter;
use crate::processors::footprint::{derive_offset, intersect, CoordinateOffset};
use crate::processors::merging::merge;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Load,
    Merge,
    PersistMerged,
    BoxCrop,
    PersistBoxCrop,
    ExtractBoundary,
    IntersectBoundary,
    InvokeExternal,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Load,
        Stage::Merge,
        Stage::PersistMerged,
        Stage::BoxCrop,
        Stage::PersistBoxCrop,
        Stage::ExtractBoundary,
        Stage::IntersectBoundary,
        Stage::InvokeExternal,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Load => "LOAD",
            Stage::Merge => "MERGE",
            Stage::PersistMerged => "PERSIST_MERGED",
            Stage::BoxCrop => "BOX_CROP",
            Stage::PersistBoxCrop => "PERSIST_BOXCROP",
            Stage::ExtractBoundary => "EXTRACT_BOUNDARY",
            Stage::IntersectBoundary => "INTERSECT_BOUNDARY",
            Stage::InvokeExternal => "INVOKE_EXTERNAL",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn stage_failed(stage: Stage) -> String {
    format!("stage {} failed", stage)
}

/// Deterministic output locations of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPaths {
    /// Merged clouds (`01a`, `01b`)
    pub merged: [PathBuf; 2],
    /// Box-cropped clouds (`02a`, `02b`)
    pub boxcut: [PathBuf; 2],
    /// Footprint-cropped clouds written by the external tool (`03a`, `03b`)
    pub bordercut: [PathBuf; 2],
    pub footprint_csv: PathBuf,
    pub crop_logs: [PathBuf; 2],
    pub m3c2_log: PathBuf,
}

impl ArtifactPaths {
    pub fn new(dir: &Path, epoch1_name: &str, epoch2_name: &str) -> Self {
        let file = |name: String| dir.join(name);
        Self {
            merged: [
                file(format!("01a_{}_merged.ply", epoch1_name)),
                file(format!("01b_{}_merged.ply", epoch2_name)),
            ],
            boxcut: [
                file(format!("02a_{}_boxcut.ply", epoch1_name)),
                file(format!("02b_{}_boxcut.ply", epoch2_name)),
            ],
            bordercut: [
                file(format!("03a_{}_bordercut.ply", epoch1_name)),
                file(format!("03b_{}_bordercut.ply", epoch2_name)),
            ],
            footprint_csv: file("footprint_common.csv".to_string()),
            crop_logs: [file("boxcut_e1.log".to_string()), file("boxcut_e2.log".to_string())],
            m3c2_log: file("log_m3c2.log".to_string()),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(
            &config.paths.intermediate_results,
            &config.project_meta.epoch1_name,
            &config.project_meta.epoch2_name,
        )
    }
}

/// How epoch sources are found and loaded.
#[derive(Debug, Default)]
pub struct LoadOptions {
    /// Attribute channels to load; `None` loads all available channels
    pub channels: Option<Vec<String>>,
    /// Filters applied to every loaded file before merging
    pub filters: Vec<AttributeFilter>,
    /// Accepted extensions when the source is a directory
    pub extensions: Vec<String>,
    /// Search directories recursively
    pub greedy: bool,
}

impl LoadOptions {
    pub fn from_config(config: &RunConfig) -> Self {
        let filters = if config.app_settings.filter_ground_points {
            vec![AttributeFilter::ground_points()]
        } else {
            Vec::new()
        };

        Self {
            channels: Some(config.scalar_fields()),
            filters,
            extensions: config.app_settings.greedy_file_types.clone(),
            greedy: config.app_settings.greedy_directory_search,
        }
    }
}

fn load_filtered(path: &Path, options: &LoadOptions) -> Result<PointCloudData, LoaderError> {
    let mut cloud = load_point_cloud(path, options.channels.as_deref())?;
    for f in &options.filters {
        cloud = f.apply(cloud)?;
    }
    info!("{}: {} points", path.display(), cloud.len());
    Ok(cloud)
}

/// Load every source of an epoch, filtered, without merging.
///
/// A file yields one cloud; a directory yields one cloud per matching file,
/// in sorted path order. Files are loaded one after another.
pub fn load_sources(path: &Path, options: &LoadOptions) -> Result<Vec<PointCloudData>, LoaderError> {
    if path.is_dir() {
        let files = find_point_cloud_files(path, &options.extensions, options.greedy)?;
        debug!("{} point cloud files in {}", files.len(), path.display());
        files
            .iter()
            .map(|file| load_filtered(file, options))
            .collect()
    } else if path.is_file() {
        Ok(vec![load_filtered(path, options)?])
    } else {
        Err(LoaderError::NotFound(path.to_path_buf()))
    }
}

/// Combine the sources of one epoch. Directory sources are merged; a single
/// file is passed through without a provenance channel.
fn combine_sources(path: &Path, mut clouds: Vec<PointCloudData>) -> Result<PointCloudData, CloudError> {
    if path.is_dir() {
        return merge(clouds);
    }
    clouds.pop().ok_or(CloudError::EmptyInput)
}

/// Load one epoch from a file or a directory of files.
///
/// # Errors
///
/// Fails with [`LoaderError::NotFound`] for a missing path and with
/// [`CloudError::EmptyInput`] for a directory without matching files.
pub fn load_epoch(path: &Path, options: &LoadOptions) -> Result<PointCloudData, LoaderError> {
    let clouds = load_sources(path, options)?;
    Ok(combine_sources(path, clouds)?)
}

/// Point counts per epoch after each reducing stage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PointCounts {
    pub merged: [usize; 2],
    pub box_cropped: [usize; 2],
}

/// Everything the external stage needs, produced by [`prepare_epochs`].
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub artifacts: ArtifactPaths,
    pub common_box: BoundingBox,
    pub footprints: [Polygon<f64>; 2],
    pub common_footprint: Polygon<f64>,
    pub offset: CoordinateOffset,
    pub counts: PointCounts,
}

/// Run every stage up to and including INTERSECT_BOUNDARY.
///
/// `on_stage` is called as each stage starts.
pub fn prepare_epochs<R, F>(config: &RunConfig, rng: &mut R, mut on_stage: F) -> Result<PreparedRun>
where
    R: Rng + ?Sized,
    F: FnMut(Stage),
{
    let artifacts = ArtifactPaths::from_config(config);
    let options = LoadOptions::from_config(config);
    let sources = [&config.paths.pcd_e1, &config.paths.pcd_e2];

    on_stage(Stage::Load);
    let mut loaded = Vec::with_capacity(2);
    for source in sources {
        info!("Loading {}", source.display());
        let clouds = load_sources(source, &options)
            .with_context(|| format!("failed to load '{}'", source.display()))
            .with_context(|| stage_failed(Stage::Load))?;
        loaded.push(clouds);
    }

    on_stage(Stage::Merge);
    let mut epochs = Vec::with_capacity(2);
    for (source, clouds) in sources.iter().zip(loaded) {
        let cloud = combine_sources(source, clouds)
            .with_context(|| format!("failed to merge '{}'", source.display()))
            .with_context(|| stage_failed(Stage::Merge))?;
        info!("Epoch {}: {}", source.display(), cloud);
        epochs.push(cloud);
    }
    let merged_counts = [epochs[0].len(), epochs[1].len()];

    on_stage(Stage::PersistMerged);
    if config.app_settings.save_intermediate_results {
        for (cloud, path) in epochs.iter().zip(&artifacts.merged) {
            write_ply(path, cloud, PlyFormat::BinaryLittleEndian)
                .with_context(|| stage_failed(Stage::PersistMerged))?;
            info!("Wrote {}", path.display());
        }
    } else {
        debug!("Merged clouds not saved");
    }

    on_stage(Stage::BoxCrop);
    let (epochs, common_box) = cut_to_common_box(epochs, config.cropping.margin)
        .with_context(|| stage_failed(Stage::BoxCrop))?;
    let box_counts = [epochs[0].len(), epochs[1].len()];
    info!(
        "Box crop: {} -> {} and {} -> {} points",
        merged_counts[0], box_counts[0], merged_counts[1], box_counts[1]
    );
    if box_counts.contains(&0) {
        return Err(anyhow::anyhow!("no common bounding box region"))
            .with_context(|| stage_failed(Stage::BoxCrop));
    }

    on_stage(Stage::PersistBoxCrop);
    for (cloud, path) in epochs.iter().zip(&artifacts.boxcut) {
        write_ply(path, cloud, PlyFormat::BinaryLittleEndian)
            .with_context(|| stage_failed(Stage::PersistBoxCrop))?;
        info!("Wrote {}", path.display());
    }

    on_stage(Stage::ExtractBoundary);
    let mut footprints = Vec::with_capacity(2);
    for (cloud, name) in epochs
        .iter()
        .zip([&config.project_meta.epoch1_name, &config.project_meta.epoch2_name])
    {
        let footprint = extract_boundary(cloud, config.boundary.alpha, config.boundary.sample_size, rng)
            .with_context(|| format!("footprint of epoch '{}'", name))
            .with_context(|| stage_failed(Stage::ExtractBoundary))?;
        info!(
            "Footprint of '{}': {} vertices, area {:.3}",
            name,
            footprint.exterior().0.len(),
            footprint.unsigned_area()
        );
        footprints.push(footprint);
    }
    let footprints: [Polygon<f64>; 2] = [footprints.remove(0), footprints.remove(0)];

    on_stage(Stage::IntersectBoundary);
    let common_footprint =
        intersect(&footprints[0], &footprints[1]).with_context(|| stage_failed(Stage::IntersectBoundary))?;
    let offset = derive_offset(&common_footprint).with_context(|| stage_failed(Stage::IntersectBoundary))?;
    write_polygon_csv(&artifacts.footprint_csv, &common_footprint)
        .with_context(|| stage_failed(Stage::IntersectBoundary))?;
    info!(
        "Common footprint: area {:.3}, offset {}",
        common_footprint.unsigned_area(),
        offset
    );

    Ok(PreparedRun {
        artifacts,
        common_box,
        footprints,
        common_footprint,
        offset,
        counts: PointCounts {
            merged: merged_counts,
            box_cropped: box_counts,
        },
    })
}

/// The three external calls, in execution order: crop epoch 1, crop epoch 2,
/// distance computation.
pub fn build_invocations(config: &RunConfig, prepared: &PreparedRun) -> Vec<Invocation> {
    let cc = CloudCompare::new(&config.paths.cc_exe);
    let a = &prepared.artifacts;

    let crop = |i: usize| {
        cc.crop2d(
            &format!("footprint crop {}", i + 1),
            &a.boxcut[i],
            &a.bordercut[i],
            &a.crop_logs[i],
            &prepared.common_footprint,
            &prepared.offset,
        )
    };

    vec![
        crop(0),
        crop(1),
        cc.m3c2(
            &a.bordercut[0],
            &a.bordercut[1],
            &a.m3c2_log,
            &config.paths.m3c2_settings,
            &config.paths.hsv_settings,
            &prepared.offset,
        ),
    ]
}

/// Options of a pipeline run that are not part of the configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Log the external command lines instead of executing them
    pub dry_run: bool,
}

/// Outcome of a complete run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub prepared: PreparedRun,
    pub invocations: Vec<Invocation>,
    pub executed: bool,
}

/// Creates the subsampling random source from the configured seed.
pub fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// Run the whole pipeline.
///
/// `on_stage` is called as each stage starts.
pub fn run_pipeline<F>(config: &RunConfig, options: &RunOptions, mut on_stage: F) -> Result<RunSummary>
where
    F: FnMut(Stage),
{
    let mut rng = make_rng(config.boundary.seed);
    let prepared = prepare_epochs(config, &mut rng, &mut on_stage)?;
    let invocations = build_invocations(config, &prepared);

    on_stage(Stage::InvokeExternal);
    if options.dry_run {
        for invocation in &invocations {
            info!("[dry run] {}: {}", invocation.label, invocation);
        }
    } else {
        for invocation in &invocations {
            info!("Running {}", invocation.label);
            external::run(invocation)
                .with_context(|| format!("{} ({})", stage_failed(Stage::InvokeExternal), invocation.label))?;
        }
    }

    Ok(RunSummary {
        prepared,
        invocations,
        executed: !options.dry_run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cloud::AttributeValues;
    use crate::core::loaders::load_ply;
    use crate::processors::merging::PROVENANCE_CHANNEL;
    use std::fs;
    use tempfile::tempdir;

    /// Regular grid with a classification channel (every third point non-ground).
    fn grid_cloud(x0: f64, y0: f64, size: usize, z: f64) -> PointCloudData {
        let mut xyz = Vec::new();
        for i in 0..size {
            for j in 0..size {
                xyz.push([x0 + i as f64, y0 + j as f64, z + 0.01 * (i + j) as f64]);
            }
        }
        let n = xyz.len();
        let classes = (0..n).map(|k| if k % 3 == 0 { 5 } else { 2 }).collect();
        let intensity = (0..n).map(|k| k as u16).collect();
        PointCloudData::from_xyz(xyz)
            .with_attribute("classification", AttributeValues::U8(classes))
            .unwrap()
            .with_attribute("intensity", AttributeValues::U16(intensity))
            .unwrap()
    }

    fn test_config(root: &Path, e1: PathBuf, e2: PathBuf) -> RunConfig {
        let mut config = RunConfig::default();
        config.paths.pcd_e1 = e1;
        config.paths.pcd_e2 = e2;
        config.paths.intermediate_results = root.join("out");
        config.paths.cc_exe = PathBuf::from("/opt/cc/CloudCompare");
        config.boundary.alpha = 0.0;
        config.boundary.seed = Some(1);
        config
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::BoxCrop.to_string(), "BOX_CROP");
        assert_eq!(Stage::ALL.len(), 8);
    }

    #[test]
    fn test_artifact_paths() {
        let paths = ArtifactPaths::new(Path::new("/data/out"), "2020", "2021");

        assert_eq!(paths.merged[0], PathBuf::from("/data/out/01a_2020_merged.ply"));
        assert_eq!(paths.boxcut[1], PathBuf::from("/data/out/02b_2021_boxcut.ply"));
        assert_eq!(paths.bordercut[0], PathBuf::from("/data/out/03a_2020_bordercut.ply"));
        assert_eq!(paths.crop_logs[1], PathBuf::from("/data/out/boxcut_e2.log"));
        assert_eq!(paths.m3c2_log, PathBuf::from("/data/out/log_m3c2.log"));
    }

    #[test]
    fn test_load_epoch_single_file_has_no_provenance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan.ply");
        write_ply(&path, &grid_cloud(0.0, 0.0, 4, 0.0), PlyFormat::Ascii).unwrap();

        let cloud = load_epoch(&path, &LoadOptions::default()).unwrap();

        assert_eq!(cloud.len(), 16);
        assert!(cloud.attribute(PROVENANCE_CHANNEL).is_none());
    }

    #[test]
    fn test_load_epoch_directory_merges_filtered_files() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir_all(&nested).unwrap();
        write_ply(&dir.path().join("a.ply"), &grid_cloud(0.0, 0.0, 3, 0.0), PlyFormat::BinaryLittleEndian).unwrap();
        write_ply(&nested.join("b.ply"), &grid_cloud(10.0, 0.0, 3, 0.0), PlyFormat::BinaryLittleEndian).unwrap();

        let mut options = LoadOptions {
            channels: Some(vec!["classification".to_string()]),
            filters: vec![AttributeFilter::ground_points()],
            extensions: vec![".ply".to_string()],
            greedy: false,
        };

        let flat = load_epoch(dir.path(), &options).unwrap();
        assert_eq!(flat.len(), 6);
        assert!(flat.attribute("intensity").is_none());

        options.greedy = true;
        let greedy = load_epoch(dir.path(), &options).unwrap();
        assert_eq!(greedy.len(), 12);
        assert_eq!(
            greedy.attribute(PROVENANCE_CHANNEL),
            Some(&AttributeValues::U32([vec![1; 6], vec![2; 6]].concat()))
        );
    }

    #[test]
    fn test_load_epoch_errors() {
        let dir = tempdir().unwrap();
        let options = LoadOptions {
            extensions: vec![".las".to_string()],
            ..LoadOptions::default()
        };

        let missing = load_epoch(&dir.path().join("nope"), &options);
        assert!(matches!(missing, Err(LoaderError::NotFound(_))));

        let empty = load_epoch(dir.path(), &options);
        assert!(matches!(empty, Err(LoaderError::Cloud(CloudError::EmptyInput))));
    }

    #[test]
    fn test_prepare_epochs_end_to_end() {
        let dir = tempdir().unwrap();
        let e1 = dir.path().join("e1.ply");
        let e2 = dir.path().join("e2.ply");
        write_ply(&e1, &grid_cloud(100.0, 200.0, 21, 0.0), PlyFormat::BinaryLittleEndian).unwrap();
        write_ply(&e2, &grid_cloud(110.5, 206.5, 21, 0.0), PlyFormat::BinaryLittleEndian).unwrap();

        let config = test_config(dir.path(), e1, e2);
        let mut rng = StdRng::seed_from_u64(1);
        let mut stages = Vec::new();

        let prepared = prepare_epochs(&config, &mut rng, |s| stages.push(s)).unwrap();

        assert_eq!(stages, Stage::ALL[..7].to_vec());
        assert_eq!(prepared.counts.merged, [441, 441]);
        // Common box is x in [110.5, 120], y in [206.5, 220]: 10 x 14 grid points each
        assert_eq!(prepared.counts.box_cropped, [140, 140]);
        // Footprints [111, 120] x [207, 220] and [110.5, 119.5] x [206.5, 219.5]
        assert!((prepared.common_footprint.unsigned_area() - 8.5 * 12.5).abs() < 1e-6);
        assert_eq!(prepared.offset, CoordinateOffset { x: -115.0, y: -213.0 });

        for path in prepared.artifacts.merged.iter().chain(&prepared.artifacts.boxcut) {
            assert!(path.exists(), "{} missing", path.display());
        }
        assert!(prepared.artifacts.footprint_csv.exists());

        let boxcut = load_ply(&prepared.artifacts.boxcut[0], None).unwrap();
        assert_eq!(boxcut.len(), 140);
        assert!(boxcut.attribute("intensity").is_some());
    }

    #[test]
    fn test_prepare_epochs_skips_merged_artifacts() {
        let dir = tempdir().unwrap();
        let e1 = dir.path().join("e1.ply");
        let e2 = dir.path().join("e2.ply");
        write_ply(&e1, &grid_cloud(0.0, 0.0, 6, 0.0), PlyFormat::Ascii).unwrap();
        write_ply(&e2, &grid_cloud(0.5, 0.5, 6, 0.0), PlyFormat::Ascii).unwrap();

        let mut config = test_config(dir.path(), e1, e2);
        config.app_settings.save_intermediate_results = false;

        let prepared = prepare_epochs(&config, &mut StdRng::seed_from_u64(0), |_| {}).unwrap();

        assert!(!prepared.artifacts.merged[0].exists());
        assert!(prepared.artifacts.boxcut[0].exists());
    }

    #[test]
    fn test_prepare_epochs_no_common_box() {
        let dir = tempdir().unwrap();
        let e1 = dir.path().join("e1.ply");
        let e2 = dir.path().join("e2.ply");
        write_ply(&e1, &grid_cloud(0.0, 0.0, 5, 0.0), PlyFormat::Ascii).unwrap();
        write_ply(&e2, &grid_cloud(50.0, 50.0, 5, 0.0), PlyFormat::Ascii).unwrap();

        let config = test_config(dir.path(), e1, e2);
        let err = prepare_epochs(&config, &mut StdRng::seed_from_u64(0), |_| {}).unwrap_err();

        let message = format!("{:#}", err);
        assert!(message.contains("stage BOX_CROP failed"), "{}", message);
        assert!(message.contains("no common bounding box region"), "{}", message);
    }

    #[test]
    fn test_build_invocations_and_dry_run() {
        let dir = tempdir().unwrap();
        let e1 = dir.path().join("e1.ply");
        let e2 = dir.path().join("e2.ply");
        write_ply(&e1, &grid_cloud(0.0, 0.0, 11, 0.0), PlyFormat::BinaryLittleEndian).unwrap();
        write_ply(&e2, &grid_cloud(2.5, 3.5, 11, 0.0), PlyFormat::BinaryLittleEndian).unwrap();

        let config = test_config(dir.path(), e1, e2);
        let mut stages = Vec::new();
        let summary = run_pipeline(&config, &RunOptions { dry_run: true }, |s| stages.push(s)).unwrap();

        assert!(!summary.executed);
        assert_eq!(stages, Stage::ALL.to_vec());
        assert_eq!(summary.invocations.len(), 3);

        let artifacts = &summary.prepared.artifacts;
        let crop1 = summary.invocations[0].args_lossy();
        assert!(crop1.contains(&artifacts.boxcut[0].display().to_string()));
        assert!(crop1.contains(&artifacts.bordercut[0].display().to_string()));
        assert!(crop1.contains(&"-CROP2D".to_string()));

        let m3c2 = summary.invocations[2].args_lossy();
        assert!(m3c2.contains(&artifacts.bordercut[1].display().to_string()));
        assert!(m3c2.contains(&config.paths.m3c2_settings.display().to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_pipeline_external_failure() {
        let dir = tempdir().unwrap();
        let e1 = dir.path().join("e1.ply");
        let e2 = dir.path().join("e2.ply");
        write_ply(&e1, &grid_cloud(0.0, 0.0, 6, 0.0), PlyFormat::Ascii).unwrap();
        write_ply(&e2, &grid_cloud(0.5, 0.5, 6, 0.0), PlyFormat::Ascii).unwrap();

        let mut config = test_config(dir.path(), e1, e2);
        config.paths.cc_exe = PathBuf::from("false");

        let err = run_pipeline(&config, &RunOptions::default(), |_| {}).unwrap_err();
        assert!(format!("{:#}", err).contains("stage INVOKE_EXTERNAL failed"));
    }
}
