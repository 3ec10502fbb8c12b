//! Configuration types for an epoch-preparation run.
//!
//! A [`RunConfig`] is read from YAML once, overridden from the command line,
//! resolved and validated, then passed by reference to every stage.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or checking a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Naming of the project and its two epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMeta {
    #[serde(default = "default_project_name")]
    pub name: String,

    /// Label of the first epoch, used in artifact file names
    #[serde(default = "default_epoch1_name")]
    pub epoch1_name: String,

    /// Label of the second epoch, used in artifact file names
    #[serde(default = "default_epoch2_name")]
    pub epoch2_name: String,
}

fn default_project_name() -> String {
    "despan".to_string()
}

fn default_epoch1_name() -> String {
    "e1".to_string()
}

fn default_epoch2_name() -> String {
    "e2".to_string()
}

impl Default for ProjectMeta {
    fn default() -> Self {
        Self {
            name: default_project_name(),
            epoch1_name: default_epoch1_name(),
            epoch2_name: default_epoch2_name(),
        }
    }
}

/// What to keep from the inputs and how to find them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Load the intensity channel
    #[serde(default = "default_true")]
    pub retain_intensities: bool,

    /// Load the classification channel and keep ground points only
    #[serde(default)]
    pub filter_ground_points: bool,

    /// Write the merged clouds before cropping
    #[serde(default = "default_true")]
    pub save_intermediate_results: bool,

    /// Search epoch directories recursively
    #[serde(default)]
    pub greedy_directory_search: bool,

    /// File extensions loaded from epoch directories
    #[serde(default = "default_file_types")]
    pub greedy_file_types: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_file_types() -> Vec<String> {
    vec![".las".to_string(), ".laz".to_string(), ".ply".to_string()]
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            retain_intensities: true,
            filter_ground_points: false,
            save_intermediate_results: true,
            greedy_directory_search: false,
            greedy_file_types: default_file_types(),
        }
    }
}

/// Input, output and tool locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// First epoch: a point cloud file or a directory of them
    #[serde(default)]
    pub pcd_e1: PathBuf,

    /// Second epoch: a point cloud file or a directory of them
    #[serde(default)]
    pub pcd_e2: PathBuf,

    #[serde(default = "default_intermediate_results")]
    pub intermediate_results: PathBuf,

    /// CloudCompare executable
    #[serde(default = "default_cc_exe", alias = "CC_exe")]
    pub cc_exe: PathBuf,

    /// M3C2 parameter file passed to CloudCompare
    #[serde(default = "default_m3c2_settings")]
    pub m3c2_settings: PathBuf,

    /// Color scale file for the distance scalar field
    #[serde(default = "default_hsv_settings")]
    pub hsv_settings: PathBuf,
}

fn default_intermediate_results() -> PathBuf {
    PathBuf::from("intermediate_results")
}

fn default_cc_exe() -> PathBuf {
    PathBuf::from("CloudCompare")
}

fn default_m3c2_settings() -> PathBuf {
    PathBuf::from("m3c2_params.txt")
}

fn default_hsv_settings() -> PathBuf {
    PathBuf::from("hsv_color_scale.xml")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            pcd_e1: PathBuf::new(),
            pcd_e2: PathBuf::new(),
            intermediate_results: default_intermediate_results(),
            cc_exe: default_cc_exe(),
            m3c2_settings: default_m3c2_settings(),
            hsv_settings: default_hsv_settings(),
        }
    }
}

/// Footprint extraction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryConfig {
    /// Alpha-shape parameter on normalized coordinates (0 = convex hull)
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Maximum number of points triangulated
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Seed for the subsampling; random when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_alpha() -> f64 {
    20.0
}

fn default_sample_size() -> usize {
    10_000
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            sample_size: default_sample_size(),
            seed: None,
        }
    }
}

/// Common-box cropping parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CroppingConfig {
    /// Expansion of the common box, as a fraction of its span per axis
    #[serde(default)]
    pub margin: f64,
}

/// Complete run configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub project_meta: ProjectMeta,

    #[serde(default)]
    pub app_settings: AppSettings,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub boundary: BoundaryConfig,

    #[serde(default)]
    pub cropping: CroppingConfig,
}

/// Makes a relative path absolute against the working directory.
fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() || path.as_os_str().is_empty() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(cwd.join(path))
}

/// Lower-cases an extension and gives it a leading dot.
fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

impl RunConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: RunConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }

    /// Makes every path absolute and normalizes the accepted extensions.
    ///
    /// A bare executable name (no directory part) is left as is so it can be
    /// looked up on `PATH`.
    pub fn resolve(mut self) -> Result<Self, ConfigError> {
        self.paths.pcd_e1 = absolute(&self.paths.pcd_e1)?;
        self.paths.pcd_e2 = absolute(&self.paths.pcd_e2)?;
        self.paths.intermediate_results = absolute(&self.paths.intermediate_results)?;
        self.paths.m3c2_settings = absolute(&self.paths.m3c2_settings)?;
        self.paths.hsv_settings = absolute(&self.paths.hsv_settings)?;
        if self.paths.cc_exe.components().count() > 1 {
            self.paths.cc_exe = absolute(&self.paths.cc_exe)?;
        }

        self.app_settings.greedy_file_types = self
            .app_settings
            .greedy_file_types
            .iter()
            .map(|ext| normalize_extension(ext))
            .collect();

        Ok(self)
    }

    /// Checks parameter ranges and that both epoch sources exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.boundary.alpha.is_finite() && self.boundary.alpha >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "boundary.alpha must be a non-negative number, got {}",
                self.boundary.alpha
            )));
        }
        if self.boundary.sample_size < 3 {
            return Err(ConfigError::Invalid(format!(
                "boundary.sample_size must be at least 3, got {}",
                self.boundary.sample_size
            )));
        }
        if !(self.cropping.margin.is_finite() && self.cropping.margin >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "cropping.margin must be a non-negative number, got {}",
                self.cropping.margin
            )));
        }
        if self.app_settings.greedy_file_types.is_empty() {
            return Err(ConfigError::Invalid(
                "app_settings.greedy_file_types is empty".to_string(),
            ));
        }
        if self.project_meta.epoch1_name.is_empty() || self.project_meta.epoch2_name.is_empty() {
            return Err(ConfigError::Invalid("epoch names must not be empty".to_string()));
        }

        for (key, path) in [("paths.pcd_e1", &self.paths.pcd_e1), ("paths.pcd_e2", &self.paths.pcd_e2)] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!("{} is not set", key)));
            }
            if !path.exists() {
                return Err(ConfigError::Invalid(format!(
                    "{} does not exist: {}",
                    key,
                    path.display()
                )));
            }
        }

        Ok(())
    }

    /// Attribute channels to load, following the retention settings.
    pub fn scalar_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        if self.app_settings.retain_intensities {
            fields.push("intensity".to_string());
        }
        if self.app_settings.filter_ground_points {
            fields.push("classification".to_string());
        }
        fields
    }
}
