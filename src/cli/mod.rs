//! Command-line interface for epoch preparation.

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::time::Instant;

use geo::Area;

use crate::config::RunConfig;
use crate::core::{load_point_cloud, write_polygon_csv};
use crate::pipeline::{make_rng, run_pipeline, RunOptions};
use crate::processors::boundary::extract_boundary;

#[derive(Parser)]
#[command(name = "despan")]
#[command(about = "Prepare two point cloud epochs for M3C2 change detection", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: merge, crop, footprint, CloudCompare
    Run {
        /// Epoch 1 point cloud file or directory
        #[arg(long)]
        epoch1: Option<PathBuf>,
        /// Epoch 2 point cloud file or directory
        #[arg(long)]
        epoch2: Option<PathBuf>,
        /// Search epoch directories recursively
        #[arg(long)]
        greedy_dir_search: bool,
        /// Seed for footprint subsampling
        #[arg(long)]
        seed: Option<u64>,
        /// Log the CloudCompare command lines without running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Extract the footprint polygon of a single point cloud
    Footprint {
        /// Input point cloud (PLY, LAS or LAZ)
        input: PathBuf,
        /// Output CSV file for the polygon ring
        output: PathBuf,
        /// Alpha parameter (0 gives the convex hull)
        #[arg(long)]
        alpha: Option<f64>,
        /// Maximum number of points used for the alpha shape
        #[arg(long)]
        sample_size: Option<usize>,
        /// Seed for subsampling
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Write the default configuration as YAML
    DefaultConfig {
        /// Output YAML file
        #[arg(default_value = "despan.yaml")]
        output: PathBuf,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            let head: String = value.chars().take(36).collect();
            format!("{}...", head)
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    // Load config
    let config = match &cli.config {
        Some(path) => match RunConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                error!("Failed to load config from {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => RunConfig::default(),
    };

    match cli.command {
        Commands::Run { epoch1, epoch2, greedy_dir_search, seed, dry_run } => {
            let mut config = config;
            if let Some(path) = epoch1 {
                config.paths.pcd_e1 = path;
            }
            if let Some(path) = epoch2 {
                config.paths.pcd_e2 = path;
            }
            if greedy_dir_search {
                config.app_settings.greedy_directory_search = true;
            }
            if seed.is_some() {
                config.boundary.seed = seed;
            }
            cmd_run(config, dry_run);
        }
        Commands::Footprint { input, output, alpha, sample_size, seed } => {
            cmd_footprint(&input, &output, alpha, sample_size, seed, &config);
        }
        Commands::DefaultConfig { output } => {
            cmd_default_config(&output);
        }
    }
}

fn cmd_run(config: RunConfig, dry_run: bool) {
    let start = Instant::now();

    let config = match config.resolve() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if dry_run {
        println!("DRY RUN: CloudCompare will not be started");
    }
    println!("Epoch 1: {}", config.paths.pcd_e1.display());
    println!("Epoch 2: {}", config.paths.pcd_e2.display());
    println!("Output directory: {}", config.paths.intermediate_results.display());

    let spinner = create_spinner("Starting...");
    let result = run_pipeline(&config, &RunOptions { dry_run }, |stage| {
        spinner.set_message(format!("{}...", stage));
    });
    spinner.finish_and_clear();

    match result {
        Ok(summary) => {
            if dry_run {
                for invocation in &summary.invocations {
                    println!("{}", invocation);
                }
            }

            let prepared = &summary.prepared;
            let counts = &prepared.counts;
            print_summary(
                "Epoch Preparation Complete",
                &[
                    (&*config.project_meta.epoch1_name, format!(
                        "{} -> {} points",
                        counts.merged[0], counts.box_cropped[0]
                    )),
                    (&*config.project_meta.epoch2_name, format!(
                        "{} -> {} points",
                        counts.merged[1], counts.box_cropped[1]
                    )),
                    ("Footprint area", format!("{:.3}", prepared.common_footprint.unsigned_area())),
                    ("Footprint vertices", prepared.common_footprint.exterior().0.len().to_string()),
                    ("Offset", prepared.offset.to_string()),
                    ("Output directory", config.paths.intermediate_results.display().to_string()),
                    ("CloudCompare run", summary.executed.to_string()),
                    ("Duration", format!("{:.2?}", start.elapsed())),
                ],
            );
        }
        Err(e) => {
            error!("Pipeline failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_footprint(
    input: &Path,
    output: &Path,
    alpha: Option<f64>,
    sample_size: Option<usize>,
    seed: Option<u64>,
    config: &RunConfig,
) {
    let start = Instant::now();

    let alpha = alpha.unwrap_or(config.boundary.alpha);
    let sample_size = sample_size.unwrap_or(config.boundary.sample_size);
    let mut rng = make_rng(seed.or(config.boundary.seed));

    println!("Extracting footprint...");
    println!("Input: {}", input.display());
    println!("Output: {}", output.display());
    println!("Parameters:");
    println!("  alpha: {}", alpha);
    println!("  sample_size: {}", sample_size);

    let spinner = create_spinner("Loading point cloud...");

    let cloud = match load_point_cloud(input, Some(&[])) {
        Ok(c) => c,
        Err(e) => {
            spinner.finish_and_clear();
            error!("Failed to load point cloud: {}", e);
            std::process::exit(1);
        }
    };

    spinner.set_message("Computing alpha shape...");

    let footprint = match extract_boundary(&cloud, alpha, sample_size, &mut rng) {
        Ok(polygon) => polygon,
        Err(e) => {
            spinner.finish_and_clear();
            error!("Footprint extraction failed: {}", e);
            std::process::exit(1);
        }
    };

    match write_polygon_csv(output, &footprint) {
        Ok(()) => {
            spinner.finish_and_clear();

            print_summary(
                "Footprint Complete",
                &[
                    ("Input file", input.display().to_string()),
                    ("Output CSV", output.display().to_string()),
                    ("Points in cloud", cloud.len().to_string()),
                    ("Vertices", footprint.exterior().0.len().to_string()),
                    ("Area", format!("{:.3}", footprint.unsigned_area())),
                    ("Duration", format!("{:.2?}", start.elapsed())),
                ],
            );
        }
        Err(e) => {
            spinner.finish_and_clear();
            error!("Failed to write footprint: {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_default_config(output: &Path) {
    match RunConfig::default().to_yaml(output) {
        Ok(()) => println!("Default configuration written to {}", output.display()),
        Err(e) => {
            error!("Failed to write configuration: {}", e);
            std::process::exit(1);
        }
    }
}
