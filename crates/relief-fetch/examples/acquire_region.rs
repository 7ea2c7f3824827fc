//! Example: acquire a region raster, or inspect the shared rate limiter.
//!
//! Usage:
//!   cargo run --example acquire_region -- acquire mount_rainier -121.9 46.7 -121.6 47.0
//!   cargo run --example acquire_region -- status
//!   cargo run --example acquire_region -- clear --force
//!
//! Set `RUST_LOG=relief_fetch=debug` for per-source detail.

use clap::{Parser, Subcommand};
use relief_dem::GeoBounds;
use relief_fetch::{
    AcquisitionConfig, EnvCredentials, HttpTransport, RateLimiter, RegionAcquirer, RegionClass,
    RegionRequest, SystemClock,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Acquire DEM rasters for a region")]
struct Cli {
    /// YAML configuration file; defaults apply when omitted
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch and assemble a region
    Acquire {
        region_id: String,
        #[arg(allow_hyphen_values = true)]
        west: f64,
        #[arg(allow_hyphen_values = true)]
        south: f64,
        #[arg(allow_hyphen_values = true)]
        east: f64,
        #[arg(allow_hyphen_values = true)]
        north: f64,
        /// Output pixels along the longer side
        #[arg(long, default_value_t = 2048)]
        max_dimension: u32,
        /// Region outside national high-resolution coverage
        #[arg(long)]
        international: bool,
        /// Accept a resolution below the sampling rule
        #[arg(long)]
        allow_degraded: bool,
        /// Also consider 250/500/1000 m sources
        #[arg(long)]
        coarse_fallbacks: bool,
    },
    /// Show the shared rate limiter state
    Status,
    /// Reset rate limiter violations
    Clear {
        /// Clear even while a backoff window is active
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("relief_fetch=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(cli: Cli) -> relief_fetch::Result<()> {
    let config = match &cli.config {
        Some(path) => AcquisitionConfig::from_yaml_file(path)?,
        None => AcquisitionConfig::default(),
    };

    match cli.command {
        Command::Acquire {
            region_id,
            west,
            south,
            east,
            north,
            max_dimension,
            international,
            allow_degraded,
            coarse_fallbacks,
        } => {
            let bounds = GeoBounds::new(west, south, east, north)?;
            let class = if international {
                RegionClass::International
            } else {
                RegionClass::Domestic
            };
            let request = RegionRequest::new(region_id, bounds, class, max_dimension)
                .with_degraded(allow_degraded)
                .with_coarse_fallbacks(coarse_fallbacks);

            let acquirer = RegionAcquirer::from_config(
                &config,
                Arc::new(HttpTransport::new(&config.fetch)?),
                Arc::new(EnvCredentials),
                Arc::new(SystemClock),
            )?;

            let start = Instant::now();
            let result = acquirer.acquire(&request)?;
            println!("Region:     {}", result.record.region_id);
            println!("Artifact:   {}", result.record.artifact_path.display());
            println!(
                "Resolution: {} (visible pixel {:.1} m{})",
                result.record.resolution_used,
                result.choice.visible_pixel_m,
                if result.record.degraded { ", degraded" } else { "" }
            );
            if result.reused_artifact {
                println!("Reused existing artifact");
            } else {
                println!(
                    "Tiles:      {} total, {} downloaded, {} cached",
                    result.tiles_total, result.tiles_downloaded, result.cache_hits
                );
            }
            println!("Elapsed:    {:.2}s", start.elapsed().as_secs_f64());
        }
        Command::Status => {
            let limiter = RateLimiter::from_config(&config.rate_limit, Arc::new(SystemClock));
            println!("{}", serde_json::to_string_pretty(&limiter.status())?);
        }
        Command::Clear { force } => {
            let limiter = RateLimiter::from_config(&config.rate_limit, Arc::new(SystemClock));
            let state = limiter.clear(force)?;
            println!("Cleared; {} requests made today", state.requests_today);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
