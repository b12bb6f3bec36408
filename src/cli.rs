//! Command-line interface.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::address::{load_address_list, sanitize_filename};
use crate::automation::config::matching_from_settings;
use crate::automation::report::RunReport;
use crate::automation::runner::{open_signals, LiveStages};
use crate::automation::{default_desktop, process, run_pipeline, PipelineConfig};
use crate::geocode::{Geocoder, GoogleGeocoder};
use crate::matching::{self, MatchConfig};
use crate::paths;
use crate::settings::{Settings, SettingsError};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Settings file (default: config.json next to the executable)
    #[arg(short, long, env = "STREETMESH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Process every address in a list file
    Run {
        /// Address list; `[District]` lines start a district
        addresses: PathBuf,

        /// Only process these districts (repeatable)
        #[arg(short, long = "district")]
        districts: Vec<String>,
    },
    /// Print the coordinates of an address
    Geocode { address: String },
    /// Locate a template in a screenshot and write the match artifacts
    Match {
        template: PathBuf,
        screenshot: PathBuf,

        /// Artifact directory (default: the screenshots directory)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Print the file name derived from an address
    Filename { address: String },
    /// Read or change settings
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Terminate the browser, RenderDoc and Blender
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print one value
    Get { key: String },
    /// Set one value and save
    Set { key: String, value: String },
    /// Print every value
    List,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(paths::get_default_config_path)
    }
}

/// Directory for logs and run reports.
pub fn log_dir(settings: Option<&Settings>) -> PathBuf {
    settings
        .and_then(|s| s.get_path("paths.log_dir"))
        .unwrap_or_else(paths::get_logs_dir)
}

pub fn execute(cli: Cli, settings: Result<Settings, SettingsError>) -> Result<()> {
    let config_path = cli.config_path();
    match cli.command {
        Command::Run {
            addresses,
            districts,
        } => run(&settings?, &addresses, &districts),
        Command::Geocode { address } => {
            let settings = settings?;
            let geocoder = GoogleGeocoder::new(
                settings.require("api.google_maps_api_key")?,
                settings.get("api.geocode_endpoint").map(str::to_string),
            )?;
            let location = geocoder.geocode(&address)?;
            println!("{}", location);
            Ok(())
        }
        Command::Match {
            template,
            screenshot,
            out,
        } => {
            // Matching works without a settings file
            let (config, out_dir) = match settings {
                Ok(settings) => (
                    matching_from_settings(&settings)?,
                    settings.get_path("paths.screenshot_dir"),
                ),
                Err(SettingsError::NotFound(_)) => (MatchConfig::default(), None),
                Err(e) => return Err(e.into()),
            };
            let out_dir = out
                .or(out_dir)
                .unwrap_or_else(paths::get_screenshots_dir);
            match_files(&template, &screenshot, &out_dir, &config)
        }
        Command::Filename { address } => {
            println!("{}", sanitize_filename(&address));
            Ok(())
        }
        Command::Config(command) => config_command(command, settings, &config_path),
        Command::Clear => {
            let stopped = default_desktop().terminate_processes(&process::helper_targets())?;
            println!("Stopped {} helper processes", stopped);
            Ok(())
        }
    }
}

fn run(settings: &Settings, addresses: &Path, districts: &[String]) -> Result<()> {
    // Configuration problems abort before any address is touched
    let config = PipelineConfig::from_settings(settings)?;
    let list = load_address_list(addresses)?;
    let jobs = config.layout.jobs(&list, districts);
    if jobs.is_empty() {
        return Err(anyhow!("No addresses to process in {}", addresses.display()));
    }
    paths::ensure_directories(&[
        &config.layout.rdc_dir,
        &config.layout.project_dir,
        &config.screenshot_dir,
        &config.signal_dir,
    ])
    .context("Failed to create output directories")?;

    let geocoder = GoogleGeocoder::new(config.api_key.clone(), config.geocode_endpoint.clone())?;
    let desktop = default_desktop();
    let signals = open_signals(&config)?;
    let report = RunReport::create(&log_dir(Some(settings)))?;
    tracing::info!("Run report: {}", report.path().display());

    let mut stages = LiveStages::new(&config, &geocoder, desktop.as_ref(), signals);
    let summary = run_pipeline(&config, &jobs, &mut stages, Some(&report));
    println!("{}", summary);
    for (address, reason) in &summary.failed {
        println!("  failed: {} ({})", address, reason);
    }
    Ok(())
}

fn match_files(template: &Path, screenshot: &Path, out_dir: &Path, config: &MatchConfig) -> Result<()> {
    let template_img = matching::load_image(template)?.to_rgba8();
    let screenshot_img = matching::load_image(screenshot)?.to_rgba8();
    let result = matching::match_template(
        &image::imageops::grayscale(&template_img),
        &image::imageops::grayscale(&screenshot_img),
        config,
    )?;
    let stem = screenshot
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "match".to_string());
    let artifacts = matching::write_artifacts(
        out_dir,
        &stem,
        template,
        &template_img,
        &screenshot_img,
        &result,
    )?;
    print!("{}", matching::coordinates_report(template, &result));
    println!("Artifacts written to {}", out_dir.display());
    tracing::debug!("Annotated result: {}", artifacts.annotated.display());
    Ok(())
}

fn config_command(
    command: ConfigCommand,
    settings: Result<Settings, SettingsError>,
    config_path: &Path,
) -> Result<()> {
    match command {
        ConfigCommand::Get { key } => {
            let settings = settings?;
            let value = settings
                .get(&key)
                .ok_or_else(|| SettingsError::Missing(key.clone()))?;
            println!("{}", value);
        }
        ConfigCommand::Set { key, value } => {
            let mut settings = match settings {
                Ok(settings) => settings,
                Err(SettingsError::NotFound(_)) => Settings::new(config_path),
                Err(e) => return Err(e.into()),
            };
            settings.set(&key, value)?;
            settings.save()?;
            tracing::info!("Updated {} in {}", key, settings.path().display());
        }
        ConfigCommand::List => {
            for (key, value) in settings?.entries() {
                println!("{} = {}", key, value);
            }
        }
    }
    Ok(())
}
