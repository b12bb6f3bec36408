//! streetmesh
//!
//! Turns a list of street addresses into cropped 3D city meshes: each address
//! is geocoded, opened as a satellite map, captured with RenderDoc, imported
//! into Blender and cropped to the area located by template matching.

mod address;
mod automation;
mod blender;
mod capture;
mod cli;
mod geocode;
mod logging;
mod matching;
mod paths;
mod settings;
mod signal;

use anyhow::Result;
use clap::Parser;

use cli::Cli;
use settings::Settings;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config_path();
    let settings = Settings::load(&config_path);

    let log_dir = cli::log_dir(settings.as_ref().ok());
    logging::install_panic_hook(log_dir.clone());
    let level = settings
        .as_ref()
        .ok()
        .and_then(|s| s.get("settings.log_level"))
        .unwrap_or("info")
        .to_string();
    match logging::init(&log_dir, &level) {
        Ok(path) => tracing::debug!("Logging to {}", path.display()),
        Err(e) => eprintln!("Warning: file logging disabled: {:#}", e),
    }
    tracing::debug!("Settings file: {}", config_path.display());

    let result = cli::execute(cli, settings);
    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    result
}
