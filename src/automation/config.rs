//! Typed pipeline configuration.
//!
//! Read once from the settings store before any address is processed. Every
//! tunable has a default here, so only the API key and the executable and
//! project paths have to be present in `config.json`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::address::JobLayout;
use crate::blender::MeshCleanup;
use crate::matching::MatchConfig;
use crate::paths;
use crate::settings::{Settings, SettingsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTransport {
    File,
    Tcp,
}

impl FromStr for SignalTransport {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(SignalTransport::File),
            "tcp" => Ok(SignalTransport::Tcp),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub transport: SignalTransport,
    /// TCP port; 0 picks a free one
    pub port: u16,
    pub poll_interval: Duration,
    /// Budget for each wait on the Blender script
    pub timeout: Duration,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            transport: SignalTransport::File,
            port: 0,
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Title fragments used to find the helper windows.
#[derive(Debug, Clone)]
pub struct WindowTitles {
    pub renderdoc: String,
    pub browser: String,
    /// The browser's GPU-startup dialog
    pub browser_gpu: String,
    pub blender: String,
}

impl Default for WindowTitles {
    fn default() -> Self {
        Self {
            renderdoc: "RenderDoc".to_string(),
            browser: "Google Chrome".to_string(),
            browser_gpu: "Google Chrome Gpu".to_string(),
            blender: "Blender".to_string(),
        }
    }
}

/// Screen positions and pacing for the RenderDoc UI sequence.
///
/// `process_list` and `first_result` are offsets from the RenderDoc window's
/// top-left corner; `thumbnail` and `save_menu` are absolute screen positions.
#[derive(Debug, Clone)]
pub struct CaptureLayout {
    pub renderdoc_size: (i32, i32),
    pub process_list: (i32, i32),
    pub first_result: (i32, i32),
    pub thumbnail: (i32, i32),
    pub save_menu: (i32, i32),
    /// Length of each drag stroke over the map
    pub drag_distance: i32,
    pub stroke: Duration,
    /// Filter typed into the injection dialog
    pub search_text: String,
    pub typing_interval: Duration,
}

impl Default for CaptureLayout {
    fn default() -> Self {
        Self {
            renderdoc_size: (1600, 900),
            process_list: (80, 550),
            first_result: (80, 275),
            thumbnail: (1275, 1100),
            save_menu: (1300, 1155),
            drag_distance: 200,
            stroke: Duration::from_millis(300),
            // Double spaces survive IME word completion
            search_text: "Google  Chrome  Gpu".to_string(),
            typing_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub api_key: String,
    pub geocode_endpoint: Option<String>,
    pub chrome_path: PathBuf,
    pub renderdoc_path: PathBuf,
    pub blender_path: PathBuf,
    pub layout: JobLayout,
    pub screenshot_dir: PathBuf,
    pub signal_dir: PathBuf,
    pub map_zoom: u32,
    pub min_capture_kb: u64,
    pub capture_retries: u32,
    pub reuse_capture: bool,
    pub signals: SignalConfig,
    pub blender_timeout: Duration,
    pub save_timeout: Duration,
    /// How long RenderDoc gets to write the capture after Enter
    pub capture_save_timeout: Duration,
    pub window_retries: u32,
    pub window_retry_delay: Duration,
    pub browser_settle: Duration,
    pub matching: MatchConfig,
    pub cleanup: MeshCleanup,
    pub windows: WindowTitles,
    pub capture: CaptureLayout,
}

/// Reads a duration in (possibly fractional) seconds.
fn seconds(settings: &Settings, key: &str, default: f64) -> Result<Duration, SettingsError> {
    let value: f64 = settings.get_or(key, default)?;
    Duration::try_from_secs_f64(value).map_err(|_| SettingsError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn point(settings: &Settings, key: &str, default: (i32, i32)) -> Result<(i32, i32), SettingsError> {
    Ok((
        settings.get_or(&format!("{key}_x"), default.0)?,
        settings.get_or(&format!("{key}_y"), default.1)?,
    ))
}

/// A number that is off when the key is absent or empty.
fn optional(settings: &Settings, key: &str) -> Result<Option<f64>, SettingsError> {
    match settings.get(key).map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| SettingsError::Invalid {
                key: key.to_string(),
                value: value.to_string(),
            }),
    }
}

/// Mesh cleanup from the `mesh` section; only vertex merging is on by default.
pub fn cleanup_from_settings(settings: &Settings) -> Result<MeshCleanup, SettingsError> {
    let d = MeshCleanup::default();
    let ratio_key = "mesh.decimate_ratio";
    let decimate_ratio = optional(settings, ratio_key)?;
    if let Some(ratio) = decimate_ratio {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(SettingsError::Invalid {
                key: ratio_key.to_string(),
                value: ratio.to_string(),
            });
        }
    }
    Ok(MeshCleanup {
        merge_distance: settings.get_or("mesh.merge_distance", d.merge_distance)?,
        max_distance: optional(settings, "mesh.max_distance")?,
        min_height: optional(settings, "mesh.min_height")?,
        decimate_ratio,
    })
}

fn text(settings: &Settings, key: &str, default: &str) -> String {
    settings
        .get(key)
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn required_path(settings: &Settings, key: &str) -> Result<PathBuf, SettingsError> {
    settings.require(key).map(|v| PathBuf::from(v.trim()))
}

/// Matching tunables from the `matching` section. Also used by the offline `match` command.
pub fn matching_from_settings(settings: &Settings) -> Result<MatchConfig, SettingsError> {
    let d = MatchConfig::default();
    Ok(MatchConfig {
        min_match_count: settings.get_or("matching.min_match_count", d.min_match_count)?,
        ratio: settings.get_or("matching.ratio", d.ratio)?,
        ransac_threshold: settings.get_or("matching.ransac_threshold", d.ransac_threshold)?,
        ransac_iterations: settings.get_or("matching.ransac_iterations", d.ransac_iterations)?,
        padding: settings.get_or("matching.padding", d.padding)?,
        fast_threshold: settings.get_or("matching.fast_threshold", d.fast_threshold)?,
        max_keypoints: settings.get_or("matching.max_keypoints", d.max_keypoints)?,
        pyramid_levels: settings.get_or("matching.pyramid_levels", d.pyramid_levels)?,
        scale_factor: settings.get_or("matching.scale_factor", d.scale_factor)?,
        binary_fallback: settings.get_or("matching.orb_fallback", d.binary_fallback)?,
    })
}

impl PipelineConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        let transport_key = "settings.signal_transport";
        let transport = match settings.get(transport_key).map(str::trim) {
            None | Some("") => SignalTransport::File,
            Some(value) => value.parse().map_err(|_| SettingsError::Invalid {
                key: transport_key.to_string(),
                value: value.to_string(),
            })?,
        };
        let poll = seconds(settings, "settings.signal_poll_s", 2.0)?
            .clamp(Duration::from_secs(1), Duration::from_secs(5));

        let layout = JobLayout {
            rdc_dir: settings
                .get_path("paths.rdc_dir")
                .unwrap_or_else(paths::get_default_capture_dir),
            project_dir: required_path(settings, "paths.project_dir")?,
            template_dir: settings.get_path("paths.template_dir"),
            fallback_template: settings.get_path("paths.template_image_path"),
        };

        let d = CaptureLayout::default();
        let capture = CaptureLayout {
            renderdoc_size: (
                settings.get_or("layout.renderdoc_width", d.renderdoc_size.0)?,
                settings.get_or("layout.renderdoc_height", d.renderdoc_size.1)?,
            ),
            process_list: point(settings, "layout.process_list", d.process_list)?,
            first_result: point(settings, "layout.first_result", d.first_result)?,
            thumbnail: point(settings, "layout.thumbnail", d.thumbnail)?,
            save_menu: point(settings, "layout.save_menu", d.save_menu)?,
            drag_distance: settings.get_or("layout.drag_distance", d.drag_distance)?,
            stroke: seconds(settings, "layout.stroke_s", d.stroke.as_secs_f64())?,
            search_text: text(settings, "layout.search_text", &d.search_text),
            typing_interval: seconds(
                settings,
                "layout.typing_interval_s",
                d.typing_interval.as_secs_f64(),
            )?,
        };

        let w = WindowTitles::default();
        let windows = WindowTitles {
            renderdoc: text(settings, "windows.renderdoc_title", &w.renderdoc),
            browser: text(settings, "windows.browser_title", &w.browser),
            browser_gpu: text(settings, "windows.browser_gpu_title", &w.browser_gpu),
            blender: text(settings, "windows.blender_title", &w.blender),
        };

        Ok(Self {
            api_key: settings.require("api.google_maps_api_key")?.trim().to_string(),
            geocode_endpoint: settings
                .get("api.geocode_endpoint")
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            chrome_path: required_path(settings, "paths.chrome_path")?,
            renderdoc_path: required_path(settings, "paths.renderdoc_path")?,
            blender_path: required_path(settings, "paths.blender_path")?,
            layout,
            screenshot_dir: settings
                .get_path("paths.screenshot_dir")
                .unwrap_or_else(paths::get_screenshots_dir),
            signal_dir: settings
                .get_path("paths.signal_dir")
                .unwrap_or_else(paths::get_signals_dir),
            map_zoom: settings.get_or("settings.map_zoom", 21)?,
            min_capture_kb: settings.get_or("settings.min_capture_kb", 1024)?,
            capture_retries: settings.get_or("settings.capture_retries", 1)?,
            reuse_capture: settings.get_or("settings.reuse_capture", false)?,
            signals: SignalConfig {
                transport,
                port: settings.get_or("settings.signal_port", 0)?,
                poll_interval: poll,
                timeout: seconds(settings, "settings.signal_timeout_s", 300.0)?,
            },
            blender_timeout: seconds(settings, "settings.blender_timeout_s", 300.0)?,
            save_timeout: seconds(settings, "settings.save_timeout_s", 300.0)?,
            capture_save_timeout: seconds(settings, "settings.capture_save_timeout_s", 30.0)?,
            window_retries: settings.get_or("settings.window_retries", 3)?,
            window_retry_delay: seconds(settings, "settings.window_retry_delay_s", 5.0)?,
            browser_settle: seconds(settings, "settings.browser_settle_s", 2.0)?,
            matching: matching_from_settings(settings)?,
            cleanup: cleanup_from_settings(settings)?,
            windows,
            capture,
        })
    }
}
