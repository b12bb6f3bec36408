//! Template matching: locate a reference photo inside a window screenshot.
//!
//! This module provides:
//! - Keypoint detection and descriptors (`features`)
//! - Homography fitting (`homography`)
//! - The crop region derived from the projected template corners
//! - Match artifacts (annotated screenshot, matches image, coordinate report)

pub mod features;
pub mod homography;

use anyhow::{Context, Result};
use chrono::Local;
use image::{GrayImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use features::{
    cross_checked_matches, extract_binary_features, extract_features, ratio_matches, Detector,
    FeatureMatch, Keypoint,
};
use homography::{project, ransac, Point};

/// Matches kept from the binary fallback.
const BINARY_KEEP: usize = 50;

#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub min_match_count: usize,
    pub ratio: f32,
    pub ransac_threshold: f64,
    pub ransac_iterations: usize,
    pub padding: u32,
    pub fast_threshold: u8,
    pub max_keypoints: usize,
    pub pyramid_levels: usize,
    pub scale_factor: f32,
    pub binary_fallback: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            min_match_count: 10,
            ratio: 0.7,
            ransac_threshold: 5.0,
            ransac_iterations: 1000,
            padding: 10,
            fast_threshold: 20,
            max_keypoints: 4000,
            pyramid_levels: 8,
            scale_factor: 1.2,
            binary_fallback: false,
        }
    }
}

impl MatchConfig {
    pub fn detector(&self) -> Detector {
        Detector {
            threshold: self.fast_threshold,
            max_keypoints: self.max_keypoints,
            levels: self.pyramid_levels,
            scale_factor: self.scale_factor,
        }
    }
}

/// Axis-aligned rectangle in screenshot pixels, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    Patch,
    Binary,
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchMethod::Patch => write!(f, "patch"),
            MatchMethod::Binary => write!(f, "binary"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("failed to load {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("only {found} good matches, need {required}")]
    TooFewMatches { found: usize, required: usize },
    #[error("matches do not determine a homography")]
    Degenerate,
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub method: MatchMethod,
    pub homography: Matrix3<f64>,
    /// Template corners `(0,0), (0,h-1), (w-1,h-1), (w-1,0)` in screenshot space
    pub corners: [Point; 4],
    pub center: (i32, i32),
    pub region: CropRegion,
    pub good_matches: usize,
    pub inliers: usize,
    /// Matched pairs (template, screenshot) used for the fit
    pub pairs: Vec<(Keypoint, Keypoint)>,
}

/// Bounding box of `corners` padded by `padding`, clamped to the image.
pub fn crop_region(corners: &[Point], width: u32, height: u32, padding: u32) -> CropRegion {
    let min_x = corners.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let max_x = corners.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
    let min_y = corners.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let max_y = corners.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);

    let pad = padding as f64;
    let max_px = width.saturating_sub(1) as f64;
    let max_py = height.saturating_sub(1) as f64;
    let x0 = (min_x.floor() - pad).clamp(0.0, max_px) as u32;
    let y0 = (min_y.floor() - pad).clamp(0.0, max_py) as u32;
    let x1 = (max_x.ceil() + pad).clamp(0.0, max_px) as u32;
    let y1 = (max_y.ceil() + pad).clamp(0.0, max_py) as u32;

    CropRegion {
        x: x0,
        y: y0,
        width: x1.saturating_sub(x0) + 1,
        height: y1.saturating_sub(y0) + 1,
    }
}

fn locate(
    method: MatchMethod,
    matches: &[FeatureMatch],
    template_kps: &[Keypoint],
    screenshot_kps: &[Keypoint],
    template: &GrayImage,
    screenshot: &GrayImage,
    config: &MatchConfig,
) -> Result<MatchResult, MatchError> {
    if matches.len() < config.min_match_count {
        return Err(MatchError::TooFewMatches {
            found: matches.len(),
            required: config.min_match_count,
        });
    }

    let pairs: Vec<(Keypoint, Keypoint)> = matches
        .iter()
        .map(|m| (template_kps[m.query], screenshot_kps[m.train]))
        .collect();
    let src: Vec<Point> = pairs.iter().map(|(t, _)| t.position()).collect();
    let dst: Vec<Point> = pairs.iter().map(|(_, s)| s.position()).collect();

    let fit = ransac(&src, &dst, config.ransac_threshold, config.ransac_iterations)
        .ok_or(MatchError::Degenerate)?;

    let (w, h) = template.dimensions();
    let (w, h) = (w.saturating_sub(1) as f64, h.saturating_sub(1) as f64);
    let mut corners = [(0.0, 0.0); 4];
    for (slot, p) in corners
        .iter_mut()
        .zip([(0.0, 0.0), (0.0, h), (w, h), (w, 0.0)])
    {
        *slot = project(&fit.homography, p).ok_or(MatchError::Degenerate)?;
    }

    let cx = corners.iter().map(|p| p.0).sum::<f64>() / 4.0;
    let cy = corners.iter().map(|p| p.1).sum::<f64>() / 4.0;
    let (sw, sh) = screenshot.dimensions();

    Ok(MatchResult {
        method,
        homography: fit.homography,
        corners,
        center: (cx as i32, cy as i32),
        region: crop_region(&corners, sw, sh, config.padding),
        good_matches: matches.len(),
        inliers: fit.inliers.len(),
        pairs,
    })
}

fn match_patches(
    template: &GrayImage,
    screenshot: &GrayImage,
    config: &MatchConfig,
) -> Result<MatchResult, MatchError> {
    let detector = config.detector();
    let t = extract_features(template, &detector);
    let s = extract_features(screenshot, &detector);
    let matches = ratio_matches(&t, &s, config.ratio);
    tracing::info!(
        "Patch matching: {} template / {} screenshot keypoints, {} good matches",
        t.len(),
        s.len(),
        matches.len()
    );

    let t_kps: Vec<Keypoint> = t.iter().map(|f| f.keypoint).collect();
    let s_kps: Vec<Keypoint> = s.iter().map(|f| f.keypoint).collect();
    locate(MatchMethod::Patch, &matches, &t_kps, &s_kps, template, screenshot, config)
}

fn match_binary(
    template: &GrayImage,
    screenshot: &GrayImage,
    config: &MatchConfig,
) -> Result<MatchResult, MatchError> {
    let detector = config.detector();
    let t = extract_binary_features(template, &detector);
    let s = extract_binary_features(screenshot, &detector);
    let matches = cross_checked_matches(&t, &s, BINARY_KEEP);
    tracing::info!("Binary matching: {} good matches", matches.len());

    let t_kps: Vec<Keypoint> = t.iter().map(|f| f.keypoint).collect();
    let s_kps: Vec<Keypoint> = s.iter().map(|f| f.keypoint).collect();
    locate(MatchMethod::Binary, &matches, &t_kps, &s_kps, template, screenshot, config)
}

/// Locates `template` inside `screenshot`.
pub fn match_template(
    template: &GrayImage,
    screenshot: &GrayImage,
    config: &MatchConfig,
) -> Result<MatchResult, MatchError> {
    match match_patches(template, screenshot, config) {
        Ok(result) => Ok(result),
        Err(e) if config.binary_fallback => {
            tracing::warn!("Patch matching failed ({}), trying binary descriptors", e);
            match_binary(template, screenshot, config)
        }
        Err(e) => Err(e),
    }
}

pub fn load_image(path: &Path) -> Result<image::DynamicImage, MatchError> {
    image::open(path).map_err(|source| MatchError::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Files written for one match.
#[derive(Debug, Clone)]
pub struct MatchArtifacts {
    pub screenshot: PathBuf,
    pub annotated: PathBuf,
    pub matches: PathBuf,
    pub report: PathBuf,
}

fn draw_polygon(img: &mut RgbaImage, corners: &[Point; 4], color: Rgba<u8>) {
    for i in 0..corners.len() {
        let a = corners[i];
        let b = corners[(i + 1) % corners.len()];
        // 3 px wide outline
        for offset in -1..=1 {
            let o = offset as f32;
            draw_line_segment_mut(
                img,
                (a.0 as f32 + o, a.1 as f32),
                (b.0 as f32 + o, b.1 as f32),
                color,
            );
            draw_line_segment_mut(
                img,
                (a.0 as f32, a.1 as f32 + o),
                (b.0 as f32, b.1 as f32 + o),
                color,
            );
        }
    }
}

/// The screenshot with the located quadrilateral and centre drawn on it.
pub fn annotate(screenshot: &RgbaImage, result: &MatchResult) -> RgbaImage {
    let mut img = screenshot.clone();
    draw_polygon(&mut img, &result.corners, Rgba([0, 255, 0, 255]));
    draw_filled_circle_mut(&mut img, result.center, 10, Rgba([255, 0, 0, 255]));
    img
}

/// Template and screenshot side by side with a line per matched pair.
pub fn draw_matches(template: &RgbaImage, screenshot: &RgbaImage, result: &MatchResult) -> RgbaImage {
    let (tw, th) = template.dimensions();
    let (sw, sh) = screenshot.dimensions();
    let mut canvas = RgbaImage::from_pixel(tw + sw, th.max(sh), Rgba([0, 0, 0, 255]));
    image::imageops::replace(&mut canvas, template, 0, 0);
    image::imageops::replace(&mut canvas, screenshot, tw as i64, 0);

    for (t, s) in &result.pairs {
        draw_line_segment_mut(
            &mut canvas,
            (t.x, t.y),
            (s.x + tw as f32, s.y),
            Rgba([0, 255, 0, 255]),
        );
    }
    canvas
}

pub fn coordinates_report(template_path: &Path, result: &MatchResult) -> String {
    let mut report = String::new();
    let _ = writeln!(report, "template: {}", template_path.display());
    let _ = writeln!(report, "time: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(report, "method: {}", result.method);
    let _ = writeln!(report, "good matches: {}", result.good_matches);
    let _ = writeln!(report, "inliers: {}", result.inliers);
    let _ = writeln!(report);
    let _ = writeln!(report, "center: ({}, {})", result.center.0, result.center.1);
    let _ = writeln!(report, "corners:");
    for (i, (x, y)) in result.corners.iter().enumerate() {
        let _ = writeln!(report, "  {}: ({}, {})", i + 1, *x as i32, *y as i32);
    }
    let r = result.region;
    let _ = writeln!(
        report,
        "crop region: x={} y={} width={} height={}",
        r.x, r.y, r.width, r.height
    );
    report
}

/// Writes the screenshot, annotated result, matches image and report into `out_dir`.
pub fn write_artifacts(
    out_dir: &Path,
    stem: &str,
    template_path: &Path,
    template: &RgbaImage,
    screenshot: &RgbaImage,
    result: &MatchResult,
) -> Result<MatchArtifacts> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let artifacts = MatchArtifacts {
        screenshot: out_dir.join(format!("{}_screenshot_{}.png", stem, timestamp)),
        annotated: out_dir.join(format!("{}_match_{}_{}.png", stem, result.method, timestamp)),
        matches: out_dir.join(format!("{}_matches_{}_{}.png", stem, result.method, timestamp)),
        report: out_dir.join(format!("{}_coordinates_{}.txt", stem, timestamp)),
    };

    screenshot
        .save(&artifacts.screenshot)
        .context("Failed to save screenshot")?;
    annotate(screenshot, result)
        .save(&artifacts.annotated)
        .context("Failed to save match result image")?;
    draw_matches(template, screenshot, result)
        .save(&artifacts.matches)
        .context("Failed to save matches image")?;
    fs::write(&artifacts.report, coordinates_report(template_path, result))
        .context("Failed to write match report")?;

    tracing::info!("Match artifacts saved to {}", out_dir.display());
    Ok(artifacts)
}
