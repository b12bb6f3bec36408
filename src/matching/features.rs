//! Scale-space keypoints, oriented patch descriptors and descriptor matching.
//!
//! Corners are detected on every level of a Gaussian pyramid and reported in
//! base-image coordinates. Each keypoint carries the intensity-centroid angle
//! of its neighbourhood; descriptors are sampled on a grid rotated by that
//! angle, so a template matches a screenshot taken at another zoom or
//! rotation.

use image::imageops::{resize, FilterType};
use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};
use imageproc::filter::gaussian_blur_f32;
use imageproc::suppress::local_maxima;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::OnceLock;

/// Half-size of the descriptor grid, in level pixels.
pub const PATCH_RADIUS: f32 = 8.0;
const PATCH_STEP: usize = 2;
/// Keypoints keep this distance to a level's border so a rotated patch fits.
pub const BORDER: u32 = 13;
const ORIENTATION_RADIUS: i32 = 7;
const SUPPRESSION_RADIUS: u32 = 2;
const SMOOTHING_SIGMA: f32 = 1.2;

const BINARY_TESTS: usize = 256;
const BINARY_SEED: u64 = 0x5eed_b21e;

/// One pyramid level: the resized image and its smoothed copy for sampling.
#[derive(Debug, Clone)]
pub struct Level {
    pub scale_x: f32,
    pub scale_y: f32,
    pub image: GrayImage,
    smoothed: GrayImage,
}

impl Level {
    fn new(image: GrayImage, scale_x: f32, scale_y: f32) -> Self {
        let smoothed = gaussian_blur_f32(&image, SMOOTHING_SIGMA);
        Self {
            scale_x,
            scale_y,
            image,
            smoothed,
        }
    }

    fn area(&self) -> f32 {
        let (w, h) = self.image.dimensions();
        (w * h) as f32
    }

    /// Bilinear sample of the smoothed level, clamped to the image.
    fn sample(&self, x: f32, y: f32) -> f32 {
        let (w, h) = self.smoothed.dimensions();
        let x = x.clamp(0.0, (w - 1) as f32);
        let y = y.clamp(0.0, (h - 1) as f32);
        let (x0, y0) = (x.floor() as u32, y.floor() as u32);
        let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
        let (fx, fy) = (x - x0 as f32, y - y0 as f32);
        let p = |px: u32, py: u32| self.smoothed.get_pixel(px, py)[0] as f32;

        p(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + p(x1, y0) * fx * (1.0 - fy)
            + p(x0, y1) * (1.0 - fx) * fy
            + p(x1, y1) * fx * fy
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// Position in base-image pixels
    pub x: f32,
    pub y: f32,
    /// Patch radius in base-image pixels
    pub size: f32,
    /// Intensity-centroid direction, radians
    pub angle: f32,
    pub score: f32,
    pub level: usize,
}

impl Keypoint {
    pub fn position(&self) -> (f64, f64) {
        (self.x as f64, self.y as f64)
    }

    fn local(&self, level: &Level) -> (f32, f32) {
        (self.x / level.scale_x, self.y / level.scale_y)
    }

    fn distance_sq(&self, other: &Keypoint) -> f32 {
        (self.x - other.x).powi(2) + (self.y - other.y).powi(2)
    }
}

/// Float descriptor: mean-centred, L2-normalised samples of the oriented patch.
#[derive(Debug, Clone)]
pub struct Feature {
    pub keypoint: Keypoint,
    pub descriptor: Vec<f32>,
}

/// Steered BRIEF-style bit-test descriptor.
#[derive(Debug, Clone)]
pub struct BinaryFeature {
    pub keypoint: Keypoint,
    pub bits: [u64; BINARY_TESTS / 64],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMatch {
    /// Index into the template features
    pub query: usize,
    /// Index into the screenshot features
    pub train: usize,
    pub distance: f32,
}

/// Pyramid and corner detector settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detector {
    pub threshold: u8,
    pub max_keypoints: usize,
    pub levels: usize,
    pub scale_factor: f32,
}

impl Detector {
    /// Levels shrink by `scale_factor` until one is too small to hold a patch.
    pub fn pyramid(&self, image: &GrayImage) -> Vec<Level> {
        let (width, height) = image.dimensions();
        let min_side = 2 * BORDER + 1;
        let count = if self.scale_factor > 1.0 {
            self.levels.max(1)
        } else {
            1
        };

        let mut levels = Vec::new();
        for i in 0..count {
            let scale = self.scale_factor.powi(i as i32);
            let lw = (width as f32 / scale).round() as u32;
            let lh = (height as f32 / scale).round() as u32;
            if lw < min_side || lh < min_side {
                break;
            }
            let img = if i == 0 {
                image.clone()
            } else {
                resize(image, lw, lh, FilterType::Triangle)
            };
            levels.push(Level::new(
                img,
                width as f32 / lw as f32,
                height as f32 / lh as f32,
            ));
        }
        levels
    }

    /// Oriented corners from every level, strongest first.
    ///
    /// Each level keeps a share of `max_keypoints` proportional to its area.
    pub fn keypoints(&self, pyramid: &[Level]) -> Vec<Keypoint> {
        let total_area: f32 = pyramid.iter().map(Level::area).sum();
        let mut keypoints = Vec::new();
        for (index, level) in pyramid.iter().enumerate() {
            let quota = (self.max_keypoints as f32 * level.area() / total_area).ceil() as usize;
            keypoints.extend(level_keypoints(level, index, self.threshold, quota));
        }
        sort_keypoints(&mut keypoints);
        keypoints.truncate(self.max_keypoints);
        keypoints
    }
}

// Ties broken by level and position so results do not depend on detector order
fn sort_keypoints(keypoints: &mut [Keypoint]) {
    keypoints.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.level.cmp(&b.level))
            .then(a.y.total_cmp(&b.y))
            .then(a.x.total_cmp(&b.x))
    });
}

fn level_keypoints(level: &Level, index: usize, threshold: u8, quota: usize) -> Vec<Keypoint> {
    let (width, height) = level.image.dimensions();
    if width <= 2 * BORDER || height <= 2 * BORDER {
        return Vec::new();
    }

    let corners: Vec<Corner> = corners_fast9(&level.image, threshold)
        .into_iter()
        .filter(|c| {
            c.x >= BORDER && c.y >= BORDER && c.x < width - BORDER && c.y < height - BORDER
        })
        .collect();

    let scale = (level.scale_x + level.scale_y) / 2.0;
    let mut keypoints: Vec<Keypoint> = local_maxima(&corners, SUPPRESSION_RADIUS)
        .into_iter()
        .map(|c| Keypoint {
            x: c.x as f32 * level.scale_x,
            y: c.y as f32 * level.scale_y,
            size: PATCH_RADIUS * scale,
            angle: orientation(level, c.x, c.y),
            score: c.score,
            level: index,
        })
        .collect();
    sort_keypoints(&mut keypoints);
    keypoints.truncate(quota);
    keypoints
}

/// Direction from `(cx, cy)` to the intensity centroid of the disc around it.
pub fn orientation(level: &Level, cx: u32, cy: u32) -> f32 {
    let r = ORIENTATION_RADIUS;
    let (mut m10, mut m01) = (0.0f32, 0.0f32);
    for dy in -r..=r {
        for dx in -r..=r {
            if dx * dx + dy * dy > r * r {
                continue;
            }
            let v = level
                .smoothed
                .get_pixel((cx as i32 + dx) as u32, (cy as i32 + dy) as u32)[0]
                as f32;
            m10 += dx as f32 * v;
            m01 += dy as f32 * v;
        }
    }
    m01.atan2(m10)
}

fn patch_offsets() -> impl Iterator<Item = (f32, f32)> {
    let r = PATCH_RADIUS as i32;
    (-r..=r).step_by(PATCH_STEP).flat_map(move |dy| {
        (-r..=r)
            .step_by(PATCH_STEP)
            .map(move |dx| (dx as f32, dy as f32))
    })
}

/// Samples the patch offset `(u, v)` in the keypoint's rotated frame.
fn steered(level: &Level, kp: &Keypoint, u: f32, v: f32) -> f32 {
    let (cx, cy) = kp.local(level);
    let (sin, cos) = kp.angle.sin_cos();
    level.sample(cx + u * cos - v * sin, cy + u * sin + v * cos)
}

/// Samples the oriented patch around `kp`. Returns `None` for flat patches.
pub fn describe(level: &Level, kp: &Keypoint) -> Option<Vec<f32>> {
    let mut values: Vec<f32> = patch_offsets()
        .map(|(u, v)| steered(level, kp, u, v))
        .collect();

    let mean = values.iter().sum::<f32>() / values.len() as f32;
    values.iter_mut().for_each(|v| *v -= mean);
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm < 1e-3 {
        return None;
    }
    values.iter_mut().for_each(|v| *v /= norm);
    Some(values)
}

pub fn extract_features(image: &GrayImage, detector: &Detector) -> Vec<Feature> {
    let pyramid = detector.pyramid(image);
    detector
        .keypoints(&pyramid)
        .into_iter()
        .filter_map(|keypoint| {
            describe(&pyramid[keypoint.level], &keypoint).map(|descriptor| Feature {
                keypoint,
                descriptor,
            })
        })
        .collect()
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Nearest-neighbour matching with Lowe's ratio test.
///
/// The second neighbour is taken among features away from the best one, so
/// the same corner found on two pyramid levels does not reject itself.
pub fn ratio_matches(query: &[Feature], train: &[Feature], ratio: f32) -> Vec<FeatureMatch> {
    if train.len() < 2 {
        return Vec::new();
    }
    let ratio_sq = ratio * ratio;

    query
        .iter()
        .enumerate()
        .filter_map(|(qi, q)| {
            let (best, ti) = train
                .iter()
                .enumerate()
                .map(|(ti, t)| (squared_distance(&q.descriptor, &t.descriptor), ti))
                .min_by(|a, b| a.0.total_cmp(&b.0))?;

            let anchor = &train[ti].keypoint;
            let radius_sq = (anchor.size / 2.0).powi(2);
            let second = train
                .iter()
                .filter(|t| t.keypoint.distance_sq(anchor) > radius_sq)
                .map(|t| squared_distance(&q.descriptor, &t.descriptor))
                .fold(f32::INFINITY, f32::min);

            (best < ratio_sq * second).then(|| FeatureMatch {
                query: qi,
                train: ti,
                distance: best.sqrt(),
            })
        })
        .collect()
}

fn binary_tests() -> &'static [(f32, f32, f32, f32)] {
    static TESTS: OnceLock<Vec<(f32, f32, f32, f32)>> = OnceLock::new();
    TESTS.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(BINARY_SEED);
        let r = PATCH_RADIUS as i32;
        (0..BINARY_TESTS)
            .map(|_| {
                (
                    rng.gen_range(-r..=r) as f32,
                    rng.gen_range(-r..=r) as f32,
                    rng.gen_range(-r..=r) as f32,
                    rng.gen_range(-r..=r) as f32,
                )
            })
            .collect()
    })
}

pub fn extract_binary_features(image: &GrayImage, detector: &Detector) -> Vec<BinaryFeature> {
    let pyramid = detector.pyramid(image);
    detector
        .keypoints(&pyramid)
        .into_iter()
        .map(|keypoint| {
            let level = &pyramid[keypoint.level];
            let mut bits = [0u64; BINARY_TESTS / 64];
            for (i, &(x1, y1, x2, y2)) in binary_tests().iter().enumerate() {
                if steered(level, &keypoint, x1, y1) < steered(level, &keypoint, x2, y2) {
                    bits[i / 64] |= 1 << (i % 64);
                }
            }
            BinaryFeature { keypoint, bits }
        })
        .collect()
}

fn hamming(a: &[u64], b: &[u64]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

fn nearest_binary(from: &BinaryFeature, to: &[BinaryFeature]) -> Option<(usize, u32)> {
    to.iter()
        .enumerate()
        .map(|(i, f)| (i, hamming(&from.bits, &f.bits)))
        .min_by_key(|&(i, d)| (d, i))
}

/// Brute-force Hamming matching with cross-check, best `keep` by distance.
pub fn cross_checked_matches(
    query: &[BinaryFeature],
    train: &[BinaryFeature],
    keep: usize,
) -> Vec<FeatureMatch> {
    let mut matches: Vec<FeatureMatch> = query
        .iter()
        .enumerate()
        .filter_map(|(qi, q)| {
            let (ti, distance) = nearest_binary(q, train)?;
            let (back, _) = nearest_binary(&train[ti], query)?;
            (back == qi).then_some(FeatureMatch {
                query: qi,
                train: ti,
                distance: distance as f32,
            })
        })
        .collect();

    matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    matches.truncate(keep);
    matches
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;
    use std::f32::consts::FRAC_PI_2;

    /// Deterministic blocky texture: square cells of pseudo-random gray.
    pub(crate) fn block_texture(width: u32, height: u32, cell: u32, seed: u64) -> GrayImage {
        let cols = width.div_ceil(cell);
        let mut rng = StdRng::seed_from_u64(seed);
        let levels: Vec<u8> = (0..(cols * height.div_ceil(cell)))
            .map(|_| rng.gen_range(0..=255))
            .collect();
        GrayImage::from_fn(width, height, |x, y| {
            Luma([levels[((y / cell) * cols + x / cell) as usize]])
        })
    }

    fn detector() -> Detector {
        Detector {
            threshold: 20,
            max_keypoints: 4000,
            levels: 8,
            scale_factor: 1.2,
        }
    }

    fn feature_at(x: f32, y: f32, descriptor: Vec<f32>) -> Feature {
        Feature {
            keypoint: Keypoint {
                x,
                y,
                size: PATCH_RADIUS,
                angle: 0.0,
                score: 1.0,
                level: 0,
            },
            descriptor,
        }
    }

    #[test]
    fn test_flat_image_has_no_keypoints() {
        let img = GrayImage::from_pixel(64, 64, Luma([128]));
        let d = detector();
        assert!(d.keypoints(&d.pyramid(&img)).is_empty());
    }

    #[test]
    fn test_pyramid_stops_at_patch_size() {
        let d = detector();
        let img = GrayImage::new(40, 40);
        let pyramid = d.pyramid(&img);
        // 40, 33, 28; the next level (23 px) cannot hold a patch
        assert_eq!(pyramid.len(), 3);
        assert_eq!(pyramid[1].image.dimensions(), (33, 33));
        assert!((pyramid[2].scale_x - 40.0 / 28.0).abs() < 1e-6);

        let flat = Detector {
            scale_factor: 1.0,
            ..d
        };
        assert_eq!(flat.pyramid(&img).len(), 1);
    }

    #[test]
    fn test_keypoints_respect_border_and_cap() {
        let img = block_texture(160, 160, 8, 7);
        let d = Detector {
            max_keypoints: usize::MAX,
            ..detector()
        };
        let pyramid = d.pyramid(&img);
        let all = d.keypoints(&pyramid);
        assert!(!all.is_empty());
        assert!(all.iter().any(|kp| kp.level > 0));
        for kp in &all {
            let level = &pyramid[kp.level];
            let (lx, ly) = kp.local(level);
            let (w, h) = level.image.dimensions();
            assert!(lx >= BORDER as f32 - 0.01 && lx < (w - BORDER) as f32 + 0.01);
            assert!(ly >= BORDER as f32 - 0.01 && ly < (h - BORDER) as f32 + 0.01);
        }
        for pair in all.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }

        let capped = Detector {
            max_keypoints: 5,
            ..detector()
        };
        assert_eq!(capped.keypoints(&pyramid).len(), 5.min(all.len()));
    }

    #[test]
    fn test_orientation_points_to_bright_side() {
        let d = Detector {
            levels: 1,
            ..detector()
        };
        let right = GrayImage::from_fn(41, 41, |x, _| Luma([if x > 20 { 200 } else { 50 }]));
        let angle = orientation(&d.pyramid(&right)[0], 20, 20);
        assert!(angle.abs() < 0.05, "angle {}", angle);

        let below = GrayImage::from_fn(41, 41, |_, y| Luma([if y > 20 { 200 } else { 50 }]));
        let angle = orientation(&d.pyramid(&below)[0], 20, 20);
        assert!((angle - FRAC_PI_2).abs() < 0.05, "angle {}", angle);
    }

    #[test]
    fn test_descriptor_normalised() {
        let img = block_texture(64, 64, 8, 3);
        let d = Detector {
            levels: 1,
            ..detector()
        };
        let pyramid = d.pyramid(&img);
        let kp = Keypoint {
            x: 32.0,
            y: 32.0,
            size: PATCH_RADIUS,
            angle: 0.3,
            score: 0.0,
            level: 0,
        };
        let desc = describe(&pyramid[0], &kp).unwrap();
        assert_eq!(desc.len(), 81);
        let mean: f32 = desc.iter().sum::<f32>() / desc.len() as f32;
        let norm: f32 = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!(mean.abs() < 1e-4);
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_ratio_matches_identical_sets() {
        let img = block_texture(128, 128, 8, 11);
        let features = extract_features(&img, &detector());
        assert!(features.len() >= 10);
        let matches = ratio_matches(&features, &features, 0.7);
        assert!(matches.len() >= features.len() / 2);
        for m in matches {
            assert_eq!(m.query, m.train);
        }
    }

    #[test]
    fn test_ratio_test_ignores_nearby_duplicates() {
        let query = vec![feature_at(10.0, 10.0, vec![1.0, 0.0])];

        // Same descriptor at two distant places is ambiguous
        let distant = vec![
            feature_at(50.0, 50.0, vec![1.0, 0.0]),
            feature_at(150.0, 50.0, vec![0.99, 0.01]),
        ];
        assert!(ratio_matches(&query, &distant, 0.7).is_empty());

        // The same corner seen twice is not
        let duplicate = vec![
            feature_at(50.0, 50.0, vec![1.0, 0.0]),
            feature_at(51.0, 51.0, vec![0.99, 0.01]),
            feature_at(150.0, 50.0, vec![0.0, 1.0]),
        ];
        let matches = ratio_matches(&query, &duplicate, 0.7);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].train, 0);
    }

    #[test]
    fn test_binary_cross_check_identical_sets() {
        let img = block_texture(128, 128, 8, 11);
        let features = extract_binary_features(&img, &detector());
        let matches = cross_checked_matches(&features, &features, 50);
        assert!(!matches.is_empty());
        assert!(matches.len() <= 50);
        assert!(matches.iter().all(|m| m.distance == 0.0));
    }

    #[test]
    fn test_hamming() {
        assert_eq!(hamming(&[0b1011, 0], &[0b0001, 1]), 3);
    }
}
