//! Homography estimation: normalised DLT inside a RANSAC loop.

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;

pub type Point = (f64, f64);

const SAMPLE_SIZE: usize = 4;
const RANSAC_SEED: u64 = 0x4f6d_6174;

#[derive(Debug, Clone)]
pub struct RansacFit {
    pub homography: Matrix3<f64>,
    pub inliers: Vec<usize>,
}

/// Applies `h` to a point. `None` when the point maps to infinity.
pub fn project(h: &Matrix3<f64>, (x, y): Point) -> Option<Point> {
    let p = h * Vector3::new(x, y, 1.0);
    if p.z.abs() < 1e-12 {
        return None;
    }
    Some((p.x / p.z, p.y / p.z))
}

/// Similarity transform moving the centroid to the origin with mean distance sqrt(2).
fn normalizing_transform(points: &[Point]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-9 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0))
}

fn apply(t: &Matrix3<f64>, points: &[Point]) -> Vec<Point> {
    points
        .iter()
        .map(|&(x, y)| (t[(0, 0)] * x + t[(0, 2)], t[(1, 1)] * y + t[(1, 2)]))
        .collect()
}

fn is_collinear(a: Point, b: Point, c: Point) -> bool {
    let area = (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0);
    area.abs() < 1e-6
}

fn has_collinear_triple(points: &[Point]) -> bool {
    let n = points.len();
    for i in 0..n {
        for j in (i + 1)..n {
            for k in (j + 1)..n {
                if is_collinear(points[i], points[j], points[k]) {
                    return true;
                }
            }
        }
    }
    false
}

/// Direct linear transform over `src -> dst` (at least 4 pairs).
pub fn fit_dlt(src: &[Point], dst: &[Point]) -> Option<Matrix3<f64>> {
    if src.len() != dst.len() || src.len() < SAMPLE_SIZE {
        return None;
    }
    let t_src = normalizing_transform(src)?;
    let t_dst = normalizing_transform(dst)?;
    let src_n = apply(&t_src, src);
    let dst_n = apply(&t_dst, dst);
    if src.len() == SAMPLE_SIZE && (has_collinear_triple(&src_n) || has_collinear_triple(&dst_n)) {
        return None;
    }

    // Accumulate AᵀA; its smallest eigenvector is the least-squares solution
    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (&(x, y), &(u, v)) in src_n.iter().zip(&dst_n) {
        let rows = [
            SVector::<f64, 9>::from_row_slice(&[-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u]),
            SVector::<f64, 9>::from_row_slice(&[0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v]),
        ];
        for row in &rows {
            ata += row * row.transpose();
        }
    }

    let eigen = ata.symmetric_eigen();
    let (min_idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = eigen.eigenvectors.column(min_idx);
    let h_n = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let mut homography = t_dst.try_inverse()? * h_n * t_src;
    let scale = homography[(2, 2)];
    if scale.abs() < 1e-12 {
        return None;
    }
    homography /= scale;
    if homography.determinant().abs() < 1e-9 {
        return None;
    }
    Some(homography)
}

fn reprojection_error(h: &Matrix3<f64>, src: Point, dst: Point) -> f64 {
    match project(h, src) {
        Some((x, y)) => ((x - dst.0).powi(2) + (y - dst.1).powi(2)).sqrt(),
        None => f64::INFINITY,
    }
}

fn inliers_of(h: &Matrix3<f64>, src: &[Point], dst: &[Point], threshold: f64) -> Vec<usize> {
    (0..src.len())
        .filter(|&i| reprojection_error(h, src[i], dst[i]) <= threshold)
        .collect()
}

/// Robust fit: random minimal samples, keep the largest consensus, refit on it.
///
/// Seeded, so the same correspondences always give the same result.
pub fn ransac(src: &[Point], dst: &[Point], threshold: f64, iterations: usize) -> Option<RansacFit> {
    let n = src.len();
    if n != dst.len() || n < SAMPLE_SIZE {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(RANSAC_SEED);
    let mut best: Option<(Matrix3<f64>, Vec<usize>)> = None;

    for _ in 0..iterations.max(1) {
        let sample = rand::seq::index::sample(&mut rng, n, SAMPLE_SIZE);
        let s: Vec<Point> = sample.iter().map(|i| src[i]).collect();
        let d: Vec<Point> = sample.iter().map(|i| dst[i]).collect();
        let Some(h) = fit_dlt(&s, &d) else {
            continue;
        };

        let inliers = inliers_of(&h, src, dst, threshold);
        if best.as_ref().is_none_or(|(_, b)| inliers.len() > b.len()) {
            let done = inliers.len() == n;
            best = Some((h, inliers));
            if done {
                break;
            }
        }
    }

    let (mut homography, mut inliers) = best?;
    if inliers.len() < SAMPLE_SIZE {
        return None;
    }

    let s: Vec<Point> = inliers.iter().map(|&i| src[i]).collect();
    let d: Vec<Point> = inliers.iter().map(|&i| dst[i]).collect();
    if let Some(refined) = fit_dlt(&s, &d) {
        let refined_inliers = inliers_of(&refined, src, dst, threshold);
        if refined_inliers.len() >= inliers.len() {
            homography = refined;
            inliers = refined_inliers;
        }
    }

    Some(RansacFit {
        homography,
        inliers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Vec<Point> {
        let mut pts = Vec::new();
        for y in 0..5 {
            for x in 0..5 {
                pts.push((x as f64 * 20.0 + 3.0, y as f64 * 15.0 + 7.0));
            }
        }
        pts
    }

    #[test]
    fn test_dlt_recovers_translation() {
        let src = grid();
        let dst: Vec<Point> = src.iter().map(|&(x, y)| (x + 200.0, y + 100.0)).collect();
        let h = fit_dlt(&src, &dst).unwrap();
        let (x, y) = project(&h, (0.0, 0.0)).unwrap();
        assert!((x - 200.0).abs() < 1e-6);
        assert!((y - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_dlt_recovers_perspective() {
        let truth = Matrix3::new(1.1, 0.05, 30.0, -0.02, 0.95, 12.0, 0.0004, 0.0002, 1.0);
        let src = grid();
        let dst: Vec<Point> = src.iter().map(|&p| project(&truth, p).unwrap()).collect();
        let h = fit_dlt(&src[..4], &dst[..4]);
        // The first four grid points are collinear
        assert!(h.is_none());

        let h = fit_dlt(&src, &dst).unwrap();
        for &p in &src {
            let a = project(&h, p).unwrap();
            let b = project(&truth, p).unwrap();
            assert!((a.0 - b.0).abs() < 1e-6 && (a.1 - b.1).abs() < 1e-6);
        }
    }

    #[test]
    fn test_ransac_rejects_outliers() {
        let src = grid();
        let mut dst: Vec<Point> = src.iter().map(|&(x, y)| (x * 0.5 + 40.0, y * 0.5 + 10.0)).collect();
        dst[3] = (500.0, 500.0);
        dst[11] = (0.0, 900.0);
        dst[20] = (-50.0, 3.0);

        let fit = ransac(&src, &dst, 5.0, 500).unwrap();
        assert_eq!(fit.inliers.len(), src.len() - 3);
        assert!(!fit.inliers.contains(&3));
        assert!(!fit.inliers.contains(&11));
        let (x, y) = project(&fit.homography, (100.0, 100.0)).unwrap();
        assert!((x - 90.0).abs() < 1e-3);
        assert!((y - 60.0).abs() < 1e-3);
    }

    #[test]
    fn test_ransac_needs_four_points() {
        let pts = vec![(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)];
        assert!(ransac(&pts, &pts, 5.0, 10).is_none());
    }
}
