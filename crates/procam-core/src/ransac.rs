//! Model-agnostic RANSAC.
//!
//! Implement [`Estimator`] for a model and call [`ransac`]. A run that finds no
//! consensus reports `model == None` instead of failing loudly; callers decide
//! which error that maps to.

use rand::prelude::IndexedRandom;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacOptions {
    pub max_iters: usize,
    /// Inlier residual threshold, in the units of [`Estimator::residual`].
    pub thresh: f64,
    pub min_inliers: usize,
    /// Target probability of drawing at least one all-inlier sample.
    pub confidence: f64,
    pub seed: u64,
    pub refit_on_inliers: bool,
}

impl Default for RansacOptions {
    fn default() -> Self {
        Self {
            max_iters: 1000,
            thresh: 3.0,
            min_inliers: 4,
            confidence: 0.995,
            seed: 0x5eed_0f_9a11,
            refit_on_inliers: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacResult<M> {
    pub model: Option<M>,
    pub inliers: Vec<usize>,
    /// RMS residual over the inliers.
    pub inlier_rms: f64,
    pub iters: usize,
}

impl<M> Default for RansacResult<M> {
    fn default() -> Self {
        Self {
            model: None,
            inliers: Vec::new(),
            inlier_rms: f64::INFINITY,
            iters: 0,
        }
    }
}

pub trait Estimator {
    type Datum;
    type Model;

    const MIN_SAMPLES: usize;

    /// Fit from a subset; `None` when the subset is degenerate.
    fn fit(data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model>;

    /// Non-negative residual in the same units as `RansacOptions::thresh`.
    fn residual(model: &Self::Model, datum: &Self::Datum) -> f64;

    fn refit(data: &[Self::Datum], inliers: &[usize]) -> Option<Self::Model> {
        Self::fit(data, inliers)
    }
}

fn rms(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return f64::INFINITY;
    }
    (vals.iter().map(|v| v * v).sum::<f64>() / vals.len() as f64).sqrt()
}

fn required_iterations(
    confidence: f64,
    inlier_ratio: f64,
    min_samples: usize,
    cap: usize,
) -> usize {
    if confidence <= 0.0 || inlier_ratio <= 0.0 {
        return cap;
    }
    let denom = (1.0 - inlier_ratio.powi(min_samples as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return cap;
    }
    let n = ((1.0 - confidence.min(1.0 - 1e-12)).ln() / denom).ceil();
    (n.max(1.0) as usize).min(cap)
}

fn score<E: Estimator>(
    data: &[E::Datum],
    model: &E::Model,
    thresh: f64,
    inliers: &mut Vec<usize>,
    residuals: &mut Vec<f64>,
) {
    inliers.clear();
    residuals.clear();
    for (i, datum) in data.iter().enumerate() {
        let r = E::residual(model, datum);
        if r <= thresh {
            inliers.push(i);
            residuals.push(r);
        }
    }
}

/// Run RANSAC with a seeded RNG; identical inputs give identical results.
pub fn ransac<E: Estimator>(data: &[E::Datum], opts: &RansacOptions) -> RansacResult<E::Model> {
    let mut best: RansacResult<E::Model> = RansacResult::default();
    if data.len() < E::MIN_SAMPLES {
        return best;
    }

    let all: Vec<usize> = (0..data.len()).collect();
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut budget = opts.max_iters;
    let mut inliers = Vec::new();
    let mut residuals = Vec::new();

    let mut iter = 0;
    while iter < budget {
        iter += 1;
        let sample: Vec<usize> = all
            .choose_multiple(&mut rng, E::MIN_SAMPLES)
            .copied()
            .collect();

        let Some(mut model) = E::fit(data, &sample) else {
            continue;
        };
        score::<E>(data, &model, opts.thresh, &mut inliers, &mut residuals);
        if inliers.len() < opts.min_inliers.max(E::MIN_SAMPLES) {
            continue;
        }

        if opts.refit_on_inliers {
            if let Some(refined) = E::refit(data, &inliers) {
                let mut r_inliers = Vec::new();
                let mut r_residuals = Vec::new();
                score::<E>(
                    data,
                    &refined,
                    opts.thresh,
                    &mut r_inliers,
                    &mut r_residuals,
                );
                if r_inliers.len() >= inliers.len() {
                    model = refined;
                    inliers = r_inliers;
                    residuals = r_residuals;
                }
            }
        }

        let current_rms = rms(&residuals);
        let better = best.model.is_none()
            || inliers.len() > best.inliers.len()
            || (inliers.len() == best.inliers.len() && current_rms < best.inlier_rms);
        if better {
            best.model = Some(model);
            best.inliers = inliers.clone();
            best.inlier_rms = current_rms;
            best.iters = iter;

            let ratio = inliers.len() as f64 / data.len() as f64;
            budget = required_iterations(opts.confidence, ratio, E::MIN_SAMPLES, opts.max_iters)
                .max(iter);
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    /// y = a x + b through two samples.
    struct LineEstimator;

    impl Estimator for LineEstimator {
        type Datum = (f64, f64);
        type Model = (f64, f64);
        const MIN_SAMPLES: usize = 2;

        fn fit(data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model> {
            let n = sample.len() as f64;
            let (sx, sy, sxx, sxy) = sample.iter().fold((0.0, 0.0, 0.0, 0.0), |acc, &i| {
                let (x, y) = data[i];
                (acc.0 + x, acc.1 + y, acc.2 + x * x, acc.3 + x * y)
            });
            let det = n * sxx - sx * sx;
            if det.abs() < 1e-12 {
                return None;
            }
            let a = (n * sxy - sx * sy) / det;
            Some((a, (sy - a * sx) / n))
        }

        fn residual(model: &Self::Model, datum: &Self::Datum) -> f64 {
            (model.0 * datum.0 + model.1 - datum.1).abs()
        }
    }

    #[test]
    fn finds_line_despite_outliers() {
        let mut data: Vec<(f64, f64)> = (0..40).map(|i| (i as f64, 2.0 * i as f64 + 1.0)).collect();
        data.extend([(3.0, 90.0), (7.0, -40.0), (20.0, 5.0), (33.0, 300.0)]);

        let opts = RansacOptions {
            thresh: 0.5,
            min_inliers: 10,
            ..RansacOptions::default()
        };
        let res = ransac::<LineEstimator>(&data, &opts);
        let (a, b) = res.model.expect("consensus");
        assert!((a - 2.0).abs() < 1e-9 && (b - 1.0).abs() < 1e-9);
        assert_eq!(res.inliers.len(), 40);
    }

    #[test]
    fn too_little_data_yields_no_model() {
        let res = ransac::<LineEstimator>(&[(0.0, 0.0)], &RansacOptions::default());
        assert!(res.model.is_none());
    }
}
