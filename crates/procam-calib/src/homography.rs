//! Robust homography fitting between camera and projector pixels.

use crate::CalibrationError;
use nalgebra::Point2;
use procam_core::{
    estimate_homography, homography_from_4pt, ransac, CameraModel, Estimator, Homography,
    RansacOptions,
};
use procam_graycode::CorrespondenceDataSet;
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// RANSAC adapter: 4-point minimal solve, normalised DLT on the inliers.
struct PointPairs;

impl Estimator for PointPairs {
    type Datum = (Point2<f64>, Point2<f64>);
    type Model = Homography;

    const MIN_SAMPLES: usize = 4;

    fn fit(data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model> {
        let src = [0, 1, 2, 3].map(|k| data[sample[k]].0);
        let dst = [0, 1, 2, 3].map(|k| data[sample[k]].1);
        homography_from_4pt(&src, &dst).filter(Homography::is_well_conditioned)
    }

    fn residual(model: &Self::Model, datum: &Self::Datum) -> f64 {
        let r = (model.apply(datum.0) - datum.1).norm();
        if r.is_finite() {
            r
        } else {
            f64::INFINITY
        }
    }

    fn refit(data: &[Self::Datum], inliers: &[usize]) -> Option<Self::Model> {
        let (src, dst): (Vec<_>, Vec<_>) = inliers.iter().map(|&i| data[i]).unzip();
        estimate_homography(&src, &dst)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomographyParams {
    pub ransac: RansacOptions,
    /// Use every n-th active pixel of a data set.
    pub sample_stride: usize,
    /// Undistort camera pixels through the camera model before fitting.
    pub undistort_source: bool,
}

impl Default for HomographyParams {
    fn default() -> Self {
        Self {
            ransac: RansacOptions::default(),
            sample_stride: 1,
            undistort_source: false,
        }
    }
}

/// Neighbourhood fit used to refine a single board corner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalHomographyParams {
    /// Camera-pixel radius of the neighbourhood.
    pub search_radius: f64,
    pub min_points: usize,
    pub ransac: RansacOptions,
}

impl Default for LocalHomographyParams {
    fn default() -> Self {
        Self {
            search_radius: 3.0,
            min_points: 6,
            ransac: RansacOptions {
                max_iters: 200,
                thresh: 1.0,
                ..RansacOptions::default()
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HomographyFit {
    pub homography: Homography,
    pub inliers: Vec<usize>,
    /// RMS transfer error over the inliers, in destination pixels.
    pub rms: f64,
}

#[derive(Clone, Debug, Default)]
pub struct HomographyEstimator {
    pub params: HomographyParams,
}

impl HomographyEstimator {
    pub fn new(params: HomographyParams) -> Self {
        Self { params }
    }

    /// Robustly fit `dst ~ H * src`.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, src, dst), fields(points = src.len()))
    )]
    pub fn fit(
        &self,
        src: &[Point2<f64>],
        dst: &[Point2<f64>],
    ) -> Result<HomographyFit, CalibrationError> {
        if src.len() != dst.len() {
            return Err(CalibrationError::InvalidInput(format!(
                "homography needs equal point counts (src {}, dst {})",
                src.len(),
                dst.len()
            )));
        }
        if src.len() < PointPairs::MIN_SAMPLES {
            return Err(CalibrationError::InsufficientData {
                what: "homography point pairs",
                needed: PointPairs::MIN_SAMPLES,
                got: src.len(),
            });
        }

        let pairs: Vec<_> = src.iter().copied().zip(dst.iter().copied()).collect();
        let result = ransac::<PointPairs>(&pairs, &self.params.ransac);
        let homography = result
            .model
            .filter(|h| h.h.iter().all(|v| v.is_finite()))
            .filter(Homography::is_well_conditioned)
            .ok_or_else(|| {
                CalibrationError::SolverDiverged(format!(
                    "no homography consensus among {} pairs",
                    pairs.len()
                ))
            })?;

        log::debug!(
            "homography: {}/{} inliers, rms {:.3} px after {} iterations",
            result.inliers.len(),
            pairs.len(),
            result.inlier_rms,
            result.iters
        );
        Ok(HomographyFit {
            homography,
            inliers: result.inliers,
            rms: result.inlier_rms,
        })
    }

    /// Fit camera pixels to projector pixels over the active pixels of a scan.
    pub fn fit_data_set(
        &self,
        data_set: &CorrespondenceDataSet,
        camera: Option<&CameraModel>,
    ) -> Result<HomographyFit, CalibrationError> {
        let stride = self.params.sample_stride.max(1);
        let undistort = camera.filter(|_| self.params.undistort_source);
        let (src, dst): (Vec<_>, Vec<_>) = data_set
            .active_pixels()
            .step_by(stride)
            .map(|(c, p)| {
                let c = Point2::new(c.x as f64, c.y as f64);
                let c = match undistort {
                    Some(model) => model.undistort_pixel(&c),
                    None => c,
                };
                (c, Point2::new(p.x as f64, p.y as f64))
            })
            .unzip();
        self.fit(&src, &dst)
    }
}

/// Sub-pixel projector coordinate of a camera-space board corner.
///
/// Fits a homography on the decoded pixels within `search_radius` of
/// `corner` and maps the corner through it. `None` means the corner should
/// be dropped: too few neighbours or no stable local fit.
pub fn local_projector_point(
    data_set: &CorrespondenceDataSet,
    corner: Point2<f64>,
    params: &LocalHomographyParams,
) -> Option<Point2<f64>> {
    let r2 = params.search_radius * params.search_radius;
    let pairs: Vec<_> = data_set
        .pixels_in_window(corner, params.search_radius)
        .map(|(c, p)| {
            (
                Point2::new(c.x as f64, c.y as f64),
                Point2::new(p.x as f64, p.y as f64),
            )
        })
        .filter(|(c, _)| (c - corner).norm_squared() <= r2)
        .collect();
    if pairs.len() < params.min_points.max(PointPairs::MIN_SAMPLES) {
        return None;
    }

    let result = ransac::<PointPairs>(&pairs, &params.ransac);
    let mapped = result.model?.apply(corner);
    (mapped.x.is_finite() && mapped.y.is_finite()).then_some(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    fn truth() -> Homography {
        Homography::new(Matrix3::new(
            1.1, 0.05, 12.0, //
            -0.03, 0.95, -7.0, //
            1e-4, -5e-5, 1.0,
        ))
    }

    fn grid() -> Vec<Point2<f64>> {
        (0..8)
            .flat_map(|j| {
                (0..10).map(move |i| Point2::new(i as f64 * 40.0, j as f64 * 35.0))
            })
            .collect()
    }

    #[test]
    fn recovers_known_homography_with_outliers() {
        let src = grid();
        let mut dst: Vec<_> = src.iter().map(|p| truth().apply(*p)).collect();
        for k in [3, 17, 40, 66] {
            dst[k].x += 80.0;
        }
        let fit = HomographyEstimator::default().fit(&src, &dst).unwrap();
        assert!(fit.homography.approx_eq(&truth(), 1e-6));
        assert_eq!(fit.inliers.len(), src.len() - 4);
    }

    #[test]
    fn reverse_fit_is_the_inverse() {
        let src = grid();
        let dst: Vec<_> = src.iter().map(|p| truth().apply(*p)).collect();
        let est = HomographyEstimator::default();
        let fwd = est.fit(&src, &dst).unwrap().homography;
        let back = est.fit(&dst, &src).unwrap().homography;
        let inv = fwd.inverse().unwrap();
        let p = Point2::new(123.0, 77.0);
        let a = back.apply(p);
        let b = inv.apply(p);
        assert_relative_eq!(a.x, b.x, epsilon = 1e-6);
        assert_relative_eq!(a.y, b.y, epsilon = 1e-6);
    }

    #[test]
    fn too_few_pairs_is_an_error() {
        let pts = vec![Point2::new(0.0, 0.0); 3];
        let err = HomographyEstimator::default().fit(&pts, &pts).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InsufficientData { got: 3, .. }
        ));
        let err = HomographyEstimator::default()
            .fit(&pts, &pts[..2])
            .unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidInput(_)));
    }

    #[test]
    fn coincident_points_do_not_default_to_identity() {
        let pts = vec![Point2::new(5.0, 5.0); 10];
        let err = HomographyEstimator::default().fit(&pts, &pts).unwrap_err();
        assert!(matches!(err, CalibrationError::SolverDiverged(_)));
    }
}
