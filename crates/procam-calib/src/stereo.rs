//! Relative pose of two calibrated cameras and triangulation through them.

use crate::board::{detect, intersect_observations, BoardDetector, BoardObservation, FindBoardMode};
use crate::capture::{CaptureId, CaptureSet};
use crate::epipolar::{
    correct_match, essential_from_pose, fundamental_from_essential, stereo_rectify, Rectification,
};
use crate::intrinsics::MIN_POINTS_PER_CAPTURE;
use crate::CalibrationError;
use nalgebra::{DVector, Matrix3, Point2, Point3, Vector3};
use procam_core::{
    projection_from_pose, solve_lm, solve_pnp, triangulate_point, CameraModel, Distortion,
    GrayImageView, LeastSquaresProblem, RigidTransform, SolveOptions,
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Intrinsics (when known) and placement of one camera of the pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraView {
    pub model: Option<CameraModel>,
    /// `world_from_camera`.
    pub pose: RigidTransform,
}

impl CameraView {
    pub fn new(model: CameraModel, pose: RigidTransform) -> Self {
        Self {
            model: Some(model),
            pose,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoParams {
    /// Keep both camera models as given; otherwise refine `fx, fy, cx, cy`
    /// and `k1, k2, p1, p2, k3` of both cameras in the joint solve.
    pub fix_intrinsics: bool,
    pub solve: SolveOptions,
}

impl Default for StereoParams {
    fn default() -> Self {
        Self {
            fix_intrinsics: true,
            solve: SolveOptions::default(),
        }
    }
}

/// Board corners seen by both cameras, in matching order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StereoCapture {
    pub a: BoardObservation,
    pub b: BoardObservation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StereoSolution {
    /// Maps camera A coordinates into camera B coordinates.
    pub b_from_a: RigidTransform,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub essential: Matrix3<f64>,
    pub fundamental: Matrix3<f64>,
    pub rectification: Rectification,
    /// RMS over every corner in both images, in pixels.
    pub reprojection_error: f64,
    pub capture_count: usize,
}

const POSE: usize = 6;
const INTRINSICS: usize = 9;

fn pose_at(x: &DVector<f64>, offset: usize) -> RigidTransform {
    RigidTransform::from_rvec_tvec(
        Vector3::new(x[offset], x[offset + 1], x[offset + 2]),
        Vector3::new(x[offset + 3], x[offset + 4], x[offset + 5]),
    )
}

fn write_pose(x: &mut DVector<f64>, offset: usize, pose: &RigidTransform) {
    x.rows_mut(offset, 3).copy_from(&pose.rvec());
    x.rows_mut(offset + 3, 3).copy_from(&pose.tvec());
}

fn intrinsics_of(camera: &CameraModel) -> [f64; INTRINSICS] {
    let d = &camera.distortion;
    [
        camera.fx, camera.fy, camera.cx, camera.cy, d.k1, d.k2, d.p1, d.p2, d.k3,
    ]
}

fn with_intrinsics(base: &CameraModel, p: &[f64]) -> CameraModel {
    let d = Distortion {
        k1: p[4],
        k2: p[5],
        p1: p[6],
        p2: p[7],
        k3: p[8],
        ..base.distortion
    };
    CameraModel::new(base.image_size, p[0], p[1], p[2], p[3]).with_distortion(d)
}

/// Parameters: `b_from_a`, then `a_from_board` per capture, then (unless
/// fixed) the intrinsics of A and of B.
struct StereoProblem<'a> {
    captures: &'a [&'a StereoCapture],
    camera_a: CameraModel,
    camera_b: CameraModel,
    refine_intrinsics: bool,
    residual_count: usize,
}

impl StereoProblem<'_> {
    fn intrinsics_offset(&self) -> usize {
        POSE * (1 + self.captures.len())
    }

    fn cameras(&self, x: &DVector<f64>) -> (CameraModel, CameraModel) {
        if !self.refine_intrinsics {
            return (self.camera_a, self.camera_b);
        }
        let o = self.intrinsics_offset();
        let s = x.as_slice();
        (
            with_intrinsics(&self.camera_a, &s[o..o + INTRINSICS]),
            with_intrinsics(&self.camera_b, &s[o + INTRINSICS..o + 2 * INTRINSICS]),
        )
    }
}

impl LeastSquaresProblem for StereoProblem<'_> {
    fn num_params(&self) -> usize {
        self.intrinsics_offset() + if self.refine_intrinsics { 2 * INTRINSICS } else { 0 }
    }

    fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
        let (cam_a, cam_b) = self.cameras(x);
        let b_from_a = pose_at(x, 0);
        let mut r = DVector::zeros(self.residual_count);
        let mut k = 0;
        for (i, capture) in self.captures.iter().enumerate() {
            let a_from_board = pose_at(x, POSE * (1 + i));
            let b_from_board = b_from_a.compose(&a_from_board);
            let objects = capture.a.object_points();
            for ((o, ia), ib) in objects
                .iter()
                .zip(capture.a.image_points())
                .zip(capture.b.image_points())
            {
                let pa = cam_a.project_unchecked(&a_from_board.transform_point(o));
                let pb = cam_b.project_unchecked(&b_from_board.transform_point(o));
                r[k] = pa.x - ia.x;
                r[k + 1] = pa.y - ia.y;
                r[k + 2] = pb.x - ib.x;
                r[k + 3] = pb.y - ib.y;
                k += 4;
            }
        }
        r
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StereoCalibrator {
    params: StereoParams,
    cameras: [CameraView; 2],
    captures: CaptureSet<StereoCapture>,
    solution: Option<StereoSolution>,
}

impl StereoCalibrator {
    pub fn new(camera_a: CameraView, camera_b: CameraView) -> Self {
        Self {
            params: StereoParams::default(),
            cameras: [camera_a, camera_b],
            captures: CaptureSet::new(),
            solution: None,
        }
    }

    pub fn params(&self) -> &StereoParams {
        &self.params
    }

    pub fn set_params(&mut self, params: StereoParams) {
        self.params = params;
    }

    pub fn camera_a(&self) -> &CameraView {
        &self.cameras[0]
    }

    pub fn camera_b(&self) -> &CameraView {
        &self.cameras[1]
    }

    /// Replacing a camera invalidates the previous solution.
    pub fn set_camera_a(&mut self, view: CameraView) {
        self.cameras[0] = view;
        self.solution = None;
    }

    pub fn set_camera_b(&mut self, view: CameraView) {
        self.cameras[1] = view;
        self.solution = None;
    }

    pub fn captures(&self) -> &CaptureSet<StereoCapture> {
        &self.captures
    }

    pub fn remove_capture(&mut self, id: CaptureId) -> Option<StereoCapture> {
        self.captures.remove(id)
    }

    pub fn set_selected(&mut self, id: CaptureId, selected: bool) -> bool {
        self.captures.set_selected(id, selected)
    }

    pub fn clear_captures(&mut self) {
        self.captures.clear();
    }

    pub fn solution(&self) -> Option<&StereoSolution> {
        self.solution.as_ref()
    }

    pub fn essential(&self) -> Option<&Matrix3<f64>> {
        self.solution.as_ref().map(|s| &s.essential)
    }

    pub fn fundamental(&self) -> Option<&Matrix3<f64>> {
        self.solution.as_ref().map(|s| &s.fundamental)
    }

    pub fn rectification(&self) -> Option<&Rectification> {
        self.solution.as_ref().map(|s| &s.rectification)
    }

    fn models(&self) -> Result<(CameraModel, CameraModel), CalibrationError> {
        match (self.cameras[0].model, self.cameras[1].model) {
            (Some(a), Some(b)) => Ok((a, b)),
            (None, _) => Err(CalibrationError::Configuration(
                "camera A has no intrinsics".into(),
            )),
            (_, None) => Err(CalibrationError::Configuration(
                "camera B has no intrinsics".into(),
            )),
        }
    }

    /// Detect the board in both frames and keep only the common corners.
    ///
    /// The two detections run in parallel unless `mode` is interactive.
    pub fn detect_pair(
        &self,
        detector: &dyn BoardDetector,
        frame_a: &GrayImageView<'_>,
        frame_b: &GrayImageView<'_>,
        mode: FindBoardMode,
    ) -> Result<(BoardObservation, BoardObservation), CalibrationError> {
        let model_a = self.cameras[0].model.as_ref();
        let model_b = self.cameras[1].model.as_ref();
        let run_a = || detect(detector, frame_a, model_a, mode, "camera A");
        let run_b = || detect(detector, frame_b, model_b, mode, "camera B");
        let (a, b) = if mode == FindBoardMode::Assistant {
            (run_a(), run_b())
        } else {
            rayon::join(run_a, run_b)
        };
        let (a, b) = intersect_observations(&a?, &b?);
        if a.is_empty() {
            return Err(CalibrationError::DetectionFailed(
                "cameras share no board corners".into(),
            ));
        }
        Ok((a, b))
    }

    pub fn add_capture(
        &mut self,
        detector: &dyn BoardDetector,
        frame_a: &GrayImageView<'_>,
        frame_b: &GrayImageView<'_>,
        mode: FindBoardMode,
    ) -> Result<CaptureId, CalibrationError> {
        let (a, b) = self.detect_pair(detector, frame_a, frame_b, mode)?;
        self.add_observations(&a, &b)
    }

    /// Add a capture from observations detected elsewhere.
    pub fn add_observations(
        &mut self,
        a: &BoardObservation,
        b: &BoardObservation,
    ) -> Result<CaptureId, CalibrationError> {
        let (a, b) = intersect_observations(a, b);
        if a.is_empty() {
            return Err(CalibrationError::DetectionFailed(
                "cameras share no board corners".into(),
            ));
        }
        if a.len() < MIN_POINTS_PER_CAPTURE {
            log::warn!("rejecting stereo capture with {} common corners", a.len());
            return Err(CalibrationError::InsufficientData {
                what: "common corners in stereo capture",
                needed: MIN_POINTS_PER_CAPTURE,
                got: a.len(),
            });
        }
        let id = self.captures.add(StereoCapture { a, b });
        log::debug!("added stereo capture {id}");
        Ok(id)
    }

    /// Solve the pose of camera B relative to camera A.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self), fields(captures = self.captures.selected_count()))
    )]
    pub fn calibrate(&mut self) -> Result<&StereoSolution, CalibrationError> {
        let (model_a, model_b) = self.models()?;
        let captures: Vec<&StereoCapture> = self.captures.iter_selected().map(|(_, c)| c).collect();
        if captures.is_empty() {
            return Err(CalibrationError::InsufficientData {
                what: "selected stereo captures",
                needed: 1,
                got: 0,
            });
        }

        let mut a_from_board = Vec::with_capacity(captures.len());
        let mut candidates = Vec::with_capacity(captures.len());
        for c in &captures {
            let pa = solve_pnp(&model_a, c.a.object_points(), c.a.image_points())?;
            let pb = solve_pnp(&model_b, c.b.object_points(), c.b.image_points())?;
            candidates.push(pb.compose(&pa.inverse()));
            a_from_board.push(pa);
        }

        let seed_cost = |b_from_a: &RigidTransform| -> f64 {
            captures
                .iter()
                .zip(&a_from_board)
                .map(|(c, pa)| {
                    let pose = b_from_a.compose(pa);
                    c.b.object_points()
                        .iter()
                        .zip(c.b.image_points())
                        .map(|(o, i)| {
                            (model_b.project_unchecked(&pose.transform_point(o)) - i).norm_squared()
                        })
                        .sum::<f64>()
                })
                .sum()
        };
        let seed = candidates
            .iter()
            .map(|c| (c, seed_cost(c)))
            .filter(|(_, cost)| cost.is_finite())
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(c, _)| *c)
            .ok_or_else(|| {
                CalibrationError::SolverDiverged("no finite relative pose candidate".into())
            })?;

        let point_count: usize = captures.iter().map(|c| c.a.len()).sum();
        let problem = StereoProblem {
            captures: &captures,
            camera_a: model_a,
            camera_b: model_b,
            refine_intrinsics: !self.params.fix_intrinsics,
            residual_count: 4 * point_count,
        };
        let mut x0 = DVector::zeros(problem.num_params());
        write_pose(&mut x0, 0, &seed);
        for (i, pose) in a_from_board.iter().enumerate() {
            write_pose(&mut x0, POSE * (1 + i), pose);
        }
        if problem.refine_intrinsics {
            let o = problem.intrinsics_offset();
            x0.rows_mut(o, INTRINSICS)
                .copy_from_slice(&intrinsics_of(&model_a));
            x0.rows_mut(o + INTRINSICS, INTRINSICS)
                .copy_from_slice(&intrinsics_of(&model_b));
        }
        let free: Vec<usize> = (0..problem.num_params()).collect();

        let (x, report) = solve_lm(&problem, x0, &free, &self.params.solve);
        let (cam_a, cam_b) = problem.cameras(&x);
        let b_from_a = pose_at(&x, 0);
        if x.iter().any(|v| !v.is_finite()) || !cam_a.is_valid() || !cam_b.is_valid() {
            return Err(CalibrationError::SolverDiverged(
                "stereo solve produced a non-finite or invalid result".into(),
            ));
        }

        let essential = essential_from_pose(&b_from_a);
        let fundamental = fundamental_from_essential(&essential, &cam_a, &cam_b).ok_or_else(|| {
            CalibrationError::SolverDiverged("singular camera matrix".into())
        })?;
        let rectification = stereo_rectify(&cam_a, &cam_b, &b_from_a);
        let reprojection_error = (2.0 * report.final_cost / (2 * point_count) as f64).sqrt();
        let capture_count = captures.len();

        let baseline = b_from_a.tvec().norm();
        log::info!(
            "stereo calibrated from {capture_count} captures: \
             baseline {baseline:.4}, rms {reprojection_error:.4} px"
        );

        if problem.refine_intrinsics {
            self.cameras[0].model = Some(cam_a);
            self.cameras[1].model = Some(cam_b);
        }
        self.cameras[1].pose = self.cameras[0].pose.compose(&b_from_a.inverse());

        Ok(&*self.solution.insert(StereoSolution {
            b_from_a,
            rotation: b_from_a.rotation_matrix(),
            translation: b_from_a.tvec(),
            essential,
            fundamental,
            rectification,
            reprojection_error,
            capture_count,
        }))
    }

    /// World points from matching pixels of camera A and camera B.
    ///
    /// With `correct_matches`, each pair is first moved onto its epipolar
    /// lines, which needs a prior [`StereoCalibrator::calibrate`].
    pub fn triangulate(
        &self,
        points_a: &[Point2<f64>],
        points_b: &[Point2<f64>],
        correct_matches: bool,
    ) -> Result<Vec<Point3<f64>>, CalibrationError> {
        if points_a.len() != points_b.len() {
            return Err(CalibrationError::InvalidInput(format!(
                "triangulation needs equal point counts (A {}, B {})",
                points_a.len(),
                points_b.len()
            )));
        }
        let (model_a, model_b) = self.models()?;
        let fundamental = match (correct_matches, &self.solution) {
            (false, _) => None,
            (true, Some(solution)) => Some(solution.fundamental),
            (true, None) => {
                return Err(CalibrationError::Configuration(
                    "match correction needs a stereo calibration".into(),
                ))
            }
        };

        let projections = [
            projection_from_pose(&self.cameras[0].pose.inverse()),
            projection_from_pose(&self.cameras[1].pose.inverse()),
        ];
        let to_normalized = |camera: &CameraModel, p: Point2<f64>| {
            Point2::new((p.x - camera.cx) / camera.fx, (p.y - camera.cy) / camera.fy)
        };

        points_a
            .iter()
            .zip(points_b)
            .map(|(pa, pb)| -> Result<Point3<f64>, CalibrationError> {
                let mut ua = model_a.undistort_pixel(pa);
                let mut ub = model_b.undistort_pixel(pb);
                if let Some(f) = &fundamental {
                    match correct_match(f, &ua, &ub) {
                        Some((ca, cb)) => (ua, ub) = (ca, cb),
                        None => log::debug!("match correction degenerate at {ua} / {ub}"),
                    }
                }
                let observations = [to_normalized(&model_a, ua), to_normalized(&model_b, ub)];
                Ok(triangulate_point(&projections, &observations)?)
            })
            .collect()
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibrator() -> StereoCalibrator {
        let cam = CameraModel::new((640, 480), 600.0, 600.0, 320.0, 240.0);
        StereoCalibrator::new(
            CameraView::new(cam, RigidTransform::identity()),
            CameraView::new(
                cam,
                RigidTransform::from_rvec_tvec(Vector3::zeros(), Vector3::new(0.2, 0.0, 0.0)),
            ),
        )
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let cal = calibrator();
        let err = cal
            .triangulate(&[Point2::origin()], &[], false)
            .unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidInput(_)));
    }

    #[test]
    fn correction_needs_a_solution() {
        let cal = calibrator();
        let p = [Point2::new(320.0, 240.0)];
        let err = cal.triangulate(&p, &p, true).unwrap_err();
        assert!(matches!(err, CalibrationError::Configuration(_)));
    }

    #[test]
    fn missing_intrinsics_is_a_configuration_error() {
        let mut cal = calibrator();
        cal.set_camera_b(CameraView::default());
        assert!(matches!(
            cal.calibrate().unwrap_err(),
            CalibrationError::Configuration(_)
        ));
    }

    #[test]
    fn capture_without_common_corners_is_not_added() {
        let mut cal = calibrator();
        let a = BoardObservation::new(
            vec![Point2::new(1.0, 1.0)],
            vec![Point3::new(0.0, 0.0, 0.0)],
        )
        .unwrap();
        let b = BoardObservation::new(
            vec![Point2::new(1.0, 1.0)],
            vec![Point3::new(1.0, 0.0, 0.0)],
        )
        .unwrap();
        let err = cal.add_observations(&a, &b).unwrap_err();
        assert!(matches!(err, CalibrationError::DetectionFailed(_)));
        assert!(cal.captures().is_empty());
    }
}
