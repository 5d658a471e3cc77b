//! Projector intrinsics and pose from world points and their decoded
//! projector pixels.
//!
//! The projector is treated as an inverse camera: every correspondence pairs
//! a world-space board corner with the projector pixel that lit it, found by
//! fitting a local homography on a Gray-code scan around the corner.

use crate::board::{detect, BoardDetector, FindBoardMode};
use crate::bundle::{calibrate_camera, CameraCalibration, IntrinsicsFlags, View};
use crate::capture::{CaptureId, CaptureSet};
use crate::homography::{local_projector_point, LocalHomographyParams};
use crate::stereo::{CameraView, StereoCalibrator};
use crate::CalibrationError;
use nalgebra::{Point2, Point3};
use procam_core::{
    solve_pnp, CameraModel, CancelToken, GrayImageView, RigidTransform, SolveOptions,
};
use procam_graycode::{CorrespondenceDataSet, FrameSource, GraycodeScan, VideoOutput};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Smallest pool a projector solve is attempted on.
pub const MIN_CORRESPONDENCES: usize = 6;

/// Grow the training set gradually instead of fitting everything at once.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecimationPolicy {
    pub enabled: bool,
    /// The first pass keeps every `(pool / initial_divisor + 1)`-th
    /// correspondence, so roughly `initial_divisor` of them. Small divisors
    /// are widened until that pass has at least [`MIN_CORRESPONDENCES`].
    pub initial_divisor: usize,
    /// Free `k1` and `k2` in the pass that sees every correspondence.
    pub release_distortion_in_final_pass: bool,
}

impl Default for DecimationPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_divisor: 16,
            release_distortion_in_final_pass: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierRejection {
    pub enabled: bool,
    /// Correspondences reprojecting further than this (pixels) are dropped.
    pub max_reprojection_error: f64,
}

impl Default for OutlierRejection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_reprojection_error: 10.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectorCalibrationParams {
    /// Focal length as a multiple of the projector width.
    pub initial_throw_ratio: f64,
    /// Vertical principal-point shift as a fraction of the height.
    pub initial_lens_offset: f64,
    pub decimation: DecimationPolicy,
    pub outlier_rejection: OutlierRejection,
    pub local: LocalHomographyParams,
    pub solve: SolveOptions,
}

impl Default for ProjectorCalibrationParams {
    fn default() -> Self {
        Self {
            initial_throw_ratio: 1.0,
            initial_lens_offset: 0.0,
            decimation: DecimationPolicy::default(),
            outlier_rejection: OutlierRejection::default(),
            local: LocalHomographyParams::default(),
            solve: SolveOptions::default(),
        }
    }
}

/// Detector modes for captures taken through a stereo pair plus the
/// camera that ran the scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoCaptureOptions {
    pub stereo_mode: FindBoardMode,
    pub helper_mode: FindBoardMode,
    pub correct_matches: bool,
}

impl Default for StereoCaptureOptions {
    fn default() -> Self {
        Self {
            stereo_mode: FindBoardMode::Optimized,
            helper_mode: FindBoardMode::Assistant,
            correct_matches: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectorCorrespondence {
    pub world: Point3<f64>,
    pub projector: Point2<f64>,
    /// Where the last solve puts `world` in the projector image.
    pub reprojected: Option<Point2<f64>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectorCapture {
    pub correspondences: Vec<ProjectorCorrespondence>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectorSolution {
    pub camera_model: CameraModel,
    pub projector_to_world: RigidTransform,
    pub reprojection_error: f64,
    /// Correspondences used by the final solve.
    pub inlier_count: usize,
    /// RMS of each decimation pass, empty for a single-shot fit.
    pub decimation_errors: Vec<f64>,
}

/// Where the correspondence data set of a capture comes from.
pub enum ScanStrategy<'a> {
    /// Reuse the data set already held by the scan.
    UseExisting,
    /// Run a fresh scan first.
    Rescan {
        output: &'a mut dyn VideoOutput,
        camera: &'a mut dyn FrameSource,
    },
}

fn resolve_data_set<'s>(
    scan: &'s mut GraycodeScan,
    strategy: ScanStrategy<'_>,
) -> Result<&'s CorrespondenceDataSet, CalibrationError> {
    match strategy {
        ScanStrategy::UseExisting => scan.data_set().ok_or_else(|| {
            CalibrationError::Configuration("no Gray-code scan available".into())
        }),
        ScanStrategy::Rescan { output, camera } => Ok(scan.run(output, camera)?),
    }
}

fn clamp_seed(camera: &CameraModel) -> CameraModel {
    let (w, h) = (camera.image_size.0 as f64, camera.image_size.1 as f64);
    let mut seeded = *camera;
    seeded.fx = seeded.fx.clamp(1.0, 100.0 * w);
    seeded.fy = seeded.fy.clamp(1.0, 100.0 * w);
    seeded.cx = seeded.cx.clamp(0.01 * w, 0.99 * w);
    seeded.cy = seeded.cy.clamp(0.01 * h, 0.99 * h);
    seeded
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectorCalibrator {
    projector_size: (u32, u32),
    params: ProjectorCalibrationParams,
    captures: CaptureSet<ProjectorCapture>,
    solution: Option<ProjectorSolution>,
}

impl ProjectorCalibrator {
    pub fn new(projector_size: (u32, u32)) -> Self {
        Self::with_params(projector_size, ProjectorCalibrationParams::default())
    }

    pub fn with_params(projector_size: (u32, u32), params: ProjectorCalibrationParams) -> Self {
        Self {
            projector_size,
            params,
            captures: CaptureSet::new(),
            solution: None,
        }
    }

    pub fn projector_size(&self) -> (u32, u32) {
        self.projector_size
    }

    pub fn params(&self) -> &ProjectorCalibrationParams {
        &self.params
    }

    pub fn set_params(&mut self, params: ProjectorCalibrationParams) {
        self.params = params;
    }

    pub fn captures(&self) -> &CaptureSet<ProjectorCapture> {
        &self.captures
    }

    pub fn remove_capture(&mut self, id: CaptureId) -> Option<ProjectorCapture> {
        self.captures.remove(id)
    }

    pub fn set_selected(&mut self, id: CaptureId, selected: bool) -> bool {
        self.captures.set_selected(id, selected)
    }

    pub fn clear_captures(&mut self) {
        self.captures.clear();
    }

    pub fn solution(&self) -> Option<&ProjectorSolution> {
        self.solution.as_ref()
    }

    /// Intrinsics seed from the throw ratio and lens offset priors.
    pub fn initial_camera(&self) -> CameraModel {
        let (w, h) = (self.projector_size.0 as f64, self.projector_size.1 as f64);
        let f = w * self.params.initial_throw_ratio;
        CameraModel::new(
            self.projector_size,
            f,
            f,
            w / 2.0,
            h * (0.5 - self.params.initial_lens_offset / 2.0),
        )
    }

    /// Add a batch of raw `(world, projector pixel)` correspondences.
    pub fn add_capture(
        &mut self,
        world: &[Point3<f64>],
        projector: &[Point2<f64>],
    ) -> Result<CaptureId, CalibrationError> {
        if world.len() != projector.len() {
            return Err(CalibrationError::InvalidInput(format!(
                "{} world points for {} projector points",
                world.len(),
                projector.len()
            )));
        }
        if world.is_empty() {
            return Err(CalibrationError::InsufficientData {
                what: "usable projector correspondences",
                needed: 1,
                got: 0,
            });
        }
        let correspondences = world
            .iter()
            .zip(projector)
            .map(|(w, p)| ProjectorCorrespondence {
                world: *w,
                projector: *p,
                reprojected: None,
            })
            .collect();
        let id = self.captures.add(ProjectorCapture { correspondences });
        log::debug!("added projector capture {id} with {} points", world.len());
        Ok(id)
    }

    fn check_data_set(&self, data_set: &CorrespondenceDataSet) -> Result<(), CalibrationError> {
        if data_set.projector_size() != self.projector_size {
            return Err(CalibrationError::InvalidInput(format!(
                "scan was taken for a {:?} projector, calibrating {:?}",
                data_set.projector_size(),
                self.projector_size
            )));
        }
        Ok(())
    }

    /// Projector pixels for camera-space corners; dropped corners give `None`.
    fn projector_points(
        &self,
        data_set: &CorrespondenceDataSet,
        corners: &[Point2<f64>],
    ) -> Vec<Option<Point2<f64>>> {
        corners
            .iter()
            .map(|c| {
                let p = local_projector_point(data_set, *c, &self.params.local);
                if p.is_none() {
                    log::debug!("dropping corner at {c}: no stable local homography");
                }
                p
            })
            .collect()
    }

    /// Board seen by the camera that ran the scan, placed in the world
    /// through that camera's pose.
    ///
    /// `camera.pose` is `world_from_camera`.
    pub fn add_capture_from_board_pose(
        &mut self,
        detector: &dyn BoardDetector,
        scan: &mut GraycodeScan,
        strategy: ScanStrategy<'_>,
        camera: &CameraView,
        mode: FindBoardMode,
    ) -> Result<CaptureId, CalibrationError> {
        let model = camera.model.ok_or_else(|| {
            CalibrationError::Configuration("scan camera has no intrinsics".into())
        })?;
        let data_set = resolve_data_set(scan, strategy)?;
        self.check_data_set(data_set)?;

        let median = data_set.median();
        let board = detect(detector, &median.view(), Some(&model), mode, "scan camera")?;
        let camera_from_board = solve_pnp(&model, board.object_points(), board.image_points())?;
        let world_from_board = camera.pose.compose(&camera_from_board);

        let (world, projector): (Vec<_>, Vec<_>) = board
            .object_points()
            .iter()
            .zip(self.projector_points(data_set, board.image_points()))
            .filter_map(|(o, p)| p.map(|p| (world_from_board.transform_point(o), p)))
            .unzip();
        log::debug!(
            "board pose capture: {}/{} corners usable",
            world.len(),
            board.len()
        );
        self.add_capture(&world, &projector)
    }

    /// Board triangulated by a calibrated stereo pair and located in the
    /// scan camera's view.
    #[allow(clippy::too_many_arguments)]
    pub fn add_capture_from_stereo(
        &mut self,
        detector: &dyn BoardDetector,
        stereo: &StereoCalibrator,
        frame_a: &GrayImageView<'_>,
        frame_b: &GrayImageView<'_>,
        scan: &mut GraycodeScan,
        strategy: ScanStrategy<'_>,
        helper: Option<&CameraModel>,
        options: &StereoCaptureOptions,
    ) -> Result<CaptureId, CalibrationError> {
        let (a, b) = stereo.detect_pair(detector, frame_a, frame_b, options.stereo_mode)?;
        let triangulated =
            stereo.triangulate(a.image_points(), b.image_points(), options.correct_matches)?;

        let data_set = resolve_data_set(scan, strategy)?;
        self.check_data_set(data_set)?;
        let median = data_set.median();
        let seen = detect(detector, &median.view(), helper, options.helper_mode, "scan camera")?;

        let common: Vec<(usize, Point2<f64>)> = seen
            .object_points()
            .iter()
            .zip(seen.image_points())
            .filter_map(|(o, img)| a.find_object(o).map(|i| (i, *img)))
            .collect();
        let corners: Vec<_> = common.iter().map(|(_, img)| *img).collect();

        let (world, projector): (Vec<_>, Vec<_>) = common
            .iter()
            .zip(self.projector_points(data_set, &corners))
            .filter_map(|((i, _), p)| p.map(|p| (triangulated[*i], p)))
            .unzip();
        log::debug!(
            "stereo capture: {} triangulated, {} seen by scan camera, {} usable",
            a.len(),
            common.len(),
            world.len()
        );
        self.add_capture(&world, &projector)
    }

    pub fn calibrate(&mut self) -> Result<&ProjectorSolution, CalibrationError> {
        self.calibrate_with_cancel(&CancelToken::new())
    }

    /// Solve over the selected captures. The token is checked before every
    /// solver pass; a cancelled or failed solve keeps captures and the
    /// previous solution.
    #[cfg_attr(
        feature = "tracing",
        instrument(
            level = "info",
            skip(self, cancel),
            fields(captures = self.captures.selected_count())
        )
    )]
    pub fn calibrate_with_cancel(
        &mut self,
        cancel: &CancelToken,
    ) -> Result<&ProjectorSolution, CalibrationError> {
        let (world, projector): (Vec<Point3<f64>>, Vec<Point2<f64>>) = self
            .captures
            .iter_selected()
            .flat_map(|(_, c)| c.correspondences.iter())
            .map(|k| (k.world, k.projector))
            .unzip();
        if world.len() < MIN_CORRESPONDENCES {
            return Err(CalibrationError::InsufficientData {
                what: "projector correspondences",
                needed: MIN_CORRESPONDENCES,
                got: world.len(),
            });
        }

        let initial = self.initial_camera();
        let (mut fit, decimation_errors) = self.fit_pool(&world, &projector, &initial, cancel)?;
        let mut inlier_count = world.len();

        if self.params.outlier_rejection.enabled {
            let threshold = self.params.outlier_rejection.max_reprojection_error;
            let pose = fit.poses[0];
            let (kept_world, kept_projector): (Vec<_>, Vec<_>) = world
                .iter()
                .zip(&projector)
                .filter(|(w, p)| {
                    let r = fit.camera.project_unchecked(&pose.transform_point(w));
                    (r - **p).norm_squared() < threshold * threshold
                })
                .map(|(w, p)| (*w, *p))
                .unzip();
            log::info!(
                "outlier rejection kept {}/{} correspondences",
                kept_world.len(),
                world.len()
            );
            if kept_world.len() < MIN_CORRESPONDENCES {
                return Err(CalibrationError::InsufficientData {
                    what: "projector correspondences after outlier rejection",
                    needed: MIN_CORRESPONDENCES,
                    got: kept_world.len(),
                });
            }
            if cancel.is_cancelled() {
                return Err(CalibrationError::Cancelled);
            }
            let flags = self.pass_flags(true);
            fit = self.fit_once(&kept_world, &kept_projector, &fit.camera, &flags)?;
            inlier_count = kept_world.len();
        }

        let projector_from_world = fit.poses[0];
        for entry in self.captures.iter_mut().filter(|e| e.selected) {
            for c in &mut entry.data.correspondences {
                c.reprojected = fit
                    .camera
                    .project(&projector_from_world.transform_point(&c.world));
            }
        }

        log::info!(
            "projector calibrated from {inlier_count} correspondences: \
             f={:.2} c=({:.2}, {:.2}), rms {:.4} px",
            fit.camera.fx,
            fit.camera.cx,
            fit.camera.cy,
            fit.rms
        );

        Ok(&*self.solution.insert(ProjectorSolution {
            camera_model: fit.camera,
            projector_to_world: projector_from_world.inverse(),
            reprojection_error: fit.rms,
            inlier_count,
            decimation_errors,
        }))
    }

    fn pass_flags(&self, final_pass: bool) -> IntrinsicsFlags {
        let mut flags = IntrinsicsFlags::pinhole_guess();
        if final_pass && self.params.decimation.release_distortion_in_final_pass {
            flags.fix_k1 = false;
            flags.fix_k2 = false;
        }
        flags
    }

    fn fit_once(
        &self,
        world: &[Point3<f64>],
        projector: &[Point2<f64>],
        seed: &CameraModel,
        flags: &IntrinsicsFlags,
    ) -> Result<CameraCalibration, CalibrationError> {
        let view = View {
            object: world,
            image: projector,
        };
        calibrate_camera(&[view], seed, flags, &self.params.solve)
    }

    /// Single fit, or the decimation schedule when enabled and the pool is
    /// large enough.
    fn fit_pool(
        &self,
        world: &[Point3<f64>],
        projector: &[Point2<f64>],
        initial: &CameraModel,
        cancel: &CancelToken,
    ) -> Result<(CameraCalibration, Vec<f64>), CalibrationError> {
        let policy = &self.params.decimation;
        let count = world.len();
        let mut decimation = count / policy.initial_divisor.max(1);

        if !policy.enabled || decimation <= 1 {
            if cancel.is_cancelled() {
                return Err(CalibrationError::Cancelled);
            }
            let fit = self.fit_once(world, projector, initial, &self.pass_flags(true))?;
            return Ok((fit, Vec::new()));
        }

        let mut remaining: Vec<usize> = (0..count).collect();
        let mut train_world = Vec::with_capacity(count);
        let mut train_projector = Vec::with_capacity(count);
        let mut errors = Vec::new();
        let mut seed = *initial;
        let mut last = None;

        while decimation > 0 && count.div_ceil(decimation + 1) < MIN_CORRESPONDENCES {
            decimation /= 2;
        }
        decimation *= 2;
        loop {
            if cancel.is_cancelled() {
                log::warn!("projector calibration cancelled after {} passes", errors.len());
                return Err(CalibrationError::Cancelled);
            }
            decimation /= 2;

            let step = decimation + 1;
            let mut still = Vec::with_capacity(remaining.len());
            for (pos, &i) in remaining.iter().enumerate() {
                if pos % step == 0 {
                    train_world.push(world[i]);
                    train_projector.push(projector[i]);
                } else {
                    still.push(i);
                }
            }
            remaining = still;

            if last.is_some() {
                seed = clamp_seed(&seed);
            }
            let flags = self.pass_flags(decimation == 0);
            let fit = self.fit_once(&train_world, &train_projector, &seed, &flags)?;
            log::debug!(
                "decimation {decimation}: {} points, rms {:.4} px",
                train_world.len(),
                fit.rms
            );
            errors.push(fit.rms);
            seed = fit.camera;
            last = Some(fit);

            if decimation == 0 {
                break;
            }
        }

        let fit = last.ok_or_else(|| {
            CalibrationError::SolverDiverged("decimated fit ran no passes".into())
        })?;
        Ok((fit, errors))
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

    #[test]
    fn seed_follows_priors() {
        let cal = ProjectorCalibrator::with_params(
            (1000, 800),
            ProjectorCalibrationParams {
                initial_throw_ratio: 1.5,
                initial_lens_offset: 0.5,
                ..Default::default()
            },
        );
        let k = cal.initial_camera();
        assert_eq!((k.fx, k.fy, k.cx, k.cy), (1500.0, 1500.0, 500.0, 200.0));
    }

    #[test]
    fn seed_clamp_keeps_principal_point_inside() {
        let wild = CameraModel::new((100, 50), -3.0, 1e9, -10.0, 80.0);
        let k = clamp_seed(&wild);
        assert_eq!((k.fx, k.fy, k.cx, k.cy), (1.0, 10_000.0, 1.0, 49.5));
    }

    #[test]
    fn too_few_correspondences() {
        let mut cal = ProjectorCalibrator::new((800, 600));
        let world: Vec<_> = (0..5).map(|i| Point3::new(i as f64, 0.0, 1.0)).collect();
        let proj: Vec<_> = (0..5).map(|i| Point2::new(i as f64, 0.0)).collect();
        cal.add_capture(&world, &proj).unwrap();
        let err = cal.calibrate().unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InsufficientData { needed: 6, got: 5, .. }
        ));
    }

    #[test]
    fn empty_and_mismatched_batches_are_rejected() {
        let mut cal = ProjectorCalibrator::new((800, 600));
        assert!(matches!(
            cal.add_capture(&[], &[]).unwrap_err(),
            CalibrationError::InsufficientData { .. }
        ));
        assert!(matches!(
            cal.add_capture(&[Point3::origin()], &[]).unwrap_err(),
            CalibrationError::InvalidInput(_)
        ));
        assert!(cal.captures().is_empty());
    }
}
