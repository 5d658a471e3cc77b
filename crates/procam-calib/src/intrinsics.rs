//! Camera matrix and distortion from several views of a planar board.

use crate::board::{detect, BoardDetector, BoardObservation, FindBoardMode};
use crate::bundle::{calibrate_camera, IntrinsicsFlags, View};
use crate::capture::{CaptureId, CaptureSet};
use crate::CalibrationError;
use procam_core::{CameraModel, GrayImageView, RigidTransform, SolveOptions};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Points a single board view needs to constrain a pose.
pub const MIN_POINTS_PER_CAPTURE: usize = 4;
pub const MIN_CAPTURES: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibratorState {
    /// Nothing captured yet.
    Idle,
    /// Captures changed since the last solve (or nothing solved yet).
    Accumulating,
    Solved,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicsCapture {
    pub observation: BoardObservation,
    /// RMS reprojection error from the last solve that used this capture.
    pub reprojection_error: Option<f64>,
    pub camera_from_board: Option<RigidTransform>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicsSolution {
    pub camera: CameraModel,
    /// RMS over every point of every selected capture, in pixels.
    pub reprojection_error: f64,
    pub capture_count: usize,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsicsCalibrator {
    flags: IntrinsicsFlags,
    solve: SolveOptions,
    /// Guess before the first solve, last good solution afterwards.
    camera: CameraModel,
    captures: CaptureSet<IntrinsicsCapture>,
    solution: Option<IntrinsicsSolution>,
    dirty: bool,
}

impl CameraIntrinsicsCalibrator {
    pub fn new(image_size: (u32, u32)) -> Self {
        Self::with_guess(CameraModel::initial_guess(image_size))
    }

    /// Start from a known model; only used as a seed with
    /// [`IntrinsicsFlags::use_intrinsic_guess`].
    pub fn with_guess(camera: CameraModel) -> Self {
        Self {
            flags: IntrinsicsFlags::default(),
            solve: SolveOptions::default(),
            camera,
            captures: CaptureSet::new(),
            solution: None,
            dirty: false,
        }
    }

    pub fn image_size(&self) -> (u32, u32) {
        self.camera.image_size
    }

    pub fn flags(&self) -> &IntrinsicsFlags {
        &self.flags
    }

    pub fn set_flags(&mut self, flags: IntrinsicsFlags) {
        self.flags = flags;
        self.dirty = true;
    }

    pub fn solve_options(&self) -> &SolveOptions {
        &self.solve
    }

    pub fn set_solve_options(&mut self, solve: SolveOptions) {
        self.solve = solve;
        self.dirty = true;
    }

    /// Current camera model: the seed, or the last successful solve.
    pub fn camera_model(&self) -> &CameraModel {
        &self.camera
    }

    pub fn solution(&self) -> Option<&IntrinsicsSolution> {
        self.solution.as_ref()
    }

    pub fn state(&self) -> CalibratorState {
        if self.solution.is_some() && !self.dirty {
            CalibratorState::Solved
        } else if self.captures.is_empty() {
            CalibratorState::Idle
        } else {
            CalibratorState::Accumulating
        }
    }

    pub fn captures(&self) -> &CaptureSet<IntrinsicsCapture> {
        &self.captures
    }

    pub fn add_capture(
        &mut self,
        observation: BoardObservation,
    ) -> Result<CaptureId, CalibrationError> {
        if observation.len() < MIN_POINTS_PER_CAPTURE {
            log::warn!("rejecting board capture with {} points", observation.len());
            return Err(CalibrationError::InsufficientData {
                what: "points in board capture",
                needed: MIN_POINTS_PER_CAPTURE,
                got: observation.len(),
            });
        }
        let id = self.captures.add(IntrinsicsCapture {
            observation,
            reprojection_error: None,
            camera_from_board: None,
        });
        self.dirty = true;
        log::debug!("added intrinsics capture {id}");
        Ok(id)
    }

    /// Detect the board in `image` and keep it as a capture.
    pub fn add_capture_from_image(
        &mut self,
        detector: &dyn BoardDetector,
        image: &GrayImageView<'_>,
        mode: FindBoardMode,
    ) -> Result<CaptureId, CalibrationError> {
        let (w, h) = self.camera.image_size;
        if (image.width, image.height) != (w as usize, h as usize) {
            return Err(CalibrationError::InvalidInput(format!(
                "frame is {}x{}, calibrator expects {w}x{h}",
                image.width, image.height
            )));
        }
        let observation = detect(detector, image, Some(&self.camera), mode, "camera")?;
        self.add_capture(observation)
    }

    pub fn remove_capture(&mut self, id: CaptureId) -> Option<IntrinsicsCapture> {
        let removed = self.captures.remove(id);
        self.dirty |= removed.is_some();
        removed
    }

    pub fn set_selected(&mut self, id: CaptureId, selected: bool) -> bool {
        let changed = self.captures.is_selected(id).is_some_and(|s| s != selected);
        self.dirty |= changed;
        self.captures.set_selected(id, selected)
    }

    pub fn clear_captures(&mut self) {
        self.captures.clear();
        self.dirty = true;
    }

    /// Solve intrinsics over the selected captures.
    ///
    /// On failure the previous model and every capture are left untouched.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self), fields(captures = self.captures.selected_count()))
    )]
    pub fn calibrate(&mut self) -> Result<&IntrinsicsSolution, CalibrationError> {
        let selected: Vec<_> = self.captures.iter_selected().collect();
        if selected.len() < MIN_CAPTURES {
            return Err(CalibrationError::InsufficientData {
                what: "selected board captures",
                needed: MIN_CAPTURES,
                got: selected.len(),
            });
        }
        if let Some((id, c)) = selected
            .iter()
            .find(|(_, c)| c.observation.len() < MIN_POINTS_PER_CAPTURE)
        {
            log::warn!("capture {id} has too few points to calibrate");
            return Err(CalibrationError::InsufficientData {
                what: "points in board capture",
                needed: MIN_POINTS_PER_CAPTURE,
                got: c.observation.len(),
            });
        }

        let ids: Vec<CaptureId> = selected.iter().map(|(id, _)| *id).collect();
        let views: Vec<View<'_>> = selected
            .iter()
            .map(|(_, c)| View {
                object: c.observation.object_points(),
                image: c.observation.image_points(),
            })
            .collect();

        let result = calibrate_camera(&views, &self.camera, &self.flags, &self.solve)?;

        for ((id, pose), rms) in ids.iter().zip(&result.poses).zip(&result.per_view_rms) {
            if let Some(capture) = self.captures.get_mut(*id) {
                capture.camera_from_board = Some(*pose);
                capture.reprojection_error = Some(*rms);
                log::debug!("capture {id}: rms {rms:.4} px");
            }
        }

        log::info!(
            "camera calibrated from {} captures: fx={:.2} fy={:.2} cx={:.2} cy={:.2}, rms {:.4} px",
            ids.len(),
            result.camera.fx,
            result.camera.fy,
            result.camera.cx,
            result.camera.cy,
            result.rms
        );

        self.camera = result.camera;
        self.dirty = false;
        Ok(&*self.solution.insert(IntrinsicsSolution {
            camera: result.camera,
            reprojection_error: result.rms,
            capture_count: ids.len(),
            iterations: result.report.iterations,
            converged: result.report.converged,
        }))
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
