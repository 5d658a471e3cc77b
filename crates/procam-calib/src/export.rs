//! Flat calibration result consumed by scene and world-model code.

use crate::projector::ProjectorSolution;
use crate::CalibrationError;
use procam_core::{CameraModel, RigidTransform};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Camera matrix, distortion and pose of one calibrated view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationExport {
    /// Row-major 3x3 camera matrix.
    pub camera_matrix: [f64; 9],
    /// 5 coefficients, or 8 with the rational model.
    pub distortion: Vec<f64>,
    /// Row-major 4x4 `world_from_view` transform.
    pub transform: [f64; 16],
    pub image_size: (u32, u32),
    pub reprojection_error: f64,
}

impl CalibrationExport {
    pub fn new(
        camera: &CameraModel,
        world_from_view: &RigidTransform,
        reprojection_error: f64,
    ) -> Self {
        let k = camera.camera_matrix();
        let mut camera_matrix = [0.0; 9];
        for r in 0..3 {
            for c in 0..3 {
                camera_matrix[3 * r + c] = k[(r, c)];
            }
        }
        Self {
            camera_matrix,
            distortion: camera.distortion_vector(),
            transform: world_from_view.to_row_major(),
            image_size: camera.image_size,
            reprojection_error,
        }
    }

    /// Rebuild the camera model and `world_from_view` pose.
    pub fn to_parts(&self) -> Result<(CameraModel, RigidTransform), CalibrationError> {
        let distortion = procam_core::Distortion::from_slice(&self.distortion)?;
        let k = nalgebra::Matrix3::from_row_slice(&self.camera_matrix);
        let camera = CameraModel::from_camera_matrix(self.image_size, &k, distortion);
        let m = nalgebra::Matrix4::from_row_slice(&self.transform);
        Ok((camera, RigidTransform::from_matrix(&m)))
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

impl From<&ProjectorSolution> for CalibrationExport {
    fn from(solution: &ProjectorSolution) -> Self {
        Self::new(
            &solution.camera_model,
            &solution.projector_to_world,
            solution.reprojection_error,
        )
    }
}
