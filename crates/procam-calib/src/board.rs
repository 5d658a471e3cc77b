//! Planar calibration board observations and the detector contract.

use crate::CalibrationError;
use nalgebra::{Point2, Point3};
use procam_core::{CameraModel, GrayImageView};
use serde::{Deserialize, Serialize};

/// Object points closer than this are considered the same board corner.
pub const OBJECT_MATCH_TOLERANCE: f64 = 1e-6;

/// Detector strategy, passed through to the [`BoardDetector`] untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FindBoardMode {
    Raw,
    #[default]
    Optimized,
    /// Interactive detection; never run concurrently.
    Assistant,
}

/// Image corners of a board together with their board-frame positions.
///
/// `image_points[i]` is the observation of `object_points[i]`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardObservation {
    image_points: Vec<Point2<f64>>,
    object_points: Vec<Point3<f64>>,
}

impl BoardObservation {
    pub fn new(
        image_points: Vec<Point2<f64>>,
        object_points: Vec<Point3<f64>>,
    ) -> Result<Self, CalibrationError> {
        if image_points.len() != object_points.len() {
            return Err(CalibrationError::InvalidInput(format!(
                "board observation has {} image points but {} object points",
                image_points.len(),
                object_points.len()
            )));
        }
        Ok(Self {
            image_points,
            object_points,
        })
    }

    /// A failed detection.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.image_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_points.is_empty()
    }

    pub fn image_points(&self) -> &[Point2<f64>] {
        &self.image_points
    }

    pub fn object_points(&self) -> &[Point3<f64>] {
        &self.object_points
    }

    /// Index of the corner at `object` (within [`OBJECT_MATCH_TOLERANCE`]).
    pub fn find_object(&self, object: &Point3<f64>) -> Option<usize> {
        self.object_points
            .iter()
            .position(|o| (o - object).norm() <= OBJECT_MATCH_TOLERANCE)
    }

    /// Keep only the corners at the given indices, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            image_points: indices.iter().map(|&i| self.image_points[i]).collect(),
            object_points: indices.iter().map(|&i| self.object_points[i]).collect(),
        }
    }
}

/// Finds a calibration board in a grayscale frame.
///
/// Implementations must be callable from two threads at once, the stereo
/// calibrator runs both camera detections in parallel.
pub trait BoardDetector: Sync {
    fn find_board(
        &self,
        image: &GrayImageView<'_>,
        camera: Option<&CameraModel>,
        mode: FindBoardMode,
    ) -> Option<BoardObservation>;
}

/// Restrict two observations of the same board to their common corners.
///
/// Corners are matched by object position, not by index. The result keeps
/// the corner order of `a`.
pub fn intersect_observations(
    a: &BoardObservation,
    b: &BoardObservation,
) -> (BoardObservation, BoardObservation) {
    let mut keep_a = Vec::new();
    let mut keep_b = Vec::new();
    for (i, object) in a.object_points.iter().enumerate() {
        if let Some(j) = b.find_object(object) {
            keep_a.push(i);
            keep_b.push(j);
        }
    }
    (a.select(&keep_a), b.select(&keep_b))
}

/// Run the detector and turn an empty result into [`CalibrationError::DetectionFailed`].
pub(crate) fn detect(
    detector: &dyn BoardDetector,
    image: &GrayImageView<'_>,
    camera: Option<&CameraModel>,
    mode: FindBoardMode,
    what: &str,
) -> Result<BoardObservation, CalibrationError> {
    match detector.find_board(image, camera, mode) {
        Some(obs) if !obs.is_empty() => Ok(obs),
        _ => Err(CalibrationError::DetectionFailed(format!(
            "no board in {what} frame"
        ))),
    }
}
