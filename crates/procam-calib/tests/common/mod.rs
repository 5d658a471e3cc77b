#![allow(dead_code)]

use nalgebra::{Point2, Point3, Vector3};
use procam_calib::{BoardDetector, BoardObservation, FindBoardMode};
use procam_core::{CameraModel, GrayImageView, RigidTransform};

pub fn pose(rvec: [f64; 3], tvec: [f64; 3]) -> RigidTransform {
    RigidTransform::from_rvec_tvec(Vector3::from(rvec), Vector3::from(tvec))
}

/// Planar grid centred on the board origin.
pub fn board(cols: usize, rows: usize, spacing: f64) -> Vec<Point3<f64>> {
    let (ox, oy) = (
        (cols - 1) as f64 * spacing / 2.0,
        (rows - 1) as f64 * spacing / 2.0,
    );
    (0..rows)
        .flat_map(|j| {
            let y = j as f64 * spacing - oy;
            (0..cols).map(move |i| Point3::new(i as f64 * spacing - ox, y, 0.0))
        })
        .collect()
}

pub fn observe(
    camera: &CameraModel,
    camera_from_board: &RigidTransform,
    object: &[Point3<f64>],
) -> BoardObservation {
    let image = object
        .iter()
        .map(|o| camera_from_board.transform_point(o))
        .map(|p| camera.project_unchecked(&p))
        .collect();
    BoardObservation::new(image, object.to_vec()).expect("matching lengths")
}

/// Small repeatable offset in roughly `[-amplitude, amplitude]`.
pub fn jitter(i: usize, amplitude: f64) -> Point2<f64> {
    let t = i as f64;
    Point2::new(
        (t * 12.9898).sin() * amplitude,
        (t * 78.233 + 1.0).sin() * amplitude,
    )
}

/// Detector that answers by frame width, so several synthetic cameras can
/// share one instance.
#[derive(Default)]
pub struct ScriptedDetector {
    boards: Vec<(usize, BoardObservation)>,
}

impl ScriptedDetector {
    pub fn with(mut self, frame_width: usize, observation: BoardObservation) -> Self {
        self.boards.push((frame_width, observation));
        self
    }
}

impl BoardDetector for ScriptedDetector {
    fn find_board(
        &self,
        image: &GrayImageView<'_>,
        _camera: Option<&CameraModel>,
        _mode: FindBoardMode,
    ) -> Option<BoardObservation> {
        self.boards
            .iter()
            .find(|(w, _)| *w == image.width)
            .map(|(_, o)| o.clone())
    }
}

/// Show library logs when a test is run with `RUST_LOG` set.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
