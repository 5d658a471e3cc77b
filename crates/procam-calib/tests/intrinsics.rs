mod common;

use approx::assert_relative_eq;
use common::{board, observe, pose, ScriptedDetector};
use procam_calib::{
    CalibrationError, CalibratorState, CameraIntrinsicsCalibrator, FindBoardMode,
};
use procam_core::{CameraModel, Distortion, GrayImage};

fn true_camera() -> CameraModel {
    CameraModel::new((640, 480), 612.0, 605.0, 322.5, 238.0).with_distortion(Distortion {
        k1: -0.12,
        k2: 0.04,
        ..Distortion::none()
    })
}

fn views() -> Vec<procam_core::RigidTransform> {
    vec![
        pose([0.25, -0.1, 0.02], [0.01, 0.0, 0.55]),
        pose([-0.3, 0.15, -0.05], [-0.02, 0.01, 0.6]),
        pose([0.05, 0.35, 0.1], [0.03, -0.02, 0.5]),
        pose([-0.1, -0.3, 0.0], [0.0, 0.03, 0.65]),
        pose([0.3, 0.25, -0.1], [-0.03, -0.01, 0.58]),
        pose([-0.2, -0.2, 0.05], [0.02, 0.02, 0.52]),
    ]
}

#[test]
fn recovers_intrinsics_from_tilted_boards() {
    common::init_logging();
    let camera = true_camera();
    let object = board(9, 6, 0.03);
    let mut cal = CameraIntrinsicsCalibrator::new((640, 480));
    for p in views() {
        cal.add_capture(observe(&camera, &p, &object)).unwrap();
    }
    assert_eq!(cal.state(), CalibratorState::Accumulating);

    let solution = cal.calibrate().unwrap().clone();
    assert_eq!(solution.capture_count, 6);
    assert!(solution.reprojection_error < 1e-3, "rms {}", solution.reprojection_error);
    assert_relative_eq!(solution.camera.fx, camera.fx, max_relative = 1e-3);
    assert_relative_eq!(solution.camera.fy, camera.fy, max_relative = 1e-3);
    assert_relative_eq!(solution.camera.cx, camera.cx, epsilon = 0.5);
    assert_relative_eq!(solution.camera.cy, camera.cy, epsilon = 0.5);
    assert_relative_eq!(
        solution.camera.distortion.k1,
        camera.distortion.k1,
        epsilon = 1e-2
    );
    assert_eq!(cal.state(), CalibratorState::Solved);

    for (_, capture) in cal.captures().iter_selected() {
        let rms = capture.reprojection_error.expect("per-capture error");
        assert!(rms < 1e-2);
        assert!(capture.camera_from_board.is_some());
    }
}

#[test]
fn failed_solve_keeps_previous_model() {
    let camera = true_camera();
    let object = board(9, 6, 0.03);
    let mut cal = CameraIntrinsicsCalibrator::new((640, 480));
    let ids: Vec<_> = views()
        .iter()
        .map(|p| cal.add_capture(observe(&camera, p, &object)).unwrap())
        .collect();
    let solved_camera = cal.calibrate().unwrap().camera;

    for id in &ids[1..] {
        assert!(cal.set_selected(*id, false));
    }
    assert_eq!(cal.state(), CalibratorState::Accumulating);
    let err = cal.calibrate().unwrap_err();
    assert!(matches!(
        err,
        CalibrationError::InsufficientData { got: 1, .. }
    ));
    assert_eq!(*cal.camera_model(), solved_camera);
    assert_eq!(cal.captures().len(), ids.len());
}

#[test]
fn new_solve_options_need_a_fresh_solve() {
    let camera = true_camera();
    let object = board(9, 6, 0.03);
    let mut cal = CameraIntrinsicsCalibrator::new((640, 480));
    for p in views() {
        cal.add_capture(observe(&camera, &p, &object)).unwrap();
    }
    cal.calibrate().unwrap();
    assert_eq!(cal.state(), CalibratorState::Solved);

    let mut solve = *cal.solve_options();
    solve.max_iters = 50;
    cal.set_solve_options(solve);
    assert_eq!(cal.state(), CalibratorState::Accumulating);
    assert!(cal.solution().is_some());

    cal.calibrate().unwrap();
    assert_eq!(cal.state(), CalibratorState::Solved);
}

#[test]
fn detector_frames_must_match_image_size() {
    let camera = true_camera();
    let object = board(9, 6, 0.03);
    let detector = ScriptedDetector::default().with(640, observe(&camera, &views()[0], &object));
    let mut cal = CameraIntrinsicsCalibrator::new((640, 480));

    let frame = GrayImage::filled(640, 480, 0);
    cal.add_capture_from_image(&detector, &frame.view(), FindBoardMode::Raw)
        .unwrap();

    let wrong = GrayImage::filled(320, 240, 0);
    let err = cal
        .add_capture_from_image(&detector, &wrong.view(), FindBoardMode::Raw)
        .unwrap_err();
    assert!(matches!(err, CalibrationError::InvalidInput(_)));
    assert_eq!(cal.captures().len(), 1);
}

#[test]
fn missing_board_is_a_detection_failure() {
    let detector = ScriptedDetector::default();
    let mut cal = CameraIntrinsicsCalibrator::new((640, 480));
    let frame = GrayImage::filled(640, 480, 0);
    let err = cal
        .add_capture_from_image(&detector, &frame.view(), FindBoardMode::Optimized)
        .unwrap_err();
    assert!(matches!(err, CalibrationError::DetectionFailed(_)));
}

#[test]
fn calibrator_survives_a_json_round_trip() {
    let camera = true_camera();
    let object = board(9, 6, 0.03);
    let mut cal = CameraIntrinsicsCalibrator::new((640, 480));
    for p in views().iter().take(3) {
        cal.add_capture(observe(&camera, p, &object)).unwrap();
    }
    cal.calibrate().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("camera.json");
    cal.write_json(&path).unwrap();
    let loaded = CameraIntrinsicsCalibrator::load_json(&path).unwrap();
    assert_eq!(loaded.captures().len(), 3);
    assert_eq!(loaded.state(), CalibratorState::Solved);
    assert_relative_eq!(
        loaded.camera_model().fx,
        cal.camera_model().fx,
        epsilon = 1e-9
    );
}
