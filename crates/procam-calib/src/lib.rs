//! Camera, stereo and projector calibration.
//!
//! Board detection and projector output are injected through the
//! [`BoardDetector`] and [`procam_graycode::VideoOutput`] traits; everything
//! else (captures, solves, exports) lives here.
//!
//! ```no_run
//! use procam_calib::{BoardObservation, CameraIntrinsicsCalibrator};
//!
//! # fn observations() -> Vec<BoardObservation> { Vec::new() }
//! let mut calibrator = CameraIntrinsicsCalibrator::new((1280, 960));
//! for obs in observations() {
//!     calibrator.add_capture(obs)?;
//! }
//! let solution = calibrator.calibrate()?;
//! println!("rms {:.3} px", solution.reprojection_error);
//! # Ok::<(), procam_calib::CalibrationError>(())
//! ```

mod board;
mod bundle;
mod capture;
mod epipolar;
mod error;
mod export;
mod homography;
mod intrinsics;
mod projector;
mod stereo;

pub use board::{
    intersect_observations, BoardDetector, BoardObservation, FindBoardMode,
    OBJECT_MATCH_TOLERANCE,
};
pub use bundle::IntrinsicsFlags;
pub use capture::{CaptureEntry, CaptureId, CaptureSet};
pub use epipolar::{
    correct_match, essential_from_pose, fundamental_from_essential, skew, stereo_rectify,
    Rectification,
};
pub use error::CalibrationError;
pub use export::CalibrationExport;
pub use homography::{
    local_projector_point, HomographyEstimator, HomographyFit, HomographyParams,
    LocalHomographyParams,
};
pub use intrinsics::{
    CalibratorState, CameraIntrinsicsCalibrator, IntrinsicsCapture, IntrinsicsSolution,
    MIN_CAPTURES, MIN_POINTS_PER_CAPTURE,
};
pub use projector::{
    DecimationPolicy, OutlierRejection, ProjectorCalibrationParams, ProjectorCalibrator,
    ProjectorCapture, ProjectorCorrespondence, ProjectorSolution, ScanStrategy,
    StereoCaptureOptions, MIN_CORRESPONDENCES,
};
pub use stereo::{CameraView, StereoCalibrator, StereoCapture, StereoParams, StereoSolution};
