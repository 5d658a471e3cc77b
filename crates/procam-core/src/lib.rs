//! Geometric building blocks for projector/camera calibration.
//!
//! Everything here is independent of how images are captured or how boards
//! are detected: pinhole cameras with OpenCV-style distortion, rigid poses,
//! homographies, PnP, triangulation and the two numerical workhorses
//! (seeded RANSAC and a Levenberg–Marquardt adapter with parameter masks).

mod camera;
mod cancel;
mod error;
mod homography;
mod image;
mod lm;
mod logger;
mod pnp;
mod ransac;
mod transform;
mod triangulation;

pub use camera::{CameraModel, Distortion};
pub use cancel::CancelToken;
pub use error::CoreError;
pub use homography::{estimate_homography, homography_from_4pt, Homography};
pub use image::{sample_bilinear, sample_bilinear_u8, GrayImage, GrayImageView};
pub use lm::{numeric_jacobian, solve_lm, LeastSquaresProblem, SolveOptions, SolveReport};
pub use pnp::{fit_plane, refine_pose, reprojection_rms, solve_pnp, PlaneFit};
pub use ransac::{ransac, Estimator, RansacOptions, RansacResult};
pub use transform::RigidTransform;
pub use triangulation::{projection_from_pose, triangulate_point};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::{init, init_with_level, LogFilter};
