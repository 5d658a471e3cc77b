//! Facade crate for the `procam-*` workspace.
//!
//! It re-exports the member crates and adds:
//! - [`ProcamConfig`], a single JSON file with every tunable;
//! - (feature `image`) PNG import/export of patterns, frames and previews;
//! - (feature `cli`) the `procam` command line tool.
//!
//! ## Quickstart
//!
//! ```no_run
//! use procam::graycode::GrayCodeCodec;
//! use procam::calib::HomographyEstimator;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let codec = GrayCodeCodec::new(1280, 800)?;
//! let frames = procam::images::load_frames("captures/")?;
//! let data_set = codec.decode(&frames, 10)?;
//! let fit = HomographyEstimator::default().fit_data_set(&data_set, None)?;
//! println!("camera -> projector: {:?}", fit.homography);
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `procam::core`: cameras, poses, homographies, RANSAC, LM, PnP.
//! - `procam::graycode`: pattern generation, decoding, scans, data sets.
//! - `procam::calib`: homography estimation and the camera, stereo and
//!   projector calibrators.
//! - `procam::images` (feature `image`): conversions from `image::GrayImage`.

mod config;
mod error;

pub use procam_calib as calib;
pub use procam_core as core;
pub use procam_graycode as graycode;

pub use nalgebra;

pub use config::ProcamConfig;
pub use error::ProcamError;

pub use procam_calib::{
    CalibrationError, CameraIntrinsicsCalibrator, HomographyEstimator, ProjectorCalibrator,
    StereoCalibrator,
};
pub use procam_core::{CameraModel, GrayImage, RigidTransform};
pub use procam_graycode::{CorrespondenceDataSet, GrayCodeCodec, GraycodeScan};

#[cfg(feature = "image")]
pub mod images;

/// Route `log` records into `tracing` and install the subscriber.
#[cfg(feature = "tracing")]
pub fn init_tracing(json: bool, fallback: &procam_core::LogFilter) {
    procam_core::init_tracing(json, fallback);
    let _ = tracing_log::LogTracer::init();
}
