//! Gray-code structured light.
//!
//! - [`generate`] / [`Pattern`]: the frame sequence for a projector resolution.
//! - [`GrayCodeCodec::decode`]: captured frames → [`CorrespondenceDataSet`].
//! - [`GraycodeScan`]: drives a [`VideoOutput`] and a [`FrameSource`] through
//!   a full blocking scan.

mod codec;
mod dataset;
mod error;
mod scan;

pub use codec::{
    binary_to_gray, bits_for, generate, gray_to_binary, Axis, GrayCodeCodec, Pattern,
    PatternFrame,
};
pub use dataset::{CorrespondenceDataSet, DataSetIter, DataSetPixel};
pub use error::GrayCodeError;
pub use scan::{FrameSource, GraycodeScan, ScanConfig, VideoOutput};
