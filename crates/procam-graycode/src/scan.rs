//! Blocking display → settle → capture loop that feeds the decoder.

use crate::{CorrespondenceDataSet, GrayCodeCodec, GrayCodeError};
use procam_core::{CancelToken, GrayImage};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Anything that can put a pattern in front of the projector.
pub trait VideoOutput {
    fn display_pattern(&mut self, image: &GrayImage);
    /// Projector resolution in pixels.
    fn output_size(&self) -> (u32, u32);
    fn is_output_ready(&self) -> bool;
}

/// Camera side of a scan.
pub trait FrameSource {
    /// A frame exposed after this call was made, or `None` if the camera failed.
    fn grab_frame(&mut self) -> Option<GrayImage>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Pixels whose white/black swing does not exceed this are inactive.
    pub threshold: u8,
    /// Wait between showing a frame and grabbing the camera image.
    pub settle_delay_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            settle_delay_ms: 200,
        }
    }
}

impl ScanConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Owns the most recent scan result and knows how to produce a new one.
#[derive(Clone, Debug, Default)]
pub struct GraycodeScan {
    config: ScanConfig,
    data_set: Option<CorrespondenceDataSet>,
}

impl GraycodeScan {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            data_set: None,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: ScanConfig) {
        self.config = config;
    }

    pub fn data_set(&self) -> Option<&CorrespondenceDataSet> {
        self.data_set.as_ref()
    }

    pub fn has_data(&self) -> bool {
        self.data_set.is_some()
    }

    pub fn set_data_set(&mut self, data_set: CorrespondenceDataSet) {
        self.data_set = Some(data_set);
    }

    pub fn clear(&mut self) {
        self.data_set = None;
    }

    pub fn run(
        &mut self,
        output: &mut dyn VideoOutput,
        camera: &mut dyn FrameSource,
    ) -> Result<&CorrespondenceDataSet, GrayCodeError> {
        self.run_with_cancel(output, camera, &CancelToken::new())
    }

    /// Show every pattern frame, wait, grab, then decode.
    ///
    /// Strictly sequential: a camera frame is only requested after the
    /// settle delay of the frame currently displayed. The previous data set
    /// survives any failure or cancellation.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, output, camera, cancel))
    )]
    pub fn run_with_cancel(
        &mut self,
        output: &mut dyn VideoOutput,
        camera: &mut dyn FrameSource,
        cancel: &CancelToken,
    ) -> Result<&CorrespondenceDataSet, GrayCodeError> {
        if !output.is_output_ready() {
            return Err(GrayCodeError::OutputNotReady);
        }
        let (pw, ph) = output.output_size();
        let codec = GrayCodeCodec::new(pw, ph)?;
        let pattern = *codec.pattern();
        log::info!(
            "scanning {}x{} projector with {} frames",
            pw,
            ph,
            pattern.frame_count()
        );

        let mut captures = Vec::with_capacity(pattern.frame_count());
        for (index, image) in pattern.images().enumerate() {
            if cancel.is_cancelled() {
                log::warn!("scan cancelled at frame {index}");
                return Err(GrayCodeError::Cancelled);
            }
            output.display_pattern(&image);
            std::thread::sleep(self.config.settle_delay());
            let frame = camera
                .grab_frame()
                .ok_or(GrayCodeError::NoFrame { index })?;
            log::debug!("captured frame {}/{}", index + 1, pattern.frame_count());
            captures.push(frame);
        }

        let data_set = codec.decode(&captures, self.config.threshold)?;
        log::info!("scan decoded with {} active pixels", data_set.active_count());
        Ok(&*self.data_set.insert(data_set))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GrayCodeError> {
        match &self.data_set {
            Some(ds) => ds.save(path),
            None => Err(GrayCodeError::InvalidInput("no scan data to save".into())),
        }
    }

    pub fn load(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<&CorrespondenceDataSet, GrayCodeError> {
        let ds = CorrespondenceDataSet::load(path)?;
        Ok(&*self.data_set.insert(ds))
    }
}
