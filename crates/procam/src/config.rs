//! One JSON file holding every tunable of a scan-and-calibrate session.

use crate::ProcamError;
use procam_calib::{HomographyParams, IntrinsicsFlags, ProjectorCalibrationParams, StereoParams};
use procam_graycode::ScanConfig;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Missing sections fall back to their defaults, so a config file only
/// needs the values it changes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcamConfig {
    pub scan: ScanConfig,
    pub homography: HomographyParams,
    pub intrinsics: IntrinsicsFlags,
    pub stereo: StereoParams,
    pub projector: ProjectorCalibrationParams,
}

impl ProcamConfig {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ProcamError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ProcamError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
