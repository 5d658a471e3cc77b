//! PNG import and export on top of the `image` crate.

use crate::ProcamError;
use procam_core::{GrayImage, GrayImageView};
use procam_graycode::{CorrespondenceDataSet, Pattern};
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Borrow an `image::GrayImage` as a [`GrayImageView`] without copying.
pub fn gray_view(img: &::image::GrayImage) -> GrayImageView<'_> {
    GrayImageView {
        width: img.width() as usize,
        height: img.height() as usize,
        data: img.as_raw(),
    }
}

pub fn from_image(img: &::image::GrayImage) -> GrayImage {
    GrayImage {
        width: img.width() as usize,
        height: img.height() as usize,
        data: img.as_raw().clone(),
    }
}

pub fn to_image(img: &GrayImage) -> Result<::image::GrayImage, ProcamError> {
    ::image::GrayImage::from_raw(img.width as u32, img.height as u32, img.data.clone()).ok_or_else(
        || {
            ProcamError::InvalidInput(format!(
                "{}x{} image holds {} bytes",
                img.width,
                img.height,
                img.data.len()
            ))
        },
    )
}

/// Any format `image` can decode, converted to 8-bit luma.
pub fn load_gray(path: impl AsRef<Path>) -> Result<GrayImage, ProcamError> {
    let img = ::image::open(path)?.to_luma8();
    Ok(from_image(&img))
}

pub fn save_png(img: &GrayImage, path: impl AsRef<Path>) -> Result<(), ProcamError> {
    to_image(img)?.save_with_format(path, ::image::ImageFormat::Png)?;
    Ok(())
}

/// Write every frame of `pattern` as `pattern_NN.png` in projection order.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(pattern, dir), fields(frames = pattern.frame_count()))
)]
pub fn write_pattern(
    pattern: &Pattern,
    dir: impl AsRef<Path>,
) -> Result<Vec<PathBuf>, ProcamError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    pattern
        .images()
        .enumerate()
        .map(|(i, img)| {
            let path = dir.join(format!("pattern_{i:02}.png"));
            save_png(&img, &path)?;
            Ok(path)
        })
        .collect()
}

/// Load every PNG in `dir`, sorted by file name.
#[cfg_attr(feature = "tracing", instrument(level = "info", skip(dir)))]
pub fn load_frames(dir: impl AsRef<Path>) -> Result<Vec<GrayImage>, ProcamError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_png = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("png"));
        if is_png {
            paths.push(path);
        }
    }
    paths.sort();
    log::debug!("loading {} frames", paths.len());
    paths.iter().map(load_gray).collect()
}

/// `median.png`, `median_inverse.png` and `active.png` for a decoded scan.
pub fn write_previews(
    data_set: &CorrespondenceDataSet,
    dir: impl AsRef<Path>,
) -> Result<(), ProcamError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    save_png(&data_set.median(), dir.join("median.png"))?;
    save_png(&data_set.median_inverse(), dir.join("median_inverse.png"))?;
    save_png(&data_set.active_map(), dir.join("active.png"))?;
    Ok(())
}
