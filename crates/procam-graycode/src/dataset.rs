//! Dense camera→projector correspondence map produced by a Gray-code decode.

use crate::GrayCodeError;
use nalgebra::Point2;
use procam_core::GrayImage;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: [u8; 4] = *b"GCDS";
const VERSION: u32 = 1;

/// One camera pixel of the map. `projector` is `None` for inactive pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataSetPixel {
    pub camera: Point2<u32>,
    pub projector: Option<Point2<u32>>,
}

impl DataSetPixel {
    pub fn is_active(&self) -> bool {
        self.projector.is_some()
    }
}

/// Result of a Gray-code decode.
///
/// Immutable once built: a new scan produces a new set rather than updating
/// this one. The projector→camera inverse map is built at construction.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrespondenceDataSet {
    camera_size: (u32, u32),
    projector_size: (u32, u32),
    /// Projector index `y * projector_width + x` per camera pixel; meaningless when inactive.
    pixels: Vec<u32>,
    active: Vec<bool>,
    /// Saturating `white - black` per camera pixel.
    swing: Vec<u8>,
    white: GrayImage,
    black: GrayImage,
    inverse: Vec<Option<u32>>,
}

#[derive(Serialize)]
struct DataSetFileRef<'a> {
    magic: [u8; 4],
    version: u32,
    camera_width: u32,
    camera_height: u32,
    projector_width: u32,
    projector_height: u32,
    pixels: &'a [u32],
    active_mask: Vec<u8>,
    swing: &'a [u8],
    white: &'a [u8],
    black: &'a [u8],
}

#[derive(Deserialize)]
struct DataSetFile {
    magic: [u8; 4],
    version: u32,
    camera_width: u32,
    camera_height: u32,
    projector_width: u32,
    projector_height: u32,
    pixels: Vec<u32>,
    active_mask: Vec<u8>,
    swing: Vec<u8>,
    white: Vec<u8>,
    black: Vec<u8>,
}

fn pack_mask(active: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; active.len().div_ceil(8)];
    for (i, _) in active.iter().enumerate().filter(|(_, a)| **a) {
        out[i / 8] |= 1 << (i % 8);
    }
    out
}

fn unpack_mask(bytes: &[u8], len: usize) -> Vec<bool> {
    (0..len).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect()
}

impl CorrespondenceDataSet {
    /// Assemble a data set, validating sizes and building the inverse map.
    pub fn from_parts(
        camera_size: (u32, u32),
        projector_size: (u32, u32),
        pixels: Vec<u32>,
        active: Vec<bool>,
        swing: Vec<u8>,
        white: GrayImage,
        black: GrayImage,
    ) -> Result<Self, GrayCodeError> {
        let n = camera_size.0 as usize * camera_size.1 as usize;
        let (cw, ch) = (camera_size.0 as usize, camera_size.1 as usize);
        let lengths_ok = pixels.len() == n
            && active.len() == n
            && swing.len() == n
            && white.width == cw
            && white.height == ch
            && white.data.len() == n
            && black.same_size(&white)
            && black.data.len() == n;
        if !lengths_ok {
            return Err(GrayCodeError::CorruptDataSet(format!(
                "array sizes do not match a {}x{} camera",
                camera_size.0, camera_size.1
            )));
        }
        let projector_len = projector_size.0 as usize * projector_size.1 as usize;
        if let Some(bad) = (0..n).find(|&i| active[i] && pixels[i] as usize >= projector_len) {
            return Err(GrayCodeError::CorruptDataSet(format!(
                "camera pixel {bad} maps outside the {}x{} projector",
                projector_size.0, projector_size.1
            )));
        }

        let mut inverse: Vec<Option<u32>> = vec![None; projector_len];
        for i in (0..n).filter(|&i| active[i]) {
            let slot = &mut inverse[pixels[i] as usize];
            match *slot {
                Some(prev) if swing[prev as usize] >= swing[i] => {}
                _ => *slot = Some(i as u32),
            }
        }

        Ok(Self {
            camera_size,
            projector_size,
            pixels,
            active,
            swing,
            white,
            black,
            inverse,
        })
    }

    pub fn camera_size(&self) -> (u32, u32) {
        self.camera_size
    }

    pub fn projector_size(&self) -> (u32, u32) {
        self.projector_size
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|a| **a).count()
    }

    pub fn white(&self) -> &GrayImage {
        &self.white
    }

    pub fn black(&self) -> &GrayImage {
        &self.black
    }

    fn projector_xy(&self, index: u32) -> Point2<u32> {
        Point2::new(index % self.projector_size.0, index / self.projector_size.0)
    }

    fn camera_xy(&self, index: usize) -> Point2<u32> {
        let w = self.camera_size.0 as usize;
        Point2::new((index % w) as u32, (index / w) as u32)
    }

    pub fn camera_to_projector(&self, x: u32, y: u32) -> Option<Point2<u32>> {
        if x >= self.camera_size.0 || y >= self.camera_size.1 {
            return None;
        }
        let i = y as usize * self.camera_size.0 as usize + x as usize;
        self.active[i].then(|| self.projector_xy(self.pixels[i]))
    }

    pub fn projector_to_camera(&self, x: u32, y: u32) -> Option<Point2<u32>> {
        if x >= self.projector_size.0 || y >= self.projector_size.1 {
            return None;
        }
        let i = y as usize * self.projector_size.0 as usize + x as usize;
        self.inverse[i].map(|c| self.camera_xy(c as usize))
    }

    /// Every camera pixel in row-major order. Restartable: each call starts over.
    pub fn iter(&self) -> DataSetIter<'_> {
        DataSetIter {
            data_set: self,
            next: 0,
        }
    }

    /// `(camera, projector)` pairs of the active pixels.
    pub fn active_pixels(&self) -> impl Iterator<Item = (Point2<u32>, Point2<u32>)> + '_ {
        self.iter().filter_map(|p| p.projector.map(|q| (p.camera, q)))
    }

    /// Active pairs whose camera pixel lies in the square window around `center`.
    pub fn pixels_in_window(
        &self,
        center: Point2<f64>,
        half_size: f64,
    ) -> impl Iterator<Item = (Point2<u32>, Point2<u32>)> + '_ {
        let (w, h) = (self.camera_size.0 as f64, self.camera_size.1 as f64);
        let x0 = (center.x - half_size).floor().clamp(0.0, w) as u32;
        let x1 = (center.x + half_size).ceil().clamp(0.0, w - 1.0) as u32;
        let y0 = (center.y - half_size).floor().clamp(0.0, h) as u32;
        let y1 = (center.y + half_size).ceil().clamp(0.0, h - 1.0) as u32;
        (y0..=y1)
            .flat_map(move |y| (x0..=x1).map(move |x| (x, y)))
            .filter_map(move |(x, y)| {
                self.camera_to_projector(x, y)
                    .map(|p| (Point2::new(x, y), p))
            })
    }

    /// Camera-sized image of the per-pixel decision threshold `(white + black) / 2`.
    pub fn median(&self) -> GrayImage {
        let data = self
            .white
            .data
            .iter()
            .zip(&self.black.data)
            .map(|(&w, &b)| ((w as u16 + b as u16) / 2) as u8)
            .collect();
        GrayImage {
            width: self.white.width,
            height: self.white.height,
            data,
        }
    }

    /// Projector-sized image: the white-frame brightness seen at each projector pixel.
    pub fn median_inverse(&self) -> GrayImage {
        let data = self
            .inverse
            .iter()
            .map(|c| c.map_or(0, |c| self.white.data[c as usize]))
            .collect();
        GrayImage {
            width: self.projector_size.0 as usize,
            height: self.projector_size.1 as usize,
            data,
        }
    }

    /// Camera-sized mask image, 255 where the decode is active.
    pub fn active_map(&self) -> GrayImage {
        GrayImage {
            width: self.camera_size.0 as usize,
            height: self.camera_size.1 as usize,
            data: self.active.iter().map(|&a| if a { 255 } else { 0 }).collect(),
        }
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), GrayCodeError> {
        let file = DataSetFileRef {
            magic: MAGIC,
            version: VERSION,
            camera_width: self.camera_size.0,
            camera_height: self.camera_size.1,
            projector_width: self.projector_size.0,
            projector_height: self.projector_size.1,
            pixels: &self.pixels,
            active_mask: pack_mask(&self.active),
            swing: &self.swing,
            white: &self.white.data,
            black: &self.black.data,
        };
        bincode::serialize_into(writer, &file)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self, GrayCodeError> {
        let file: DataSetFile = bincode::deserialize_from(reader)?;
        if file.magic != MAGIC {
            return Err(GrayCodeError::CorruptDataSet("bad magic".into()));
        }
        if file.version != VERSION {
            return Err(GrayCodeError::CorruptDataSet(format!(
                "unsupported version {}",
                file.version
            )));
        }
        let n = file.camera_width as usize * file.camera_height as usize;
        if file.active_mask.len() != n.div_ceil(8) {
            return Err(GrayCodeError::CorruptDataSet(
                "active mask does not match the camera size".into(),
            ));
        }
        let (cw, ch) = (file.camera_width as usize, file.camera_height as usize);
        let white = GrayImage::from_raw(cw, ch, file.white)
            .map_err(|e| GrayCodeError::CorruptDataSet(e.to_string()))?;
        let black = GrayImage::from_raw(cw, ch, file.black)
            .map_err(|e| GrayCodeError::CorruptDataSet(e.to_string()))?;
        Self::from_parts(
            (file.camera_width, file.camera_height),
            (file.projector_width, file.projector_height),
            file.pixels,
            unpack_mask(&file.active_mask, n),
            file.swing,
            white,
            black,
        )
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GrayCodeError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, GrayCodeError> {
        Self::read_from(BufReader::new(File::open(path)?))
    }
}

pub struct DataSetIter<'a> {
    data_set: &'a CorrespondenceDataSet,
    next: usize,
}

impl Iterator for DataSetIter<'_> {
    type Item = DataSetPixel;

    fn next(&mut self) -> Option<Self::Item> {
        let ds = self.data_set;
        if self.next >= ds.pixels.len() {
            return None;
        }
        let i = self.next;
        self.next += 1;
        Some(DataSetPixel {
            camera: ds.camera_xy(i),
            projector: ds.active[i].then(|| ds.projector_xy(ds.pixels[i])),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.data_set.pixels.len() - self.next;
        (rest, Some(rest))
    }
}

impl ExactSizeIterator for DataSetIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> CorrespondenceDataSet {
        // 3x2 camera looking at a 4x4 projector; pixels 0 and 4 both hit projector (1, 1)
        let white = GrayImage::from_raw(3, 2, vec![200, 90, 40, 180, 250, 30]).expect("white");
        let black = GrayImage::filled(3, 2, 20);
        let swing = white.data.iter().map(|w| w.saturating_sub(20)).collect();
        CorrespondenceDataSet::from_parts(
            (3, 2),
            (4, 4),
            vec![5, 6, 0, 7, 5, 0],
            vec![true, true, false, true, true, false],
            swing,
            white,
            black,
        )
        .expect("valid parts")
    }

    #[test]
    fn inverse_prefers_strongest_swing() {
        let ds = tiny();
        // camera index 4 (x=1, y=1) has swing 230 > 180
        assert_eq!(ds.projector_to_camera(1, 1), Some(Point2::new(1, 1)));
        assert_eq!(ds.projector_to_camera(2, 1), Some(Point2::new(1, 0)));
        assert_eq!(ds.projector_to_camera(0, 0), None);
    }

    #[test]
    fn iteration_is_restartable_and_hides_inactive_coordinates() {
        let ds = tiny();
        let first: Vec<DataSetPixel> = ds.iter().collect();
        let second: Vec<DataSetPixel> = ds.iter().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 6);
        assert!(first[2].projector.is_none());
        assert_eq!(ds.active_pixels().count(), 4);
    }

    #[test]
    fn previews_have_expected_sizes() {
        let ds = tiny();
        let median = ds.median();
        assert_eq!((median.width, median.height), (3, 2));
        assert_eq!(median.get(0, 0), 110);
        let inv = ds.median_inverse();
        assert_eq!((inv.width, inv.height), (4, 4));
        assert_eq!(inv.get(1, 1), 250);
        assert_eq!(ds.active_map().data, vec![255, 255, 0, 255, 255, 0]);
    }

    #[test]
    fn window_query_clips_to_the_image() {
        let ds = tiny();
        let near: Vec<_> = ds.pixels_in_window(Point2::new(0.0, 0.0), 1.0).collect();
        assert_eq!(near.len(), 4);
    }

    #[test]
    fn out_of_range_active_pixels_are_rejected() {
        let err = CorrespondenceDataSet::from_parts(
            (1, 1),
            (2, 2),
            vec![4],
            vec![true],
            vec![100],
            GrayImage::filled(1, 1, 120),
            GrayImage::filled(1, 1, 20),
        );
        assert!(matches!(err, Err(GrayCodeError::CorruptDataSet(_))));
    }
}
