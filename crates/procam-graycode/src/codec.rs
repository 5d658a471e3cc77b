//! Reflected binary (Gray) code patterns and their per-pixel decoder.

use crate::{CorrespondenceDataSet, GrayCodeError};
use procam_core::GrayImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

pub fn binary_to_gray(value: u32) -> u32 {
    value ^ (value >> 1)
}

pub fn gray_to_binary(gray: u32) -> u32 {
    let mut binary = gray;
    let mut shift = 1;
    while shift < 32 {
        binary ^= binary >> shift;
        shift <<= 1;
    }
    binary
}

/// Number of bit-planes needed to address `len` positions, i.e. `ceil(log2(len))`.
pub fn bits_for(len: u32) -> u32 {
    if len <= 1 {
        0
    } else {
        u32::BITS - (len - 1).leading_zeros()
    }
}

/// Projector axis addressed by a bit-plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Column index, drawn as vertical stripes.
    X,
    /// Row index, drawn as horizontal stripes.
    Y,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternFrame {
    White,
    Black,
    /// `plane == 0` carries the most significant bit of the axis.
    BitPlane { axis: Axis, plane: u32 },
}

/// The frame sequence for one projector resolution.
///
/// Order: white, black, the Y planes (MSB first), then the X planes (MSB first).
/// Images are rendered on demand; the pattern itself only stores dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    width: u32,
    height: u32,
    x_bits: u32,
    y_bits: u32,
}

/// Build the pattern for a `width x height` projector.
pub fn generate(width: u32, height: u32) -> Result<Pattern, GrayCodeError> {
    Pattern::new(width, height)
}

impl Pattern {
    pub fn new(width: u32, height: u32) -> Result<Self, GrayCodeError> {
        if width == 0 || height == 0 {
            return Err(GrayCodeError::InvalidInput(format!(
                "projector resolution must be non-zero, got {width}x{height}"
            )));
        }
        Ok(Self {
            width,
            height,
            x_bits: bits_for(width),
            y_bits: bits_for(height),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn x_bits(&self) -> u32 {
        self.x_bits
    }

    pub fn y_bits(&self) -> u32 {
        self.y_bits
    }

    pub fn frame_count(&self) -> usize {
        2 + (self.x_bits + self.y_bits) as usize
    }

    pub fn frame(&self, index: usize) -> Option<PatternFrame> {
        let y_end = 2 + self.y_bits as usize;
        match index {
            0 => Some(PatternFrame::White),
            1 => Some(PatternFrame::Black),
            i if i < y_end => Some(PatternFrame::BitPlane {
                axis: Axis::Y,
                plane: (i - 2) as u32,
            }),
            i if i < self.frame_count() => Some(PatternFrame::BitPlane {
                axis: Axis::X,
                plane: (i - y_end) as u32,
            }),
            _ => None,
        }
    }

    pub fn frames(&self) -> impl Iterator<Item = PatternFrame> + '_ {
        (0..self.frame_count()).filter_map(|i| self.frame(i))
    }

    /// Whether projector pixel `(x, y)` is lit in `frame`.
    pub fn is_lit(&self, frame: PatternFrame, x: u32, y: u32) -> bool {
        match frame {
            PatternFrame::White => true,
            PatternFrame::Black => false,
            PatternFrame::BitPlane { axis, plane } => {
                let (coord, bits) = match axis {
                    Axis::X => (x, self.x_bits),
                    Axis::Y => (y, self.y_bits),
                };
                (binary_to_gray(coord) >> (bits - 1 - plane)) & 1 == 1
            }
        }
    }

    pub fn render_frame(&self, frame: PatternFrame) -> GrayImage {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut img = GrayImage::filled(w, h, 0);
        for y in 0..h {
            for x in 0..w {
                if self.is_lit(frame, x as u32, y as u32) {
                    img.data[y * w + x] = 255;
                }
            }
        }
        img
    }

    pub fn render(&self, index: usize) -> Option<GrayImage> {
        self.frame(index).map(|f| self.render_frame(f))
    }

    /// Lazily rendered frames, in projection order.
    pub fn images(&self) -> impl Iterator<Item = GrayImage> + '_ {
        self.frames().map(|f| self.render_frame(f))
    }
}

/// Pattern generator and decoder for one projector resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GrayCodeCodec {
    pattern: Pattern,
}

struct Decoded {
    index: u32,
    swing: u8,
    active: bool,
}

impl GrayCodeCodec {
    pub fn new(projector_width: u32, projector_height: u32) -> Result<Self, GrayCodeError> {
        Ok(Self {
            pattern: generate(projector_width, projector_height)?,
        })
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Decode a captured sequence (same order as [`Pattern::frames`]).
    ///
    /// A pixel is active when its white/black swing is strictly greater than
    /// `threshold` and both decoded indices fall inside the projector.
    /// Low contrast is not an error: the resulting set simply has few or no
    /// active pixels.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, frames), fields(frames = frames.len()))
    )]
    pub fn decode(
        &self,
        frames: &[GrayImage],
        threshold: u8,
    ) -> Result<CorrespondenceDataSet, GrayCodeError> {
        let pattern = &self.pattern;
        if frames.len() != pattern.frame_count() {
            return Err(GrayCodeError::FrameCountMismatch {
                expected: pattern.frame_count(),
                got: frames.len(),
            });
        }
        let (w, h) = (frames[0].width, frames[0].height);
        if w == 0 || h == 0 || frames[0].data.len() != w * h {
            return Err(GrayCodeError::InvalidInput(format!(
                "captured frames have invalid size {w}x{h}"
            )));
        }
        for (index, f) in frames.iter().enumerate() {
            if f.width != w || f.height != h || f.data.len() != w * h {
                return Err(GrayCodeError::FrameSizeMismatch {
                    index,
                    expected_w: w,
                    expected_h: h,
                    got_w: f.width,
                    got_h: f.height,
                });
            }
        }

        let white = &frames[0];
        let black = &frames[1];
        let y_start = 2usize;
        let x_start = y_start + pattern.y_bits as usize;
        let planes = &frames[y_start..];

        let mut cells: Vec<Decoded> = (0..w * h)
            .map(|_| Decoded {
                index: 0,
                swing: 0,
                active: false,
            })
            .collect();

        cells.par_chunks_mut(w).enumerate().for_each(|(row, out)| {
            for (col, cell) in out.iter_mut().enumerate() {
                let i = row * w + col;
                let hi = white.data[i];
                let lo = black.data[i];
                let swing = hi.saturating_sub(lo);
                cell.swing = swing;
                if swing <= threshold {
                    continue;
                }
                let mid2 = hi as u16 + lo as u16;
                let read_axis = |start: usize, bits: u32| {
                    (0..bits as usize).fold(0u32, |acc, k| {
                        let bit = 2 * planes[start - y_start + k].data[i] as u16 > mid2;
                        (acc << 1) | bit as u32
                    })
                };
                let py = gray_to_binary(read_axis(y_start, pattern.y_bits));
                let px = gray_to_binary(read_axis(x_start, pattern.x_bits));
                if px < pattern.width && py < pattern.height {
                    cell.index = py * pattern.width + px;
                    cell.active = true;
                }
            }
        });

        let active_count = cells.iter().filter(|c| c.active).count();
        log::debug!(
            "decoded {}x{} camera frames: {} active pixels ({:.1}%)",
            w,
            h,
            active_count,
            100.0 * active_count as f64 / (w * h) as f64
        );

        let mut pixels = Vec::with_capacity(cells.len());
        let mut active = Vec::with_capacity(cells.len());
        let mut swing = Vec::with_capacity(cells.len());
        for c in cells {
            pixels.push(c.index);
            active.push(c.active);
            swing.push(c.swing);
        }

        CorrespondenceDataSet::from_parts(
            (w as u32, h as u32),
            (pattern.width, pattern.height),
            pixels,
            active,
            swing,
            white.clone(),
            black.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_code_round_trips() {
        for i in 0..4096 {
            let g = binary_to_gray(i);
            assert_eq!(gray_to_binary(g), i);
            if i > 0 {
                assert_eq!((g ^ binary_to_gray(i - 1)).count_ones(), 1);
            }
        }
    }

    #[test]
    fn bit_counts_follow_ceil_log2() {
        assert_eq!(bits_for(1), 0);
        assert_eq!(bits_for(2), 1);
        assert_eq!(bits_for(800), 10);
        assert_eq!(bits_for(1024), 10);
        assert_eq!(bits_for(1025), 11);

        let p = generate(1920, 1080).expect("pattern");
        assert_eq!((p.x_bits(), p.y_bits()), (11, 11));
        assert_eq!(p.frame_count(), 24);
    }

    #[test]
    fn frame_order_is_white_black_y_then_x() {
        let p = generate(8, 4).expect("pattern");
        let frames: Vec<PatternFrame> = p.frames().collect();
        assert_eq!(frames[0], PatternFrame::White);
        assert_eq!(frames[1], PatternFrame::Black);
        assert_eq!(
            frames[2],
            PatternFrame::BitPlane { axis: Axis::Y, plane: 0 }
        );
        assert_eq!(
            frames[4],
            PatternFrame::BitPlane { axis: Axis::X, plane: 0 }
        );
        assert_eq!(frames.len(), 7);
        assert!(p.frame(7).is_none());
    }

    #[test]
    fn most_significant_x_plane_splits_the_image() {
        let p = generate(8, 1).expect("pattern");
        let img = p.render_frame(PatternFrame::BitPlane { axis: Axis::X, plane: 0 });
        // gray(0..8) = 0 1 3 2 6 7 5 4: the MSB is set for x >= 4
        assert_eq!(img.data, vec![0, 0, 0, 0, 255, 255, 255, 255]);
    }

    #[test]
    fn zero_sized_pattern_is_rejected() {
        assert!(matches!(
            generate(0, 10),
            Err(GrayCodeError::InvalidInput(_))
        ));
    }

    #[test]
    fn wrong_frame_count_is_a_hard_error() {
        let codec = GrayCodeCodec::new(16, 16).expect("codec");
        let frames = vec![GrayImage::filled(4, 4, 0); 3];
        assert!(matches!(
            codec.decode(&frames, 10),
            Err(GrayCodeError::FrameCountMismatch { expected: 10, got: 3 })
        ));
    }
}
