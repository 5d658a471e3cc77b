use procam_core::{CancelToken, GrayImage};
use procam_graycode::{
    generate, CorrespondenceDataSet, FrameSource, GrayCodeCodec, GrayCodeError, GraycodeScan,
    Pattern, ScanConfig, VideoOutput,
};
use std::cell::RefCell;
use std::rc::Rc;

/// Camera that sees the projector pixel-for-pixel with `lo`/`hi` brightness levels.
fn identity_capture(pattern: &Pattern, lo: u8, hi: u8) -> Vec<GrayImage> {
    pattern
        .images()
        .map(|img| GrayImage {
            width: img.width,
            height: img.height,
            data: img
                .data
                .iter()
                .map(|&v| if v > 0 { hi } else { lo })
                .collect(),
        })
        .collect()
}

#[test]
fn noise_free_capture_decodes_every_pixel_exactly() {
    for (w, h) in [(1, 1), (2, 3), (13, 7), (64, 48), (100, 37)] {
        let codec = GrayCodeCodec::new(w, h).expect("codec");
        let frames = identity_capture(codec.pattern(), 20, 230);
        let ds = codec.decode(&frames, 10).expect("decode");

        assert_eq!(ds.camera_size(), (w, h));
        assert_eq!(ds.active_count(), (w * h) as usize, "size {w}x{h}");
        for px in ds.iter() {
            let p = px.projector.expect("active");
            assert_eq!(p, px.camera, "size {w}x{h}");
        }
    }
}

#[test]
fn threshold_is_exclusive() {
    let codec = GrayCodeCodec::new(16, 8).expect("codec");
    let threshold = 40;

    let active_at = |white: u8| {
        let capture = identity_capture(codec.pattern(), 30, white);
        codec.decode(&capture, threshold).expect("decode").active_count()
    };
    assert_eq!(active_at(29 + threshold), 0);
    assert_eq!(active_at(30 + threshold), 0);
    assert_eq!(active_at(31 + threshold), 16 * 8);
}

#[test]
fn camera_larger_than_projector_marks_out_of_range_inactive() {
    // 5-wide projector uses 3 bits; camera columns 5..8 decode to x >= 5 and must be dropped
    let pattern = generate(5, 1).expect("pattern");
    let wide = generate(8, 1).expect("pattern");
    let frames = identity_capture(&wide, 0, 200);
    let codec = GrayCodeCodec::new(pattern.width(), pattern.height()).expect("codec");
    assert_eq!(wide.frame_count(), pattern.frame_count());

    let ds = codec.decode(&frames, 10).expect("decode");
    assert_eq!(ds.active_count(), 5);
    assert!(ds.camera_to_projector(6, 0).is_none());
}

#[test]
fn mismatched_frame_sizes_are_rejected() {
    let codec = GrayCodeCodec::new(4, 4).expect("codec");
    let mut frames = identity_capture(codec.pattern(), 0, 255);
    frames[3] = GrayImage::filled(3, 4, 0);
    assert!(matches!(
        codec.decode(&frames, 10),
        Err(GrayCodeError::FrameSizeMismatch { index: 3, .. })
    ));
}

#[test]
fn median_inverse_of_identity_scan_is_the_white_frame() {
    let codec = GrayCodeCodec::new(32, 16).expect("codec");
    let mut frames = identity_capture(codec.pattern(), 10, 200);
    for (i, v) in frames[0].data.iter_mut().enumerate() {
        *v = 100 + (i % 100) as u8;
    }
    let ds = codec.decode(&frames, 10).expect("decode");
    assert_eq!(ds.median_inverse(), frames[0]);
}

#[test]
fn persistence_round_trip_is_bit_exact() {
    let codec = GrayCodeCodec::new(40, 30).expect("codec");
    let mut frames = identity_capture(codec.pattern(), 25, 210);
    // knock out a block so the mask is not trivial
    for y in 5..12 {
        for x in 3..9 {
            frames[0].set(x, y, 25);
        }
    }
    let ds = codec.decode(&frames, 10).expect("decode");
    assert!(ds.active_count() < 40 * 30);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("scan.gcds");
    ds.save(&path).expect("save");
    let loaded = CorrespondenceDataSet::load(&path).expect("load");
    assert_eq!(loaded, ds);

    let mut bytes = Vec::new();
    ds.write_to(&mut bytes).expect("encode");
    bytes.truncate(bytes.len() / 2);
    assert!(CorrespondenceDataSet::read_from(bytes.as_slice()).is_err());
}

struct SharedProjector {
    shown: Rc<RefCell<Option<GrayImage>>>,
    size: (u32, u32),
    ready: bool,
    displayed: usize,
}

impl VideoOutput for SharedProjector {
    fn display_pattern(&mut self, image: &GrayImage) {
        self.displayed += 1;
        *self.shown.borrow_mut() = Some(image.clone());
    }

    fn output_size(&self) -> (u32, u32) {
        self.size
    }

    fn is_output_ready(&self) -> bool {
        self.ready
    }
}

struct LookingCamera {
    shown: Rc<RefCell<Option<GrayImage>>>,
}

impl FrameSource for LookingCamera {
    fn grab_frame(&mut self) -> Option<GrayImage> {
        let shown = self.shown.borrow();
        let img = shown.as_ref()?;
        Some(GrayImage {
            width: img.width,
            height: img.height,
            data: img.data.iter().map(|&v| if v > 0 { 190 } else { 15 }).collect(),
        })
    }
}

fn rig(size: (u32, u32), ready: bool) -> (SharedProjector, LookingCamera) {
    let shown = Rc::new(RefCell::new(None));
    (
        SharedProjector {
            shown: shown.clone(),
            size,
            ready,
            displayed: 0,
        },
        LookingCamera { shown },
    )
}

#[test]
fn scan_matches_direct_decode() {
    let (mut output, mut camera) = rig((24, 12), true);
    let mut scan = GraycodeScan::new(ScanConfig {
        threshold: 10,
        settle_delay_ms: 0,
    });
    let scanned = scan.run(&mut output, &mut camera).expect("scan").clone();

    let codec = GrayCodeCodec::new(24, 12).expect("codec");
    let direct = codec
        .decode(&identity_capture(codec.pattern(), 15, 190), 10)
        .expect("decode");
    assert_eq!(scanned, direct);
    assert_eq!(output.displayed, codec.pattern().frame_count());
}

#[test]
fn scan_failures_keep_previous_data() {
    let mut scan = GraycodeScan::new(ScanConfig {
        threshold: 10,
        settle_delay_ms: 0,
    });
    let (mut output, mut camera) = rig((8, 8), true);
    scan.run(&mut output, &mut camera).expect("first scan");
    let before = scan.data_set().cloned();

    let (mut dark, mut camera) = rig((8, 8), false);
    assert!(matches!(
        scan.run(&mut dark, &mut camera),
        Err(GrayCodeError::OutputNotReady)
    ));

    let cancel = CancelToken::new();
    cancel.cancel();
    let (mut output, mut camera) = rig((16, 16), true);
    assert!(matches!(
        scan.run_with_cancel(&mut output, &mut camera, &cancel),
        Err(GrayCodeError::Cancelled)
    ));
    assert_eq!(output.displayed, 0);
    assert_eq!(scan.data_set().cloned(), before);
}
