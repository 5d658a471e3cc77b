use nalgebra::Point2;
use procam_calib::{HomographyEstimator, HomographyParams};
use procam_core::GrayImage;
use procam_graycode::GrayCodeCodec;

#[test]
fn identity_rig_recovers_unit_homography() {
    let codec = GrayCodeCodec::new(800, 600).unwrap();
    // camera sees the projector pixel for pixel, with a dim black level
    let frames: Vec<GrayImage> = codec
        .pattern()
        .images()
        .map(|img| GrayImage {
            width: img.width,
            height: img.height,
            data: img.data.iter().map(|&v| if v > 0 { 210 } else { 25 }).collect(),
        })
        .collect();
    let data_set = codec.decode(&frames, 10).unwrap();
    assert_eq!(data_set.active_count(), 800 * 600);

    let params = HomographyParams {
        sample_stride: 7,
        ..HomographyParams::default()
    };
    let fit = HomographyEstimator::new(params)
        .fit_data_set(&data_set, None)
        .unwrap();
    let centre = fit.homography.apply(Point2::new(400.0, 300.0));
    assert!((centre - Point2::new(400.0, 300.0)).norm() < 1.0, "{centre}");
    assert!(fit.rms < 1e-3);
}
