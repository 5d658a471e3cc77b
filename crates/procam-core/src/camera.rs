//! Pinhole camera with the OpenCV rational distortion model.
//!
//! Coefficients follow OpenCV ordering `(k1, k2, p1, p2, k3, k4, k5, k6)`:
//!
//! ```text
//! r2 = x^2 + y^2
//! radial = (1 + k1 r2 + k2 r2^2 + k3 r2^3) / (1 + k4 r2 + k5 r2^2 + k6 r2^3)
//! x' = x radial + 2 p1 x y + p2 (r2 + 2 x^2)
//! y' = y radial + p1 (r2 + 2 y^2) + 2 p2 x y
//! ```

use crate::{CoreError, RigidTransform};
use nalgebra::{Matrix3, Point2, Point3, Vector2};
use serde::{Deserialize, Serialize};

const UNDISTORT_ITERATIONS: usize = 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
    pub k4: f64,
    pub k5: f64,
    pub k6: f64,
}

impl Distortion {
    pub fn none() -> Self {
        Self::default()
    }

    /// `true` when any denominator term of the rational model is in use.
    pub fn is_rational(&self) -> bool {
        self.k4 != 0.0 || self.k5 != 0.0 || self.k6 != 0.0
    }

    pub fn as_array(&self) -> [f64; 8] {
        [
            self.k1, self.k2, self.p1, self.p2, self.k3, self.k4, self.k5, self.k6,
        ]
    }

    pub fn from_array(c: [f64; 8]) -> Self {
        Self {
            k1: c[0],
            k2: c[1],
            p1: c[2],
            p2: c[3],
            k3: c[4],
            k4: c[5],
            k5: c[6],
            k6: c[7],
        }
    }

    /// Export in OpenCV layout: 5 coefficients, or 8 with the rational terms.
    pub fn to_vec(&self) -> Vec<f64> {
        let all = self.as_array();
        if self.is_rational() {
            all.to_vec()
        } else {
            all[..5].to_vec()
        }
    }

    /// Accepts 0, 4, 5 or 8 coefficients.
    pub fn from_slice(coeffs: &[f64]) -> Result<Self, CoreError> {
        if !matches!(coeffs.len(), 0 | 4 | 5 | 8) {
            return Err(CoreError::InvalidInput(format!(
                "expected 0, 4, 5 or 8 distortion coefficients, got {}",
                coeffs.len()
            )));
        }
        let mut all = [0.0; 8];
        all[..coeffs.len()].copy_from_slice(coeffs);
        Ok(Self::from_array(all))
    }

    /// Apply distortion to an ideal normalized point.
    pub fn distort(&self, p: Vector2<f64>) -> Vector2<f64> {
        let (x, y) = (p.x, p.y);
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = (1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6)
            / (1.0 + self.k4 * r2 + self.k5 * r4 + self.k6 * r6);
        let xy = x * y;
        Vector2::new(
            x * radial + 2.0 * self.p1 * xy + self.p2 * (r2 + 2.0 * x * x),
            y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * xy,
        )
    }

    /// Fixed-point inversion of [`Distortion::distort`].
    pub fn undistort(&self, p: Vector2<f64>) -> Vector2<f64> {
        if *self == Self::none() {
            return p;
        }
        let (x0, y0) = (p.x, p.y);
        let (mut x, mut y) = (x0, y0);
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let icdist = (1.0 + ((self.k6 * r2 + self.k5) * r2 + self.k4) * r2)
                / (1.0 + ((self.k3 * r2 + self.k2) * r2 + self.k1) * r2);
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (x0 - dx) * icdist;
            y = (y0 - dy) * icdist;
        }
        Vector2::new(x, y)
    }
}

/// Intrinsics of a camera (or of a projector treated as an inverse camera).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub image_size: (u32, u32),
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub distortion: Distortion,
}

impl CameraModel {
    pub fn new(image_size: (u32, u32), fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            image_size,
            fx,
            fy,
            cx,
            cy,
            distortion: Distortion::none(),
        }
    }

    /// Principal point at the image centre, focal length equal to the width.
    pub fn initial_guess(image_size: (u32, u32)) -> Self {
        let (w, h) = (image_size.0 as f64, image_size.1 as f64);
        Self::new(image_size, w, w, w / 2.0, h / 2.0)
    }

    pub fn with_distortion(mut self, distortion: Distortion) -> Self {
        self.distortion = distortion;
        self
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Build from a 3x3 camera matrix; skew is ignored.
    pub fn from_camera_matrix(
        image_size: (u32, u32),
        k: &Matrix3<f64>,
        distortion: Distortion,
    ) -> Self {
        Self::new(image_size, k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)])
            .with_distortion(distortion)
    }

    /// Finite parameters and positive focal lengths.
    pub fn is_valid(&self) -> bool {
        let all = [self.fx, self.fy, self.cx, self.cy];
        all.iter()
            .chain(self.distortion.as_array().iter())
            .all(|v| v.is_finite())
            && self.fx > 0.0
            && self.fy > 0.0
    }

    /// Project a camera-frame point. Points at or behind the camera give `None`.
    pub fn project(&self, p: &Point3<f64>) -> Option<Point2<f64>> {
        if p.z <= 1e-12 {
            return None;
        }
        Some(self.project_unchecked(p))
    }

    /// Projection without the cheirality check, used inside residuals.
    #[inline]
    pub fn project_unchecked(&self, p: &Point3<f64>) -> Point2<f64> {
        let d = self.distortion.distort(Vector2::new(p.x / p.z, p.y / p.z));
        Point2::new(self.fx * d.x + self.cx, self.fy * d.y + self.cy)
    }

    /// Project a world point through a world-to-camera transform.
    pub fn project_world(
        &self,
        camera_from_world: &RigidTransform,
        p: &Point3<f64>,
    ) -> Option<Point2<f64>> {
        self.project(&camera_from_world.transform_point(p))
    }

    /// Undistorted normalized coordinates of a pixel.
    pub fn normalize(&self, pixel: &Point2<f64>) -> Point2<f64> {
        let d = Vector2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy);
        let u = self.distortion.undistort(d);
        Point2::new(u.x, u.y)
    }

    /// Where a pixel would land on an ideal (distortion free) camera with the same K.
    pub fn undistort_pixel(&self, pixel: &Point2<f64>) -> Point2<f64> {
        let n = self.normalize(pixel);
        Point2::new(self.fx * n.x + self.cx, self.fy * n.y + self.cy)
    }

    /// OpenCV-style coefficient vector, see [`Distortion::to_vec`].
    pub fn distortion_vector(&self) -> Vec<f64> {
        self.distortion.to_vec()
    }

    pub fn without_distortion(&self) -> Self {
        Self {
            distortion: Distortion::none(),
            ..*self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_camera() -> CameraModel {
        CameraModel::new((1280, 720), 900.0, 910.0, 640.0, 360.0).with_distortion(Distortion {
            k1: -0.21,
            k2: 0.05,
            p1: 0.001,
            p2: -0.0005,
            k3: 0.0,
            ..Distortion::none()
        })
    }

    #[test]
    fn undistort_inverts_distort() {
        let cam = sample_camera();
        for (x, y) in [(0.0, 0.0), (0.2, -0.1), (-0.35, 0.25), (0.4, 0.3)] {
            let ideal = Vector2::new(x, y);
            let back = cam.distortion.undistort(cam.distortion.distort(ideal));
            assert_relative_eq!(back, ideal, epsilon = 1e-6);
        }
    }

    #[test]
    fn normalize_inverts_project() {
        let cam = sample_camera();
        let p = Point3::new(0.3, -0.2, 2.0);
        let px = cam.project(&p).expect("in front");
        let n = cam.normalize(&px);
        assert_relative_eq!(n.x, 0.15, epsilon = 1e-6);
        assert_relative_eq!(n.y, -0.1, epsilon = 1e-6);
    }

    #[test]
    fn points_behind_camera_do_not_project() {
        let cam = sample_camera();
        assert!(cam.project(&Point3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn export_uses_five_or_eight_coefficients() {
        let mut d = sample_camera().distortion;
        assert_eq!(d.to_vec().len(), 5);
        d.k4 = 0.01;
        assert_eq!(d.to_vec().len(), 8);
        assert_eq!(Distortion::from_slice(&d.to_vec()).expect("valid"), d);
        assert!(Distortion::from_slice(&[0.0; 6]).is_err());
    }
}
