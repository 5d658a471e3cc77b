use nalgebra::{
    Isometry3, Matrix3, Matrix4, Point3, Rotation3, Translation3, UnitQuaternion, Vector3,
};
use serde::{Deserialize, Serialize};

/// Rigid pose mapping points from a source frame into a target frame.
///
/// Naming follows `target_from_source`: `camera_from_board.transform_point(p)`
/// takes a board point into camera coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    pub iso: Isometry3<f64>,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidTransform {
    pub fn identity() -> Self {
        Self {
            iso: Isometry3::identity(),
        }
    }

    pub fn from_isometry(iso: Isometry3<f64>) -> Self {
        Self { iso }
    }

    pub fn from_rotation_translation(r: Rotation3<f64>, t: Vector3<f64>) -> Self {
        Self {
            iso: Isometry3::from_parts(
                Translation3::from(t),
                UnitQuaternion::from_rotation_matrix(&r),
            ),
        }
    }

    /// Build from a Rodrigues rotation vector and a translation.
    pub fn from_rvec_tvec(rvec: Vector3<f64>, tvec: Vector3<f64>) -> Self {
        Self {
            iso: Isometry3::from_parts(
                Translation3::from(tvec),
                UnitQuaternion::from_scaled_axis(rvec),
            ),
        }
    }

    pub fn rvec(&self) -> Vector3<f64> {
        self.iso.rotation.scaled_axis()
    }

    pub fn tvec(&self) -> Vector3<f64> {
        self.iso.translation.vector
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.iso.rotation.to_rotation_matrix().into_inner()
    }

    /// Homogeneous 4x4 matrix.
    pub fn matrix(&self) -> Matrix4<f64> {
        self.iso.to_homogeneous()
    }

    /// Row-major copy of [`RigidTransform::matrix`].
    pub fn to_row_major(&self) -> [f64; 16] {
        let m = self.matrix();
        let mut out = [0.0; 16];
        for r in 0..4 {
            for c in 0..4 {
                out[r * 4 + c] = m[(r, c)];
            }
        }
        out
    }

    /// Accepts a homogeneous matrix whose upper-left block is a rotation.
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        let r = m.fixed_view::<3, 3>(0, 0).into_owned();
        let t = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
        Self::from_rotation_translation(Rotation3::from_matrix(&r), t)
    }

    pub fn inverse(&self) -> Self {
        Self {
            iso: self.iso.inverse(),
        }
    }

    /// `self * other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &RigidTransform) -> Self {
        Self {
            iso: self.iso * other.iso,
        }
    }

    #[inline]
    pub fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        self.iso.transform_point(p)
    }

    /// Rotation angle (radians) between two poses.
    pub fn rotation_angle_to(&self, other: &RigidTransform) -> f64 {
        self.iso.rotation.angle_to(&other.iso.rotation)
    }
}
