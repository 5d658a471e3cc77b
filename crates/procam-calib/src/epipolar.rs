//! Two-view epipolar geometry: essential/fundamental matrices, optimal
//! match correction and rectification.

use nalgebra::{
    DMatrix, Matrix3, Matrix3x4, Matrix4, Point2, Rotation3, Vector2, Vector3,
};
use procam_core::{CameraModel, RigidTransform};
use serde::{Deserialize, Serialize};

pub fn skew(t: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -t.z, t.y, //
        t.z, 0.0, -t.x, //
        -t.y, t.x, 0.0,
    )
}

/// `E = [t]x R` for `b_from_a = (R, t)`; `x_b^T E x_a = 0` in normalized coordinates.
pub fn essential_from_pose(b_from_a: &RigidTransform) -> Matrix3<f64> {
    skew(&b_from_a.tvec()) * b_from_a.rotation_matrix()
}

/// `F = K_b^-T E K_a^-1`, so that `x_b^T F x_a = 0` in pixels.
pub fn fundamental_from_essential(
    essential: &Matrix3<f64>,
    camera_a: &CameraModel,
    camera_b: &CameraModel,
) -> Option<Matrix3<f64>> {
    let ka_inv = camera_a.camera_matrix().try_inverse()?;
    let kb_inv = camera_b.camera_matrix().try_inverse()?;
    Some(kb_inv.transpose() * essential * ka_inv)
}

/// Bouguet rectification of a calibrated pair.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rectification {
    /// Rotation of camera A into the rectified frame.
    pub r1: Matrix3<f64>,
    pub r2: Matrix3<f64>,
    /// Projection of rectified A coordinates into the rectified A image.
    pub p1: Matrix3x4<f64>,
    /// Projection of rectified A coordinates into the rectified B image.
    pub p2: Matrix3x4<f64>,
    /// Disparity-to-depth mapping.
    pub q: Matrix4<f64>,
}

fn rotation_from_rvec(v: Vector3<f64>) -> Matrix3<f64> {
    Rotation3::new(v).into_inner()
}

/// Mean rectified position of the image corners of `camera`, in units of the
/// new focal length and relative to a zero principal point.
fn rectified_corner_mean(
    camera: &CameraModel,
    rotation: &Matrix3<f64>,
    f_new: f64,
) -> Vector2<f64> {
    let (w, h) = (camera.image_size.0 as f64, camera.image_size.1 as f64);
    let corners = [
        Point2::new(0.0, 0.0),
        Point2::new(w - 1.0, 0.0),
        Point2::new(0.0, h - 1.0),
        Point2::new(w - 1.0, h - 1.0),
    ];
    let sum = corners.iter().fold(Vector2::zeros(), |acc, c| {
        let n = camera.normalize(c);
        let r = rotation * Vector3::new(n.x, n.y, 1.0);
        acc + Vector2::new(f_new * r.x / r.z, f_new * r.y / r.z)
    });
    sum / 4.0
}

/// Rotate both cameras so epipolar lines become image rows (or columns for a
/// mostly vertical baseline). Principal points are shared, so disparity at
/// infinity is zero.
pub fn stereo_rectify(
    camera_a: &CameraModel,
    camera_b: &CameraModel,
    b_from_a: &RigidTransform,
) -> Rectification {
    let half = rotation_from_rvec(-0.5 * b_from_a.rvec());
    let t = half * b_from_a.tvec();

    let idx = if t.x.abs() > t.y.abs() { 0 } else { 1 };
    let c = t[idx];
    let nt = t.norm();
    let mut uu = Vector3::zeros();
    uu[idx] = if c > 0.0 { 1.0 } else { -1.0 };

    let mut ww = t.cross(&uu);
    let nw = ww.norm();
    if nw > 0.0 && nt > 0.0 {
        ww *= (c.abs() / nt).clamp(-1.0, 1.0).acos() / nw;
    }
    let wr = rotation_from_rvec(ww);
    let r1 = wr * half.transpose();
    let r2 = wr * half;
    let t_new = r2 * b_from_a.tvec();

    // focal along the axis orthogonal to the baseline
    let f_new = if idx == 0 {
        camera_a.fy.min(camera_b.fy)
    } else {
        camera_a.fx.min(camera_b.fx)
    };

    let centre = |cam: &CameraModel, r: &Matrix3<f64>| {
        let half_size = Vector2::new(
            (cam.image_size.0 as f64 - 1.0) * 0.5,
            (cam.image_size.1 as f64 - 1.0) * 0.5,
        );
        half_size - rectified_corner_mean(cam, r, f_new)
    };
    let cc = (centre(camera_a, &r1) + centre(camera_b, &r2)) * 0.5;

    let mut p1 = Matrix3x4::zeros();
    p1[(0, 0)] = f_new;
    p1[(1, 1)] = f_new;
    p1[(0, 2)] = cc.x;
    p1[(1, 2)] = cc.y;
    p1[(2, 2)] = 1.0;
    let mut p2 = p1;
    p2[(idx, 3)] = t_new[idx] * f_new;

    let mut q = Matrix4::zeros();
    q[(0, 0)] = 1.0;
    q[(0, 3)] = -cc.x;
    q[(1, 1)] = 1.0;
    q[(1, 3)] = -cc.y;
    q[(2, 3)] = f_new;
    if t_new[idx].abs() > f64::EPSILON {
        q[(3, 2)] = -1.0 / t_new[idx];
    }

    Rectification { r1, r2, p1, p2, q }
}

fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

/// Real parts of the roots of `sum coeffs[i] t^i`, from the companion matrix.
fn polynomial_roots(coeffs: &[f64]) -> Vec<f64> {
    let scale = coeffs.iter().fold(0.0_f64, |m, c| m.max(c.abs()));
    if scale == 0.0 {
        return Vec::new();
    }
    let Some(degree) = coeffs.iter().rposition(|c| c.abs() > 1e-12 * scale) else {
        return Vec::new();
    };
    if degree == 0 {
        return Vec::new();
    }
    let lead = coeffs[degree];
    let mut companion = DMatrix::<f64>::zeros(degree, degree);
    for i in 1..degree {
        companion[(i, i - 1)] = 1.0;
    }
    for i in 0..degree {
        companion[(i, degree - 1)] = -coeffs[i] / lead;
    }
    companion
        .complex_eigenvalues()
        .iter()
        .map(|z| z.re)
        .filter(|re| re.is_finite())
        .collect()
}

/// Rotation taking the (unit, in-plane) epipole `e` onto the x axis.
fn epipole_rotation(e: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        e.x, e.y, 0.0, //
        -e.y, e.x, 0.0, //
        0.0, 0.0, 1.0,
    )
}

/// Homogeneous translation by `p`.
fn translate(p: &Point2<f64>) -> Matrix3<f64> {
    Matrix3::new(
        1.0, 0.0, p.x, //
        0.0, 1.0, p.y, //
        0.0, 0.0, 1.0,
    )
}

fn null_vector(m: &Matrix3<f64>) -> Option<Vector3<f64>> {
    let svd = m.svd(false, true);
    let v_t = svd.v_t?;
    let (i, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    Some(v_t.row(i).transpose())
}

/// Closest point to the origin on the homogeneous line `l`.
fn foot_of_origin(l: &Vector3<f64>) -> Vector3<f64> {
    Vector3::new(-l.x * l.z, -l.y * l.z, l.x * l.x + l.y * l.y)
}

/// Optimal (Hartley–Sturm) correction of one match.
///
/// Returns the pair closest to `(xa, xb)` in image distance that satisfies
/// `x_b^T F x_a = 0` exactly. `None` when the geometry is degenerate.
pub fn correct_match(
    fundamental: &Matrix3<f64>,
    xa: &Point2<f64>,
    xb: &Point2<f64>,
) -> Option<(Point2<f64>, Point2<f64>)> {
    let f = translate(xb).transpose() * fundamental * translate(xa);

    let mut e1 = null_vector(&f)?;
    let mut e2 = null_vector(&f.transpose())?;
    let n1 = (e1.x * e1.x + e1.y * e1.y).sqrt();
    let n2 = (e2.x * e2.x + e2.y * e2.y).sqrt();
    if n1 < 1e-15 || n2 < 1e-15 {
        return None;
    }
    e1 /= n1;
    e2 /= n2;

    let r1 = epipole_rotation(&e1);
    let r2 = epipole_rotation(&e2);
    let f = r2 * f * r1.transpose();

    let (f1, f2) = (e1.z, e2.z);
    let (a, b, c, d) = (f[(1, 1)], f[(1, 2)], f[(2, 1)], f[(2, 2)]);

    // g(t) = t ((at+b)^2 + f2^2 (ct+d)^2)^2 - (ad-bc) (1+f1^2 t^2)^2 (at+b)(ct+d)
    let quad = [
        b * b + f2 * f2 * d * d,
        2.0 * (a * b + f2 * f2 * c * d),
        a * a + f2 * f2 * c * c,
    ];
    let lhs = poly_mul(&[0.0, 1.0], &poly_mul(&quad, &quad));
    let ep = [1.0, 0.0, f1 * f1];
    let rhs = poly_mul(&poly_mul(&ep, &ep), &poly_mul(&[b, a], &[d, c]));
    let det = a * d - b * c;
    let g: Vec<f64> = (0..7)
        .map(|i| {
            let l = lhs.get(i).copied().unwrap_or(0.0);
            let r = rhs.get(i).copied().unwrap_or(0.0);
            l - det * r
        })
        .collect();

    let cost = |t: f64| {
        let p = a * t + b;
        let q = c * t + d;
        t * t / (1.0 + f1 * f1 * t * t) + q * q / (p * p + f2 * f2 * q * q)
    };
    let cost_inf = 1.0 / (f1 * f1) + c * c / (a * a + f2 * f2 * c * c);

    let mut best: Option<(f64, f64)> = None;
    for t in polynomial_roots(&g) {
        let s = cost(t);
        if s.is_finite() && best.is_none_or(|(_, bs)| s < bs) {
            best = Some((t, s));
        }
    }

    let (l1, l2) = match best {
        Some((t, s)) if !(cost_inf.is_finite() && cost_inf < s) => (
            Vector3::new(t * f1, 1.0, -t),
            Vector3::new(-f2 * (c * t + d), a * t + b, c * t + d),
        ),
        _ if cost_inf.is_finite() => (Vector3::new(f1, 0.0, -1.0), Vector3::new(-f2 * c, a, c)),
        _ => return None,
    };

    let ha = translate(xa) * r1.transpose() * foot_of_origin(&l1);
    let hb = translate(xb) * r2.transpose() * foot_of_origin(&l2);
    if ha.z.abs() < 1e-15 || hb.z.abs() < 1e-15 {
        return None;
    }
    Some((
        Point2::new(ha.x / ha.z, ha.y / ha.z),
        Point2::new(hb.x / hb.z, hb.y / hb.z),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    fn rig() -> (CameraModel, CameraModel, RigidTransform) {
        let a = CameraModel::new((640, 480), 600.0, 600.0, 320.0, 240.0);
        let b = CameraModel::new((640, 480), 620.0, 615.0, 330.0, 235.0);
        let b_from_a = RigidTransform::from_rvec_tvec(
            Vector3::new(0.02, -0.08, 0.01),
            Vector3::new(-0.12, 0.005, 0.01),
        );
        (a, b, b_from_a)
    }

    fn epipolar_residual(f: &Matrix3<f64>, xa: &Point2<f64>, xb: &Point2<f64>) -> f64 {
        (Vector3::new(xb.x, xb.y, 1.0).transpose() * f * Vector3::new(xa.x, xa.y, 1.0))[0]
    }

    #[test]
    fn fundamental_matrix_satisfies_epipolar_constraint() {
        let (a, b, b_from_a) = rig();
        let f = fundamental_from_essential(&essential_from_pose(&b_from_a), &a, &b).unwrap();
        for p in [Point3::new(0.1, -0.05, 1.2), Point3::new(-0.3, 0.2, 2.0)] {
            let xa = a.project(&p).unwrap();
            let xb = b.project(&b_from_a.transform_point(&p)).unwrap();
            assert!(epipolar_residual(&f, &xa, &xb).abs() < 1e-9);
        }
    }

    #[test]
    fn corrected_matches_lie_on_epipolar_lines() {
        let (a, b, b_from_a) = rig();
        let f = fundamental_from_essential(&essential_from_pose(&b_from_a), &a, &b).unwrap();
        let p = Point3::new(0.05, 0.1, 1.5);
        let xa = a.project(&p).unwrap();
        let xb = b.project(&b_from_a.transform_point(&p)).unwrap();

        let noisy_a = xa + Vector2::new(0.7, -0.4);
        let noisy_b = xb + Vector2::new(-0.3, 0.6);
        let (ca, cb) = correct_match(&f, &noisy_a, &noisy_b).unwrap();

        let scale = f.norm();
        assert!(epipolar_residual(&f, &ca, &cb).abs() / scale < 1e-6);
        // The correction moves points by at most the injected noise.
        assert!((ca - noisy_a).norm() + (cb - noisy_b).norm() < 2.0);
    }

    #[test]
    fn exact_matches_are_left_alone() {
        let (a, b, b_from_a) = rig();
        let f = fundamental_from_essential(&essential_from_pose(&b_from_a), &a, &b).unwrap();
        let p = Point3::new(-0.1, 0.02, 0.9);
        let xa = a.project(&p).unwrap();
        let xb = b.project(&b_from_a.transform_point(&p)).unwrap();
        let (ca, cb) = correct_match(&f, &xa, &xb).unwrap();
        assert_relative_eq!(ca, xa, epsilon = 1e-6);
        assert_relative_eq!(cb, xb, epsilon = 1e-6);
    }

    #[test]
    fn rectified_rows_align() {
        let (a, b, b_from_a) = rig();
        let rect = stereo_rectify(&a, &b, &b_from_a);
        for p in [Point3::new(0.1, -0.05, 1.2), Point3::new(-0.3, 0.2, 2.0)] {
            let ra = rect.r1 * p.coords;
            let rb = rect.r2 * b_from_a.transform_point(&p).coords;
            let ya = rect.p1[(1, 1)] * ra.y / ra.z + rect.p1[(1, 2)];
            let yb = rect.p2[(1, 1)] * rb.y / rb.z + rect.p2[(1, 2)];
            assert_relative_eq!(ya, yb, epsilon = 1e-9);
        }
        assert!(rect.p2[(0, 3)].abs() > 0.0);
        assert_eq!(rect.p2[(1, 3)], 0.0);
    }
}
