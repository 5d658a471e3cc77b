use crate::{CoreError, RigidTransform};
use nalgebra::{DMatrix, Matrix3x4, Point2, Point3};

/// Normalized projection matrix `[R | t]` of a `camera_from_world` pose.
pub fn projection_from_pose(camera_from_world: &RigidTransform) -> Matrix3x4<f64> {
    camera_from_world.matrix().fixed_view::<3, 4>(0, 0).into_owned()
}

/// Linear (DLT) triangulation of one point seen in several views.
///
/// `projections[i]` maps homogeneous world points to homogeneous image points
/// in the same coordinates as `points[i]` (normalized or pixel, as long as
/// they agree).
pub fn triangulate_point(
    projections: &[Matrix3x4<f64>],
    points: &[Point2<f64>],
) -> Result<Point3<f64>, CoreError> {
    if projections.len() != points.len() {
        return Err(CoreError::InvalidInput(format!(
            "{} projection matrices for {} observations",
            projections.len(),
            points.len()
        )));
    }
    if projections.len() < 2 {
        return Err(CoreError::InsufficientData {
            what: "views for triangulation",
            needed: 2,
            got: projections.len(),
        });
    }

    let mut a = DMatrix::<f64>::zeros(2 * projections.len(), 4);
    for (i, (p, cam)) in points.iter().zip(projections).enumerate() {
        a.row_mut(2 * i)
            .copy_from(&(cam.row(2) * p.x - cam.row(0)));
        a.row_mut(2 * i + 1)
            .copy_from(&(cam.row(2) * p.y - cam.row(1)));
    }

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| CoreError::SolverDiverged("svd failed during triangulation".into()))?;
    let x = v_t.row(v_t.nrows() - 1);
    let w = x[3];
    if w.abs() <= f64::EPSILON {
        return Err(CoreError::SolverDiverged("triangulated point at infinity".into()));
    }
    Ok(Point3::new(x[0] / w, x[1] / w, x[2] / w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn two_views_recover_point() {
        let a = RigidTransform::identity();
        let b = RigidTransform::from_rvec_tvec(
            Vector3::new(0.0, -0.1, 0.0),
            Vector3::new(-0.2, 0.0, 0.0),
        );
        let pw = Point3::new(0.1, -0.05, 2.0);
        let project = |pose: &RigidTransform| {
            let pc = pose.transform_point(&pw);
            Point2::new(pc.x / pc.z, pc.y / pc.z)
        };

        let est = triangulate_point(
            &[projection_from_pose(&a), projection_from_pose(&b)],
            &[project(&a), project(&b)],
        )
        .expect("triangulate");
        assert!((est - pw).norm() < 1e-9);
    }

    #[test]
    fn single_view_is_insufficient() {
        let p = projection_from_pose(&RigidTransform::identity());
        assert!(triangulate_point(&[p], &[Point2::new(0.0, 0.0)]).is_err());
    }
}
