//! Pose of a known 3D point set from its image (perspective-n-point).
//!
//! Planar sets are initialised by decomposing a plane-to-image homography,
//! general sets by a normalised DLT. Both are then refined by minimising the
//! reprojection error through the full camera model.

use crate::{
    estimate_homography, solve_lm, CameraModel, CoreError, LeastSquaresProblem, RigidTransform,
    SolveOptions,
};
use nalgebra::{
    DMatrix, DVector, Matrix3, Matrix3x4, Matrix4, Point2, Point3, Rotation3, Vector3,
};

/// Relative flatness below which a point set is treated as planar.
const PLANARITY_TOLERANCE: f64 = 1e-9;

/// Least-squares plane through a point set.
#[derive(Clone, Copy, Debug)]
pub struct PlaneFit {
    /// Maps plane-local coordinates (z == 0 on the plane) into the input frame.
    pub frame_from_plane: RigidTransform,
    /// Smallest over largest scatter eigenvalue.
    pub flatness: f64,
}

pub fn fit_plane(points: &[Point3<f64>]) -> Option<PlaneFit> {
    if points.len() < 3 {
        return None;
    }
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;
    let mut scatter = Matrix3::<f64>::zeros();
    for p in points {
        let d = p.coords - centroid;
        scatter += d * d.transpose();
    }
    let eig = scatter.symmetric_eigen();
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));
    let largest = eig.eigenvalues[order[0]];
    if largest <= 0.0 {
        return None;
    }

    let e1: Vector3<f64> = eig.eigenvectors.column(order[0]).into_owned();
    let e2: Vector3<f64> = eig.eigenvectors.column(order[1]).into_owned();
    let e3 = e1.cross(&e2);
    let basis = Matrix3::from_columns(&[e1, e2, e3]);

    Some(PlaneFit {
        frame_from_plane: RigidTransform::from_rotation_translation(
            Rotation3::from_matrix_unchecked(basis),
            centroid,
        ),
        flatness: eig.eigenvalues[order[2]].max(0.0) / largest,
    })
}

fn closest_rotation(m: &Matrix3<f64>) -> Option<Rotation3<f64>> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        r = u_fixed * v_t;
    }
    Some(Rotation3::from_matrix_unchecked(r))
}

/// Initial `camera_from_plane` from points on the plane z == 0 and their normalized images.
fn planar_pose(
    plane: &[Point2<f64>],
    normalized: &[Point2<f64>],
) -> Result<RigidTransform, CoreError> {
    let h = estimate_homography(plane, normalized)
        .ok_or_else(|| CoreError::SolverDiverged("degenerate plane-to-image homography".into()))?;
    let h1: Vector3<f64> = h.h.column(0).into_owned();
    let h2: Vector3<f64> = h.h.column(1).into_owned();
    let h3: Vector3<f64> = h.h.column(2).into_owned();

    let scale = 2.0 / (h1.norm() + h2.norm());
    let mut r1 = h1 * scale;
    let mut r2 = h2 * scale;
    let mut t = h3 * scale;
    if t.z < 0.0 {
        r1 = -r1;
        r2 = -r2;
        t = -t;
    }
    let r3 = r1.cross(&r2);
    let rot = closest_rotation(&Matrix3::from_columns(&[r1, r2, r3]))
        .ok_or_else(|| CoreError::SolverDiverged("rotation orthonormalisation failed".into()))?;
    Ok(RigidTransform::from_rotation_translation(rot, t))
}

/// Initial `camera_from_world` from six or more general points and normalized images.
fn dlt_pose(
    world: &[Point3<f64>],
    normalized: &[Point2<f64>],
) -> Result<RigidTransform, CoreError> {
    let n = world.len();
    if n < 6 {
        return Err(CoreError::InsufficientData {
            what: "non-planar PnP correspondences",
            needed: 6,
            got: n,
        });
    }

    let centroid = world.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n as f64;
    let mean_dist =
        world.iter().map(|p| (p.coords - centroid).norm()).sum::<f64>() / n as f64;
    if mean_dist <= f64::EPSILON {
        return Err(CoreError::InvalidInput("all world points coincide".into()));
    }
    let s = 3.0_f64.sqrt() / mean_dist;
    let t_world = Matrix4::new(
        s, 0.0, 0.0, -s * centroid.x, //
        0.0, s, 0.0, -s * centroid.y, //
        0.0, 0.0, s, -s * centroid.z, //
        0.0, 0.0, 0.0, 1.0,
    );

    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (pw, pn)) in world.iter().zip(normalized).enumerate() {
        let q = (pw.coords - centroid) * s;
        let (u, v) = (pn.x, pn.y);
        for (c, val) in [q.x, q.y, q.z, 1.0].into_iter().enumerate() {
            a[(2 * i, c)] = val;
            a[(2 * i, 8 + c)] = -u * val;
            a[(2 * i + 1, 4 + c)] = val;
            a[(2 * i + 1, 8 + c)] = -v * val;
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| CoreError::SolverDiverged("svd failed in PnP DLT".into()))?;
    let row = v_t.row(v_t.nrows() - 1);
    let p_norm = Matrix3x4::from_row_slice(&row.iter().copied().collect::<Vec<_>>());
    let p = p_norm * t_world;

    let m: Matrix3<f64> = p.fixed_view::<3, 3>(0, 0).into_owned();
    let mut scale = (m.row(0).norm() + m.row(1).norm() + m.row(2).norm()) / 3.0;
    if m.determinant() < 0.0 {
        scale = -scale;
    }
    if scale.abs() <= f64::EPSILON {
        return Err(CoreError::SolverDiverged("degenerate PnP DLT solution".into()));
    }
    let rot = closest_rotation(&(m / scale))
        .ok_or_else(|| CoreError::SolverDiverged("rotation orthonormalisation failed".into()))?;
    let t = p.column(3) / scale;
    Ok(RigidTransform::from_rotation_translation(rot, t))
}

/// Pose-only reprojection problem, parameters `[rvec, tvec]`.
struct PoseProblem<'a> {
    camera: &'a CameraModel,
    object: &'a [Point3<f64>],
    image: &'a [Point2<f64>],
}

impl LeastSquaresProblem for PoseProblem<'_> {
    fn num_params(&self) -> usize {
        6
    }

    fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
        let pose = RigidTransform::from_rvec_tvec(
            Vector3::new(x[0], x[1], x[2]),
            Vector3::new(x[3], x[4], x[5]),
        );
        let mut r = DVector::zeros(2 * self.object.len());
        for (i, (o, img)) in self.object.iter().zip(self.image).enumerate() {
            let proj = self.camera.project_unchecked(&pose.transform_point(o));
            r[2 * i] = proj.x - img.x;
            r[2 * i + 1] = proj.y - img.y;
        }
        r
    }
}

/// Refine `camera_from_object` by minimising pixel reprojection error.
pub fn refine_pose(
    camera: &CameraModel,
    object: &[Point3<f64>],
    image: &[Point2<f64>],
    initial: &RigidTransform,
    opts: &SolveOptions,
) -> RigidTransform {
    let problem = PoseProblem {
        camera,
        object,
        image,
    };
    let rv = initial.rvec();
    let tv = initial.tvec();
    let x0 = DVector::from_vec(vec![rv.x, rv.y, rv.z, tv.x, tv.y, tv.z]);
    let (x, _) = solve_lm(&problem, x0, &[0, 1, 2, 3, 4, 5], opts);
    RigidTransform::from_rvec_tvec(
        Vector3::new(x[0], x[1], x[2]),
        Vector3::new(x[3], x[4], x[5]),
    )
}

/// Estimate `camera_from_object` for known 3D points and their pixel observations.
///
/// Planar sets need at least 4 points, general sets at least 6.
pub fn solve_pnp(
    camera: &CameraModel,
    object: &[Point3<f64>],
    image: &[Point2<f64>],
) -> Result<RigidTransform, CoreError> {
    if object.len() != image.len() {
        return Err(CoreError::InvalidInput(format!(
            "PnP needs equal point counts (object {}, image {})",
            object.len(),
            image.len()
        )));
    }
    if object.len() < 4 {
        return Err(CoreError::InsufficientData {
            what: "PnP correspondences",
            needed: 4,
            got: object.len(),
        });
    }

    let normalized: Vec<Point2<f64>> = image.iter().map(|p| camera.normalize(p)).collect();
    let plane = fit_plane(object)
        .ok_or_else(|| CoreError::InvalidInput("degenerate object point set".into()))?;

    let initial = if plane.flatness <= PLANARITY_TOLERANCE {
        let object_to_plane = plane.frame_from_plane.inverse();
        let in_plane: Vec<Point2<f64>> = object
            .iter()
            .map(|p| {
                let q = object_to_plane.transform_point(p);
                Point2::new(q.x, q.y)
            })
            .collect();
        planar_pose(&in_plane, &normalized)?.compose(&object_to_plane)
    } else {
        dlt_pose(object, &normalized)?
    };

    let refined = refine_pose(camera, object, image, &initial, &SolveOptions::default());
    if refined.matrix().iter().any(|v| !v.is_finite()) {
        return Err(CoreError::SolverDiverged("PnP refinement produced non-finite pose".into()));
    }
    Ok(refined)
}

/// RMS pixel distance between observations and reprojected object points.
pub fn reprojection_rms(
    camera: &CameraModel,
    camera_from_object: &RigidTransform,
    object: &[Point3<f64>],
    image: &[Point2<f64>],
) -> f64 {
    if object.is_empty() {
        return 0.0;
    }
    let ss: f64 = object
        .iter()
        .zip(image)
        .map(|(o, i)| {
            let p = camera.project_unchecked(&camera_from_object.transform_point(o));
            (p - i).norm_squared()
        })
        .sum();
    (ss / object.len() as f64).sqrt()
}
