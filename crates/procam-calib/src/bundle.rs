//! Joint refinement of camera intrinsics and per-view poses.
//!
//! Parameter layout: `[fx, fy, cx, cy, k1, k2, p1, p2, k3, k4, k5, k6]`
//! followed by `(rvec, tvec)` of every view. Fixed parameters stay at their
//! seeded value; a fixed aspect ratio ties `fy` to `fx`.

use crate::CalibrationError;
use nalgebra::{DVector, Matrix2, Point2, Point3, Vector2, Vector3};
use procam_core::{
    estimate_homography, fit_plane, solve_lm, solve_pnp, CameraModel, Distortion,
    LeastSquaresProblem, RigidTransform, SolveOptions, SolveReport,
};
use serde::{Deserialize, Serialize};

const INTRINSIC_PARAMS: usize = 12;
const POSE_PARAMS: usize = 6;
const PLANAR_FLATNESS: f64 = 1e-9;

/// Which intrinsic parameters the solver may move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntrinsicsFlags {
    pub fix_k1: bool,
    pub fix_k2: bool,
    pub fix_k3: bool,
    pub fix_k4: bool,
    pub fix_k5: bool,
    pub fix_k6: bool,
    /// Force `p1 = p2 = 0`.
    pub zero_tangent: bool,
    /// Keep `fy / fx` at its seeded value.
    pub fix_aspect_ratio: bool,
    pub fix_principal_point: bool,
    /// Seed from the supplied model instead of the image-size guess.
    pub use_intrinsic_guess: bool,
    /// Enable the `k4..k6` denominator terms.
    pub rational_model: bool,
    /// Estimate the initial focal length from per-view homographies.
    pub closed_form_init: bool,
}

impl Default for IntrinsicsFlags {
    fn default() -> Self {
        Self {
            fix_k1: false,
            fix_k2: false,
            fix_k3: false,
            fix_k4: false,
            fix_k5: true,
            fix_k6: true,
            zero_tangent: false,
            fix_aspect_ratio: false,
            fix_principal_point: false,
            use_intrinsic_guess: false,
            rational_model: false,
            closed_form_init: true,
        }
    }
}

impl IntrinsicsFlags {
    /// Every distortion term fixed, square pixels, seeded from a guess.
    pub fn pinhole_guess() -> Self {
        Self {
            fix_k1: true,
            fix_k2: true,
            fix_k3: true,
            fix_k4: true,
            fix_k5: true,
            fix_k6: true,
            zero_tangent: true,
            fix_aspect_ratio: true,
            fix_principal_point: false,
            use_intrinsic_guess: true,
            rational_model: false,
            closed_form_init: false,
        }
    }

    fn free_intrinsics(&self) -> Vec<usize> {
        let candidates = [
            (0, true),
            (1, !self.fix_aspect_ratio),
            (2, !self.fix_principal_point),
            (3, !self.fix_principal_point),
            (4, !self.fix_k1),
            (5, !self.fix_k2),
            (6, !self.zero_tangent),
            (7, !self.zero_tangent),
            (8, !self.fix_k3),
            (9, self.rational_model && !self.fix_k4),
            (10, self.rational_model && !self.fix_k5),
            (11, self.rational_model && !self.fix_k6),
        ];
        candidates
            .iter()
            .filter(|(_, free)| *free)
            .map(|(i, _)| *i)
            .collect()
    }
}

/// One view of a rigid point set.
#[derive(Clone, Copy, Debug)]
pub(crate) struct View<'a> {
    pub object: &'a [Point3<f64>],
    pub image: &'a [Point2<f64>],
}

#[derive(Clone, Debug)]
pub(crate) struct CameraCalibration {
    pub camera: CameraModel,
    /// `camera_from_object` per view.
    pub poses: Vec<RigidTransform>,
    pub per_view_rms: Vec<f64>,
    pub rms: f64,
    pub report: SolveReport,
}

struct BundleProblem<'a> {
    views: &'a [View<'a>],
    image_size: (u32, u32),
    /// `fy / fx` when the aspect ratio is fixed.
    aspect: Option<f64>,
    residual_count: usize,
}

impl BundleProblem<'_> {
    fn camera(&self, x: &DVector<f64>) -> CameraModel {
        let fy = match self.aspect {
            Some(a) => x[0] * a,
            None => x[1],
        };
        let mut k = [0.0; 8];
        for (i, v) in k.iter_mut().enumerate() {
            *v = x[4 + i];
        }
        CameraModel::new(self.image_size, x[0], fy, x[2], x[3])
            .with_distortion(Distortion::from_array(k))
    }

    fn pose(x: &DVector<f64>, view: usize) -> RigidTransform {
        let o = INTRINSIC_PARAMS + POSE_PARAMS * view;
        RigidTransform::from_rvec_tvec(
            Vector3::new(x[o], x[o + 1], x[o + 2]),
            Vector3::new(x[o + 3], x[o + 4], x[o + 5]),
        )
    }
}

impl LeastSquaresProblem for BundleProblem<'_> {
    fn num_params(&self) -> usize {
        INTRINSIC_PARAMS + POSE_PARAMS * self.views.len()
    }

    fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
        let camera = self.camera(x);
        let mut r = DVector::zeros(self.residual_count);
        let mut k = 0;
        for (v, view) in self.views.iter().enumerate() {
            let pose = Self::pose(x, v);
            for (o, img) in view.object.iter().zip(view.image) {
                let p = camera.project_unchecked(&pose.transform_point(o));
                r[k] = p.x - img.x;
                r[k + 1] = p.y - img.y;
                k += 2;
            }
        }
        r
    }
}

/// Vanishing-point focal estimate from plane-to-image homographies, with the
/// principal point held at `(cx, cy)`.
fn closed_form_focal(views: &[View<'_>], cx: f64, cy: f64) -> Option<(f64, f64)> {
    let mut ata = Matrix2::<f64>::zeros();
    let mut atb = Vector2::<f64>::zeros();
    for view in views {
        let plane = fit_plane(view.object)?;
        if plane.flatness > PLANAR_FLATNESS {
            return None;
        }
        let to_plane = plane.frame_from_plane.inverse();
        let src: Vec<_> = view
            .object
            .iter()
            .map(|p| {
                let q = to_plane.transform_point(p);
                Point2::new(q.x, q.y)
            })
            .collect();
        let h = estimate_homography(&src, view.image)?.h;

        let mut c0 = Vector3::zeros();
        let mut c1 = Vector3::zeros();
        for j in 0..3 {
            let shift = if j == 0 {
                cx
            } else if j == 1 {
                cy
            } else {
                0.0
            };
            c0[j] = h[(j, 0)] - shift * h[(2, 0)];
            c1[j] = h[(j, 1)] - shift * h[(2, 1)];
        }
        let d1 = (c0 + c1) * 0.5;
        let d2 = (c0 - c1) * 0.5;
        let pairs = [
            (c0.try_normalize(1e-12)?, c1.try_normalize(1e-12)?),
            (d1.try_normalize(1e-12)?, d2.try_normalize(1e-12)?),
        ];
        for (a, b) in pairs {
            let row = Vector2::new(a.x * b.x, a.y * b.y);
            let rhs = -a.z * b.z;
            ata += row * row.transpose();
            atb += row * rhs;
        }
    }
    let sol = ata.try_inverse()? * atb;
    let fx = (1.0 / sol.x).abs().sqrt();
    let fy = (1.0 / sol.y).abs().sqrt();
    (fx.is_finite() && fy.is_finite() && fx > 0.0 && fy > 0.0).then_some((fx, fy))
}

fn seed_camera(
    views: &[View<'_>],
    initial: &CameraModel,
    flags: &IntrinsicsFlags,
) -> CameraModel {
    if flags.use_intrinsic_guess {
        let mut seeded = *initial;
        if flags.zero_tangent {
            seeded.distortion.p1 = 0.0;
            seeded.distortion.p2 = 0.0;
        }
        if !flags.rational_model {
            seeded.distortion.k4 = 0.0;
            seeded.distortion.k5 = 0.0;
            seeded.distortion.k6 = 0.0;
        }
        return seeded;
    }

    let mut seeded = CameraModel::initial_guess(initial.image_size);
    if flags.closed_form_init {
        match closed_form_focal(views, seeded.cx, seeded.cy) {
            Some((fx, fy)) => {
                if flags.fix_aspect_ratio {
                    let f = 0.5 * (fx + fy);
                    seeded.fx = f;
                    seeded.fy = f;
                } else {
                    seeded.fx = fx;
                    seeded.fy = fy;
                }
                log::debug!("closed-form focal seed fx={:.2} fy={:.2}", seeded.fx, seeded.fy);
            }
            None => log::debug!("closed-form focal seed unavailable, using image width"),
        }
    }
    seeded
}

/// Solve intrinsics and per-view poses from point correspondences.
///
/// `initial` supplies the image size, and the seed when
/// `flags.use_intrinsic_guess` is set.
pub(crate) fn calibrate_camera(
    views: &[View<'_>],
    initial: &CameraModel,
    flags: &IntrinsicsFlags,
    opts: &SolveOptions,
) -> Result<CameraCalibration, CalibrationError> {
    let seeded = seed_camera(views, initial, flags);

    let mut poses = Vec::with_capacity(views.len());
    for (i, view) in views.iter().enumerate() {
        let pose = solve_pnp(&seeded, view.object, view.image).map_err(|e| {
            log::warn!("pose initialisation failed for view {i}: {e}");
            CalibrationError::from(e)
        })?;
        poses.push(pose);
    }

    let aspect = flags.fix_aspect_ratio.then(|| seeded.fy / seeded.fx);
    let problem = BundleProblem {
        views,
        image_size: seeded.image_size,
        aspect,
        residual_count: 2 * views.iter().map(|v| v.object.len()).sum::<usize>(),
    };

    let mut x0 = DVector::zeros(problem.num_params());
    x0[0] = seeded.fx;
    x0[1] = seeded.fy;
    x0[2] = seeded.cx;
    x0[3] = seeded.cy;
    for (i, k) in seeded.distortion.as_array().iter().enumerate() {
        x0[4 + i] = *k;
    }
    for (v, pose) in poses.iter().enumerate() {
        let o = INTRINSIC_PARAMS + POSE_PARAMS * v;
        x0.rows_mut(o, 3).copy_from(&pose.rvec());
        x0.rows_mut(o + 3, 3).copy_from(&pose.tvec());
    }

    let mut free = flags.free_intrinsics();
    free.extend(INTRINSIC_PARAMS..problem.num_params());

    let (x, report) = solve_lm(&problem, x0, &free, opts);
    let camera = problem.camera(&x);
    if !camera.is_valid() || x.iter().any(|v| !v.is_finite()) {
        return Err(CalibrationError::SolverDiverged(format!(
            "intrinsics solve produced fx={}, fy={}",
            camera.fx, camera.fy
        )));
    }

    let poses: Vec<_> = (0..views.len()).map(|v| BundleProblem::pose(&x, v)).collect();
    let mut total_sq = 0.0;
    let mut total_n = 0usize;
    let per_view_rms = views
        .iter()
        .zip(&poses)
        .map(|(view, pose)| {
            let rms = procam_core::reprojection_rms(&camera, pose, view.object, view.image);
            total_sq += rms * rms * view.object.len() as f64;
            total_n += view.object.len();
            rms
        })
        .collect();
    let rms = if total_n == 0 {
        0.0
    } else {
        (total_sq / total_n as f64).sqrt()
    };

    Ok(CameraCalibration {
        camera,
        poses,
        per_view_rms,
        rms,
        report,
    })
}
