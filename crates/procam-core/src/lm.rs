//! Levenberg–Marquardt for small calibration problems.
//!
//! Problems expose residuals only; the Jacobian defaults to central
//! differences. Parameters can be frozen through a mask, in which case the
//! solver only sees the free parameters. The minimisation itself is delegated
//! to the `levenberg-marquardt` crate.

use levenberg_marquardt::{LeastSquaresProblem as LmProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector};
use nalgebra_lm::{storage::Owned, Dyn};
use serde::{Deserialize, Serialize};

type LmVector = nalgebra_lm::DVector<f64>;
type LmMatrix = nalgebra_lm::DMatrix<f64>;

pub trait LeastSquaresProblem {
    fn num_params(&self) -> usize;

    fn residuals(&self, x: &DVector<f64>) -> DVector<f64>;

    /// Jacobian restricted to the columns in `free`.
    fn jacobian(&self, x: &DVector<f64>, free: &[usize]) -> DMatrix<f64> {
        numeric_jacobian(self, x, free)
    }
}

/// Central-difference Jacobian over the `free` columns.
pub fn numeric_jacobian<P: LeastSquaresProblem + ?Sized>(
    problem: &P,
    x: &DVector<f64>,
    free: &[usize],
) -> DMatrix<f64> {
    let m = problem.residuals(x).len();
    let mut jac = DMatrix::<f64>::zeros(m, free.len());
    let mut shifted = x.clone();
    for (col, &i) in free.iter().enumerate() {
        let h = 1e-6 * x[i].abs().max(1.0);
        shifted[i] = x[i] + h;
        let plus = problem.residuals(&shifted);
        shifted[i] = x[i] - h;
        let minus = problem.residuals(&shifted);
        shifted[i] = x[i];
        jac.set_column(col, &((plus - minus) / (2.0 * h)));
    }
    jac
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveOptions {
    /// Patience of the solver; the evaluation budget is `max_iters * (free + 1)`.
    pub max_iters: usize,
    /// Relative cost reduction below which the solve stops.
    pub ftol: f64,
    /// Orthogonality between residuals and Jacobian columns below which the solve stops.
    pub gtol: f64,
    /// Relative step size below which the solve stops.
    pub xtol: f64,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_iters: 200,
            ftol: 1e-12,
            gtol: 1e-10,
            xtol: 1e-12,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveReport {
    /// Residual evaluations spent by the solver.
    pub iterations: usize,
    /// `0.5 * |r|^2` at the returned parameters.
    pub final_cost: f64,
    pub converged: bool,
}

/// Exposes the free slice of a full parameter vector to the solver.
struct FreeParams<'a, P: LeastSquaresProblem + ?Sized> {
    problem: &'a P,
    free: &'a [usize],
    full: DVector<f64>,
}

impl<P: LeastSquaresProblem + ?Sized> LmProblem<f64, Dyn, Dyn> for FreeParams<'_, P> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &LmVector) {
        for (k, &i) in self.free.iter().enumerate() {
            self.full[i] = x[k];
        }
    }

    fn params(&self) -> LmVector {
        LmVector::from_iterator(self.free.len(), self.free.iter().map(|&i| self.full[i]))
    }

    fn residuals(&self) -> Option<LmVector> {
        let r = self.problem.residuals(&self.full);
        Some(LmVector::from_column_slice(r.as_slice()))
    }

    fn jacobian(&self) -> Option<LmMatrix> {
        let jac = self.problem.jacobian(&self.full, self.free);
        let (rows, cols) = jac.shape();
        Some(LmMatrix::from_column_slice(rows, cols, jac.as_slice()))
    }
}

/// Minimise `0.5 * |r(x)|^2` starting at `x0`, moving only the indices in `free`.
pub fn solve_lm<P: LeastSquaresProblem + ?Sized>(
    problem: &P,
    x0: DVector<f64>,
    free: &[usize],
    opts: &SolveOptions,
) -> (DVector<f64>, SolveReport) {
    if free.is_empty() {
        let final_cost = 0.5 * problem.residuals(&x0).norm_squared();
        let report = SolveReport {
            iterations: 0,
            final_cost,
            converged: final_cost.is_finite(),
        };
        return (x0, report);
    }

    let lm = LevenbergMarquardt::new()
        .with_ftol(opts.ftol)
        .with_xtol(opts.xtol)
        .with_gtol(opts.gtol)
        .with_patience(opts.max_iters.max(1));

    let wrapper = FreeParams {
        problem,
        free,
        full: x0,
    };
    let (wrapper, report) = lm.minimize(wrapper);
    log::trace!(
        "lm finished after {} evaluations: {:?}",
        report.number_of_evaluations,
        report.termination
    );

    (
        wrapper.full,
        SolveReport {
            iterations: report.number_of_evaluations,
            final_cost: report.objective_function,
            converged: report.termination.was_successful(),
        },
    )
}
