//! Error propagation through the converged fit.
//!
//! At the solution `y(a(η), η) = 0`, so by the implicit-function theorem
//!
//! ```text
//! da/dη = W⁻¹ D,    W = ∂y/∂x (no multiplier curvature),    D = -∂y/∂η = 2 C⁻¹
//! C_a   = (da/dη) C_η (da/dη)ᵀ
//! ```
//!
//! `W` is inverted in the scaled basis `E W E` and unscaled afterwards.

use nalgebra::{DMatrix, DVector};

use super::FitProblem;
use super::assembler::{self, Layout};
use crate::domain::SolverOptions;
use crate::math::{SolveMethod, invert_lu_or_svd, scale_symmetric};

/// Propagates the measurement covariance and writes the result into the
/// objects. Returns the `npar × npar` global covariance, or `None` if `W`
/// could not be inverted.
pub fn propagate(
    problem: &mut FitProblem,
    layout: &Layout,
    x: &DVector<f64>,
    e: &DVector<f64>,
    options: &SolverOptions,
) -> Option<DMatrix<f64>> {
    let idim = layout.idim();
    let npar = layout.npar;
    if npar == 0 {
        return None;
    }

    let mut d_full = DMatrix::zeros(idim, idim);
    for obj in problem.objects() {
        obj.add_to_global_chi2_der_matrix(&mut d_full, 1.0);
    }
    let d = d_full.columns(0, npar).into_owned();
    let cov_eta = assembler::measured_covariance(problem, layout);

    let w = assembler::assemble_m(problem, layout, x, true);
    let w_scaled = scale_symmetric(&w, e);
    let Some((w_scaled_inv, method)) =
        invert_lu_or_svd(&w_scaled, options.lu_min_determinant, options.svd_cutoff)
    else {
        log::warn!("error propagation: system matrix could not be inverted");
        return None;
    };
    if method == SolveMethod::Svd {
        log::warn!("error propagation: LU failed, using SVD pseudo-inverse");
    }
    let w_inv = scale_symmetric(&w_scaled_inv, e);

    let dadeta = w_inv * d;
    let cov_full = &dadeta * cov_eta * dadeta.transpose();
    let cov = cov_full.view((0, 0), (npar, npar)).into_owned();
    if !cov.iter().all(|v| v.is_finite()) {
        log::warn!("error propagation: non-finite covariance");
        return None;
    }

    assembler::write_fitted_covariance(problem, &cov);
    Some(cov)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FitObject, FourVector};
    use crate::fit::assembler::{IndexOrder, fill_errors, fill_x, initialize};

    #[test]
    fn unconstrained_covariance_is_the_measurement() {
        let mut cov = DMatrix::from_diagonal(&DVector::from_row_slice(&[4.0, 1.0, 2.25, 9.0]));
        cov[(0, 1)] = 0.5;
        cov[(1, 0)] = 0.5;
        let mut problem = FitProblem::new();
        problem.add_object(FitObject::px_py_pz_e("a", FourVector::new(30.0, 10.0, 5.0, 20.0), &cov).unwrap());
        let layout = initialize(&mut problem, IndexOrder::ObjectOrder);
        let mut x = DVector::zeros(layout.idim());
        let mut e = DVector::zeros(layout.idim());
        fill_x(&problem, &mut x);
        fill_errors(&problem, &layout, &mut e);

        let out = propagate(&mut problem, &layout, &x, &e, &SolverOptions::default()).unwrap();
        // global order is (px, py, pz, E)
        assert!((&out - &cov).amax() < 1e-9);
        let fitted = problem.objects()[0].fitted_covariance().unwrap();
        assert!((fitted - &cov).amax() < 1e-9);
    }
}
