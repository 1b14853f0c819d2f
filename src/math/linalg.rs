//! Dense linear solves with fallbacks.
//!
//! The fit repeatedly solves small symmetric (often indefinite) systems:
//!
//! ```text
//! [ L   Jᵀ ] [Δa]   [g]
//! [ J   0  ] [Δλ] = [c]
//! ```
//!
//! - LU is tried first; it is rejected when `|det|` is tiny or not finite.
//! - SVD is the fallback, with singular values below a relative cutoff zeroed.
//!   This is what keeps redundant constraints (rank-deficient `J`) solvable.
//! - Normal-equation solves (`J Jᵀ`) use Cholesky, falling back to SVD.

use nalgebra::{DMatrix, DVector, Dyn};
use nalgebra::linalg::Cholesky;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveMethod {
    Lu,
    Svd,
}

#[derive(Debug, Clone)]
pub struct LinearSolution {
    pub x: DVector<f64>,
    pub method: SolveMethod,
    /// Determinant from the LU attempt (NaN when LU was not possible).
    pub determinant: f64,
}

pub fn is_finite_matrix(m: &DMatrix<f64>) -> bool {
    m.iter().all(|v| v.is_finite())
}

pub fn is_finite_vector(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

/// Solves `m x = b` by LU, falling back to a truncated SVD.
///
/// Returns `None` only if both fail or produce non-finite values.
pub fn solve_lu_or_svd(
    m: &DMatrix<f64>,
    b: &DVector<f64>,
    min_determinant: f64,
    svd_cutoff: f64,
) -> Option<LinearSolution> {
    let lu = m.clone().lu();
    let determinant = lu.determinant();
    if determinant.is_finite() && determinant.abs() >= min_determinant {
        if let Some(x) = lu.solve(b).filter(is_finite_vector) {
            return Some(LinearSolution {
                x,
                method: SolveMethod::Lu,
                determinant,
            });
        }
    }
    let x = solve_truncated_svd(m, b, svd_cutoff)?;
    Some(LinearSolution {
        x,
        method: SolveMethod::Svd,
        determinant,
    })
}

/// Least-squares / minimum-norm solution of `m x = b`, zeroing singular values
/// below `cutoff · σ_max`.
pub fn solve_truncated_svd(m: &DMatrix<f64>, b: &DVector<f64>, cutoff: f64) -> Option<DVector<f64>> {
    if !is_finite_matrix(m) {
        return None;
    }
    let svd = m.clone().svd(true, true);
    let smax = svd.singular_values.max();
    if !(smax > 0.0) {
        return Some(DVector::zeros(m.ncols()));
    }
    svd.solve(b, cutoff * smax).ok().filter(is_finite_vector)
}

/// Inverse by LU, falling back to the truncated SVD pseudo-inverse.
pub fn invert_lu_or_svd(
    m: &DMatrix<f64>,
    min_determinant: f64,
    svd_cutoff: f64,
) -> Option<(DMatrix<f64>, SolveMethod)> {
    let lu = m.clone().lu();
    let det = lu.determinant();
    if det.is_finite() && det.abs() >= min_determinant {
        if let Some(inv) = lu.try_inverse().filter(is_finite_matrix) {
            return Some((inv, SolveMethod::Lu));
        }
    }
    pseudo_inverse(m, svd_cutoff).map(|inv| (inv, SolveMethod::Svd))
}

pub fn pseudo_inverse(m: &DMatrix<f64>, cutoff: f64) -> Option<DMatrix<f64>> {
    if !is_finite_matrix(m) {
        return None;
    }
    let svd = m.clone().svd(true, true);
    let smax = svd.singular_values.max();
    if !(smax > 0.0) {
        return Some(DMatrix::zeros(m.ncols(), m.nrows()));
    }
    svd.pseudo_inverse(cutoff * smax).ok().filter(is_finite_matrix)
}

/// Cholesky of `J Jᵀ`, rejected when its pivots spread further than the SVD
/// cutoff allows (nearly dependent constraint rows).
fn normal_cholesky(jjt: DMatrix<f64>, cutoff: f64) -> Option<Cholesky<f64, Dyn>> {
    let chol = jjt.cholesky()?;
    let diag = chol.l_dirty().diagonal();
    let max = diag.amax();
    let min = diag.iter().fold(f64::INFINITY, |acc, d| acc.min(d.abs()));
    (min > cutoff * max).then_some(chol)
}

/// Least-squares multipliers: the `λ` minimizing `|g + Jᵀλ|`.
///
/// `j` is `ncon × npar`. Solves `(J Jᵀ) λ = -J g` by Cholesky, otherwise
/// `Jᵀ λ = -g` by SVD.
pub fn least_squares_multipliers(j: &DMatrix<f64>, g: &DVector<f64>, cutoff: f64) -> Option<DVector<f64>> {
    let jjt = j * j.transpose();
    let rhs = -(j * g);
    if let Some(chol) = normal_cholesky(jjt, cutoff) {
        let lambda = chol.solve(&rhs);
        if is_finite_vector(&lambda) {
            return Some(lambda);
        }
    }
    solve_truncated_svd(&j.transpose(), &(-g), cutoff)
}

/// Minimum-norm correction `p̂ = -Jᵀ (J Jᵀ)⁻¹ c` that removes the linearized
/// constraint violation `c`.
pub fn min_norm_correction(j: &DMatrix<f64>, c: &DVector<f64>, cutoff: f64) -> Option<DVector<f64>> {
    let jjt = j * j.transpose();
    let s = match normal_cholesky(jjt.clone(), cutoff) {
        Some(chol) => chol.solve(c),
        None => pseudo_inverse(&jjt, cutoff)? * c,
    };
    let p = -(j.transpose() * s);
    is_finite_vector(&p).then_some(p)
}

/// `diag(e) · m · diag(e)`.
pub fn scale_symmetric(m: &DMatrix<f64>, e: &DVector<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(m.nrows(), m.ncols(), |i, j| e[i] * m[(i, j)] * e[j])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lu_solves_regular_kkt_system() {
        // minimize x² + y² subject to x + y = 2
        let m = DMatrix::from_row_slice(3, 3, &[2.0, 0.0, 1.0, 0.0, 2.0, 1.0, 1.0, 1.0, 0.0]);
        let b = DVector::from_row_slice(&[0.0, 0.0, 2.0]);
        let sol = solve_lu_or_svd(&m, &b, 1e-12, 1e-3).unwrap();
        assert_eq!(sol.method, SolveMethod::Lu);
        assert!((sol.x[0] - 1.0).abs() < 1e-12);
        assert!((sol.x[1] - 1.0).abs() < 1e-12);
        assert!((sol.x[2] + 2.0).abs() < 1e-12);
    }

    #[test]
    fn duplicated_constraint_falls_back_to_svd() {
        let m = DMatrix::from_row_slice(
            4,
            4,
            &[
                2.0, 0.0, 1.0, 1.0, //
                0.0, 2.0, 1.0, 1.0, //
                1.0, 1.0, 0.0, 0.0, //
                1.0, 1.0, 0.0, 0.0,
            ],
        );
        let b = DVector::from_row_slice(&[0.0, 0.0, 2.0, 2.0]);
        let sol = solve_lu_or_svd(&m, &b, 1e-12, 1e-3).unwrap();
        assert_eq!(sol.method, SolveMethod::Svd);
        assert!((sol.x[0] - 1.0).abs() < 1e-9);
        assert!((sol.x[1] - 1.0).abs() < 1e-9);
        // The multipliers split the force between the two copies.
        assert!((sol.x[2] + sol.x[3] + 2.0).abs() < 1e-9);
    }

    #[test]
    fn least_squares_multipliers_cancel_gradient() {
        let j = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        let g = DVector::from_row_slice(&[-2.0, -2.0]);
        let lambda = least_squares_multipliers(&j, &g, 1e-6).unwrap();
        assert!((lambda[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn least_squares_multipliers_handle_redundant_rows() {
        let j = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let g = DVector::from_row_slice(&[-2.0, -2.0]);
        let lambda = least_squares_multipliers(&j, &g, 1e-6).unwrap();
        let residual = &g + j.transpose() * &lambda;
        assert!(residual.norm() < 1e-9);
    }

    #[test]
    fn min_norm_correction_removes_linear_violation() {
        let j = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        let c = DVector::from_row_slice(&[0.5]);
        let p = min_norm_correction(&j, &c, 1e-6).unwrap();
        assert!(((&j * &p)[0] + 0.5).abs() < 1e-12);
    }
}
