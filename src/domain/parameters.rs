//! Per-object parameter storage.
//!
//! A `ParameterSet` keeps the current values, the measured values, the
//! measured/fixed flags, the measurement covariance with its cached inverse,
//! the fitted covariance written after a fit, and the local-to-global index
//! map filled in by the assembler.

use nalgebra::DMatrix;

use crate::error::SetupError;

/// Upper bound on the number of local parameters of any parameterization.
pub const MAX_PAR: usize = 10;

/// A parameter change is significant when it exceeds this fraction of its error.
const SIGNIFICANT_FRACTION: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct ParameterSet {
    par: Vec<f64>,
    mpar: Vec<f64>,
    measured: Vec<bool>,
    fixed: Vec<bool>,
    cov: DMatrix<f64>,
    /// Inverse of `cov` restricted to measured, non-fixed parameters; zero elsewhere.
    cov_inv: Option<DMatrix<f64>>,
    fitted_cov: Option<DMatrix<f64>>,
    global: Vec<Option<usize>>,
}

impl ParameterSet {
    /// All parameters start at zero, unmeasured, free, and with zero covariance.
    pub fn new(npar: usize) -> Self {
        debug_assert!(npar <= MAX_PAR);
        let mut set = Self {
            par: vec![0.0; npar],
            mpar: vec![0.0; npar],
            measured: vec![false; npar],
            fixed: vec![false; npar],
            cov: DMatrix::zeros(npar, npar),
            cov_inv: None,
            fitted_cov: None,
            global: vec![None; npar],
        };
        set.recompute_inverse();
        set
    }

    pub fn len(&self) -> usize {
        self.par.len()
    }

    pub fn is_empty(&self) -> bool {
        self.par.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.par
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.par
    }

    pub fn get(&self, i: usize) -> f64 {
        self.par[i]
    }

    /// Writes a value; NaN and infinities are ignored.
    ///
    /// Returns whether the change is significant compared with the parameter error.
    pub fn set(&mut self, i: usize, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        let significant = self.is_significant_change(i, value);
        self.par[i] = value;
        significant
    }

    pub fn is_significant_change(&self, i: usize, value: f64) -> bool {
        let delta = (value - self.par[i]).abs();
        let err = self.error(i);
        if err > 0.0 {
            delta > SIGNIFICANT_FRACTION * err
        } else {
            delta > 0.0
        }
    }

    pub fn measured_value(&self, i: usize) -> f64 {
        self.mpar[i]
    }

    pub fn set_measured_value(&mut self, i: usize, value: f64) {
        if value.is_finite() {
            self.mpar[i] = value;
        }
    }

    pub fn is_measured(&self, i: usize) -> bool {
        self.measured[i]
    }

    pub fn set_measured(&mut self, i: usize, measured: bool) {
        self.measured[i] = measured;
        self.recompute_inverse();
    }

    pub fn is_fixed(&self, i: usize) -> bool {
        self.fixed[i]
    }

    pub fn set_fixed(&mut self, i: usize, fixed: bool) {
        self.fixed[i] = fixed;
        if fixed {
            self.global[i] = None;
        }
        self.recompute_inverse();
    }

    /// Free and measured: the parameter contributes to χ².
    pub fn contributes_to_chi2(&self, i: usize) -> bool {
        self.measured[i] && !self.fixed[i]
    }

    pub fn error(&self, i: usize) -> f64 {
        self.cov[(i, i)].max(0.0).sqrt()
    }

    pub fn set_error(&mut self, i: usize, error: f64) {
        self.cov[(i, i)] = error * error;
        self.recompute_inverse();
    }

    /// Sets a symmetric covariance element.
    pub fn set_cov(&mut self, i: usize, j: usize, value: f64) {
        self.cov[(i, j)] = value;
        self.cov[(j, i)] = value;
        self.recompute_inverse();
    }

    pub fn set_covariance(&mut self, object: &str, cov: &DMatrix<f64>) -> Result<(), SetupError> {
        let n = self.len();
        if cov.nrows() != n || cov.ncols() != n {
            return Err(SetupError::CovarianceShape {
                object: object.to_string(),
                npar: n,
                rows: cov.nrows(),
                cols: cov.ncols(),
            });
        }
        self.cov = (cov + cov.transpose()) * 0.5;
        self.recompute_inverse();
        Ok(())
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.cov
    }

    pub fn inverse_covariance(&self) -> Option<&DMatrix<f64>> {
        self.cov_inv.as_ref()
    }

    /// False when the measured block of the covariance could not be inverted.
    pub fn has_valid_covariance(&self) -> bool {
        self.cov_inv.is_some()
    }

    pub fn fitted_covariance(&self) -> Option<&DMatrix<f64>> {
        self.fitted_cov.as_ref()
    }

    pub fn set_fitted_covariance(&mut self, cov: Option<DMatrix<f64>>) {
        self.fitted_cov = cov;
    }

    /// Fitted error when a fit produced one, the measurement error otherwise.
    pub fn fitted_error(&self, i: usize) -> f64 {
        match &self.fitted_cov {
            Some(cov) => cov[(i, i)].max(0.0).sqrt(),
            None => self.error(i),
        }
    }

    pub fn global_index(&self, i: usize) -> Option<usize> {
        self.global[i]
    }

    pub fn set_global_index(&mut self, i: usize, global: Option<usize>) {
        self.global[i] = global;
    }

    /// `(y - η)ᵀ V⁻¹ (y - η)` over the measured, free parameters.
    pub fn chi2(&self) -> f64 {
        let Some(cinv) = &self.cov_inv else {
            return 0.0;
        };
        let n = self.len();
        let mut chi2 = 0.0;
        for i in 0..n {
            if !self.contributes_to_chi2(i) {
                continue;
            }
            let ri = self.par[i] - self.mpar[i];
            for j in 0..n {
                if self.contributes_to_chi2(j) {
                    chi2 += ri * cinv[(i, j)] * (self.par[j] - self.mpar[j]);
                }
            }
        }
        chi2
    }

    /// `∂χ²/∂a_i = 2 Σ_j V⁻¹_ij (a_j - m_j)`.
    pub fn chi2_gradient(&self, i: usize) -> f64 {
        let Some(cinv) = &self.cov_inv else {
            return 0.0;
        };
        if !self.contributes_to_chi2(i) {
            return 0.0;
        }
        (0..self.len())
            .filter(|&j| self.contributes_to_chi2(j))
            .map(|j| 2.0 * cinv[(i, j)] * (self.par[j] - self.mpar[j]))
            .sum()
    }

    /// `∂²χ²/∂a_i∂a_j = 2 V⁻¹_ij`.
    pub fn chi2_hessian(&self, i: usize, j: usize) -> f64 {
        match &self.cov_inv {
            Some(cinv) if self.contributes_to_chi2(i) && self.contributes_to_chi2(j) => {
                2.0 * cinv[(i, j)]
            }
            _ => 0.0,
        }
    }

    /// Rebuilds the cached inverse of the measured block.
    pub fn recompute_inverse(&mut self) {
        let active: Vec<usize> = (0..self.len())
            .filter(|&i| self.contributes_to_chi2(i))
            .collect();
        let n = self.len();
        if active.is_empty() {
            self.cov_inv = Some(DMatrix::zeros(n, n));
            return;
        }
        let block = DMatrix::from_fn(active.len(), active.len(), |r, c| {
            self.cov[(active[r], active[c])]
        });
        let inverse = match block.clone().cholesky() {
            Some(chol) => Some(chol.inverse()),
            None => block.try_inverse(),
        };
        self.cov_inv = inverse.filter(|m| m.iter().all(|v| v.is_finite())).map(|inv| {
            let mut full = DMatrix::zeros(n, n);
            for (r, &i) in active.iter().enumerate() {
                for (c, &j) in active.iter().enumerate() {
                    full[(i, j)] = inv[(r, c)];
                }
            }
            full
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measured_pair() -> ParameterSet {
        let mut set = ParameterSet::new(2);
        set.set_measured(0, true);
        set.set_measured(1, true);
        set.set_error(0, 2.0);
        set.set_error(1, 0.5);
        set
    }

    #[test]
    fn chi2_uses_inverse_of_measured_block() {
        let mut set = measured_pair();
        set.set(0, 4.0);
        set.set(1, -1.0);
        // (4/2)^2 + (1/0.5)^2
        assert!((set.chi2() - 8.0).abs() < 1e-12);
        assert!((set.chi2_gradient(0) - 2.0 * 4.0 / 4.0).abs() < 1e-12);
        assert!((set.chi2_hessian(1, 1) - 8.0).abs() < 1e-12);
    }

    #[test]
    fn nan_writes_are_ignored() {
        let mut set = measured_pair();
        set.set(0, 1.5);
        assert!(!set.set(0, f64::NAN));
        assert_eq!(set.get(0), 1.5);
    }

    #[test]
    fn significance_is_relative_to_error() {
        let mut set = measured_pair();
        assert!(!set.set(0, 1e-5));
        assert!(set.set(0, 1e-2));
    }

    #[test]
    fn fixed_and_unmeasured_parameters_do_not_contribute() {
        let mut set = measured_pair();
        set.set(0, 3.0);
        set.set(1, 3.0);
        set.set_fixed(1, true);
        assert!((set.chi2() - 9.0 / 4.0).abs() < 1e-12);
        set.set_measured(0, false);
        assert_eq!(set.chi2(), 0.0);
    }

    #[test]
    fn singular_measured_block_has_no_inverse() {
        let mut set = ParameterSet::new(1);
        set.set_measured(0, true);
        assert!(!set.has_valid_covariance());
        set.set_error(0, 1.0);
        assert!(set.has_valid_covariance());
    }

    #[test]
    fn covariance_shape_is_checked() {
        let mut set = ParameterSet::new(3);
        let err = set.set_covariance("x", &DMatrix::identity(2, 2)).unwrap_err();
        assert!(matches!(err, SetupError::CovarianceShape { npar: 3, .. }));
    }
}
