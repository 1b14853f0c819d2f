//! A particle taking part in the fit.
//!
//! `FitObject` couples a parameterization with its parameter storage and a
//! cached four-momentum (plus derivatives). Every parameter write goes
//! through `recompute()`, so the cache never lags the parameters.

use nalgebra::{DMatrix, DVector};

use super::four_vector::{FourVector, Meta};
use super::parameters::ParameterSet;
use crate::error::SetupError;
use crate::models::{IsrPhoton, Jet, Kinematics, Parameterization, ParticleKind, PxPyPzE, PxPyPzM, Track};

/// Handle of a fit object inside a `FitDriver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub usize);

impl ObjectId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct FitObject {
    name: String,
    kind: ParticleKind,
    params: ParameterSet,
    kin: Kinematics,
}

impl FitObject {
    /// Creates an object with all parameters unmeasured and free.
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<ParticleKind>,
        values: &[f64],
    ) -> Result<Self, SetupError> {
        let name = name.into();
        let kind = kind.into();
        let npar = kind.npar();
        if values.len() != npar {
            return Err(SetupError::ValueCount {
                object: name,
                expected: npar,
                actual: values.len(),
            });
        }
        if let Some(&bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(SetupError::InvalidValue {
                what: "parameter value",
                value: bad,
            });
        }
        let mut params = ParameterSet::new(npar);
        params.values_mut().copy_from_slice(values);
        kind.normalize(params.values_mut());
        for i in 0..npar {
            let v = params.get(i);
            params.set_measured_value(i, v);
        }
        let kin = kind.evaluate(params.values());
        Ok(Self {
            name,
            kind,
            params,
            kin,
        })
    }

    /// Same as `new`, with every parameter measured and the given covariance.
    pub fn measured(
        name: impl Into<String>,
        kind: impl Into<ParticleKind>,
        values: &[f64],
        cov: &DMatrix<f64>,
    ) -> Result<Self, SetupError> {
        let mut obj = Self::new(name, kind, values)?;
        for i in 0..obj.npar() {
            obj.params.set_measured(i, true);
        }
        obj.params.set_covariance(&obj.name, cov)?;
        Ok(obj)
    }

    /// Jet with uncorrelated errors on (E, θ, φ).
    pub fn jet(
        name: impl Into<String>,
        e: f64,
        theta: f64,
        phi: f64,
        errors: [f64; 3],
        mass: f64,
    ) -> Result<Self, SetupError> {
        let cov = DMatrix::from_diagonal(&DVector::from_iterator(
            3,
            errors.iter().map(|s| s * s),
        ));
        Self::measured(name, Jet::new(mass), &[e, theta, phi], &cov)
    }

    /// Massless, fully unmeasured jet.
    pub fn neutrino(name: impl Into<String>, e: f64, theta: f64, phi: f64) -> Result<Self, SetupError> {
        Self::new(name, Jet::massless(), &[e, theta, phi])
    }

    /// Measured four-vector; `cov` is over (px, py, pz, E).
    pub fn px_py_pz_e(name: impl Into<String>, p: FourVector, cov: &DMatrix<f64>) -> Result<Self, SetupError> {
        Self::measured(name, PxPyPzE, &[p.px, p.py, p.pz, p.e], cov)
    }

    /// Measured three-momentum with a fixed mass; `cov` is over (px, py, pz).
    pub fn px_py_pz_m(
        name: impl Into<String>,
        px: f64,
        py: f64,
        pz: f64,
        mass: f64,
        cov: &DMatrix<f64>,
    ) -> Result<Self, SetupError> {
        Self::measured(name, PxPyPzM::new(mass), &[px, py, pz], cov)
    }

    /// ISR photon starting at `pz` with fixed transverse momentum.
    pub fn isr_photon(
        name: impl Into<String>,
        px: f64,
        py: f64,
        pz: f64,
        b: f64,
        pz_max: f64,
    ) -> Result<Self, SetupError> {
        let isr = IsrPhoton::new(b, pz_max)?;
        let mut obj = Self::new(name, isr, &[px, py, isr.pg(pz)])?;
        obj.params.set_fixed(0, true);
        obj.params.set_fixed(1, true);
        obj.params.set_measured(2, true);
        obj.params.set_measured_value(2, 0.0);
        obj.params.set_error(2, 1.0);
        Ok(obj)
    }

    /// Measured track; `cov` is over (κ, φ, tanλ).
    pub fn track(
        name: impl Into<String>,
        kappa: f64,
        phi: f64,
        tan_lambda: f64,
        mass: f64,
        cov: &DMatrix<f64>,
    ) -> Result<Self, SetupError> {
        Self::measured(name, Track::new(mass), &[kappa, phi, tan_lambda], cov)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ParticleKind {
        &self.kind
    }

    pub fn npar(&self) -> usize {
        self.params.len()
    }

    pub fn param_name(&self, i: usize) -> &'static str {
        self.kind.param_name(i)
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    pub fn param(&self, i: usize) -> f64 {
        self.params.get(i)
    }

    /// Writes one parameter, normalizes and refreshes the cache.
    ///
    /// Non-finite values are ignored. Returns whether the change was significant.
    pub fn set_param(&mut self, i: usize, value: f64) -> bool {
        if i >= self.npar() || !value.is_finite() {
            return false;
        }
        let mut trial = self.params.values().to_vec();
        trial[i] = value;
        self.kind.normalize(&mut trial);
        let mut significant = false;
        for (j, v) in trial.into_iter().enumerate() {
            significant |= self.params.set(j, v);
        }
        self.recompute();
        significant
    }

    pub fn measured_param(&self, i: usize) -> f64 {
        self.params.measured_value(i)
    }

    pub fn set_measured_param(&mut self, i: usize, value: f64) {
        self.params.set_measured_value(i, value);
    }

    pub fn is_param_measured(&self, i: usize) -> bool {
        self.params.is_measured(i)
    }

    pub fn set_param_measured(&mut self, i: usize, measured: bool) {
        self.params.set_measured(i, measured);
    }

    pub fn is_param_fixed(&self, i: usize) -> bool {
        self.params.is_fixed(i)
    }

    pub fn fix_param(&mut self, i: usize, fixed: bool) {
        self.params.set_fixed(i, fixed);
    }

    pub fn error(&self, i: usize) -> f64 {
        self.params.error(i)
    }

    pub fn set_error(&mut self, i: usize, error: f64) {
        self.params.set_error(i, error);
    }

    pub fn set_cov(&mut self, i: usize, j: usize, value: f64) {
        self.params.set_cov(i, j, value);
    }

    pub fn set_covariance(&mut self, cov: &DMatrix<f64>) -> Result<(), SetupError> {
        self.params.set_covariance(&self.name, cov)
    }

    pub fn has_valid_covariance(&self) -> bool {
        self.params.has_valid_covariance()
    }

    pub fn fitted_covariance(&self) -> Option<&DMatrix<f64>> {
        self.params.fitted_covariance()
    }

    pub(crate) fn set_fitted_covariance(&mut self, cov: Option<DMatrix<f64>>) {
        self.params.set_fitted_covariance(cov);
    }

    pub fn global_par_num(&self, i: usize) -> Option<usize> {
        self.params.global_index(i)
    }

    pub fn set_global_par_num(&mut self, i: usize, global: Option<usize>) {
        if !self.params.is_fixed(i) {
            self.params.set_global_index(i, global);
        }
    }

    pub fn four_momentum(&self) -> FourVector {
        self.kin.p
    }

    pub fn first_derivative(&self, meta: Meta, local: usize) -> f64 {
        self.kin.d1[meta.index()][local]
    }

    pub fn second_derivative(&self, meta: Meta, l1: usize, l2: usize) -> f64 {
        self.kin.d2[meta.index()][l1][l2]
    }

    pub fn chi2(&self) -> f64 {
        self.params.chi2()
    }

    /// Pulls this object's free parameters out of the global vector,
    /// normalizes them and writes the normalized values back.
    ///
    /// Returns whether any parameter changed significantly.
    pub fn update_params(&mut self, x: &mut DVector<f64>) -> bool {
        let n = self.npar();
        let mut trial = self.params.values().to_vec();
        for (i, slot) in trial.iter_mut().enumerate() {
            if let Some(g) = self.params.global_index(i) {
                if x[g].is_finite() {
                    *slot = x[g];
                }
            }
        }
        self.kind.normalize(&mut trial);
        let mut significant = false;
        for (i, v) in trial.into_iter().enumerate().take(n) {
            significant |= self.params.set(i, v);
            if let Some(g) = self.params.global_index(i) {
                x[g] = self.params.get(i);
            }
        }
        self.recompute();
        significant
    }

    /// `∂χ²/∂a` added into the global first-derivative vector.
    pub fn add_to_global_chi2_der_vector(&self, y: &mut DVector<f64>) {
        for i in 0..self.npar() {
            if let Some(g) = self.params.global_index(i) {
                y[g] += self.params.chi2_gradient(i);
            }
        }
    }

    /// `scale · ∂²χ²/∂a∂a` added into a global matrix.
    pub fn add_to_global_chi2_der_matrix(&self, m: &mut DMatrix<f64>, scale: f64) {
        for i in 0..self.npar() {
            let Some(gi) = self.params.global_index(i) else {
                continue;
            };
            for j in 0..self.npar() {
                if let Some(gj) = self.params.global_index(j) {
                    m[(gi, gj)] += scale * self.params.chi2_hessian(i, j);
                }
            }
        }
    }

    /// Measurement covariance of the measured, free parameters placed into a
    /// global matrix.
    pub fn add_to_global_cov(&self, v: &mut DMatrix<f64>) {
        let cov = self.params.covariance();
        for i in 0..self.npar() {
            let Some(gi) = self.params.global_index(i) else {
                continue;
            };
            if !self.params.contributes_to_chi2(i) {
                continue;
            }
            for j in 0..self.npar() {
                if let Some(gj) = self.params.global_index(j) {
                    if self.params.contributes_to_chi2(j) {
                        v[(gi, gj)] = cov[(i, j)];
                    }
                }
            }
        }
    }

    pub fn kinematics(&self) -> &Kinematics {
        &self.kin
    }

    pub fn recompute(&mut self) {
        self.kin = self.kind.evaluate(self.params.values());
    }
}
