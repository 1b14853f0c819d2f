//! Constrained Newton solver on the Lagrangian `χ² + Σ λ_k c_k`.
//!
//! Each iteration:
//!
//! - assembles `M` and `y` at the current point and solves the scaled system
//!   `(E M E) Δx̃ = E y`, with `Δx = -E Δx̃`
//! - retries with least-squares and then zeroed multipliers when the step
//!   has negative curvature along the parameter block
//! - limits the step with an ℓ1 merit function: full step, second-order
//!   correction, then a bisection line search
//!
//! Convergence is declared when the scaled Newton step vanishes, or when χ²
//! and the parameters both stop moving.

use nalgebra::{DMatrix, DVector};

use super::assembler::{self, IndexOrder, Layout};
use super::line_search::{LineSearchContext, Trial, bisection_search};
use super::merit::{ConstraintState, PenaltyWeightInputs, merit, merit_derivative, penalty_weight};
use super::{FitEngine, FitOutcome, FitProblem, covariance};
use crate::domain::{Engine, SolverOptions};
use crate::error::FitError;
use crate::math::{
    SolveMethod, is_finite_matrix, is_finite_vector, least_squares_multipliers, min_norm_correction,
    scale_symmetric, solve_lu_or_svd,
};
use crate::trace::{
    FitView, SUBSTEP_BISECTION, SUBSTEP_FULL, SUBSTEP_SECOND_ORDER, TraceEvent, TraceValues, TracerChain,
};

/// Sufficient-decrease factor of the merit test.
const ETA: f64 = 0.1;
/// Curvature / Goldstein factor of the bisection.
const ZETA: f64 = 0.5;
/// Σ|Δx̃| below `NULL_STEP · idim` means the system is already solved.
const NULL_STEP: f64 = 1e-6;
/// Parameter moves below this fraction of the error are not significant.
const SIGNIFICANT_STEP: f64 = 1e-4;
/// Attempts at a step with non-negative curvature.
const CURVATURE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct NewtonFitter {
    options: SolverOptions,
}

impl NewtonFitter {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }
}

impl FitEngine for NewtonFitter {
    fn kind(&self) -> Engine {
        Engine::Newton
    }

    fn fit(&mut self, problem: &mut FitProblem, tracers: &mut TracerChain) -> FitOutcome {
        let layout = assembler::initialize(problem, IndexOrder::ObjectOrder);
        if layout.npar == 0 {
            return FitOutcome::failed(FitError::EmptyProblem, &layout, problem.chi2(), 0);
        }
        if let Err(err) = assembler::check_covariances(problem) {
            return FitOutcome::failed(err, &layout, problem.chi2(), 0);
        }
        Session::new(problem, tracers, &self.options, layout).run()
    }
}

/// Transient state of one `fit()` call.
struct Session<'a> {
    problem: &'a mut FitProblem,
    tracers: &'a mut TracerChain,
    options: &'a SolverOptions,
    layout: Layout,
    x: DVector<f64>,
    xold: DVector<f64>,
    dx: DVector<f64>,
    dxscal: DVector<f64>,
    e: DVector<f64>,
    /// `M` at `x` from the last Newton solve.
    m: DMatrix<f64>,
    chi2: f64,
    iteration: usize,
    values: TraceValues,
    error_code: i32,
}

impl<'a> Session<'a> {
    fn new(
        problem: &'a mut FitProblem,
        tracers: &'a mut TracerChain,
        options: &'a SolverOptions,
        layout: Layout,
    ) -> Self {
        let idim = layout.idim();
        Self {
            problem,
            tracers,
            options,
            layout,
            x: DVector::zeros(idim),
            xold: DVector::zeros(idim),
            dx: DVector::zeros(idim),
            dxscal: DVector::zeros(idim),
            e: DVector::from_element(idim, 1.0),
            m: DMatrix::zeros(idim, idim),
            chi2: 0.0,
            iteration: 0,
            values: TraceValues::default(),
            error_code: 0,
        }
    }

    fn notify(&mut self, event: TraceEvent) {
        if self.tracers.is_empty() {
            return;
        }
        let view = FitView {
            engine: Engine::Newton,
            iteration: self.iteration,
            chi2: self.chi2,
            problem: &*self.problem,
            values: self.values,
            error_code: self.error_code,
        };
        self.tracers.notify(event, &view);
    }

    fn run(mut self) -> FitOutcome {
        assembler::fill_x(self.problem, &mut self.x);
        assembler::update_params(self.problem, &mut self.x);
        self.determine_multipliers();

        self.chi2 = self.problem.chi2();
        self.notify(TraceEvent::Initialize);

        let mut stalled = 0;
        let error = loop {
            self.notify(TraceEvent::Step);
            let chi2_old = self.chi2;
            self.xold.copy_from(&self.x);
            assembler::fill_errors(self.problem, &self.layout, &mut self.e);

            if let Err(err) = self.newton_dx() {
                break Some(err);
            }
            if self.dxscal.iter().map(|v| v.abs()).sum::<f64>() < NULL_STEP * self.layout.idim() as f64 {
                break None;
            }

            self.limited_step();
            self.chi2 = self.problem.chi2();
            self.iteration += 1;

            let (max_step, significant) = self.step_size();
            log::debug!(
                "newton iter {}: chi2={:.6e} dchi2={:.3e} max step={:.3e} alpha={:.3e} mu={:.3e}",
                self.iteration,
                self.chi2,
                self.chi2 - chi2_old,
                max_step,
                self.values.alpha,
                self.values.mu
            );

            if self.iteration > self.options.max_iterations {
                break Some(FitError::OutOfIterations {
                    iterations: self.iteration,
                });
            }
            if !self.chi2.is_finite() || self.chi2 > self.options.chi2_ceiling {
                break Some(FitError::ChiSquareDiverged { chi2: self.chi2 });
            }
            if (self.chi2 - chi2_old).abs() < self.options.chi2_tolerance && max_step < self.options.step_tolerance {
                break None;
            }
            stalled = if significant { 0 } else { stalled + 1 };
            if stalled >= self.options.stall_limit {
                break Some(FitError::NotStabilized { steps: stalled });
            }
        };

        self.error_code = error.as_ref().map_or(0, FitError::code);
        self.notify(TraceEvent::Step);

        let covariance = match error {
            Some(_) => None,
            None => {
                assembler::fill_errors(self.problem, &self.layout, &mut self.e);
                covariance::propagate(self.problem, &self.layout, &self.x, &self.e, self.options)
            }
        };

        let outcome = FitOutcome::new(self.chi2, &self.layout, self.iteration, error, covariance);
        self.notify(TraceEvent::Finish);
        outcome
    }

    fn lambda(&self) -> DVector<f64> {
        self.x.rows(self.layout.npar, self.layout.ncon).into_owned()
    }

    fn set_lambda(&mut self, lambda: &DVector<f64>) {
        self.x.rows_mut(self.layout.npar, self.layout.ncon).copy_from(lambda);
    }

    /// Multipliers that best satisfy `∇χ² + Jᵀλ = 0` at the current point.
    fn determine_multipliers(&mut self) {
        if self.layout.ncon == 0 {
            return;
        }
        let j = assembler::constraint_jacobian(self.problem, &self.layout);
        let g = assembler::chi2_gradient(self.problem, &self.layout);
        match least_squares_multipliers(&j, &g, self.options.svd_cutoff) {
            Some(lambda) => self.set_lambda(&lambda),
            None => log::warn!("could not determine Lagrange multipliers, keeping previous values"),
        }
    }

    fn newton_dx(&mut self) -> Result<(), FitError> {
        for attempt in 0..CURVATURE_ATTEMPTS {
            match attempt {
                1 => self.determine_multipliers(),
                2 => self.set_lambda(&DVector::zeros(self.layout.ncon)),
                _ => {}
            }

            let m = assembler::assemble_m(self.problem, &self.layout, &self.x, false);
            if !is_finite_matrix(&m) {
                return Err(FitError::NonFinite { what: "system matrix" });
            }
            let y = assembler::assemble_y(self.problem, &self.layout, &self.x);
            if !is_finite_vector(&y) {
                return Err(FitError::NonFinite { what: "derivative vector" });
            }

            let m_scaled = scale_symmetric(&m, &self.e);
            let y_scaled = y.component_mul(&self.e);
            let solution = solve_lu_or_svd(
                &m_scaled,
                &y_scaled,
                self.options.lu_min_determinant,
                self.options.svd_cutoff,
            )
            .ok_or(FitError::SingularSystem { stage: "newton step" })?;
            if solution.method == SolveMethod::Svd {
                log::warn!(
                    "newton iter {}: LU rejected (det={:.3e}), using SVD",
                    self.iteration,
                    solution.determinant
                );
            }
            self.values.det_w = solution.determinant;

            self.dxscal = -solution.x;
            self.dx = self.dxscal.component_mul(&self.e);
            self.m = m;

            let p_l_p = self.p_l_p();
            if p_l_p >= 0.0 {
                break;
            }
            log::debug!("newton iter {}: pᵀLp={p_l_p:.3e} on attempt {attempt}", self.iteration);
        }
        Ok(())
    }

    /// `pᵀ L p` with `L` the parameter block of `M`.
    fn p_l_p(&self) -> f64 {
        let npar = self.layout.npar;
        let p = self.dx.rows(0, npar).into_owned();
        let l = self.m.view((0, 0), (npar, npar)).into_owned();
        p.dot(&(l * &p))
    }

    fn constraint_state(&self) -> (DVector<f64>, DVector<f64>) {
        let values = assembler::constraint_values(self.problem);
        let inverse_errors = self.e.rows(self.layout.npar, self.layout.ncon).into_owned();
        (values, inverse_errors)
    }

    /// Moves the objects to `v` and evaluates the merit function there.
    fn merit_at(&mut self, v: &mut DVector<f64>, mu: f64) -> f64 {
        assembler::update_params(self.problem, v);
        let chi2 = self.problem.chi2();
        let (values, inverse_errors) = self.constraint_state();
        let cons = ConstraintState {
            values: &values,
            inverse_errors: &inverse_errors,
        };
        merit(self.options.merit, mu, chi2, &cons)
    }

    fn trial(&mut self, alpha: f64, mu: f64, need_derivative: bool) -> Trial {
        let mut xt = &self.x + &self.dx * alpha;
        let phi = self.merit_at(&mut xt, mu);
        let dphi = need_derivative.then(|| {
            let g = assembler::chi2_gradient(self.problem, &self.layout);
            let grad_dot_p = g.dot(&self.dx.rows(0, self.layout.npar));
            let (values, inverse_errors) = self.constraint_state();
            let cons = ConstraintState {
                values: &values,
                inverse_errors: &inverse_errors,
            };
            merit_derivative(self.options.merit, mu, grad_dot_p, &cons)
        });
        self.values.alpha = alpha;
        self.values.phi = phi;
        self.chi2 = self.problem.chi2();
        self.notify(TraceEvent::Substep(SUBSTEP_BISECTION));
        Trial { phi, dphi }
    }

    /// Chooses the step length along `dx` and moves `x` (and the objects) there.
    fn limited_step(&mut self) {
        let npar = self.layout.npar;
        let mut xnew = &self.x + &self.dx;

        let g = assembler::chi2_gradient(self.problem, &self.layout);
        let grad_dot_p = g.dot(&self.dx.rows(0, npar));
        let (values, inverse_errors) = self.constraint_state();
        let cons = ConstraintState {
            values: &values,
            inverse_errors: &inverse_errors,
        };
        let lambda = self.lambda();
        let lambda_new = xnew.rows(npar, self.layout.ncon).into_owned();
        let mu = penalty_weight(
            self.options.merit,
            &PenaltyWeightInputs {
                cons,
                lambda_new: &lambda_new,
                lambda: &lambda,
                grad_dot_p,
                p_l_p: self.p_l_p(),
            },
        );
        let phi0 = merit(self.options.merit, mu, self.problem.chi2(), &cons);
        let dphi0 = merit_derivative(self.options.merit, mu, grad_dot_p, &cons);
        let threshold = phi0 + ETA * dphi0;

        self.values = TraceValues {
            alpha: 0.0,
            phi: phi0,
            mu,
            det_w: self.values.det_w,
        };
        self.notify(TraceEvent::Substep(SUBSTEP_FULL));

        let phi_full = self.merit_at(&mut xnew, mu);
        self.values.alpha = 1.0;
        self.values.phi = phi_full;
        self.chi2 = self.problem.chi2();
        self.notify(TraceEvent::Substep(SUBSTEP_FULL));
        log::trace!("full step: phi0={phi0:.6e} dphi0={dphi0:.3e} phi={phi_full:.6e} mu={mu:.3e}");

        if phi_full <= threshold {
            self.x = xnew;
            return;
        }

        if self.options.second_order_correction && self.layout.ncon > 0 {
            if let Some(x_corrected) = self.second_order_correction(&xnew, mu, threshold) {
                self.x = x_corrected;
                return;
            }
        }

        let ctx = LineSearchContext {
            phi0,
            dphi0,
            eta: ETA,
            zeta: ZETA,
        };
        let mode = self.options.line_search;
        let result = {
            let mut eval = |alpha: f64, need: bool| self.trial(alpha, mu, need);
            bisection_search(mode, &ctx, &mut eval)
        };
        log::trace!(
            "line search: alpha={:.4e} after {} trials (accepted: {})",
            result.alpha,
            result.trials,
            result.accepted
        );

        let mut x_final = &self.x + &self.dx * result.alpha;
        assembler::update_params(self.problem, &mut x_final);
        self.values.alpha = result.alpha;
        self.x = x_final;
    }

    /// Adds `p̂ = -Jᵀ(JJᵀ)⁻¹ c(x + p)` to the full step; returns the corrected
    /// point if it passes the merit test. Otherwise the objects are left at
    /// `xnew`.
    fn second_order_correction(&mut self, xnew: &DVector<f64>, mu: f64, threshold: f64) -> Option<DVector<f64>> {
        let npar = self.layout.npar;
        let ncon = self.layout.ncon;
        let j = self.m.view((npar, 0), (ncon, npar)).into_owned();
        let c = assembler::constraint_values(self.problem);
        let correction = min_norm_correction(&j, &c, self.options.svd_cutoff)?;

        let mut x_corrected = xnew.clone();
        let mut params = x_corrected.rows_mut(0, npar);
        params += &correction;
        let phi = self.merit_at(&mut x_corrected, mu);
        self.values.alpha = 1.5;
        self.values.phi = phi;
        self.chi2 = self.problem.chi2();
        self.notify(TraceEvent::Substep(SUBSTEP_SECOND_ORDER));
        log::trace!("second-order correction: phi={phi:.6e} threshold={threshold:.6e}");

        if phi <= threshold {
            return Some(x_corrected);
        }
        let mut restore = xnew.clone();
        assembler::update_params(self.problem, &mut restore);
        None
    }

    /// Largest accepted parameter move in units of its error, and whether
    /// any move was significant.
    fn step_size(&self) -> (f64, bool) {
        let mut max_step: f64 = 0.0;
        let mut significant = false;
        for i in 0..self.layout.npar {
            let delta = (self.x[i] - self.xold[i]).abs();
            max_step = max_step.max(delta / self.e[i]);
            significant |= delta > SIGNIFICANT_STEP * self.e[i];
        }
        (max_step, significant)
    }
}
