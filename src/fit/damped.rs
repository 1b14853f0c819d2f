//! Damped Newton fit.
//!
//! Solves `M Δx = y` for the full Lagrangian system and moves along
//! `x = x₀ - s Δx`, choosing `s` by backtracking on `f = ½ |E y|²`. When
//! backtracking cannot find `s ≥ 0.01`, the step is rebuilt from the
//! eigenvectors of the scaled system, dropping the weakest directions one
//! at a time.

use nalgebra::{DMatrix, DVector, SymmetricEigen};

use super::assembler::{self, IndexOrder, Layout};
use super::{FitEngine, FitOutcome, FitProblem, covariance};
use crate::domain::{Engine, SolverOptions};
use crate::error::FitError;
use crate::math::{is_finite_matrix, is_finite_vector, least_squares_multipliers, scale_symmetric};
use crate::trace::{FitView, SUBSTEP_BISECTION, TraceEvent, TraceValues, TracerChain};

/// Sufficient-decrease factor of the backtracking.
const ALF: f64 = 1e-4;
/// Largest component of the scaled step.
const MAX_STEP: f64 = 5.0;
/// Backtracking trials per direction.
const MAX_TRIALS: usize = 100;
const MIN_SCALE: f64 = 1e-4;
/// Best scale below which the eigenvector fallback is used.
const SCALE_FALLBACK: f64 = 0.01;
const CHI2_CONVERGED: f64 = 1e-3;
const F_CONVERGED: f64 = 1e-3;
const F_NEGLIGIBLE: f64 = 1e-6;

#[derive(Debug, Clone, Default)]
pub struct DampedFitter {
    options: SolverOptions,
}

impl DampedFitter {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }
}

impl FitEngine for DampedFitter {
    fn kind(&self) -> Engine {
        Engine::Damped
    }

    fn fit(&mut self, problem: &mut FitProblem, tracers: &mut TracerChain) -> FitOutcome {
        let layout = assembler::initialize(problem, IndexOrder::ObjectOrder);
        if layout.npar == 0 {
            return FitOutcome::failed(FitError::EmptyProblem, &layout, problem.chi2(), 0);
        }
        if let Err(err) = assembler::check_covariances(problem) {
            return FitOutcome::failed(err, &layout, problem.chi2(), 0);
        }
        let idim = layout.idim();
        DampedSession {
            problem,
            tracers,
            options: &self.options,
            layout,
            x: DVector::zeros(idim),
            xold: DVector::zeros(idim),
            e: DVector::from_element(idim, 1.0),
            chi2: 0.0,
            iteration: 0,
            values: TraceValues::default(),
            error_code: 0,
        }
        .run()
    }
}

/// Best point seen along the search directions of one iteration.
#[derive(Debug, Clone)]
struct Best {
    f: f64,
    scale: f64,
    x: DVector<f64>,
}

struct DampedSession<'a> {
    problem: &'a mut FitProblem,
    tracers: &'a mut TracerChain,
    options: &'a SolverOptions,
    layout: Layout,
    x: DVector<f64>,
    xold: DVector<f64>,
    e: DVector<f64>,
    chi2: f64,
    iteration: usize,
    values: TraceValues,
    error_code: i32,
}

impl DampedSession<'_> {
    fn notify(&mut self, event: TraceEvent) {
        if self.tracers.is_empty() {
            return;
        }
        let view = FitView {
            engine: Engine::Damped,
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
        self.seed_multipliers();
        self.chi2 = self.problem.chi2();
        self.notify(TraceEvent::Initialize);

        let error = loop {
            let chi2_old = self.chi2;
            self.xold.copy_from(&self.x);
            assembler::fill_errors(self.problem, &self.layout, &mut self.e);

            let m = assembler::assemble_m(self.problem, &self.layout, &self.x, false);
            if !is_finite_matrix(&m) {
                break Some(FitError::NonFinite { what: "system matrix" });
            }
            let y = assembler::assemble_y(self.problem, &self.layout, &self.x);
            if !is_finite_vector(&y) {
                break Some(FitError::NonFinite {
                    what: "derivative vector",
                });
            }
            let m_scaled = scale_symmetric(&m, &self.e);
            let y_scaled = y.component_mul(&self.e);
            let f0 = 0.5 * y_scaled.norm_squared();
            // already at a stationary point of the Lagrangian
            if f0 < F_NEGLIGIBLE {
                break None;
            }
            let mut best = Best {
                f: f0,
                scale: 0.0,
                x: self.xold.clone(),
            };

            let lu = m_scaled.clone().lu();
            self.values.det_w = lu.determinant();
            match lu.solve(&y_scaled).filter(is_finite_vector) {
                Some(dxscal) => self.optimize_scale(&m_scaled, &y_scaled, dxscal, &mut best),
                None => log::warn!("damped iter {}: LU failed, using eigenvectors", self.iteration),
            }
            if best.scale < SCALE_FALLBACK {
                self.eigen_directions(&m_scaled, &y_scaled, &mut best);
            }

            self.x = best.x.clone();
            assembler::update_params(self.problem, &mut self.x);
            self.chi2 = self.problem.chi2();
            self.iteration += 1;
            self.values.alpha = best.scale;
            self.values.phi = best.f;
            log::debug!(
                "damped iter {}: chi2={:.6e} f0={:.3e} fbest={:.3e} scale={:.3e}",
                self.iteration,
                self.chi2,
                f0,
                best.f,
                best.scale
            );
            self.notify(TraceEvent::Step);

            if self.iteration > self.options.max_iterations {
                break Some(FitError::OutOfIterations {
                    iterations: self.iteration,
                });
            }
            if !self.chi2.is_finite() || self.chi2 > self.options.chi2_ceiling {
                break Some(FitError::ChiSquareDiverged { chi2: self.chi2 });
            }
            let converged = (self.chi2 - chi2_old).abs() < CHI2_CONVERGED
                && best.f < F_CONVERGED
                && (best.f < F_NEGLIGIBLE || (f0 - best.f).abs() < 0.2 * best.f);
            if converged {
                break None;
            }
        };

        self.error_code = error.as_ref().map_or(0, FitError::code);
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

    /// Least-squares multipliers at the starting point, so that a start on
    /// the solution has `y ≈ 0`.
    fn seed_multipliers(&mut self) {
        let (npar, ncon) = (self.layout.npar, self.layout.ncon);
        if ncon == 0 {
            return;
        }
        let j = assembler::constraint_jacobian(self.problem, &self.layout);
        let g = assembler::chi2_gradient(self.problem, &self.layout);
        match least_squares_multipliers(&j, &g, self.options.svd_cutoff) {
            Some(lambda) => self.x.rows_mut(npar, ncon).copy_from(&lambda),
            None => log::debug!("damped fit: no multiplier estimate, starting from zero"),
        }
    }

    /// `f = ½ |E y|²` at `x`; moves the objects there.
    fn f_at(&mut self, x: &mut DVector<f64>) -> f64 {
        assembler::update_params(self.problem, x);
        let y = assembler::assemble_y(self.problem, &self.layout, x);
        let f = 0.5 * y.component_mul(&self.e).norm_squared();
        if f.is_finite() { f } else { f64::INFINITY }
    }

    /// Backtracks along `-dxscal` with quadratic, then cubic, interpolation.
    fn optimize_scale(
        &mut self,
        m_scaled: &DMatrix<f64>,
        y_scaled: &DVector<f64>,
        mut dxscal: DVector<f64>,
        best: &mut Best,
    ) {
        let f0 = 0.5 * y_scaled.norm_squared();
        let grad = m_scaled * y_scaled;
        let stepsize = dxscal.amax();
        if stepsize > MAX_STEP {
            dxscal *= MAX_STEP / stepsize;
        }
        let dx = dxscal.component_mul(&self.e);
        let slope = -dxscal.dot(&grad);

        let mut scale: f64 = 1.0;
        let mut scale_old: f64 = 1.0;
        let mut f_old = f0;
        for trial in 1..=MAX_TRIALS {
            let mut xt = &self.xold - &dx * scale;
            let f = self.f_at(&mut xt);
            let chi2 = self.problem.chi2();
            if f < best.f {
                *best = Best { f, scale, x: xt };
            }
            self.values.alpha = scale;
            self.values.phi = f;
            self.chi2 = chi2;
            self.notify(TraceEvent::Substep(SUBSTEP_BISECTION));
            log::trace!("damped trial {trial}: scale={scale:.4e} f={f:.6e}");

            if f < f0 + ALF * scale * slope {
                break;
            }
            let mut next = if trial == 1 {
                -slope / (2.0 * (f - f0 - slope))
            } else {
                let rhs1 = f - f0 - scale * slope;
                let rhs2 = f_old - f0 - scale_old * slope;
                let a = (rhs1 / (scale * scale) - rhs2 / (scale_old * scale_old)) / (scale - scale_old);
                let b = (-scale_old * rhs1 / (scale * scale) + scale * rhs2 / (scale_old * scale_old))
                    / (scale - scale_old);
                if a == 0.0 {
                    -slope / (2.0 * b)
                } else {
                    let disc = b * b - 3.0 * a * slope;
                    if disc < 0.0 {
                        0.5 * scale
                    } else if b <= 0.0 {
                        (-b + disc.sqrt()) / (3.0 * a)
                    } else {
                        -slope / (b + disc.sqrt())
                    }
                }
            };
            if trial > 1 && next > 0.5 * scale {
                next = 0.5 * scale;
            }
            scale_old = scale;
            f_old = f;
            scale = if next >= 0.1 * scale { next } else { 0.1 * scale };
            if scale <= MIN_SCALE {
                break;
            }
        }
    }

    /// Retries the search with steps built from the leading eigenvectors of
    /// the scaled system, one direction fewer each time.
    fn eigen_directions(&mut self, m_scaled: &DMatrix<f64>, y_scaled: &DVector<f64>, best: &mut Best) {
        let eigen = SymmetricEigen::new(m_scaled.clone());
        let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
        order.sort_by(|&a, &b| eigen.eigenvalues[b].abs().total_cmp(&eigen.eigenvalues[a].abs()));

        let coeffs: Vec<f64> = order
            .iter()
            .map(|&k| {
                let ev = eigen.eigenvalues[k];
                if ev == 0.0 {
                    0.0
                } else {
                    eigen.eigenvectors.column(k).dot(y_scaled) / ev
                }
            })
            .collect();
        let mut ndim = order
            .iter()
            .take_while(|&&k| eigen.eigenvalues[k] != 0.0)
            .count();

        while ndim > 0 {
            let mut dxscal = DVector::zeros(m_scaled.nrows());
            for (&k, &c) in order.iter().zip(coeffs.iter()).take(ndim) {
                dxscal.axpy(c, &eigen.eigenvectors.column(k), 1.0);
            }
            log::debug!("damped iter {}: eigen step with {ndim} directions", self.iteration);
            self.optimize_scale(m_scaled, y_scaled, dxscal, best);
            ndim -= 1;
            if best.scale >= SCALE_FALLBACK {
                break;
            }
        }
    }
}
