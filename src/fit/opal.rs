//! Direct-elimination fit (the OPAL scheme).
//!
//! Parameters are split into measured `η` (measurements `y`, covariance `V`)
//! and unmeasured `ξ`; the constraint Jacobian into `F_η` and `F_ξ`. Per
//! iteration:
//!
//! ```text
//! S  = F_η V F_ηᵀ + F_ξ F_ξᵀ
//! λ  = S⁻¹ (f + F_η (y - η))
//! Δξ = -α (F_ξᵀ S⁻¹ F_ξ)⁻¹ F_ξᵀ λ          λ += S⁻¹ F_ξ Δξ
//! η  = y - V F_ηᵀ λ
//! χ² = (y - η)ᵀ V⁻¹ (y - η) + Σ |2 λ_k f_k|
//! ```
//!
//! The step factor `α` grows by 0.1 after good iterations and is halved
//! (restoring the previous point) after bad ones.

use nalgebra::{DMatrix, DVector};

use super::assembler::{self, IndexOrder, Layout};
use super::{FitEngine, FitOutcome, FitProblem};
use crate::domain::{Engine, SolverOptions};
use crate::error::FitError;
use crate::math::is_finite_vector;
use crate::trace::{FitView, TraceEvent, TraceValues, TracerChain};

const CHIK_CONVERGED: f64 = 1e-3;
const CHIT_CONVERGED: f64 = 1e-4;
const CHIK_OVER_CHIT: f64 = 1e-2;
const CHIK_GROWTH: f64 = 1.05;
const CHI2_MAX: f64 = 1e4;
const ALPHA_MIN: f64 = 0.05;
const ALPHA_STEP: f64 = 0.1;
/// Constraint and parameter stability threshold of the secondary criterion.
const STABLE: f64 = 1e-6;

#[derive(Debug, Clone, Default)]
pub struct OpalFitter {
    options: SolverOptions,
}

impl OpalFitter {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }
}

impl FitEngine for OpalFitter {
    fn kind(&self) -> Engine {
        Engine::Opal
    }

    fn fit(&mut self, problem: &mut FitProblem, tracers: &mut TracerChain) -> FitOutcome {
        let mut layout = assembler::initialize(problem, IndexOrder::MeasuredFirst);
        if layout.nsoft > 0 {
            log::warn!(
                "OPAL engine ignores {} soft constraint(s); use the newton or damped engine",
                layout.nsoft
            );
            layout.nsoft = 0;
        }
        if layout.npar == 0 {
            return FitOutcome::failed(FitError::EmptyProblem, &layout, 0.0, 0);
        }
        if let Err(err) = assembler::check_covariances(problem) {
            return FitOutcome::failed(err, &layout, problem.object_chi2(), 0);
        }

        let nmea = layout.nmea;
        let v = assembler::measured_covariance(problem, &layout)
            .view((0, 0), (nmea, nmea))
            .into_owned();
        let v_inv = if nmea == 0 {
            DMatrix::zeros(0, 0)
        } else {
            match v.clone().try_inverse() {
                Some(inv) => inv,
                None => {
                    return FitOutcome::failed(
                        FitError::SingularSystem {
                            stage: "measurement covariance",
                        },
                        &layout,
                        problem.object_chi2(),
                        0,
                    );
                }
            }
        };

        let mut y = DVector::zeros(nmea);
        for obj in problem.objects() {
            for i in 0..obj.npar() {
                if let Some(g) = obj.global_par_num(i).filter(|&g| g < nmea) {
                    y[g] = obj.measured_param(i);
                }
            }
        }

        OpalSession {
            problem,
            tracers,
            options: &self.options,
            layout,
            v,
            v_inv,
            y,
            chi2: 0.0,
            iteration: 0,
            alpha: 1.0,
            error_code: 0,
        }
        .run()
    }
}

struct OpalSession<'a> {
    problem: &'a mut FitProblem,
    tracers: &'a mut TracerChain,
    options: &'a SolverOptions,
    layout: Layout,
    v: DMatrix<f64>,
    v_inv: DMatrix<f64>,
    y: DVector<f64>,
    chi2: f64,
    iteration: usize,
    alpha: f64,
    error_code: i32,
}

impl OpalSession<'_> {
    fn notify(&mut self, event: TraceEvent) {
        if self.tracers.is_empty() {
            return;
        }
        let view = FitView {
            engine: Engine::Opal,
            iteration: self.iteration,
            chi2: self.chi2,
            problem: &*self.problem,
            values: TraceValues {
                alpha: self.alpha,
                ..TraceValues::default()
            },
            error_code: self.error_code,
        };
        self.tracers.notify(event, &view);
    }

    /// Pushes `etaxi` into the objects; false if it holds non-finite values.
    fn update(&mut self, etaxi: &mut DVector<f64>) -> bool {
        if !is_finite_vector(etaxi) {
            return false;
        }
        assembler::update_params(self.problem, etaxi);
        true
    }

    fn run(mut self) -> FitOutcome {
        let Layout { npar, nmea, nunm, ncon, .. } = self.layout;
        let mut etaxi = DVector::zeros(npar);
        assembler::fill_x(self.problem, &mut etaxi);

        if ncon == 0 {
            etaxi.rows_mut(0, nmea).copy_from(&self.y);
            self.update(&mut etaxi);
            self.notify(TraceEvent::Initialize);
            self.notify(TraceEvent::Step);
            let mut cov = DMatrix::zeros(npar, npar);
            cov.view_mut((0, 0), (nmea, nmea)).copy_from(&self.v);
            assembler::write_fitted_covariance(self.problem, &cov);
            let outcome = FitOutcome::new(0.0, &self.layout, 0, None, Some(cov));
            self.notify(TraceEvent::Finish);
            return outcome;
        }

        self.update(&mut etaxi);
        self.notify(TraceEvent::Initialize);

        let mut fjac = assembler::constraint_jacobian(self.problem, &self.layout);
        let mut etasv = etaxi.clone();
        let (mut chik, mut chit) = (0.0, 0.0);
        let (mut chik0, mut chit0) = (0.0, 0.0);
        let mut restore = false;

        let error = loop {
            if restore {
                etaxi.copy_from(&etasv);
                if !self.update(&mut etaxi) {
                    break Some(FitError::NonFinite {
                        what: "restored parameters",
                    });
                }
                fjac = assembler::constraint_jacobian(self.problem, &self.layout);
            } else {
                etasv.copy_from(&etaxi);
                chik0 = chik;
                chit0 = chit;
            }

            let f = assembler::constraint_values(self.problem);
            let feta = fjac.columns(0, nmea).into_owned();
            let fxi = fjac.columns(nmea, nunm).into_owned();
            let eta = etaxi.rows(0, nmea).into_owned();

            let r = &f + &feta * (&self.y - &eta);
            let mut s = &feta * &self.v * feta.transpose();
            if nunm > 0 {
                s += &fxi * fxi.transpose();
            }
            let Some(s_inv) = s.try_inverse() else {
                break Some(FitError::SingularSystem { stage: "constraint matrix S" });
            };
            let mut lambda = &s_inv * &r;

            if nunm > 0 {
                let s_inv_fxi = &s_inv * &fxi;
                let w1 = fxi.transpose() * &s_inv_fxi;
                let rhs = -(fxi.transpose() * &lambda) * self.alpha;
                let Some(chol) = w1.cholesky() else {
                    break Some(FitError::SingularSystem {
                        stage: "unmeasured block",
                    });
                };
                let dxi = chol.solve(&rhs);
                let mut xi = etaxi.rows_mut(nmea, nunm);
                xi += &dxi;
                lambda += &s_inv_fxi * &dxi;
            }

            let eta_new = &self.y - &self.v * (feta.transpose() * &lambda);
            etaxi.rows_mut(0, nmea).copy_from(&eta_new);
            let updated = self.update(&mut etaxi);
            fjac = assembler::constraint_jacobian(self.problem, &self.layout);

            let resid = &self.y - etaxi.rows(0, nmea);
            chit = resid.dot(&(&self.v_inv * &resid));
            let f_new = assembler::constraint_values(self.problem);
            chik = lambda
                .iter()
                .zip(f_new.iter())
                .map(|(l, c)| (2.0 * l * c).abs())
                .sum();
            self.chi2 = chit + chik;
            self.iteration += 1;

            let stable = f.iter().all(|c| c.abs() < STABLE)
                && etaxi.iter().zip(etasv.iter()).all(|(a, b)| (a - b).abs() < STABLE);
            let converged = stable
                || ((chik - chik0).abs() < CHIK_CONVERGED
                    && (chit - chit0).abs() < CHIT_CONVERGED * chit
                    && chik < CHIK_OVER_CHIT * chit);
            let bad = chik > CHIK_GROWTH * chik0 && chik > CHIK_OVER_CHIT * chit && chik > chik0 + 1e-10;

            log::debug!(
                "opal iter {}: chi2={:.6e} (chit={:.6e} chik={:.3e}) alpha={:.2}",
                self.iteration,
                self.chi2,
                chit,
                chik,
                self.alpha
            );
            self.notify(TraceEvent::Step);

            restore = false;
            if self.iteration > self.options.max_iterations {
                break Some(FitError::OutOfIterations {
                    iterations: self.iteration,
                });
            } else if converged && updated {
                break None;
            } else if self.iteration > 2 && self.chi2 > CHI2_MAX && updated {
                break Some(FitError::ChiSquareDiverged { chi2: self.chi2 });
            } else if (bad && self.iteration > 1) || !updated {
                if self.alpha > ALPHA_MIN {
                    self.alpha = ALPHA_MIN.max(0.5 * self.alpha);
                    restore = true;
                }
            } else {
                self.alpha = (self.alpha + ALPHA_STEP).min(1.0);
            }
        };

        self.error_code = error.as_ref().map_or(0, FitError::code);
        let covariance = match error {
            Some(_) => None,
            None => {
                let cov = self.covariance(&fjac);
                if let Some(cov) = &cov {
                    assembler::write_fitted_covariance(self.problem, cov);
                } else {
                    log::warn!("OPAL error propagation failed");
                }
                cov
            }
        };
        let outcome = FitOutcome::new(self.chi2, &self.layout, self.iteration, error, covariance);
        self.notify(TraceEvent::Finish);
        outcome
    }

    /// Closed-form covariance of `(η, ξ)` at the solution.
    fn covariance(&self, fjac: &DMatrix<f64>) -> Option<DMatrix<f64>> {
        let Layout { npar, nmea, nunm, .. } = self.layout;
        let v = &self.v;
        let feta = fjac.columns(0, nmea).into_owned();
        let fxi = fjac.columns(nmea, nunm).into_owned();

        let mut s = &feta * v * feta.transpose();
        if nunm > 0 {
            s += &fxi * fxi.transpose();
        }
        let s_inv = s.try_inverse()?;

        let mut g = feta.transpose() * &s_inv * &feta;
        let mut minv_xieta = DMatrix::zeros(nunm, nmea);
        if nunm > 0 {
            let s_inv_fxi = &s_inv * &fxi;
            let h = feta.transpose() * &s_inv_fxi;
            let u = (fxi.transpose() * &s_inv_fxi).try_inverse()?;
            let hu = &h * &u;
            minv_xieta = -(v * &hu).transpose();
            g -= &hu * h.transpose();
        }

        let identity = DMatrix::<f64>::identity(nmea, nmea);
        let minv_etaeta = v * (identity - &g * v);
        let detadt = &minv_etaeta * &self.v_inv;
        let v_detadt = v * detadt.transpose();

        let mut cov = DMatrix::zeros(npar, npar);
        cov.view_mut((0, 0), (nmea, nmea)).copy_from(&(&detadt * &v_detadt));
        if nunm > 0 {
            let dxidt = &minv_xieta * &self.v_inv;
            let v_dxidt = v * dxidt.transpose();
            cov.view_mut((nmea, 0), (nunm, nmea)).copy_from(&(&dxidt * &v_detadt));
            cov.view_mut((0, nmea), (nmea, nunm)).copy_from(&(&detadt * &v_dxidt));
            cov.view_mut((nmea, nmea), (nunm, nunm)).copy_from(&(&dxidt * &v_dxidt));
        }
        cov.iter().all(|x| x.is_finite()).then_some(cov)
    }
}
