//! Constrained fitting.
//!
//! Responsibilities:
//!
//! - hold the objects and constraints of one event (`FitProblem`)
//! - assemble the global system from them (`assembler`)
//! - solve it with one of three engines sharing the `FitEngine` contract
//! - propagate the measurement errors to the fitted parameters
//!
//! `FitDriver` ties these together behind a small stateful API.

pub mod assembler;
pub mod covariance;
pub mod damped;
pub mod driver;
pub mod line_search;
pub mod merit;
pub mod newton;
pub mod opal;
pub mod problem;

use nalgebra::DMatrix;

use crate::domain::{Engine, SolverOptions};
use crate::error::FitError;
use crate::math::chi2_probability;
use crate::trace::TracerChain;

pub use assembler::Layout;
pub use damped::DampedFitter;
pub use driver::FitDriver;
pub use newton::NewtonFitter;
pub use opal::OpalFitter;
pub use problem::FitProblem;

/// Result of one `fit()` call.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    pub chi2: f64,
    pub dof: i32,
    pub iterations: usize,
    /// χ² tail probability; -1 on failure or when `dof ≤ 0`.
    pub probability: f64,
    pub error: Option<FitError>,
    /// Fitted covariance of the free parameters (global order); `None` when
    /// the fit failed or the propagation did.
    pub covariance: Option<DMatrix<f64>>,
}

impl FitOutcome {
    pub(crate) fn new(
        chi2: f64,
        layout: &Layout,
        iterations: usize,
        error: Option<FitError>,
        covariance: Option<DMatrix<f64>>,
    ) -> Self {
        let dof = layout.dof();
        let probability = match error {
            Some(_) => -1.0,
            None => chi2_probability(chi2, dof),
        };
        Self {
            chi2,
            dof,
            iterations,
            probability,
            error,
            covariance,
        }
    }

    pub(crate) fn failed(error: FitError, layout: &Layout, chi2: f64, iterations: usize) -> Self {
        Self::new(chi2, layout, iterations, Some(error), None)
    }

    pub fn converged(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_code(&self) -> i32 {
        self.error.as_ref().map_or(0, FitError::code)
    }
}

/// A solver for the global system of a `FitProblem`.
///
/// Engines leave the objects at their last attempted values, also on failure.
pub trait FitEngine: Send {
    fn kind(&self) -> Engine;

    fn fit(&mut self, problem: &mut FitProblem, tracers: &mut TracerChain) -> FitOutcome;
}

pub fn engine_for(options: &SolverOptions) -> Box<dyn FitEngine> {
    match options.engine {
        Engine::Newton => Box::new(NewtonFitter::new(options.clone())),
        Engine::Damped => Box::new(DampedFitter::new(options.clone())),
        Engine::Opal => Box::new(OpalFitter::new(options.clone())),
    }
}
