//! Shared configuration and report types.
//!
//! These are kept serializable so they can be:
//!
//! - read from a JSON event file (`EventSpec`, `SolverOptions`)
//! - mapped from CLI flags (the `ValueEnum` enums)
//! - exported after a fit (`FitSummary`)

use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::four_vector::FourVector;

/// Which solver runs `FitDriver::fit()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// Lagrange-Newton with merit-function line search.
    #[default]
    Newton,
    /// Newton on the gradient norm with backtracking on the step scale.
    Damped,
    /// Direct elimination of the multipliers (OPAL-style).
    Opal,
}

impl Engine {
    pub fn display_name(self) -> &'static str {
        match self {
            Engine::Newton => "Newton (line search)",
            Engine::Damped => "Newton (damped)",
            Engine::Opal => "OPAL",
        }
    }
}

/// Acceptance rule of the bisection line search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LineSearchMode {
    /// Always take the full Newton step.
    None,
    /// Sufficient decrease only.
    Armijo,
    /// Sufficient decrease plus the curvature condition.
    Wolfe,
    /// Sufficient decrease bounded from below.
    #[default]
    Goldstein,
}

/// How the penalty weight `μ` of the ℓ1 merit function is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MeritMode {
    /// `φ = χ² + μ Σ|c|` with `μ` from the predicted decrease.
    #[default]
    L1,
    /// `φ = χ² + μ Σ|c|/σ_c` with `μ = max |λ σ_c|`.
    L1Scaled,
}

/// Iteration tracer attached by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TracerKind {
    #[default]
    None,
    Text,
}

/// Solver knobs. Defaults reproduce the reference behavior of each engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub engine: Engine,
    /// Iterations allowed before `OutOfIterations`.
    pub max_iterations: usize,
    /// `|Δχ²|` below which the fit may stop.
    pub chi2_tolerance: f64,
    /// Largest accepted parameter step, in units of the parameter error,
    /// below which the fit may stop.
    pub step_tolerance: f64,
    /// χ² above this is treated as divergence.
    pub chi2_ceiling: f64,
    pub line_search: LineSearchMode,
    pub merit: MeritMode,
    pub second_order_correction: bool,
    /// LU solutions with `|det|` below this fall back to SVD.
    pub lu_min_determinant: f64,
    /// Relative singular value cutoff of the SVD fallback.
    pub svd_cutoff: f64,
    /// Consecutive steps without a significant parameter change before
    /// `NotStabilized` is reported.
    pub stall_limit: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            engine: Engine::Newton,
            max_iterations: 200,
            chi2_tolerance: 1e-4,
            step_tolerance: 1e-3,
            chi2_ceiling: 1e10,
            line_search: LineSearchMode::Goldstein,
            merit: MeritMode::L1,
            second_order_correction: true,
            lu_min_determinant: 1e-12,
            svd_cutoff: 1e-3,
            stall_limit: 10,
        }
    }
}

/// One particle in a JSON event file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ObjectSpec {
    /// Jet in (E, θ, φ) with uncorrelated errors.
    Jet {
        name: String,
        e: f64,
        theta: f64,
        phi: f64,
        errors: [f64; 3],
        #[serde(default)]
        mass: f64,
    },
    /// Fully unmeasured massless particle.
    Neutrino {
        name: String,
        e: f64,
        theta: f64,
        phi: f64,
    },
    /// Four-vector with a covariance over (px, py, pz, E).
    FourMomentum {
        name: String,
        p: FourVector,
        covariance: Vec<Vec<f64>>,
    },
    /// Three-momentum with a fixed mass; covariance over (px, py, pz).
    MassiveMomentum {
        name: String,
        px: f64,
        py: f64,
        pz: f64,
        mass: f64,
        covariance: Vec<Vec<f64>>,
    },
    IsrPhoton {
        name: String,
        #[serde(default)]
        px: f64,
        #[serde(default)]
        py: f64,
        pz: f64,
        b: f64,
        pz_max: f64,
    },
    /// Track in (κ, φ, tanλ); covariance over the same.
    Track {
        name: String,
        kappa: f64,
        phi: f64,
        tan_lambda: f64,
        mass: f64,
        covariance: Vec<Vec<f64>>,
    },
}

impl ObjectSpec {
    pub fn name(&self) -> &str {
        match self {
            ObjectSpec::Jet { name, .. }
            | ObjectSpec::Neutrino { name, .. }
            | ObjectSpec::FourMomentum { name, .. }
            | ObjectSpec::MassiveMomentum { name, .. }
            | ObjectSpec::IsrPhoton { name, .. }
            | ObjectSpec::Track { name, .. } => name,
        }
    }
}

/// Coefficients of a linear momentum combination `fE·E + fx·px + fy·py + fz·pz`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MomentumFactors {
    #[serde(default)]
    pub e: f64,
    #[serde(default)]
    pub px: f64,
    #[serde(default)]
    pub py: f64,
    #[serde(default)]
    pub pz: f64,
}

/// One constraint in a JSON event file. `objects` are indices into the
/// event's object list; `sides` (when present) assigns each member to side 1
/// or 2 of a mass difference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ConstraintSpec {
    Momentum {
        name: String,
        factors: MomentumFactors,
        #[serde(default)]
        value: f64,
        objects: Vec<usize>,
    },
    /// Shorthand for the four momentum constraints `ΣP = beam`.
    Beam { objects: Vec<usize> },
    Mass {
        name: String,
        #[serde(default)]
        mass: f64,
        objects: Vec<usize>,
        #[serde(default)]
        sides: Vec<u8>,
    },
    RecoilMass {
        name: String,
        mass: f64,
        objects: Vec<usize>,
    },
    SoftGaussMass {
        name: String,
        mass: f64,
        sigma: f64,
        objects: Vec<usize>,
        #[serde(default)]
        sides: Vec<u8>,
    },
    SoftBwMass {
        name: String,
        mass: f64,
        gamma: f64,
        objects: Vec<usize>,
        #[serde(default)]
        sides: Vec<u8>,
    },
    SoftGaussMomentum {
        name: String,
        factors: MomentumFactors,
        #[serde(default)]
        value: f64,
        sigma: f64,
        objects: Vec<usize>,
    },
}

/// A complete event: particles, constraints, and optional beam and options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub objects: Vec<ObjectSpec>,
    pub constraints: Vec<ConstraintSpec>,
    #[serde(default)]
    pub beam: Option<FourVector>,
    #[serde(default)]
    pub options: Option<SolverOptions>,
}

/// Fitted state of one object, as reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub name: String,
    pub kind: String,
    pub parameter_names: Vec<String>,
    pub measured: Vec<f64>,
    pub fitted: Vec<f64>,
    /// Fitted errors (measurement errors when no fitted covariance exists).
    pub errors: Vec<f64>,
    pub four_momentum: FourVector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintSummary {
    pub name: String,
    pub soft: bool,
    pub value: f64,
    /// Penalty contribution for soft constraints, 0 for hard ones.
    pub chi2: f64,
}

/// Everything a fit reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitSummary {
    pub event: Option<String>,
    pub engine: Engine,
    pub probability: f64,
    pub chi2: f64,
    pub dof: i32,
    pub iterations: usize,
    pub error_code: i32,
    pub error: Option<String>,
    pub covariance_valid: bool,
    pub objects: Vec<ObjectSummary>,
    pub constraints: Vec<ConstraintSummary>,
}

impl FitSummary {
    pub fn converged(&self) -> bool {
        self.error_code == 0
    }
}

/// A full run's configuration as understood by the pipeline.
///
/// This is derived from CLI flags (plus the options stored in the event file).
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input: PathBuf,
    /// Overrides applied on top of the event's own options.
    pub overrides: OptionOverrides,
    pub tracer: TracerKind,
    /// Add an unmeasured massless photon to every momentum/recoil constraint.
    pub unmeasured_photon: bool,
    pub export_json: Option<PathBuf>,
}

/// Solver settings given explicitly on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionOverrides {
    pub engine: Option<Engine>,
    pub line_search: Option<LineSearchMode>,
    pub merit: Option<MeritMode>,
    pub max_iterations: Option<usize>,
    pub no_second_order_correction: bool,
}

impl OptionOverrides {
    pub fn apply(&self, base: &SolverOptions) -> SolverOptions {
        let mut out = base.clone();
        if let Some(engine) = self.engine {
            out.engine = engine;
        }
        if let Some(mode) = self.line_search {
            out.line_search = mode;
        }
        if let Some(merit) = self.merit {
            out.merit = merit;
        }
        if let Some(n) = self.max_iterations {
            out.max_iterations = n;
        }
        if self.no_second_order_correction {
            out.second_order_correction = false;
        }
        out
    }
}
