//! ℓ1 merit function of the line search.
//!
//! ```text
//! L1:        φ = χ² + μ Σ|c_k|           φ' = gᵀp - μ Σ|c_k|
//! L1Scaled:  φ = χ² + μ Σ|c_k| / σ_k     φ' = gᵀp - μ Σ|c_k| / σ_k
//! ```
//!
//! `μ` follows Nocedal & Wright: large enough that the Newton step is a
//! descent direction of `φ`.

use nalgebra::DVector;

use crate::domain::MeritMode;

const RHO: f64 = 0.1;
const WELL_SATISFIED: f64 = 0.001;

/// Constraint state at one point.
#[derive(Debug, Clone, Copy)]
pub struct ConstraintState<'a> {
    /// Constraint values.
    pub values: &'a DVector<f64>,
    /// `1/σ_k` of each constraint (1 when the error is zero).
    pub inverse_errors: &'a DVector<f64>,
}

impl ConstraintState<'_> {
    fn norm1(&self) -> f64 {
        self.values.iter().map(|c| c.abs()).sum()
    }

    fn norm1_scaled(&self) -> f64 {
        self.values
            .iter()
            .zip(self.inverse_errors.iter())
            .map(|(c, e)| (c * e).abs())
            .sum()
    }

    fn weighted_norm(&self, mode: MeritMode) -> f64 {
        match mode {
            MeritMode::L1 => self.norm1(),
            MeritMode::L1Scaled => self.norm1_scaled(),
        }
    }
}

pub fn merit(mode: MeritMode, mu: f64, chi2: f64, cons: &ConstraintState<'_>) -> f64 {
    chi2 + mu * cons.weighted_norm(mode)
}

/// Directional derivative of `merit` along `p`; `grad_dot_p = ∇χ²·p`.
pub fn merit_derivative(mode: MeritMode, mu: f64, grad_dot_p: f64, cons: &ConstraintState<'_>) -> f64 {
    grad_dot_p - mu * cons.weighted_norm(mode)
}

/// Inputs of the penalty-weight rule.
#[derive(Debug, Clone, Copy)]
pub struct PenaltyWeightInputs<'a> {
    pub cons: ConstraintState<'a>,
    /// Multipliers after the Newton step.
    pub lambda_new: &'a DVector<f64>,
    /// Multipliers before the step.
    pub lambda: &'a DVector<f64>,
    pub grad_dot_p: f64,
    pub p_l_p: f64,
}

pub fn penalty_weight(mode: MeritMode, inputs: &PenaltyWeightInputs<'_>) -> f64 {
    let ncon = inputs.cons.values.len();
    if ncon == 0 {
        return 0.0;
    }
    match mode {
        MeritMode::L1 => {
            let cnorm1 = inputs.cons.norm1();
            let cnorm1_scaled = inputs.cons.norm1_scaled();
            if cnorm1_scaled < ncon as f64 * WELL_SATISFIED || inputs.grad_dot_p <= 0.0 {
                inputs.lambda_new.amax() / (1.0 - RHO)
            } else {
                let sigma = if inputs.p_l_p > 0.0 { 1.0 } else { 0.0 };
                (inputs.grad_dot_p + 0.5 * sigma * inputs.p_l_p) / ((1.0 - RHO) * cnorm1)
            }
        }
        MeritMode::L1Scaled => inputs
            .lambda
            .iter()
            .zip(inputs.cons.inverse_errors.iter())
            .map(|(l, e)| (l / e).abs())
            .fold(0.0, f64::max),
    }
}
