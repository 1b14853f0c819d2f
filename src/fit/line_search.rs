//! Bisection line search on a merit function.
//!
//! The search brackets the step length in `[α_L, α_R]`, starting from
//! `[0, 1]`. A trial that fails sufficient decrease moves `α_R`; a trial that
//! passes either ends the search or, for the Wolfe and Goldstein rules when
//! the step looks too short, moves `α_L`.
//!
//! ```text
//! sufficient decrease:  φ(α) < φ(0) + η α φ'(0)
//! Wolfe curvature:      φ'(α) ≥ ζ φ'(0)
//! Goldstein lower:      φ(α) ≥ φ(0) + ζ α φ'(0)
//! ```

use crate::domain::LineSearchMode;

/// Step length used when the direction is not a descent direction.
pub const NON_DESCENT_ALPHA: f64 = 0.001;

const MAX_HALVINGS: usize = 30;
const MIN_HALVINGS_WITH_BRACKET: usize = 6;

#[derive(Debug, Clone, Copy)]
pub struct LineSearchContext {
    pub phi0: f64,
    pub dphi0: f64,
    /// Sufficient-decrease factor.
    pub eta: f64,
    /// Curvature / Goldstein factor.
    pub zeta: f64,
}

/// Merit value at a trial step; `dphi` only when requested.
#[derive(Debug, Clone, Copy)]
pub struct Trial {
    pub phi: f64,
    pub dphi: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSearchResult {
    pub accepted: bool,
    pub alpha: f64,
    pub trials: usize,
}

/// Runs the search. `eval(α, need_derivative)` must move the parameters to
/// `x + α p` and report the merit there.
pub fn bisection_search(
    mode: LineSearchMode,
    ctx: &LineSearchContext,
    eval: &mut dyn FnMut(f64, bool) -> Trial,
) -> LineSearchResult {
    if mode == LineSearchMode::None {
        return LineSearchResult {
            accepted: false,
            alpha: 1.0,
            trials: 0,
        };
    }
    if !(ctx.dphi0 < 0.0) {
        eval(NON_DESCENT_ALPHA, false);
        return LineSearchResult {
            accepted: false,
            alpha: NON_DESCENT_ALPHA,
            trials: 1,
        };
    }

    let mut alpha_l = 0.0;
    let mut alpha_r = 1.0;
    let mut alpha;
    let mut trials = 0;
    let mut accepted = false;
    loop {
        trials += 1;
        alpha = 0.5 * (alpha_l + alpha_r);
        let trial = eval(alpha, mode == LineSearchMode::Wolfe);
        let decrease = trial.phi < ctx.phi0 + ctx.eta * alpha * ctx.dphi0;
        log::trace!("line search trial {trials}: alpha={alpha:.4e} phi={:.6e}", trial.phi);

        if !decrease {
            alpha_r = alpha;
        } else {
            let too_short = match mode {
                LineSearchMode::Wolfe => trial
                    .dphi
                    .is_some_and(|dphi| dphi < ctx.zeta * ctx.dphi0),
                LineSearchMode::Goldstein => trial.phi < ctx.phi0 + ctx.zeta * alpha * ctx.dphi0,
                LineSearchMode::Armijo | LineSearchMode::None => false,
            };
            if too_short {
                alpha_l = alpha;
            } else {
                accepted = true;
                break;
            }
        }

        let keep_going =
            trials < MAX_HALVINGS && (alpha_l == 0.0 || trials < MIN_HALVINGS_WITH_BRACKET);
        if !keep_going {
            break;
        }
    }

    if !accepted && alpha_l > 0.0 {
        alpha = alpha_l;
        accepted = true;
    }
    LineSearchResult {
        accepted,
        alpha,
        trials,
    }
}
