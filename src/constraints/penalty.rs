//! χ² penalties of soft constraints.
//!
//! Both penalties are monotonic in `|x|` and return the value together with
//! the first and second derivatives:
//!
//! ```text
//! Gauss:        χ² = (x/σ)²
//! Breit-Wigner: χ² = z²,  z = Φ⁻¹(F_Cauchy(x; Γ))
//! ```
//!
//! The Breit-Wigner form maps the Cauchy tail probability onto a standard
//! normal deviate, so `x` at the half width costs the same as 0.674σ.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::math::{ln_normal_pdf, normal_quantile};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Penalty {
    Gauss { sigma: f64 },
    BreitWigner { gamma: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PenaltyValue {
    pub chi2: f64,
    pub d1: f64,
    pub d2: f64,
}

impl Penalty {
    pub fn chi2(&self, x: f64) -> f64 {
        self.evaluate(x).chi2
    }

    pub fn evaluate(&self, x: f64) -> PenaltyValue {
        match *self {
            Penalty::Gauss { sigma } => {
                let w = 1.0 / (sigma * sigma);
                PenaltyValue {
                    chi2: x * x * w,
                    d1: 2.0 * x * w,
                    d2: 2.0 * w,
                }
            }
            Penalty::BreitWigner { gamma } => breit_wigner(x, gamma),
        }
    }
}

fn breit_wigner(x: f64, gamma: f64) -> PenaltyValue {
    let half = 0.5 * gamma;
    let t = x / half;
    let one_t2 = 1.0 + t * t;

    // Tail probability P(X > |x|), accurate far from the peak.
    let tail = (half / x.abs()).atan() / PI;
    let z = if x == 0.0 {
        0.0
    } else {
        -x.signum() * normal_quantile(tail)
    };

    let pdf = 1.0 / (PI * half * one_t2);
    let dz = (pdf.ln() - ln_normal_pdf(z)).exp();
    let d2z = -2.0 * t / (half * one_t2) * dz + z * dz * dz;

    PenaltyValue {
        chi2: z * z,
        d1: 2.0 * z * dz,
        d2: 2.0 * dz * dz + 2.0 * z * d2z,
    }
}
