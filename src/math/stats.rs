//! Distribution helpers.
//!
//! - `chi2_probability`: upper tail of the χ² distribution, the fit probability
//! - `normal_quantile` / `ln_normal_pdf`: standard normal pieces used by the
//!   Breit-Wigner penalty

use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};

/// `P(χ²_dof ≥ chi2)`, or -1 when `dof ≤ 0` or `chi2` is negative or not finite.
pub fn chi2_probability(chi2: f64, dof: i32) -> f64 {
    if dof <= 0 || !(chi2 >= 0.0) || !chi2.is_finite() {
        return -1.0;
    }
    match ChiSquared::new(f64::from(dof)) {
        Ok(dist) => dist.sf(chi2),
        Err(_) => -1.0,
    }
}

/// Standard normal quantile `Φ⁻¹(p)`. `p` is clamped to `[0, 1]`.
pub fn normal_quantile(p: f64) -> f64 {
    if p.is_nan() {
        return f64::NAN;
    }
    match Normal::new(0.0, 1.0) {
        Ok(normal) => normal.inverse_cdf(p.clamp(0.0, 1.0)),
        Err(_) => f64::NAN,
    }
}

/// `ln φ(z)` for the standard normal density.
pub fn ln_normal_pdf(z: f64) -> f64 {
    -0.5 * z * z - 0.5 * (2.0 * std::f64::consts::PI).ln()
}
