//! Particle parameterizations.
//!
//! A parameterization is a small coordinate transform: it maps the local fit
//! parameters of one particle to its four-momentum and supplies the first and
//! second derivatives of (E, px, py, pz) with respect to those parameters.
//!
//! - `Jet`: (E, θ, φ) with a fixed mass; also used for neutrinos
//! - `PxPyPzE`: the four components directly
//! - `PxPyPzM`: three momentum components with a fixed mass
//! - `IsrPhoton`: transverse components plus a stretched longitudinal variable
//! - `Track`: (κ = 1/pT, φ, tanλ) with a fixed mass

pub mod isr;
pub mod jet;
pub mod momentum;
pub mod track;

use enum_dispatch::enum_dispatch;

use crate::domain::{FourVector, MAX_PAR, N_META};

pub use isr::IsrPhoton;
pub use jet::Jet;
pub use momentum::{PxPyPzE, PxPyPzM};
pub use track::Track;

/// Four-momentum of one particle together with its derivatives with respect
/// to the local parameters.
#[derive(Debug, Clone)]
pub struct Kinematics {
    pub p: FourVector,
    /// `d1[meta][i] = ∂P_meta/∂a_i`
    pub d1: [[f64; MAX_PAR]; N_META],
    /// `d2[meta][i][j] = ∂²P_meta/∂a_i∂a_j`
    pub d2: [[[f64; MAX_PAR]; MAX_PAR]; N_META],
}

impl Default for Kinematics {
    fn default() -> Self {
        Self {
            p: FourVector::ZERO,
            d1: [[0.0; MAX_PAR]; N_META],
            d2: [[[0.0; MAX_PAR]; MAX_PAR]; N_META],
        }
    }
}

impl Kinematics {
    /// Sets a symmetric second derivative.
    pub(crate) fn set_d2(&mut self, meta: usize, i: usize, j: usize, value: f64) {
        self.d2[meta][i][j] = value;
        self.d2[meta][j][i] = value;
    }
}

#[enum_dispatch]
pub trait Parameterization {
    fn npar(&self) -> usize;

    fn param_name(&self, i: usize) -> &'static str;

    /// Short label used in reports.
    fn label(&self) -> &'static str;

    /// Four-momentum and derivatives at `par` (already normalized).
    fn evaluate(&self, par: &[f64]) -> Kinematics;

    /// Brings `par` back into the canonical domain (reflections, wrapping,
    /// clamping). The four-momentum must not change except where a clamp applies.
    fn normalize(&self, _par: &mut [f64]) {}
}

#[enum_dispatch(Parameterization)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParticleKind {
    Jet(Jet),
    PxPyPzE(PxPyPzE),
    PxPyPzM(PxPyPzM),
    IsrPhoton(IsrPhoton),
    Track(Track),
}

/// Wraps an angle into `[-π, π]`.
pub(crate) fn wrap_angle(phi: f64) -> f64 {
    use std::f64::consts::PI;
    if (-PI..=PI).contains(&phi) {
        return phi;
    }
    (phi + PI).rem_euclid(2.0 * PI) - PI
}
