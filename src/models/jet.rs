//! Jet (and neutrino) parameterization: energy and direction with a fixed mass.
//!
//! ```text
//! p  = sqrt(E² - m²)
//! px = p sinθ cosφ,  py = p sinθ sinφ,  pz = p cosθ
//! ```

use std::f64::consts::PI;

use super::{Kinematics, Parameterization, wrap_angle};
use crate::domain::FourVector;

const E: usize = 0;
const THETA: usize = 1;
const PHI: usize = 2;

/// Energies are kept just above the mass so that `p > 0`.
const MASS_MARGIN: f64 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jet {
    pub mass: f64,
}

impl Jet {
    pub fn new(mass: f64) -> Self {
        Self { mass: mass.abs() }
    }

    pub fn massless() -> Self {
        Self { mass: 0.0 }
    }

    fn min_energy(&self) -> f64 {
        self.mass * (1.0 + MASS_MARGIN)
    }
}

impl Parameterization for Jet {
    fn npar(&self) -> usize {
        3
    }

    fn param_name(&self, i: usize) -> &'static str {
        match i {
            E => "E",
            THETA => "theta",
            PHI => "phi",
            _ => "undefined",
        }
    }

    fn label(&self) -> &'static str {
        if self.mass > 0.0 { "jet" } else { "massless jet" }
    }

    fn normalize(&self, par: &mut [f64]) {
        let (mut e, mut theta, mut phi) = (par[E], par[THETA], par[PHI]);
        if e < 0.0 {
            e = -e;
            theta = PI - theta;
            phi += PI;
        }
        theta = wrap_angle(theta);
        if theta < 0.0 {
            theta = -theta;
            phi += PI;
        }
        if e < self.min_energy() {
            e = self.min_energy();
        }
        par[E] = e;
        par[THETA] = theta;
        par[PHI] = wrap_angle(phi);
    }

    fn evaluate(&self, par: &[f64]) -> Kinematics {
        let e = par[E];
        let (st, ct) = par[THETA].sin_cos();
        let (sp, cp) = par[PHI].sin_cos();
        let m2 = self.mass * self.mass;

        // p and its derivatives with respect to E.
        let (p, dp, d2p) = if self.mass == 0.0 {
            (e, 1.0, 0.0)
        } else {
            let p = (e * e - m2).max(0.0).sqrt();
            if p > 0.0 {
                (p, e / p, -m2 / (p * p * p))
            } else {
                (0.0, 0.0, 0.0)
            }
        };

        let mut k = Kinematics {
            p: FourVector::new(e, p * st * cp, p * st * sp, p * ct),
            ..Kinematics::default()
        };

        k.d1[0][E] = 1.0;

        k.d1[1][E] = dp * st * cp;
        k.d1[1][THETA] = p * ct * cp;
        k.d1[1][PHI] = -p * st * sp;

        k.d1[2][E] = dp * st * sp;
        k.d1[2][THETA] = p * ct * sp;
        k.d1[2][PHI] = p * st * cp;

        k.d1[3][E] = dp * ct;
        k.d1[3][THETA] = -p * st;

        k.set_d2(1, E, E, d2p * st * cp);
        k.set_d2(1, E, THETA, dp * ct * cp);
        k.set_d2(1, E, PHI, -dp * st * sp);
        k.set_d2(1, THETA, THETA, -p * st * cp);
        k.set_d2(1, THETA, PHI, -p * ct * sp);
        k.set_d2(1, PHI, PHI, -p * st * cp);

        k.set_d2(2, E, E, d2p * st * sp);
        k.set_d2(2, E, THETA, dp * ct * sp);
        k.set_d2(2, E, PHI, dp * st * cp);
        k.set_d2(2, THETA, THETA, -p * st * sp);
        k.set_d2(2, THETA, PHI, p * ct * cp);
        k.set_d2(2, PHI, PHI, -p * st * sp);

        k.set_d2(3, E, E, d2p * ct);
        k.set_d2(3, E, THETA, -dp * st);
        k.set_d2(3, THETA, THETA, -p * ct);

        k
    }
}
