//! Charged track in helix variables with a mass hypothesis.
//!
//! ```text
//! px = cosφ / κ,  py = sinφ / κ,  pz = tanλ / κ,  κ = 1 / pT
//! ```

use std::f64::consts::PI;

use super::{Kinematics, Parameterization, wrap_angle};
use crate::domain::FourVector;

const KAPPA: usize = 0;
const PHI: usize = 1;
const TANL: usize = 2;

/// Curvatures closer to zero than this are clamped (pT ≤ 1e6).
const KAPPA_MIN: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Track {
    pub mass: f64,
}

impl Track {
    pub fn new(mass: f64) -> Self {
        Self { mass: mass.abs() }
    }
}

impl Parameterization for Track {
    fn npar(&self) -> usize {
        3
    }

    fn param_name(&self, i: usize) -> &'static str {
        ["kappa", "phi", "tanlambda"]
            .get(i)
            .copied()
            .unwrap_or("undefined")
    }

    fn label(&self) -> &'static str {
        "track"
    }

    fn normalize(&self, par: &mut [f64]) {
        if par[KAPPA] < 0.0 {
            par[KAPPA] = -par[KAPPA];
            par[PHI] += PI;
            par[TANL] = -par[TANL];
        }
        if par[KAPPA] < KAPPA_MIN {
            par[KAPPA] = KAPPA_MIN;
        }
        par[PHI] = wrap_angle(par[PHI]);
    }

    fn evaluate(&self, par: &[f64]) -> Kinematics {
        let kappa = par[KAPPA];
        let (sp, cp) = par[PHI].sin_cos();
        let t = par[TANL];
        let k1 = 1.0 / kappa;
        let k2 = k1 * k1;
        let k3 = k2 * k1;

        let a = 1.0 + t * t;
        let e = (a * k2 + self.mass * self.mass).sqrt();
        let mut k = Kinematics {
            p: FourVector::new(e, cp * k1, sp * k1, t * k1),
            ..Kinematics::default()
        };

        k.d1[1][KAPPA] = -cp * k2;
        k.d1[1][PHI] = -sp * k1;
        k.d1[2][KAPPA] = -sp * k2;
        k.d1[2][PHI] = cp * k1;
        k.d1[3][KAPPA] = -t * k2;
        k.d1[3][TANL] = k1;

        k.set_d2(1, KAPPA, KAPPA, 2.0 * cp * k3);
        k.set_d2(1, KAPPA, PHI, sp * k2);
        k.set_d2(1, PHI, PHI, -cp * k1);
        k.set_d2(2, KAPPA, KAPPA, 2.0 * sp * k3);
        k.set_d2(2, KAPPA, PHI, -cp * k2);
        k.set_d2(2, PHI, PHI, -sp * k1);
        k.set_d2(3, KAPPA, KAPPA, 2.0 * t * k3);
        k.set_d2(3, KAPPA, TANL, -k2);

        let de_dk = -a * k3 / e;
        let de_dt = t * k2 / e;
        k.d1[0][KAPPA] = de_dk;
        k.d1[0][TANL] = de_dt;
        k.set_d2(0, KAPPA, KAPPA, (3.0 * a * k2 * k2 - de_dk * de_dk) / e);
        k.set_d2(0, TANL, TANL, (k2 - de_dt * de_dt) / e);
        k.set_d2(0, KAPPA, TANL, (-2.0 * t * k3 - de_dk * de_dt) / e);
        k
    }
}
