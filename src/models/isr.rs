//! Initial-state-radiation photon along the beam axis.
//!
//! The longitudinal momentum is fitted through a stretched variable `pg`
//! whose "measurement" is 0 with unit error:
//!
//! ```text
//! pz = sign(pg) · pz_max · |pg|^(1/b)
//! ```
//!
//! With `b` well below 1 the resulting χ² penalty reproduces the steeply
//! falling photon spectrum. The transverse components are normally fixed at 0.

use super::{Kinematics, Parameterization};
use crate::domain::FourVector;
use crate::error::SetupError;

const PX: usize = 0;
const PY: usize = 1;
const PG: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IsrPhoton {
    /// Spectrum exponent, `0 < b ≤ 1`.
    pub b: f64,
    pub pz_max: f64,
}

impl IsrPhoton {
    pub fn new(b: f64, pz_max: f64) -> Result<Self, SetupError> {
        if !(b > 0.0 && b <= 1.0) {
            return Err(SetupError::InvalidValue {
                what: "ISR spectrum exponent",
                value: b,
            });
        }
        if !(pz_max > 0.0) {
            return Err(SetupError::InvalidValue {
                what: "ISR maximum pz",
                value: pz_max,
            });
        }
        Ok(Self { b, pz_max })
    }

    /// Longitudinal momentum for a given `pg`.
    pub fn pz(&self, pg: f64) -> f64 {
        pg.signum() * self.pz_max * pg.abs().powf(1.0 / self.b)
    }

    /// Inverse of `pz`.
    pub fn pg(&self, pz: f64) -> f64 {
        pz.signum() * (pz.abs() / self.pz_max).powf(self.b)
    }
}

impl Parameterization for IsrPhoton {
    fn npar(&self) -> usize {
        3
    }

    fn param_name(&self, i: usize) -> &'static str {
        ["px", "py", "pg"].get(i).copied().unwrap_or("undefined")
    }

    fn label(&self) -> &'static str {
        "ISR photon"
    }

    fn evaluate(&self, par: &[f64]) -> Kinematics {
        let (px, py, pg) = (par[PX], par[PY], par[PG]);
        let inv_b = 1.0 / self.b;
        let apg = pg.abs();
        let pz = self.pz(pg);
        let dpz = self.pz_max * inv_b * apg.powf(inv_b - 1.0);
        let d2pz = if apg == 0.0 && inv_b < 2.0 {
            0.0
        } else {
            pg.signum() * self.pz_max * inv_b * (inv_b - 1.0) * apg.powf(inv_b - 2.0)
        };

        let e = (px * px + py * py + pz * pz).sqrt();
        let mut k = Kinematics {
            p: FourVector::new(e, px, py, pz),
            ..Kinematics::default()
        };
        k.d1[1][PX] = 1.0;
        k.d1[2][PY] = 1.0;
        k.d1[3][PG] = dpz;
        k.set_d2(3, PG, PG, d2pz);

        if e > 0.0 {
            let e3 = e * e * e;
            k.d1[0][PX] = px / e;
            k.d1[0][PY] = py / e;
            k.d1[0][PG] = pz / e * dpz;
            k.set_d2(0, PX, PX, 1.0 / e - px * px / e3);
            k.set_d2(0, PY, PY, 1.0 / e - py * py / e3);
            k.set_d2(0, PX, PY, -px * py / e3);
            k.set_d2(0, PX, PG, -px * pz / e3 * dpz);
            k.set_d2(0, PY, PG, -py * pz / e3 * dpz);
            k.set_d2(
                0,
                PG,
                PG,
                (1.0 / e - pz * pz / e3) * dpz * dpz + pz / e * d2pz,
            );
        }
        k
    }
}
