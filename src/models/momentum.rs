//! Cartesian parameterizations.

use super::{Kinematics, Parameterization};
use crate::domain::FourVector;

/// Free (px, py, pz, E).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PxPyPzE;

impl Parameterization for PxPyPzE {
    fn npar(&self) -> usize {
        4
    }

    fn param_name(&self, i: usize) -> &'static str {
        ["px", "py", "pz", "E"].get(i).copied().unwrap_or("undefined")
    }

    fn label(&self) -> &'static str {
        "px/py/pz/E"
    }

    fn evaluate(&self, par: &[f64]) -> Kinematics {
        let mut k = Kinematics {
            p: FourVector::new(par[3], par[0], par[1], par[2]),
            ..Kinematics::default()
        };
        k.d1[0][3] = 1.0;
        k.d1[1][0] = 1.0;
        k.d1[2][1] = 1.0;
        k.d1[3][2] = 1.0;
        k
    }
}

/// (px, py, pz) with the energy fixed by the mass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PxPyPzM {
    pub mass: f64,
}

impl PxPyPzM {
    pub fn new(mass: f64) -> Self {
        Self { mass: mass.abs() }
    }
}

impl Parameterization for PxPyPzM {
    fn npar(&self) -> usize {
        3
    }

    fn param_name(&self, i: usize) -> &'static str {
        ["px", "py", "pz"].get(i).copied().unwrap_or("undefined")
    }

    fn label(&self) -> &'static str {
        "px/py/pz/m"
    }

    fn evaluate(&self, par: &[f64]) -> Kinematics {
        let q = [par[0], par[1], par[2]];
        let e = (q.iter().map(|v| v * v).sum::<f64>() + self.mass * self.mass).sqrt();
        let mut k = Kinematics {
            p: FourVector::new(e, q[0], q[1], q[2]),
            ..Kinematics::default()
        };
        for i in 0..3 {
            k.d1[i + 1][i] = 1.0;
        }
        if e > 0.0 {
            let e3 = e * e * e;
            for i in 0..3 {
                k.d1[0][i] = q[i] / e;
                for j in i..3 {
                    let delta = if i == j { 1.0 / e } else { 0.0 };
                    k.set_d2(0, i, j, delta - q[i] * q[j] / e3);
                }
            }
        }
        k
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParticleKind;
    use crate::models::testing::assert_derivatives_match;

    #[test]
    fn four_component_parameterization_is_identity() {
        let k = PxPyPzE.evaluate(&[1.0, 2.0, 3.0, 10.0]);
        assert_eq!(k.p, FourVector::new(10.0, 1.0, 2.0, 3.0));
        assert_derivatives_match(&ParticleKind::from(PxPyPzE), &[1.0, 2.0, 3.0, 10.0], 1e-6);
    }

    #[test]
    fn massive_momentum_keeps_mass_fixed() {
        let k = PxPyPzM::new(0.13957).evaluate(&[0.4, -1.2, 3.3]);
        assert!((k.p.mass() - 0.13957).abs() < 1e-9);
    }

    #[test]
    fn massive_momentum_derivatives_match_finite_differences() {
        let kind = ParticleKind::from(PxPyPzM::new(1.5));
        assert_derivatives_match(&kind, &[0.4, -1.2, 3.3], 1e-5);
    }
}
