//! Lorentz four-vectors in the (E, px, py, pz) basis.
//!
//! Every parameterization and constraint talks to the solver through this
//! basis: a constraint differentiates with respect to the four components,
//! a parameterization differentiates the four components with respect to its
//! local parameters, and the chain rule glues the two together.

use std::ops::{Add, AddAssign, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// Number of intermediate variables (E, px, py, pz).
pub const N_META: usize = 4;

/// Index of a four-momentum component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Meta {
    E = 0,
    Px = 1,
    Py = 2,
    Pz = 3,
}

impl Meta {
    pub const ALL: [Meta; N_META] = [Meta::E, Meta::Px, Meta::Py, Meta::Pz];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Diagonal of the Minkowski metric, signature (+, -, -, -).
    pub fn metric(self) -> f64 {
        match self {
            Meta::E => 1.0,
            _ => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FourVector {
    pub e: f64,
    pub px: f64,
    pub py: f64,
    pub pz: f64,
}

impl FourVector {
    pub const ZERO: FourVector = FourVector {
        e: 0.0,
        px: 0.0,
        py: 0.0,
        pz: 0.0,
    };

    pub fn new(e: f64, px: f64, py: f64, pz: f64) -> Self {
        Self { e, px, py, pz }
    }

    /// Components in `Meta` order.
    pub fn to_array(self) -> [f64; N_META] {
        [self.e, self.px, self.py, self.pz]
    }

    pub fn from_array(v: [f64; N_META]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }

    pub fn component(&self, meta: Meta) -> f64 {
        match meta {
            Meta::E => self.e,
            Meta::Px => self.px,
            Meta::Py => self.py,
            Meta::Pz => self.pz,
        }
    }

    /// Metric-lowered components `(E, -px, -py, -pz)`; the gradient of `m²/2`.
    pub fn lowered(self) -> [f64; N_META] {
        [self.e, -self.px, -self.py, -self.pz]
    }

    pub fn p2(&self) -> f64 {
        self.px * self.px + self.py * self.py + self.pz * self.pz
    }

    pub fn p(&self) -> f64 {
        self.p2().sqrt()
    }

    pub fn pt(&self) -> f64 {
        self.px.hypot(self.py)
    }

    pub fn mass2(&self) -> f64 {
        self.e * self.e - self.p2()
    }

    /// Invariant mass; space-like vectors (rounding noise near zero mass) report 0.
    pub fn mass(&self) -> f64 {
        self.mass2().max(0.0).sqrt()
    }

    pub fn theta(&self) -> f64 {
        self.pt().atan2(self.pz)
    }

    pub fn phi(&self) -> f64 {
        self.py.atan2(self.px)
    }

    pub fn is_finite(&self) -> bool {
        self.e.is_finite() && self.px.is_finite() && self.py.is_finite() && self.pz.is_finite()
    }
}

impl Add for FourVector {
    type Output = FourVector;

    fn add(self, rhs: FourVector) -> FourVector {
        FourVector::new(
            self.e + rhs.e,
            self.px + rhs.px,
            self.py + rhs.py,
            self.pz + rhs.pz,
        )
    }
}

impl AddAssign for FourVector {
    fn add_assign(&mut self, rhs: FourVector) {
        *self = *self + rhs;
    }
}

impl Sub for FourVector {
    type Output = FourVector;

    fn sub(self, rhs: FourVector) -> FourVector {
        self + (-rhs)
    }
}

impl Neg for FourVector {
    type Output = FourVector;

    fn neg(self) -> FourVector {
        FourVector::new(-self.e, -self.px, -self.py, -self.pz)
    }
}

impl Mul<f64> for FourVector {
    type Output = FourVector;

    fn mul(self, k: f64) -> FourVector {
        FourVector::new(self.e * k, self.px * k, self.py * k, self.pz * k)
    }
}

impl std::iter::Sum for FourVector {
    fn sum<I: Iterator<Item = FourVector>>(iter: I) -> FourVector {
        iter.fold(FourVector::ZERO, |acc, v| acc + v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mass_of_back_to_back_pair() {
        let a = FourVector::new(50.0, 0.0, 0.0, 50.0);
        let b = FourVector::new(50.0, 0.0, 0.0, -50.0);
        let sum = a + b;
        assert!((sum.mass() - 100.0).abs() < 1e-12);
        assert!(a.mass().abs() < 1e-12);
    }

    #[test]
    fn angles_follow_physics_convention() {
        let v = FourVector::new(10.0, 0.0, 3.0, 0.0);
        assert!((v.theta() - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        assert!((v.phi() - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn lowered_matches_metric() {
        let v = FourVector::new(4.0, 1.0, 2.0, 3.0);
        let lowered = v.lowered();
        for m in Meta::ALL {
            assert_eq!(lowered[m.index()], m.metric() * v.component(m));
        }
    }
}
