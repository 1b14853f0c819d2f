//! Recoil-mass constraint: the system recoiling against the members must
//! have mass `m`.
//!
//! ```text
//! R = beam - ΣP
//! c = M(R) - m
//! ∂c/∂P = -(E_R, -px_R, -py_R, -pz_R) / M(R)
//! ```

use super::mass::invariant_mass_hessian;
use super::{HardConstraint, MetaMatrix, ObjectList, ParticleFunction};
use crate::domain::{FitObject, FourVector, N_META};

#[derive(Debug, Clone, PartialEq)]
pub struct RecoilMassConstraint {
    name: String,
    members: ObjectList,
    mass: f64,
    beam: FourVector,
    global: Option<usize>,
}

impl RecoilMassConstraint {
    pub fn new(name: impl Into<String>, mass: f64, beam: FourVector, members: ObjectList) -> Self {
        Self {
            name: name.into(),
            members,
            mass,
            beam,
            global: None,
        }
    }

    pub fn recoil(&self, objects: &[FitObject]) -> FourVector {
        self.beam - self.members.sum(objects, None)
    }

    pub fn members_mut(&mut self) -> &mut ObjectList {
        &mut self.members
    }
}

impl ParticleFunction for RecoilMassConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn members(&self) -> &ObjectList {
        &self.members
    }

    fn value(&self, objects: &[FitObject]) -> f64 {
        self.recoil(objects).mass() - self.mass
    }

    fn first_derivatives(&self, objects: &[FitObject], _slot: usize) -> [f64; N_META] {
        let r = self.recoil(objects);
        let m = r.mass();
        if !(m > 0.0) {
            return [0.0; N_META];
        }
        r.lowered().map(|v| -v / m)
    }

    fn second_derivatives(&self, objects: &[FitObject], _i: usize, _j: usize) -> Option<MetaMatrix> {
        let r = self.recoil(objects);
        let m = r.mass();
        (m > 0.0).then(|| invariant_mass_hessian(r, m, 1.0))
    }
}

impl HardConstraint for RecoilMassConstraint {
    fn global_num(&self) -> Option<usize> {
        self.global
    }

    fn set_global_num(&mut self, global: Option<usize>) {
        self.global = global;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::chain::{add_global_second_derivatives, global_gradient};
    use crate::constraints::numeric::{assign_global_indices, max_relative_deviation, numeric_gradient, numeric_hessian};
    use crate::domain::ObjectId;
    use nalgebra::DMatrix;

    #[test]
    fn recoil_derivatives_match_finite_differences() {
        let mut objects = vec![
            FitObject::jet("mu1", 70.0, 1.2, 0.5, [1.0, 0.01, 0.01], 0.105).unwrap(),
            FitObject::jet("mu2", 40.0, 2.1, -2.2, [1.0, 0.01, 0.01], 0.105).unwrap(),
        ];
        let dim = assign_global_indices(&mut objects);
        let c = RecoilMassConstraint::new(
            "recoil",
            125.0,
            FourVector::new(250.0, 0.0, 0.0, 0.0),
            [ObjectId(0), ObjectId(1)].into_iter().collect(),
        );
        assert!(c.recoil(&objects).mass() > 0.0);

        let analytic = global_gradient(&c, &objects, dim);
        let numeric = numeric_gradient(&c, &objects, dim, 1e-6);
        assert!(max_relative_deviation(analytic.as_slice(), numeric.as_slice()) < 1e-5);

        let mut hessian = DMatrix::zeros(dim, dim);
        add_global_second_derivatives(&c, &objects, &mut hessian, 1.0);
        let numeric = numeric_hessian(&c, &objects, dim, 1e-6);
        assert!(max_relative_deviation(hessian.as_slice(), numeric.as_slice()) < 1e-4);
    }
}
