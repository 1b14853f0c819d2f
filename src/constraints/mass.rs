//! Invariant-mass constraints.
//!
//! Members flagged `SIDE_TWO` form a second system, and the value becomes the
//! mass difference:
//!
//! ```text
//! single side: c = M(ΣP) - m
//! two sides:   c = M(ΣP₁) - M(ΣP₂) - m
//! ∂M/∂P     = (E, -px, -py, -pz) / M
//! ∂²M/∂P∂P  = g / M - (gP)(gP)ᵀ / M³,  g = diag(1, -1, -1, -1)
//! ```

use super::penalty::Penalty;
use super::{HardConstraint, MetaMatrix, ObjectList, ParticleFunction, SIDE_TWO, SoftConstraint};
use crate::domain::{FitObject, FourVector, Meta, N_META};

fn is_side_two(flag: u8) -> bool {
    flag == SIDE_TWO
}

fn side_sums(members: &ObjectList, objects: &[FitObject]) -> (FourVector, FourVector) {
    let mut one = FourVector::ZERO;
    let mut two = FourVector::ZERO;
    for m in members.iter() {
        let p = objects[m.id.index()].four_momentum();
        if is_side_two(m.flag) {
            two += p;
        } else {
            one += p;
        }
    }
    (one, two)
}

pub(crate) fn mass_value(members: &ObjectList, objects: &[FitObject], target: f64) -> f64 {
    let (one, two) = side_sums(members, objects);
    if members.has_flag(SIDE_TWO) {
        one.mass() - two.mass() - target
    } else {
        one.mass() - target
    }
}

pub(crate) fn mass_first_derivatives(
    members: &ObjectList,
    objects: &[FitObject],
    slot: usize,
) -> [f64; N_META] {
    let flag = members.members()[slot].flag;
    let (one, two) = side_sums(members, objects);
    let (p, sign) = if is_side_two(flag) { (two, -1.0) } else { (one, 1.0) };
    let m = p.mass();
    if !(m > 0.0) {
        return [0.0; N_META];
    }
    p.lowered().map(|v| sign * v / m)
}

pub(crate) fn mass_second_derivatives(
    members: &ObjectList,
    objects: &[FitObject],
    slot_i: usize,
    slot_j: usize,
) -> Option<MetaMatrix> {
    let fi = members.members()[slot_i].flag;
    let fj = members.members()[slot_j].flag;
    if is_side_two(fi) != is_side_two(fj) {
        return None;
    }
    let (one, two) = side_sums(members, objects);
    let (p, sign) = if is_side_two(fi) { (two, -1.0) } else { (one, 1.0) };
    let m = p.mass();
    if !(m > 0.0) {
        return None;
    }
    Some(invariant_mass_hessian(p, m, sign))
}

/// `sign · (g/M - (gP)(gP)ᵀ/M³)`.
pub(crate) fn invariant_mass_hessian(p: FourVector, m: f64, sign: f64) -> MetaMatrix {
    let l = p.lowered();
    let m3 = m * m * m;
    let mut out = [[0.0; N_META]; N_META];
    for a in Meta::ALL {
        for b in Meta::ALL {
            let (ia, ib) = (a.index(), b.index());
            let diag = if ia == ib { a.metric() / m } else { 0.0 };
            out[ia][ib] = sign * (diag - l[ia] * l[ib] / m3);
        }
    }
    out
}

/// Hard invariant-mass (or mass-difference) constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct MassConstraint {
    name: String,
    members: ObjectList,
    mass: f64,
    global: Option<usize>,
}

impl MassConstraint {
    pub fn new(name: impl Into<String>, mass: f64, members: ObjectList) -> Self {
        Self {
            name: name.into(),
            members,
            mass,
            global: None,
        }
    }

    pub fn mass(&self) -> f64 {
        self.mass
    }

    pub fn set_mass(&mut self, mass: f64) {
        self.mass = mass;
    }

    pub fn members_mut(&mut self) -> &mut ObjectList {
        &mut self.members
    }
}

impl ParticleFunction for MassConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn members(&self) -> &ObjectList {
        &self.members
    }

    fn value(&self, objects: &[FitObject]) -> f64 {
        mass_value(&self.members, objects, self.mass)
    }

    fn first_derivatives(&self, objects: &[FitObject], slot: usize) -> [f64; N_META] {
        mass_first_derivatives(&self.members, objects, slot)
    }

    fn second_derivatives(&self, objects: &[FitObject], slot_i: usize, slot_j: usize) -> Option<MetaMatrix> {
        mass_second_derivatives(&self.members, objects, slot_i, slot_j)
    }
}

impl HardConstraint for MassConstraint {
    fn global_num(&self) -> Option<usize> {
        self.global
    }

    fn set_global_num(&mut self, global: Option<usize>) {
        self.global = global;
    }
}

/// Invariant mass pulled towards `mass` by a Gaussian or Breit-Wigner penalty.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftMassConstraint {
    name: String,
    members: ObjectList,
    mass: f64,
    penalty: Penalty,
}

impl SoftMassConstraint {
    pub fn gauss(name: impl Into<String>, mass: f64, sigma: f64, members: ObjectList) -> Self {
        Self {
            name: name.into(),
            members,
            mass,
            penalty: Penalty::Gauss { sigma },
        }
    }

    pub fn breit_wigner(name: impl Into<String>, mass: f64, gamma: f64, members: ObjectList) -> Self {
        Self {
            name: name.into(),
            members,
            mass,
            penalty: Penalty::BreitWigner { gamma },
        }
    }

    pub fn mass(&self) -> f64 {
        self.mass
    }
}

impl ParticleFunction for SoftMassConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn members(&self) -> &ObjectList {
        &self.members
    }

    fn value(&self, objects: &[FitObject]) -> f64 {
        mass_value(&self.members, objects, self.mass)
    }

    fn first_derivatives(&self, objects: &[FitObject], slot: usize) -> [f64; N_META] {
        mass_first_derivatives(&self.members, objects, slot)
    }

    fn second_derivatives(&self, objects: &[FitObject], slot_i: usize, slot_j: usize) -> Option<MetaMatrix> {
        mass_second_derivatives(&self.members, objects, slot_i, slot_j)
    }
}

impl SoftConstraint for SoftMassConstraint {
    fn penalty(&self) -> Penalty {
        self.penalty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::SIDE_ONE;
    use crate::constraints::chain::global_gradient;
    use crate::constraints::numeric::{assign_global_indices, max_relative_deviation, numeric_gradient, numeric_hessian};
    use crate::domain::ObjectId;
    use nalgebra::DMatrix;

    fn three_jets() -> Vec<FitObject> {
        vec![
            FitObject::jet("j1", 60.0, 1.0, 0.2, [5.0, 0.03, 0.03], 4.0).unwrap(),
            FitObject::jet("j2", 45.0, 2.0, 2.9, [4.0, 0.03, 0.03], 2.0).unwrap(),
            FitObject::jet("j3", 30.0, 1.4, -1.8, [3.0, 0.03, 0.03], 5.0).unwrap(),
        ]
    }

    fn hessian_of<F: ParticleFunction>(f: &F, objects: &[FitObject], dim: usize) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(dim, dim);
        crate::constraints::chain::add_global_second_derivatives(f, objects, &mut m, 1.0);
        m
    }

    #[test]
    fn pair_at_target_mass_has_zero_value() {
        let objects = vec![
            FitObject::px_py_pz_e("a", FourVector::new(50.0, 0.0, 0.0, 50.0), &DMatrix::identity(4, 4)).unwrap(),
            FitObject::px_py_pz_e("b", FourVector::new(50.0, 0.0, 0.0, -50.0), &DMatrix::identity(4, 4)).unwrap(),
        ];
        let c = MassConstraint::new("Z", 100.0, [ObjectId(0), ObjectId(1)].into_iter().collect());
        assert!(c.value(&objects).abs() < 1e-12);
    }

    #[test]
    fn mass_derivatives_match_finite_differences() {
        let mut objects = three_jets();
        let dim = assign_global_indices(&mut objects);
        let c = MassConstraint::new("W", 80.4, [ObjectId(0), ObjectId(1), ObjectId(2)].into_iter().collect());

        let analytic = global_gradient(&c, &objects, dim);
        let numeric = numeric_gradient(&c, &objects, dim, 1e-6);
        assert!(max_relative_deviation(analytic.as_slice(), numeric.as_slice()) < 1e-5);

        let analytic = hessian_of(&c, &objects, dim);
        let numeric = numeric_hessian(&c, &objects, dim, 1e-6);
        assert!(max_relative_deviation(analytic.as_slice(), numeric.as_slice()) < 1e-4);
    }

    #[test]
    fn mass_difference_derivatives_match_finite_differences() {
        // M is not differentiable at zero mass: side two needs a massive system
        let mut objects = three_jets();
        objects.push(FitObject::jet("j4", 35.0, 0.7, 1.1, [3.5, 0.03, 0.03], 0.0).unwrap());
        let dim = assign_global_indices(&mut objects);
        let members: ObjectList = [
            (ObjectId(0), SIDE_ONE),
            (ObjectId(1), SIDE_ONE),
            (ObjectId(2), SIDE_TWO),
            (ObjectId(3), SIDE_TWO),
        ]
        .into_iter()
        .collect();
        let c = MassConstraint::new("equal", 0.0, members);

        let (one, two) = side_sums(c.members(), &objects);
        assert!(two.mass() > 1.0);
        assert!((c.value(&objects) - (one.mass() - two.mass())).abs() < 1e-12);

        let analytic = global_gradient(&c, &objects, dim);
        let numeric = numeric_gradient(&c, &objects, dim, 1e-6);
        assert!(max_relative_deviation(analytic.as_slice(), numeric.as_slice()) < 1e-5);

        let analytic = hessian_of(&c, &objects, dim);
        let numeric = numeric_hessian(&c, &objects, dim, 1e-6);
        assert!(max_relative_deviation(analytic.as_slice(), numeric.as_slice()) < 1e-4);
    }

    #[test]
    fn gaussian_soft_mass_counts_sigmas() {
        let objects = vec![
            FitObject::px_py_pz_e("a", FourVector::new(50.0, 0.0, 0.0, 50.0), &DMatrix::identity(4, 4)).unwrap(),
            FitObject::px_py_pz_e("b", FourVector::new(50.0, 0.0, 0.0, -50.0), &DMatrix::identity(4, 4)).unwrap(),
        ];
        let members: ObjectList = [ObjectId(0), ObjectId(1)].into_iter().collect();
        let at_peak = SoftMassConstraint::gauss("Z", 100.0, 2.0, members.clone());
        assert_eq!(at_peak.chi2(&objects), 0.0);
        let off_peak = SoftMassConstraint::gauss("Z", 94.0, 2.0, members);
        assert!((off_peak.chi2(&objects) - 9.0).abs() < 1e-9);
    }
}
