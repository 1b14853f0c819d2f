//! Linear momentum constraints.
//!
//! ```text
//! c = Σ (fE·E + fx·px + fy·py + fz·pz) - value
//! ```
//!
//! Linear in the four-momenta, so the second derivatives vanish.

use super::penalty::Penalty;
use super::{HardConstraint, MetaMatrix, ObjectList, ParticleFunction, SoftConstraint};
use crate::domain::{FitObject, FourVector, Meta, N_META};

fn linear_value(members: &ObjectList, objects: &[FitObject], factors: &[f64; N_META], value: f64) -> f64 {
    let total: FourVector = members.sum(objects, None);
    total
        .to_array()
        .iter()
        .zip(factors)
        .map(|(p, f)| p * f)
        .sum::<f64>()
        - value
}

/// Factors selecting a single component.
pub fn component_factors(meta: Meta) -> [f64; N_META] {
    let mut f = [0.0; N_META];
    f[meta.index()] = 1.0;
    f
}

#[derive(Debug, Clone, PartialEq)]
pub struct MomentumConstraint {
    name: String,
    members: ObjectList,
    /// Coefficients in (E, px, py, pz) order.
    factors: [f64; N_META],
    value: f64,
    global: Option<usize>,
}

impl MomentumConstraint {
    pub fn new(name: impl Into<String>, factors: [f64; N_META], value: f64, members: ObjectList) -> Self {
        Self {
            name: name.into(),
            members,
            factors,
            value,
            global: None,
        }
    }

    /// `Σ P_meta = value`.
    pub fn component(name: impl Into<String>, meta: Meta, value: f64, members: ObjectList) -> Self {
        Self::new(name, component_factors(meta), value, members)
    }

    /// The four constraints `ΣP = beam`.
    pub fn beam(beam: FourVector, members: &ObjectList) -> [Self; N_META] {
        let names = ["sum E", "sum px", "sum py", "sum pz"];
        Meta::ALL.map(|meta| {
            Self::component(
                names[meta.index()],
                meta,
                beam.component(meta),
                members.clone(),
            )
        })
    }

    pub fn target(&self) -> f64 {
        self.value
    }

    pub fn factors(&self) -> [f64; N_META] {
        self.factors
    }

    pub fn members_mut(&mut self) -> &mut ObjectList {
        &mut self.members
    }
}

impl ParticleFunction for MomentumConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn members(&self) -> &ObjectList {
        &self.members
    }

    fn value(&self, objects: &[FitObject]) -> f64 {
        linear_value(&self.members, objects, &self.factors, self.value)
    }

    fn first_derivatives(&self, _objects: &[FitObject], _slot: usize) -> [f64; N_META] {
        self.factors
    }

    fn second_derivatives(&self, _objects: &[FitObject], _i: usize, _j: usize) -> Option<MetaMatrix> {
        None
    }
}

impl HardConstraint for MomentumConstraint {
    fn global_num(&self) -> Option<usize> {
        self.global
    }

    fn set_global_num(&mut self, global: Option<usize>) {
        self.global = global;
    }
}

/// Gaussian penalty on a linear momentum combination.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftMomentumConstraint {
    name: String,
    members: ObjectList,
    factors: [f64; N_META],
    value: f64,
    sigma: f64,
}

impl SoftMomentumConstraint {
    pub fn new(
        name: impl Into<String>,
        factors: [f64; N_META],
        value: f64,
        sigma: f64,
        members: ObjectList,
    ) -> Self {
        Self {
            name: name.into(),
            members,
            factors,
            value,
            sigma,
        }
    }
}

impl ParticleFunction for SoftMomentumConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn members(&self) -> &ObjectList {
        &self.members
    }

    fn value(&self, objects: &[FitObject]) -> f64 {
        linear_value(&self.members, objects, &self.factors, self.value)
    }

    fn first_derivatives(&self, _objects: &[FitObject], _slot: usize) -> [f64; N_META] {
        self.factors
    }

    fn second_derivatives(&self, _objects: &[FitObject], _i: usize, _j: usize) -> Option<MetaMatrix> {
        None
    }
}

impl SoftConstraint for SoftMomentumConstraint {
    fn penalty(&self) -> Penalty {
        Penalty::Gauss { sigma: self.sigma }
    }
}
