//! Constraints on the four-momenta of fit objects.
//!
//! A constraint only sees four-momenta: it reports a value and its first and
//! second derivatives with respect to (E, px, py, pz) of each referenced
//! object. The chain rule through the parameterizations lives in `chain`.
//!
//! - hard constraints must vanish at the solution (`HardConstraint`)
//! - soft constraints add a penalty of their value to χ² (`SoftConstraint`)

pub mod chain;
pub mod mass;
pub mod momentum;
pub mod numeric;
pub mod penalty;
pub mod recoil;

use enum_dispatch::enum_dispatch;

use crate::domain::{FitObject, FourVector, N_META, ObjectId};

pub use mass::{MassConstraint, SoftMassConstraint};
pub use momentum::{MomentumConstraint, SoftMomentumConstraint};
pub use penalty::{Penalty, PenaltyValue};
pub use recoil::RecoilMassConstraint;

/// Second derivatives with respect to two four-momenta.
pub type MetaMatrix = [[f64; N_META]; N_META];

/// Side flag of a mass-difference member.
pub const SIDE_ONE: u8 = 1;
pub const SIDE_TWO: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub id: ObjectId,
    pub flag: u8,
}

/// Ordered, non-owning list of the objects a constraint refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectList {
    members: Vec<Member>,
}

impl ObjectList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: ObjectId) -> &mut Self {
        self.add_with_flag(id, SIDE_ONE)
    }

    pub fn add_with_flag(&mut self, id: ObjectId, flag: u8) -> &mut Self {
        self.members.push(Member { id, flag });
        self
    }

    pub fn reset(&mut self) {
        self.members.clear();
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.members.iter().map(|m| m.id)
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.members.iter().any(|m| m.flag == flag)
    }

    /// Sum of the members' four-momenta, optionally restricted to one flag.
    pub fn sum(&self, objects: &[FitObject], flag: Option<u8>) -> FourVector {
        self.members
            .iter()
            .filter(|m| flag.is_none_or(|f| m.flag == f))
            .map(|m| objects[m.id.index()].four_momentum())
            .sum()
    }
}

impl FromIterator<ObjectId> for ObjectList {
    fn from_iter<I: IntoIterator<Item = ObjectId>>(iter: I) -> Self {
        Self {
            members: iter
                .into_iter()
                .map(|id| Member { id, flag: SIDE_ONE })
                .collect(),
        }
    }
}

impl FromIterator<(ObjectId, u8)> for ObjectList {
    fn from_iter<I: IntoIterator<Item = (ObjectId, u8)>>(iter: I) -> Self {
        Self {
            members: iter
                .into_iter()
                .map(|(id, flag)| Member { id, flag })
                .collect(),
        }
    }
}

/// A scalar function of the members' four-momenta.
#[enum_dispatch]
pub trait ParticleFunction {
    fn name(&self) -> &str;

    fn members(&self) -> &ObjectList;

    fn value(&self, objects: &[FitObject]) -> f64;

    /// `∂f/∂P` of the member at `slot`.
    fn first_derivatives(&self, objects: &[FitObject], slot: usize) -> [f64; N_META];

    /// `∂²f/∂P_i∂P_j` for the members at `slot_i` and `slot_j`; `None` when
    /// the block vanishes identically.
    fn second_derivatives(
        &self,
        objects: &[FitObject],
        slot_i: usize,
        slot_j: usize,
    ) -> Option<MetaMatrix>;
}

/// Equality constraint `value() == 0` enforced with a Lagrange multiplier.
#[enum_dispatch]
pub trait HardConstraint: ParticleFunction {
    /// Position of the multiplier in the global vector, assigned per fit.
    fn global_num(&self) -> Option<usize>;

    fn set_global_num(&mut self, global: Option<usize>);
}

/// Penalty on `value()` added to χ².
#[enum_dispatch]
pub trait SoftConstraint: ParticleFunction {
    fn penalty(&self) -> Penalty;

    fn chi2(&self, objects: &[FitObject]) -> f64 {
        self.penalty().chi2(self.value(objects))
    }
}

#[enum_dispatch(ParticleFunction, HardConstraint)]
#[derive(Debug, Clone, PartialEq)]
pub enum HardConstraintKind {
    Momentum(MomentumConstraint),
    Mass(MassConstraint),
    RecoilMass(RecoilMassConstraint),
}

#[enum_dispatch(ParticleFunction, SoftConstraint)]
#[derive(Debug, Clone, PartialEq)]
pub enum SoftConstraintKind {
    Mass(SoftMassConstraint),
    Momentum(SoftMomentumConstraint),
}

/// Either kind, for `FitDriver::add_constraint`.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Hard(HardConstraintKind),
    Soft(SoftConstraintKind),
}

impl Constraint {
    pub fn members(&self) -> &ObjectList {
        match self {
            Constraint::Hard(c) => c.members(),
            Constraint::Soft(c) => c.members(),
        }
    }
}

impl From<HardConstraintKind> for Constraint {
    fn from(c: HardConstraintKind) -> Self {
        Constraint::Hard(c)
    }
}

impl From<SoftConstraintKind> for Constraint {
    fn from(c: SoftConstraintKind) -> Self {
        Constraint::Soft(c)
    }
}
