//! The object/constraint arena a fit works on.

use crate::constraints::{
    Constraint, HardConstraintKind, ObjectList, ParticleFunction, SoftConstraint, SoftConstraintKind,
};
use crate::domain::{FitObject, ObjectId};
use crate::error::SetupError;

#[derive(Debug, Clone, Default)]
pub struct FitProblem {
    objects: Vec<FitObject>,
    hard: Vec<HardConstraintKind>,
    soft: Vec<SoftConstraintKind>,
}

impl FitProblem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&mut self, obj: FitObject) -> ObjectId {
        self.objects.push(obj);
        ObjectId(self.objects.len() - 1)
    }

    pub fn add_hard(&mut self, c: HardConstraintKind) -> Result<usize, SetupError> {
        self.check_members(c.members())?;
        self.hard.push(c);
        Ok(self.hard.len() - 1)
    }

    pub fn add_soft(&mut self, c: SoftConstraintKind) -> Result<usize, SetupError> {
        self.check_members(c.members())?;
        self.soft.push(c);
        Ok(self.soft.len() - 1)
    }

    pub fn add_constraint(&mut self, c: Constraint) -> Result<usize, SetupError> {
        match c {
            Constraint::Hard(h) => self.add_hard(h),
            Constraint::Soft(s) => self.add_soft(s),
        }
    }

    fn check_members(&self, members: &ObjectList) -> Result<(), SetupError> {
        match members.ids().find(|id| id.index() >= self.objects.len()) {
            Some(bad) => Err(SetupError::UnknownObject(bad.index())),
            None => Ok(()),
        }
    }

    pub fn objects(&self) -> &[FitObject] {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut [FitObject] {
        &mut self.objects
    }

    pub fn object(&self, id: ObjectId) -> Option<&FitObject> {
        self.objects.get(id.index())
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut FitObject> {
        self.objects.get_mut(id.index())
    }

    pub fn hard_constraints(&self) -> &[HardConstraintKind] {
        &self.hard
    }

    pub(crate) fn hard_constraints_mut(&mut self) -> &mut [HardConstraintKind] {
        &mut self.hard
    }

    pub fn soft_constraints(&self) -> &[SoftConstraintKind] {
        &self.soft
    }

    /// Object χ² plus soft-constraint penalties.
    pub fn chi2(&self) -> f64 {
        self.object_chi2() + self.soft_chi2()
    }

    pub fn object_chi2(&self) -> f64 {
        self.objects.iter().map(FitObject::chi2).sum()
    }

    pub fn soft_chi2(&self) -> f64 {
        self.soft.iter().map(|c| c.chi2(&self.objects)).sum()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.hard.clear();
        self.soft.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::MassConstraint;

    #[test]
    fn constraints_must_reference_known_objects() {
        let mut problem = FitProblem::new();
        let a = problem.add_object(FitObject::neutrino("nu", 10.0, 1.0, 0.0).unwrap());
        let ok = MassConstraint::new("m", 0.0, [a].into_iter().collect());
        assert!(problem.add_hard(ok.into()).is_ok());
        let bad = MassConstraint::new("m", 0.0, [ObjectId(5)].into_iter().collect());
        assert_eq!(problem.add_hard(bad.into()), Err(SetupError::UnknownObject(5)));
    }
}
