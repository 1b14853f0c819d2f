//! Stateful front end: collect objects and constraints, fit, query results.

use nalgebra::DMatrix;

use super::{FitEngine, FitOutcome, FitProblem, engine_for};
use crate::constraints::{Constraint, HardConstraintKind, SoftConstraintKind};
use crate::domain::{FitObject, ObjectId, SolverOptions};
use crate::error::{FitError, SetupError};
use crate::trace::{Tracer, TracerChain};

pub struct FitDriver {
    options: SolverOptions,
    engine: Box<dyn FitEngine>,
    problem: FitProblem,
    tracers: TracerChain,
    outcome: Option<FitOutcome>,
}

impl Default for FitDriver {
    fn default() -> Self {
        Self::new(SolverOptions::default())
    }
}

impl std::fmt::Debug for FitDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FitDriver")
            .field("engine", &self.engine.kind())
            .field("problem", &self.problem)
            .field("tracers", &self.tracers)
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl FitDriver {
    pub fn new(options: SolverOptions) -> Self {
        Self {
            engine: engine_for(&options),
            options,
            problem: FitProblem::new(),
            tracers: TracerChain::default(),
            outcome: None,
        }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Replaces the options; the engine is rebuilt to match.
    pub fn set_options(&mut self, options: SolverOptions) {
        self.engine = engine_for(&options);
        self.options = options;
    }

    pub fn add_fit_object(&mut self, obj: FitObject) -> ObjectId {
        self.problem.add_object(obj)
    }

    pub fn add_hard_constraint(&mut self, c: impl Into<HardConstraintKind>) -> Result<usize, SetupError> {
        self.problem.add_hard(c.into())
    }

    pub fn add_soft_constraint(&mut self, c: impl Into<SoftConstraintKind>) -> Result<usize, SetupError> {
        self.problem.add_soft(c.into())
    }

    pub fn add_constraint(&mut self, c: impl Into<Constraint>) -> Result<usize, SetupError> {
        self.problem.add_constraint(c.into())
    }

    pub fn add_tracer(&mut self, tracer: Box<dyn Tracer>) {
        self.tracers.push(tracer);
    }

    /// Runs the configured engine. Returns the fit probability, -1 on failure.
    pub fn fit(&mut self) -> f64 {
        let outcome = self.engine.fit(&mut self.problem, &mut self.tracers);
        match &outcome.error {
            Some(err) => log::warn!(
                "{} fit failed after {} iterations: {err}",
                self.engine.kind().display_name(),
                outcome.iterations
            ),
            None => log::debug!(
                "{} fit converged after {} iterations: chi2={:.5e} dof={} prob={:.4}",
                self.engine.kind().display_name(),
                outcome.iterations,
                outcome.chi2,
                outcome.dof,
                outcome.probability
            ),
        }
        if outcome.converged() && outcome.covariance.is_none() {
            log::warn!("fit converged but the fitted covariance is not available");
        }
        let probability = outcome.probability;
        self.outcome = Some(outcome);
        probability
    }

    pub fn outcome(&self) -> Option<&FitOutcome> {
        self.outcome.as_ref()
    }

    pub fn probability(&self) -> f64 {
        self.outcome.as_ref().map_or(-1.0, |o| o.probability)
    }

    /// χ² of the last fit, or of the current state before any fit.
    pub fn chi2(&self) -> f64 {
        self.outcome.as_ref().map_or_else(|| self.problem.chi2(), |o| o.chi2)
    }

    pub fn dof(&self) -> i32 {
        self.outcome.as_ref().map_or(0, |o| o.dof)
    }

    pub fn iterations(&self) -> usize {
        self.outcome.as_ref().map_or(0, |o| o.iterations)
    }

    pub fn error(&self) -> Option<&FitError> {
        self.outcome.as_ref().and_then(|o| o.error.as_ref())
    }

    /// Numeric code of `error()`; 0 when the last fit converged.
    pub fn error_code(&self) -> i32 {
        self.outcome.as_ref().map_or(0, FitOutcome::error_code)
    }

    /// Fitted covariance of all free parameters, in global index order.
    pub fn global_covariance_matrix(&self) -> Option<&DMatrix<f64>> {
        self.outcome.as_ref().and_then(|o| o.covariance.as_ref())
    }

    pub fn is_covariance_valid(&self) -> bool {
        self.global_covariance_matrix().is_some()
    }

    pub fn problem(&self) -> &FitProblem {
        &self.problem
    }

    pub fn fit_object(&self, id: ObjectId) -> Option<&FitObject> {
        self.problem.object(id)
    }

    pub fn fit_object_mut(&mut self, id: ObjectId) -> Option<&mut FitObject> {
        self.problem.object_mut(id)
    }

    /// Drops all objects, constraints and results; options and tracers stay.
    pub fn reset(&mut self) {
        self.problem.clear();
        self.outcome = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::{
        MassConstraint, MomentumConstraint, ObjectList, ParticleFunction, SoftConstraint, SoftMassConstraint,
    };
    use crate::domain::{Engine, FourVector, LineSearchMode, Meta};
    use nalgebra::DVector;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn diagonal(errors: &[f64]) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_iterator(errors.len(), errors.iter().map(|e| e * e)))
    }

    fn px_balance(driver: &mut FitDriver, px_a: f64, px_b: f64) -> [ObjectId; 2] {
        let cov = diagonal(&[2.0, 1.0, 1.0, 1.0]);
        let a = driver.add_fit_object(
            FitObject::px_py_pz_e("a", FourVector::new(30.0, px_a, 3.0, 5.0), &cov).unwrap(),
        );
        let b = driver.add_fit_object(
            FitObject::px_py_pz_e("b", FourVector::new(25.0, px_b, -2.0, 4.0), &cov).unwrap(),
        );
        driver
            .add_hard_constraint(MomentumConstraint::component("px", Meta::Px, 0.0, [a, b].into_iter().collect()))
            .unwrap();
        [a, b]
    }

    #[test]
    fn unconstrained_fit_returns_measurements() {
        let mut driver = FitDriver::default();
        let id = driver.add_fit_object(FitObject::jet("j", 50.0, 1.0, 0.5, [5.0, 0.02, 0.02], 0.0).unwrap());
        driver.fit_object_mut(id).unwrap().set_param(0, 44.0);
        driver.fit();
        assert!(driver.error().is_none());
        let obj = driver.fit_object(id).unwrap();
        assert!((obj.param(0) - 50.0).abs() < 1e-6);
        assert!((obj.param(1) - 1.0).abs() < 1e-9);
        assert!(driver.chi2() < 1e-10);
        assert_eq!(driver.dof(), 0);
        // no degrees of freedom: no probability
        assert_eq!(driver.probability(), -1.0);
    }

    #[test]
    fn linear_momentum_constraint_matches_closed_form() {
        let mut driver = FitDriver::default();
        let [a, b] = px_balance(&mut driver, 10.0, -6.0);
        let prob = driver.fit();
        assert_eq!(driver.error_code(), 0);
        let c = &driver.problem().hard_constraints()[0];
        assert!(c.value(driver.problem().objects()).abs() < 1e-6);
        // residual r = 4, σ² = 4 each: χ² = r² / (σ_a² + σ_b²) = 2
        assert!((driver.chi2() - 2.0).abs() < 1e-6);
        assert!((driver.fit_object(a).unwrap().param(0) - 8.0).abs() < 1e-6);
        assert!((driver.fit_object(b).unwrap().param(0) + 8.0).abs() < 1e-6);
        let expected = crate::math::chi2_probability(2.0, 1);
        assert!((prob - expected).abs() < 1e-6);

        let cov = driver.global_covariance_matrix().unwrap();
        assert!((cov[(0, 0)] - 2.0).abs() < 1e-9);
        assert!((cov[(0, 4)] + 2.0).abs() < 1e-9);
        let fitted = driver.fit_object(a).unwrap().fitted_covariance().unwrap();
        assert!((fitted[(0, 0)] - 2.0).abs() < 1e-9);
        // the measurement itself is untouched
        assert!((driver.fit_object(a).unwrap().error(0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn refit_of_converged_system_is_a_no_op() {
        let mut driver = FitDriver::default();
        px_balance(&mut driver, 10.0, -6.0);
        driver.fit();
        let params: Vec<f64> = driver.problem().objects().iter().flat_map(|o| o.parameters().values().to_vec()).collect();
        let chi2 = driver.chi2();

        driver.fit();
        assert_eq!(driver.iterations(), 0);
        assert!(driver.error().is_none());
        assert!((driver.chi2() - chi2).abs() < 1e-9);
        let again: Vec<f64> = driver.problem().objects().iter().flat_map(|o| o.parameters().values().to_vec()).collect();
        for (p, q) in params.iter().zip(again.iter()) {
            assert!((p - q).abs() < 1e-9);
        }
    }

    #[test]
    fn satisfied_mass_constraint_converges_immediately() {
        let mut driver = FitDriver::default();
        let pa = FourVector::new(40.0, 10.0, 20.0, 25.0);
        let pb = FourVector::new(35.0, -15.0, 5.0, -20.0);
        let a = driver.add_fit_object(FitObject::px_py_pz_e("a", pa, &diagonal(&[1.0; 4])).unwrap());
        let b = driver.add_fit_object(FitObject::px_py_pz_e("b", pb, &diagonal(&[1.0; 4])).unwrap());
        let mass = (pa + pb).mass();
        driver
            .add_hard_constraint(MassConstraint::new("m", mass, [a, b].into_iter().collect()))
            .unwrap();
        assert!(driver.problem().hard_constraints()[0].value(driver.problem().objects()).abs() < 1e-9);
        driver.fit();
        assert!(driver.error().is_none());
        assert_eq!(driver.iterations(), 0);
        assert!(driver.chi2() < 1e-12);
    }

    #[test]
    fn duplicated_constraints_are_both_satisfied() {
        let mut driver = FitDriver::default();
        let [a, b] = px_balance(&mut driver, 10.0, -6.0);
        driver
            .add_hard_constraint(MomentumConstraint::component("px again", Meta::Px, 0.0, [a, b].into_iter().collect()))
            .unwrap();
        driver.fit();
        assert!(driver.error().is_none(), "{:?}", driver.error());
        for c in driver.problem().hard_constraints() {
            assert!(c.value(driver.problem().objects()).abs() < 1e-6);
        }
        assert!((driver.chi2() - 2.0).abs() < 1e-5);
    }

    #[test]
    fn unconstrained_error_propagation_returns_input_covariance() {
        let mut cov = diagonal(&[2.0, 1.5, 3.0]);
        cov[(0, 1)] = 0.8;
        cov[(1, 0)] = 0.8;
        cov[(1, 2)] = -0.5;
        cov[(2, 1)] = -0.5;
        let mut driver = FitDriver::default();
        let id = driver.add_fit_object(FitObject::px_py_pz_m("p", 12.0, -4.0, 30.0, 0.14, &cov).unwrap());
        driver.fit();
        assert!(driver.is_covariance_valid());
        let global = driver.global_covariance_matrix().unwrap();
        assert!((global - &cov).amax() < 1e-9);
        let fitted = driver.fit_object(id).unwrap().fitted_covariance().unwrap();
        assert!((fitted - &cov).amax() < 1e-9);
    }

    #[test]
    fn gauss_soft_constraint_penalty_grows_quadratically() {
        let mut driver = FitDriver::default();
        let pa = FourVector::new(40.0, 10.0, 20.0, 25.0);
        let pb = FourVector::new(35.0, -15.0, 5.0, -20.0);
        let a = driver.add_fit_object(FitObject::px_py_pz_e("a", pa, &diagonal(&[1.0; 4])).unwrap());
        let b = driver.add_fit_object(FitObject::px_py_pz_e("b", pb, &diagonal(&[1.0; 4])).unwrap());
        let members: ObjectList = [a, b].into_iter().collect();
        let mass = (pa + pb).mass();
        let sigma = 2.0;
        for k in [0.0, 1.0, 2.5] {
            let soft = SoftMassConstraint::gauss("m", mass - k * sigma, sigma, members.clone());
            let chi2 = soft.chi2(driver.problem().objects());
            assert!((chi2 - k * k).abs() < 1e-9, "k={k}: {chi2}");
        }

        driver
            .add_soft_constraint(SoftMassConstraint::gauss("m", mass - 3.0, sigma, members))
            .unwrap();
        driver.fit();
        assert!(driver.error().is_none(), "{:?}", driver.error());
        assert_eq!(driver.dof(), 1);
        // the penalty is shared between the objects and the constraint
        assert!(driver.chi2() > 0.0 && driver.chi2() < 9.0 / 4.0);
    }

    #[test]
    fn engines_agree_on_a_linear_problem() {
        let mut chi2 = Vec::new();
        for engine in [Engine::Newton, Engine::Damped, Engine::Opal] {
            let mut driver = FitDriver::new(SolverOptions {
                engine,
                ..SolverOptions::default()
            });
            let [a, _] = px_balance(&mut driver, 10.0, -6.0);
            driver.fit();
            assert!(driver.error().is_none(), "{engine:?}: {:?}", driver.error());
            assert!((driver.fit_object(a).unwrap().param(0) - 8.0).abs() < 1e-5, "{engine:?}");
            chi2.push(driver.chi2());
        }
        for c in &chi2 {
            assert!((c - 2.0).abs() < 1e-5);
        }
    }

    #[test]
    fn failed_fit_reports_code_and_negative_probability() {
        let mut driver = FitDriver::new(SolverOptions {
            max_iterations: 0,
            ..SolverOptions::default()
        });
        px_balance(&mut driver, 10.0, -6.0);
        assert_eq!(driver.fit(), -1.0);
        assert_eq!(driver.error(), Some(&FitError::OutOfIterations { iterations: 1 }));
        assert_eq!(driver.error_code(), 1);
        assert!(!driver.is_covariance_valid());
    }

    #[test]
    fn chi2_above_ceiling_is_divergence() {
        let mut driver = FitDriver::new(SolverOptions {
            chi2_ceiling: 1e-3,
            ..SolverOptions::default()
        });
        px_balance(&mut driver, 10.0, -6.0);
        assert_eq!(driver.fit(), -1.0);
        assert!(matches!(driver.error(), Some(FitError::ChiSquareDiverged { chi2 }) if *chi2 > 1e-3));
        assert_eq!(driver.error_code(), 2);
        assert!(!driver.is_covariance_valid());
    }

    #[test]
    fn clamped_energy_stops_as_not_stabilized() {
        // E cannot drop below the jet mass, so the step towards E = 5 saturates
        let mut driver = FitDriver::new(SolverOptions {
            chi2_tolerance: 0.0,
            line_search: LineSearchMode::None,
            second_order_correction: false,
            stall_limit: 1,
            ..SolverOptions::default()
        });
        let j = driver.add_fit_object(FitObject::jet("j", 10.5, 1.2, 0.4, [1.0, 0.01, 0.01], 10.0).unwrap());
        driver
            .add_hard_constraint(MomentumConstraint::component("E", Meta::E, 5.0, [j].into_iter().collect()))
            .unwrap();
        assert_eq!(driver.fit(), -1.0);
        assert_eq!(driver.error(), Some(&FitError::NotStabilized { steps: 1 }));
        assert_eq!(driver.error_code(), 4);
        assert_eq!(driver.iterations(), 2);
        assert!((driver.fit_object(j).unwrap().param(0) - 10.0).abs() < 1e-5);
    }

    #[test]
    fn overflowing_kinematics_are_non_finite() {
        // p = sqrt(E² - m²) overflows, and px = p sinθ cosφ is NaN along the beam
        let mut driver = FitDriver::default();
        let j = driver.add_fit_object(FitObject::jet("j", 1e200, 0.0, 0.0, [1.0, 0.01, 0.01], 1.0).unwrap());
        driver
            .add_hard_constraint(MomentumConstraint::component("px", Meta::Px, 0.0, [j].into_iter().collect()))
            .unwrap();
        assert_eq!(driver.fit(), -1.0);
        assert!(matches!(driver.error(), Some(FitError::NonFinite { .. })));
        assert_eq!(driver.error_code(), 99);
        assert_eq!(driver.iterations(), 0);
    }

    #[test]
    fn fit_recovers_from_negative_curvature() {
        // Start on the far side of the |p| = 8 circle from the measurement.
        // Along the circle the Lagrangian curvature is 2 u·m / R = -1.8 there,
        // so the first Newton direction has pᵀLp < 0.
        let mut driver = FitDriver::default();
        let id = driver.add_fit_object(
            FitObject::px_py_pz_e("p", FourVector::new(20.0, 12.0, 0.0, 0.0), &DMatrix::identity(4, 4)).unwrap(),
        );
        let target = (400.0_f64 - 64.0).sqrt();
        {
            let obj = driver.fit_object_mut(id).unwrap();
            obj.set_param(0, -4.8);
            obj.set_param(1, 6.4);
            obj.fix_param(2, true);
            obj.fix_param(3, true);
            assert!((obj.four_momentum().mass() - target).abs() < 1e-9);
        }
        driver
            .add_hard_constraint(MassConstraint::new("m", target, [id].into_iter().collect()))
            .unwrap();
        let prob = driver.fit();
        assert!(driver.error().is_none(), "{:?}", driver.error());
        assert!((0.0..=1.0).contains(&prob));
        let obj = driver.fit_object(id).unwrap();
        assert!((obj.four_momentum().mass() - target).abs() < 1e-4);
        assert!((obj.param(0) - 8.0).abs() < 1e-3, "px {}", obj.param(0));
        assert!(obj.param(1).abs() < 1e-3, "py {}", obj.param(1));
    }

    #[test]
    fn pulls_are_standard_normal() {
        let mut rng = StdRng::seed_from_u64(20241018);
        let sigma = 2.0;
        let smear = Normal::new(0.0, sigma).unwrap();
        let n = 400;
        let mut pulls = Vec::with_capacity(n);
        for _ in 0..n {
            let mut driver = FitDriver::default();
            let [a, _] = px_balance(&mut driver, 8.0 + smear.sample(&mut rng), -8.0 + smear.sample(&mut rng));
            driver.fit();
            assert!(driver.error().is_none());
            let obj = driver.fit_object(a).unwrap();
            let fitted_var = obj.fitted_covariance().unwrap()[(0, 0)];
            let pull = (obj.measured_param(0) - obj.param(0)) / (sigma * sigma - fitted_var).sqrt();
            pulls.push(pull);
        }
        let mean = pulls.iter().sum::<f64>() / n as f64;
        let var = pulls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        assert!(mean.abs() < 0.2, "mean {mean}");
        assert!((var.sqrt() - 1.0).abs() < 0.15, "width {}", var.sqrt());
    }

    #[test]
    fn unknown_members_are_rejected() {
        let mut driver = FitDriver::default();
        let err = driver
            .add_hard_constraint(MassConstraint::new("m", 1.0, [ObjectId(3)].into_iter().collect()))
            .unwrap_err();
        assert_eq!(err, SetupError::UnknownObject(3));
    }
}
