//! Fit summaries: collect the fitted state of a driver into serializable rows.

pub mod format;

pub use format::{format_batch_summary, format_fit_summary};

use crate::constraints::{ParticleFunction, SoftConstraint};
use crate::domain::{ConstraintSummary, FitSummary, ObjectSummary};
use crate::fit::FitDriver;
use crate::models::Parameterization;

/// Snapshot of everything `driver` knows after `fit()`.
pub fn summarize(driver: &FitDriver, event: Option<&str>) -> FitSummary {
    let problem = driver.problem();
    let objects = problem
        .objects()
        .iter()
        .map(|obj| {
            let n = obj.npar();
            ObjectSummary {
                name: obj.name().to_string(),
                kind: obj.kind().label().to_string(),
                parameter_names: (0..n).map(|i| obj.param_name(i).to_string()).collect(),
                measured: (0..n).map(|i| obj.measured_param(i)).collect(),
                fitted: (0..n).map(|i| obj.param(i)).collect(),
                errors: (0..n).map(|i| obj.parameters().fitted_error(i)).collect(),
                four_momentum: obj.four_momentum(),
            }
        })
        .collect();

    let hard = problem.hard_constraints().iter().map(|c| ConstraintSummary {
        name: c.name().to_string(),
        soft: false,
        value: c.value(problem.objects()),
        chi2: 0.0,
    });
    let soft = problem.soft_constraints().iter().map(|c| ConstraintSummary {
        name: c.name().to_string(),
        soft: true,
        value: c.value(problem.objects()),
        chi2: c.chi2(problem.objects()),
    });

    FitSummary {
        event: event.map(str::to_string),
        engine: driver.options().engine,
        probability: driver.probability(),
        chi2: driver.chi2(),
        dof: driver.dof(),
        iterations: driver.iterations(),
        error_code: driver.error_code(),
        error: driver.error().map(|e| e.to_string()),
        covariance_valid: driver.is_covariance_valid(),
        objects,
        constraints: hard.chain(soft).collect(),
    }
}

/// Aggregate over many events.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchStats {
    pub events: usize,
    pub converged: usize,
    /// Mean probability over converged events with `dof > 0`.
    pub mean_probability: Option<f64>,
    pub mean_iterations: f64,
}

impl BatchStats {
    pub fn converged_fraction(&self) -> f64 {
        if self.events == 0 {
            return 0.0;
        }
        self.converged as f64 / self.events as f64
    }
}

pub fn batch_stats(summaries: &[FitSummary]) -> BatchStats {
    let converged: Vec<&FitSummary> = summaries.iter().filter(|s| s.converged()).collect();
    let probs: Vec<f64> = converged
        .iter()
        .filter(|s| s.probability >= 0.0)
        .map(|s| s.probability)
        .collect();
    let mean_probability = (!probs.is_empty()).then(|| probs.iter().sum::<f64>() / probs.len() as f64);
    let mean_iterations = if summaries.is_empty() {
        0.0
    } else {
        summaries.iter().map(|s| s.iterations as f64).sum::<f64>() / summaries.len() as f64
    };
    BatchStats {
        events: summaries.len(),
        converged: converged.len(),
        mean_probability,
        mean_iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::{MomentumConstraint, SoftMassConstraint};
    use crate::domain::{Engine, FitObject, FourVector, Meta};
    use nalgebra::DMatrix;

    fn driver() -> FitDriver {
        let cov = DMatrix::from_diagonal_element(4, 4, 4.0);
        let mut driver = FitDriver::default();
        let a = driver.add_fit_object(FitObject::px_py_pz_e("a", FourVector::new(30.0, 10.0, 3.0, 5.0), &cov).unwrap());
        let b = driver.add_fit_object(FitObject::px_py_pz_e("b", FourVector::new(25.0, -6.0, -2.0, 4.0), &cov).unwrap());
        driver
            .add_hard_constraint(MomentumConstraint::component("px", Meta::Px, 0.0, [a, b].into_iter().collect()))
            .unwrap();
        driver
            .add_soft_constraint(SoftMassConstraint::gauss("m", 50.0, 5.0, [a, b].into_iter().collect()))
            .unwrap();
        driver
    }

    #[test]
    fn summary_lists_objects_and_constraints() {
        let mut driver = driver();
        driver.fit();
        let summary = summarize(&driver, Some("ev1"));
        assert_eq!(summary.event.as_deref(), Some("ev1"));
        assert_eq!(summary.engine, Engine::Newton);
        assert!(summary.converged());
        assert!(summary.covariance_valid);
        assert_eq!(summary.objects.len(), 2);
        assert_eq!(summary.objects[0].parameter_names, vec!["px", "py", "pz", "E"]);
        assert!((summary.objects[0].measured[0] - 10.0).abs() < 1e-12);
        // fitted errors shrink below the measurement error
        assert!(summary.objects[0].errors[0] < 2.0);
        assert_eq!(summary.constraints.len(), 2);
        assert!(!summary.constraints[0].soft && summary.constraints[1].soft);
        assert!(summary.constraints[0].value.abs() < 1e-6);
    }

    #[test]
    fn batch_stats_skip_failed_events() {
        let mut ok = driver();
        ok.fit();
        let mut bad = FitDriver::default();
        bad.fit();
        let summaries = vec![summarize(&ok, None), summarize(&bad, None)];
        let stats = batch_stats(&summaries);
        assert_eq!(stats.events, 2);
        assert_eq!(stats.converged, 1);
        assert!((stats.converged_fraction() - 0.5).abs() < 1e-12);
        let mean = stats.mean_probability.unwrap();
        assert!((mean - summaries[0].probability).abs() < 1e-12);
    }
}
