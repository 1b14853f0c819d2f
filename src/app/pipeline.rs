//! Shared event pipeline used by `fit` and `batch`:
//! event description -> driver -> fit -> summary.

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::constraints::{
    MassConstraint, MomentumConstraint, ObjectList, RecoilMassConstraint, SIDE_ONE, SoftMassConstraint,
    SoftMomentumConstraint,
};
use crate::domain::{
    ConstraintSpec, EventSpec, FitObject, FitSummary, FourVector, MomentumFactors, N_META, ObjectId, ObjectSpec,
    OptionOverrides, SolverOptions, TracerKind,
};
use crate::error::{AppError, SetupError};
use crate::fit::FitDriver;
use crate::trace::TextTracer;

/// Name of the object added by `--unmeasured-photon`.
pub const UNMEASURED_PHOTON: &str = "isr photon";

/// Translate an event description into a ready-to-fit driver.
pub fn build_driver(
    event: &EventSpec,
    options: SolverOptions,
    unmeasured_photon: bool,
) -> Result<FitDriver, SetupError> {
    let mut driver = FitDriver::new(options);
    for spec in &event.objects {
        driver.add_fit_object(build_object(spec)?);
    }

    let photon = if unmeasured_photon {
        let measured: FourVector = driver.problem().objects().iter().map(FitObject::four_momentum).sum();
        let missing = event.beam.unwrap_or(FourVector::ZERO) - measured;
        Some(driver.add_fit_object(photon_from_missing(missing)?))
    } else {
        None
    };

    for spec in &event.constraints {
        add_constraint(&mut driver, spec, event.beam, photon)?;
    }
    Ok(driver)
}

fn build_object(spec: &ObjectSpec) -> Result<FitObject, SetupError> {
    match spec {
        ObjectSpec::Jet {
            name,
            e,
            theta,
            phi,
            errors,
            mass,
        } => FitObject::jet(name.as_str(), *e, *theta, *phi, *errors, *mass),
        ObjectSpec::Neutrino { name, e, theta, phi } => FitObject::neutrino(name.as_str(), *e, *theta, *phi),
        ObjectSpec::FourMomentum { name, p, covariance } => {
            FitObject::px_py_pz_e(name.as_str(), *p, &matrix(name, covariance, 4)?)
        }
        ObjectSpec::MassiveMomentum {
            name,
            px,
            py,
            pz,
            mass,
            covariance,
        } => FitObject::px_py_pz_m(name.as_str(), *px, *py, *pz, *mass, &matrix(name, covariance, 3)?),
        ObjectSpec::IsrPhoton {
            name,
            px,
            py,
            pz,
            b,
            pz_max,
        } => FitObject::isr_photon(name.as_str(), *px, *py, *pz, *b, *pz_max),
        ObjectSpec::Track {
            name,
            kappa,
            phi,
            tan_lambda,
            mass,
            covariance,
        } => FitObject::track(name.as_str(), *kappa, *phi, *tan_lambda, *mass, &matrix(name, covariance, 3)?),
    }
}

/// Row-major nested vectors to an `n x n` matrix.
fn matrix(object: &str, rows: &[Vec<f64>], n: usize) -> Result<DMatrix<f64>, SetupError> {
    let cols = rows.iter().map(Vec::len).find(|&len| len != n).unwrap_or(n);
    if rows.len() != n || cols != n {
        return Err(SetupError::CovarianceShape {
            object: object.to_string(),
            npar: n,
            rows: rows.len(),
            cols,
        });
    }
    Ok(DMatrix::from_fn(n, n, |i, j| rows[i][j]))
}

/// Massless, unmeasured photon pointing along the missing momentum.
fn photon_from_missing(missing: FourVector) -> Result<FitObject, SetupError> {
    let p = missing.p();
    if p > 0.0 {
        FitObject::neutrino(UNMEASURED_PHOTON, p, missing.theta(), missing.phi())
    } else {
        FitObject::neutrino(UNMEASURED_PHOTON, 1.0, std::f64::consts::FRAC_PI_2, 0.0)
    }
}

fn factors(f: &MomentumFactors) -> [f64; N_META] {
    [f.e, f.px, f.py, f.pz]
}

fn members(objects: &[usize], photon: Option<ObjectId>) -> ObjectList {
    objects.iter().map(|&i| ObjectId(i)).chain(photon).collect()
}

fn sided_members(name: &str, objects: &[usize], sides: &[u8]) -> Result<ObjectList, SetupError> {
    if sides.is_empty() {
        return Ok(objects.iter().map(|&i| (ObjectId(i), SIDE_ONE)).collect());
    }
    if sides.len() != objects.len() {
        return Err(SetupError::ValueCount {
            object: name.to_string(),
            expected: objects.len(),
            actual: sides.len(),
        });
    }
    Ok(objects.iter().zip(sides).map(|(&i, &side)| (ObjectId(i), side)).collect())
}

fn add_constraint(
    driver: &mut FitDriver,
    spec: &ConstraintSpec,
    beam: Option<FourVector>,
    photon: Option<ObjectId>,
) -> Result<(), SetupError> {
    match spec {
        ConstraintSpec::Momentum {
            name,
            factors: f,
            value,
            objects,
        } => {
            let c = MomentumConstraint::new(name.as_str(), factors(f), *value, members(objects, photon));
            driver.add_hard_constraint(c)?;
        }
        ConstraintSpec::Beam { objects } => {
            let beam = beam.ok_or_else(|| SetupError::MissingBeam {
                constraint: "beam".to_string(),
            })?;
            for c in MomentumConstraint::beam(beam, &members(objects, photon)) {
                driver.add_hard_constraint(c)?;
            }
        }
        ConstraintSpec::Mass {
            name,
            mass,
            objects,
            sides,
        } => {
            let c = MassConstraint::new(name.as_str(), *mass, sided_members(name, objects, sides)?);
            driver.add_hard_constraint(c)?;
        }
        ConstraintSpec::RecoilMass { name, mass, objects } => {
            let beam = beam.ok_or_else(|| SetupError::MissingBeam {
                constraint: name.clone(),
            })?;
            let c = RecoilMassConstraint::new(name.as_str(), *mass, beam, members(objects, photon));
            driver.add_hard_constraint(c)?;
        }
        ConstraintSpec::SoftGaussMass {
            name,
            mass,
            sigma,
            objects,
            sides,
        } => {
            let c = SoftMassConstraint::gauss(name.as_str(), *mass, *sigma, sided_members(name, objects, sides)?);
            driver.add_soft_constraint(c)?;
        }
        ConstraintSpec::SoftBwMass {
            name,
            mass,
            gamma,
            objects,
            sides,
        } => {
            let c = SoftMassConstraint::breit_wigner(name.as_str(), *mass, *gamma, sided_members(name, objects, sides)?);
            driver.add_soft_constraint(c)?;
        }
        ConstraintSpec::SoftGaussMomentum {
            name,
            factors: f,
            value,
            sigma,
            objects,
        } => {
            let members: ObjectList = objects.iter().map(|&i| ObjectId(i)).collect();
            let c = SoftMomentumConstraint::new(name.as_str(), factors(f), *value, *sigma, members);
            driver.add_soft_constraint(c)?;
        }
    }
    Ok(())
}

/// Solver options for `event`: its own options (or defaults) with CLI overrides on top.
pub fn resolve_options(event: &EventSpec, overrides: &OptionOverrides) -> SolverOptions {
    overrides.apply(&event.options.clone().unwrap_or_default())
}

/// Fit one event and summarize it.
pub fn run_event(
    event: &EventSpec,
    overrides: &OptionOverrides,
    unmeasured_photon: bool,
    tracer: TracerKind,
) -> Result<FitSummary, AppError> {
    let options = resolve_options(event, overrides);
    let mut driver = build_driver(event, options, unmeasured_photon)?;
    if tracer == TracerKind::Text {
        driver.add_tracer(Box::new(TextTracer::stdout()));
    }
    driver.fit();
    Ok(crate::report::summarize(&driver, event.name.as_deref()))
}

/// Fit independent events in parallel. Results keep the input order.
pub fn run_batch(
    events: &[EventSpec],
    overrides: &OptionOverrides,
    unmeasured_photon: bool,
) -> Result<Vec<FitSummary>, AppError> {
    events
        .par_iter()
        .enumerate()
        .map(|(i, event)| {
            run_event(event, overrides, unmeasured_photon, TracerKind::None).map_err(|e| {
                let label = event.name.clone().unwrap_or_else(|| format!("#{i}"));
                AppError::new(e.exit_code(), format!("event {label}: {e}"))
            })
        })
        .collect()
}
