//! Finite-difference checks of constraint derivatives.
//!
//! The analytic derivatives of a constraint are only useful if the chain
//! rule through the parameterizations reproduces them; these helpers perturb
//! the global parameters directly and compare.

use nalgebra::{DMatrix, DVector};

use super::ParticleFunction;
use super::chain::global_gradient;
use crate::domain::FitObject;

/// Assigns consecutive global indices to every free parameter; returns the count.
pub fn assign_global_indices(objects: &mut [FitObject]) -> usize {
    let mut next = 0;
    for obj in objects.iter_mut() {
        for i in 0..obj.npar() {
            if obj.is_param_fixed(i) {
                obj.set_global_par_num(i, None);
            } else {
                obj.set_global_par_num(i, Some(next));
                next += 1;
            }
        }
    }
    next
}

fn shifted(objects: &[FitObject], global: usize, delta: f64) -> Vec<FitObject> {
    let mut out = objects.to_vec();
    for obj in out.iter_mut() {
        for i in 0..obj.npar() {
            if obj.global_par_num(i) == Some(global) {
                let v = obj.param(i) + delta;
                obj.set_param(i, v);
            }
        }
    }
    out
}

fn step_for(objects: &[FitObject], global: usize, rel: f64) -> f64 {
    objects
        .iter()
        .flat_map(|obj| {
            (0..obj.npar())
                .filter(move |&i| obj.global_par_num(i) == Some(global))
                .map(move |i| obj.param(i).abs())
        })
        .fold(rel, |acc, v| acc.max(rel * v))
}

/// Central-difference `∂f/∂a` over `dim` global parameters.
pub fn numeric_gradient<F: ParticleFunction + ?Sized>(
    f: &F,
    objects: &[FitObject],
    dim: usize,
    rel_step: f64,
) -> DVector<f64> {
    DVector::from_fn(dim, |g, _| {
        let h = step_for(objects, g, rel_step);
        let up = f.value(&shifted(objects, g, h));
        let down = f.value(&shifted(objects, g, -h));
        (up - down) / (2.0 * h)
    })
}

/// Central differences of the analytic gradient; compares against the
/// second-derivative chain rule.
pub fn numeric_hessian<F: ParticleFunction + ?Sized>(
    f: &F,
    objects: &[FitObject],
    dim: usize,
    rel_step: f64,
) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(dim, dim);
    for g in 0..dim {
        let h = step_for(objects, g, rel_step);
        let up = global_gradient(f, &shifted(objects, g, h), dim);
        let down = global_gradient(f, &shifted(objects, g, -h), dim);
        let col = (up - down) / (2.0 * h);
        out.set_column(g, &col);
    }
    out
}

/// Largest deviation between analytic and numeric derivatives, relative to
/// `1 + |analytic|`.
pub fn max_relative_deviation(analytic: &[f64], numeric: &[f64]) -> f64 {
    analytic
        .iter()
        .zip(numeric.iter())
        .map(|(a, n)| (a - n).abs() / (1.0 + a.abs()))
        .fold(0.0, f64::max)
}
