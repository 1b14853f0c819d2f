//! Chain rule from four-momentum derivatives to global parameters.
//!
//! ```text
//! ∂f/∂a       = Σ_m ∂f/∂P_m · ∂P_m/∂a
//! ∂²f/∂a∂b    = Σ_mn ∂²f/∂P_m∂Q_n · ∂P_m/∂a · ∂Q_n/∂b  +  Σ_m ∂f/∂P_m · ∂²P_m/∂a∂b
//! ```
//!
//! The second term only appears when `a` and `b` belong to the same object.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};

use super::ParticleFunction;
use crate::domain::{FitObject, Meta, N_META};

/// `∂f/∂a` over the global parameter vector of length `dim`.
pub fn global_gradient<F: ParticleFunction + ?Sized>(
    f: &F,
    objects: &[FitObject],
    dim: usize,
) -> DVector<f64> {
    let mut out = DVector::zeros(dim);
    add_global_gradient(f, objects, &mut out, 1.0);
    out
}

/// `y[g] += factor · ∂f/∂a_g`.
pub fn add_global_gradient<F: ParticleFunction + ?Sized>(
    f: &F,
    objects: &[FitObject],
    y: &mut DVector<f64>,
    factor: f64,
) {
    for (slot, member) in f.members().iter().enumerate() {
        let obj = &objects[member.id.index()];
        let d = f.first_derivatives(objects, slot);
        for local in 0..obj.npar() {
            if let Some(g) = obj.global_par_num(local) {
                y[g] += factor * local_derivative(obj, &d, local);
            }
        }
    }
}

/// `m[k, g] += ∂f/∂a_g` and the transposed entry; the constraint cross block.
pub fn add_jacobian_row<F: ParticleFunction + ?Sized>(
    f: &F,
    objects: &[FitObject],
    m: &mut DMatrix<f64>,
    k: usize,
) {
    for (slot, member) in f.members().iter().enumerate() {
        let obj = &objects[member.id.index()];
        let d = f.first_derivatives(objects, slot);
        for local in 0..obj.npar() {
            if let Some(g) = obj.global_par_num(local) {
                let v = local_derivative(obj, &d, local);
                m[(k, g)] += v;
                m[(g, k)] += v;
            }
        }
    }
}

/// `m[a, b] += factor · ∂²f/∂a∂b` over the parameter block.
pub fn add_global_second_derivatives<F: ParticleFunction + ?Sized>(
    f: &F,
    objects: &[FitObject],
    m: &mut DMatrix<f64>,
    factor: f64,
) {
    if factor == 0.0 {
        return;
    }
    let members = f.members().members();
    for (si, mi) in members.iter().enumerate() {
        let oi = &objects[mi.id.index()];

        let d = f.first_derivatives(objects, si);
        for a in 0..oi.npar() {
            let Some(ga) = oi.global_par_num(a) else {
                continue;
            };
            for b in 0..oi.npar() {
                let Some(gb) = oi.global_par_num(b) else {
                    continue;
                };
                let v: f64 = Meta::ALL
                    .iter()
                    .map(|&meta| d[meta.index()] * oi.second_derivative(meta, a, b))
                    .sum();
                m[(ga, gb)] += factor * v;
            }
        }

        for (sj, mj) in members.iter().enumerate() {
            let Some(d2) = f.second_derivatives(objects, si, sj) else {
                continue;
            };
            let oj = &objects[mj.id.index()];
            for a in 0..oi.npar() {
                let Some(ga) = oi.global_par_num(a) else {
                    continue;
                };
                for b in 0..oj.npar() {
                    let Some(gb) = oj.global_par_num(b) else {
                        continue;
                    };
                    let mut v = 0.0;
                    for (mu, row) in d2.iter().enumerate() {
                        let dpa = oi.first_derivative(Meta::ALL[mu], a);
                        if dpa == 0.0 {
                            continue;
                        }
                        for (nu, &d2mn) in row.iter().enumerate() {
                            v += d2mn * dpa * oj.first_derivative(Meta::ALL[nu], b);
                        }
                    }
                    m[(ga, gb)] += factor * v;
                }
            }
        }
    }
}

/// Error of `f` propagated from the measurement covariances of its members.
pub fn propagated_error<F: ParticleFunction + ?Sized>(f: &F, objects: &[FitObject]) -> f64 {
    let mut local: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    for (slot, member) in f.members().iter().enumerate() {
        let obj = &objects[member.id.index()];
        let d = f.first_derivatives(objects, slot);
        let grad = local
            .entry(member.id.index())
            .or_insert_with(|| vec![0.0; obj.npar()]);
        for (i, gi) in grad.iter_mut().enumerate() {
            *gi += local_derivative(obj, &d, i);
        }
    }
    let mut var = 0.0;
    for (idx, grad) in &local {
        let params = objects[*idx].parameters();
        let cov = params.covariance();
        for i in 0..grad.len() {
            if !params.contributes_to_chi2(i) {
                continue;
            }
            for j in 0..grad.len() {
                if params.contributes_to_chi2(j) {
                    var += grad[i] * cov[(i, j)] * grad[j];
                }
            }
        }
    }
    var.max(0.0).sqrt()
}

fn local_derivative(obj: &FitObject, d: &[f64; N_META], local: usize) -> f64 {
    Meta::ALL
        .iter()
        .map(|&meta| d[meta.index()] * obj.first_derivative(meta, local))
        .sum()
}
