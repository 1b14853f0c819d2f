//! Global system assembly.
//!
//! The global vector is `x = (a_0 … a_{npar-1}, λ_0 … λ_{ncon-1})`: the free
//! parameters of all objects followed by one Lagrange multiplier per hard
//! constraint. For the Lagrangian `L = χ² + Σ λ_k c_k`:
//!
//! ```text
//! y = ∂L/∂x = [ ∂χ²/∂a + Σ λ_k ∂c_k/∂a ]     M = ∂²L/∂x² = [ ∂²χ²/∂a² + Σ λ_k ∂²c_k/∂a²   Jᵀ ]
//!             [ c                      ]                    [ J                          0  ]
//! ```
//!
//! Soft constraints enter `χ²` directly.

use nalgebra::{DMatrix, DVector};

use super::FitProblem;
use crate::constraints::chain::{add_global_gradient, add_global_second_derivatives, add_jacobian_row, propagated_error};
use crate::constraints::{HardConstraint, ParticleFunction, SoftConstraint};
use crate::error::FitError;

/// Order in which free parameters receive global indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrder {
    /// Object by object, measured and unmeasured interleaved.
    ObjectOrder,
    /// All measured parameters first, then all unmeasured ones.
    MeasuredFirst,
}

/// Dimensions of the global system for one fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Layout {
    pub npar: usize,
    /// Free parameters that contribute to χ².
    pub nmea: usize,
    /// Free parameters without a measurement.
    pub nunm: usize,
    pub ncon: usize,
    pub nsoft: usize,
}

impl Layout {
    pub fn idim(&self) -> usize {
        self.npar + self.ncon
    }

    pub fn dof(&self) -> i32 {
        self.ncon as i32 + self.nsoft as i32 - self.nunm as i32
    }
}

/// Assigns global indices to free parameters and hard constraints, and drops
/// any fitted covariance from a previous fit.
pub fn initialize(problem: &mut FitProblem, order: IndexOrder) -> Layout {
    let mut layout = Layout::default();
    let passes: &[Option<bool>] = match order {
        IndexOrder::ObjectOrder => &[None],
        IndexOrder::MeasuredFirst => &[Some(true), Some(false)],
    };
    for obj in problem.objects_mut() {
        for i in 0..obj.npar() {
            obj.set_global_par_num(i, None);
        }
        obj.set_fitted_covariance(None);
    }
    for &pass in passes {
        for obj in problem.objects_mut() {
            for i in 0..obj.npar() {
                if obj.is_param_fixed(i) {
                    continue;
                }
                let measured = obj.is_param_measured(i);
                if pass.is_some_and(|want| want != measured) {
                    continue;
                }
                obj.set_global_par_num(i, Some(layout.npar));
                layout.npar += 1;
                if measured {
                    layout.nmea += 1;
                } else {
                    layout.nunm += 1;
                }
            }
        }
    }
    let npar = layout.npar;
    for (k, c) in problem.hard_constraints_mut().iter_mut().enumerate() {
        c.set_global_num(Some(npar + k));
    }
    layout.ncon = problem.hard_constraints().len();
    layout.nsoft = problem.soft_constraints().len();
    layout
}

/// Fails when a measured object has a singular covariance.
pub fn check_covariances(problem: &FitProblem) -> Result<(), FitError> {
    match problem.objects().iter().find(|o| !o.has_valid_covariance()) {
        Some(obj) => Err(FitError::InvalidCovariance {
            object: obj.name().to_string(),
        }),
        None => Ok(()),
    }
}

/// Copies the current parameter values into `x[0..npar]`.
pub fn fill_x(problem: &FitProblem, x: &mut DVector<f64>) {
    for obj in problem.objects() {
        for i in 0..obj.npar() {
            if let Some(g) = obj.global_par_num(i) {
                x[g] = obj.param(i);
            }
        }
    }
}

/// Scale vector: parameter errors (1 when zero) and inverse constraint
/// errors (1 when zero) for the multiplier rows.
pub fn fill_errors(problem: &FitProblem, layout: &Layout, e: &mut DVector<f64>) {
    e.fill(1.0);
    for obj in problem.objects() {
        for i in 0..obj.npar() {
            if let Some(g) = obj.global_par_num(i) {
                let err = obj.error(i);
                if err > 0.0 && err.is_finite() {
                    e[g] = err;
                }
            }
        }
    }
    for (k, c) in problem.hard_constraints().iter().enumerate() {
        let err = propagated_error(c, problem.objects());
        if err > 0.0 && err.is_finite() {
            e[layout.npar + k] = 1.0 / err;
        }
    }
}

/// Pushes `x` into the objects; normalized values are written back into `x`.
pub fn update_params(problem: &mut FitProblem, x: &mut DVector<f64>) -> bool {
    let mut significant = false;
    for obj in problem.objects_mut() {
        significant |= obj.update_params(x);
    }
    significant
}

/// `M` at the current object state; `x` supplies the multipliers.
///
/// With `error_propagation` the multiplier-weighted second derivatives of the
/// hard constraints are left out.
pub fn assemble_m(problem: &FitProblem, layout: &Layout, x: &DVector<f64>, error_propagation: bool) -> DMatrix<f64> {
    let objects = problem.objects();
    let mut m = DMatrix::zeros(layout.idim(), layout.idim());
    for obj in objects {
        obj.add_to_global_chi2_der_matrix(&mut m, 1.0);
    }
    for (k, c) in problem.hard_constraints().iter().enumerate() {
        let kg = layout.npar + k;
        add_jacobian_row(c, objects, &mut m, kg);
        if !error_propagation {
            add_global_second_derivatives(c, objects, &mut m, x[kg]);
        }
    }
    add_soft_second_derivatives(problem, layout, &mut m);
    m
}

/// `y` at the current object state; `x` supplies the multipliers.
pub fn assemble_y(problem: &FitProblem, layout: &Layout, x: &DVector<f64>) -> DVector<f64> {
    let objects = problem.objects();
    let mut y = DVector::zeros(layout.idim());
    for obj in objects {
        obj.add_to_global_chi2_der_vector(&mut y);
    }
    for (k, c) in problem.hard_constraints().iter().enumerate() {
        let kg = layout.npar + k;
        add_global_gradient(c, objects, &mut y, x[kg]);
        y[kg] = c.value(objects);
    }
    for c in problem.soft_constraints() {
        let pv = c.penalty().evaluate(c.value(objects));
        add_global_gradient(c, objects, &mut y, pv.d1);
    }
    y
}

/// `∂χ²/∂a` (objects and soft constraints) over the parameter block.
pub fn chi2_gradient(problem: &FitProblem, layout: &Layout) -> DVector<f64> {
    let objects = problem.objects();
    let mut g = DVector::zeros(layout.npar);
    for obj in objects {
        obj.add_to_global_chi2_der_vector(&mut g);
    }
    for c in problem.soft_constraints() {
        let pv = c.penalty().evaluate(c.value(objects));
        add_global_gradient(c, objects, &mut g, pv.d1);
    }
    g
}

/// `∂²χ²/∂a²` (objects and soft constraints) over the parameter block.
pub fn chi2_hessian(problem: &FitProblem, layout: &Layout) -> DMatrix<f64> {
    let mut m = DMatrix::zeros(layout.npar, layout.npar);
    for obj in problem.objects() {
        obj.add_to_global_chi2_der_matrix(&mut m, 1.0);
    }
    add_soft_second_derivatives(problem, layout, &mut m);
    m
}

fn add_soft_second_derivatives(problem: &FitProblem, layout: &Layout, m: &mut DMatrix<f64>) {
    let objects = problem.objects();
    for c in problem.soft_constraints() {
        let pv = c.penalty().evaluate(c.value(objects));
        let mut grad = DVector::zeros(layout.npar);
        add_global_gradient(c, objects, &mut grad, 1.0);
        for i in 0..layout.npar {
            if grad[i] == 0.0 {
                continue;
            }
            for j in 0..layout.npar {
                m[(i, j)] += pv.d2 * grad[i] * grad[j];
            }
        }
        add_global_second_derivatives(c, objects, m, pv.d1);
    }
}

/// `J[k][g] = ∂c_k/∂a_g`, shape `ncon × npar`.
pub fn constraint_jacobian(problem: &FitProblem, layout: &Layout) -> DMatrix<f64> {
    let objects = problem.objects();
    let mut j = DMatrix::zeros(layout.ncon, layout.npar);
    for (k, c) in problem.hard_constraints().iter().enumerate() {
        let mut row = DVector::zeros(layout.npar);
        add_global_gradient(c, objects, &mut row, 1.0);
        j.set_row(k, &row.transpose());
    }
    j
}

pub fn constraint_values(problem: &FitProblem) -> DVector<f64> {
    let objects = problem.objects();
    DVector::from_iterator(
        problem.hard_constraints().len(),
        problem.hard_constraints().iter().map(|c| c.value(objects)),
    )
}

/// Measurement covariance of the free parameters, `npar × npar`; rows of
/// unmeasured parameters are zero.
pub fn measured_covariance(problem: &FitProblem, layout: &Layout) -> DMatrix<f64> {
    let mut v = DMatrix::zeros(layout.npar, layout.npar);
    for obj in problem.objects() {
        obj.add_to_global_cov(&mut v);
    }
    v
}

/// Writes the parameter block of a global covariance into the objects.
/// Fixed parameters get zero rows and columns.
pub fn write_fitted_covariance(problem: &mut FitProblem, cov: &DMatrix<f64>) {
    for obj in problem.objects_mut() {
        let n = obj.npar();
        let local = DMatrix::from_fn(n, n, |i, j| {
            match (obj.global_par_num(i), obj.global_par_num(j)) {
                (Some(gi), Some(gj)) => cov[(gi, gj)],
                _ => 0.0,
            }
        });
        obj.set_fitted_covariance(Some(local));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::{MomentumConstraint, SoftMassConstraint};
    use crate::domain::{FitObject, Meta};

    fn problem() -> FitProblem {
        let mut p = FitProblem::new();
        let j1 = p.add_object(FitObject::jet("j1", 50.0, 1.2, 0.3, [5.0, 0.02, 0.02], 0.0).unwrap());
        let nu = p.add_object(FitObject::neutrino("nu", 20.0, 1.9, -2.5).unwrap());
        let j2 = p.add_object(FitObject::jet("j2", 40.0, 2.0, 2.7, [4.0, 0.02, 0.02], 0.0).unwrap());
        let all: crate::constraints::ObjectList = [j1, nu, j2].into_iter().collect();
        p.add_hard(MomentumConstraint::component("px", Meta::Px, 0.0, all).into())
            .unwrap();
        p.add_soft(SoftMassConstraint::gauss("m", 80.0, 3.0, [j1, j2].into_iter().collect()).into())
            .unwrap();
        p
    }

    #[test]
    fn object_order_interleaves_unmeasured_parameters() {
        let mut p = problem();
        let layout = initialize(&mut p, IndexOrder::ObjectOrder);
        assert_eq!(layout.npar, 9);
        assert_eq!(layout.nunm, 3);
        assert_eq!(layout.ncon, 1);
        assert_eq!(layout.dof(), 1 + 1 - 3);
        assert_eq!(p.objects()[1].global_par_num(0), Some(3));
        assert_eq!(p.hard_constraints()[0].global_num(), Some(9));
    }

    #[test]
    fn measured_first_puts_unmeasured_last() {
        let mut p = problem();
        initialize(&mut p, IndexOrder::MeasuredFirst);
        assert_eq!(p.objects()[2].global_par_num(0), Some(3));
        assert_eq!(p.objects()[1].global_par_num(0), Some(6));
        assert_eq!(p.objects()[1].global_par_num(2), Some(8));
    }

    #[test]
    fn system_matrix_is_symmetric_with_constraint_rows() {
        let mut p = problem();
        let layout = initialize(&mut p, IndexOrder::ObjectOrder);
        let mut x = DVector::zeros(layout.idim());
        fill_x(&p, &mut x);
        x[layout.npar] = 0.7;
        let m = assemble_m(&p, &layout, &x, false);
        assert!((&m - m.transpose()).amax() < 1e-9);
        let j = constraint_jacobian(&p, &layout);
        for g in 0..layout.npar {
            assert!((m[(layout.npar, g)] - j[(0, g)]).abs() < 1e-12);
        }
        let y = assemble_y(&p, &layout, &x);
        assert!((y[layout.npar] - constraint_values(&p)[0]).abs() < 1e-12);
    }

    #[test]
    fn gradient_matches_chi2_finite_differences() {
        let mut p = problem();
        let layout = initialize(&mut p, IndexOrder::ObjectOrder);
        let mut x = DVector::zeros(layout.idim());
        fill_x(&p, &mut x);
        // move away from the measurement so the object terms are non-zero
        x[0] += 3.0;
        x[7] -= 0.01;
        update_params(&mut p, &mut x);
        let g = chi2_gradient(&p, &layout);
        for i in 0..layout.npar {
            let h = 1e-6 * x[i].abs().max(1.0);
            let mut up = p.clone();
            let mut xu = x.clone();
            xu[i] += h;
            update_params(&mut up, &mut xu);
            let mut down = p.clone();
            let mut xd = x.clone();
            xd[i] -= h;
            update_params(&mut down, &mut xd);
            let numeric = (up.chi2() - down.chi2()) / (2.0 * h);
            assert!((numeric - g[i]).abs() < 1e-4 * (1.0 + g[i].abs()), "param {i}");
        }
    }

    #[test]
    fn scale_vector_uses_inverse_constraint_error() {
        let mut p = problem();
        let layout = initialize(&mut p, IndexOrder::ObjectOrder);
        let mut e = DVector::zeros(layout.idim());
        fill_errors(&p, &layout, &mut e);
        assert_eq!(e[0], 5.0);
        assert_eq!(e[3], 1.0);
        let err = propagated_error(&p.hard_constraints()[0], p.objects());
        assert!((e[layout.npar] - 1.0 / err).abs() < 1e-12);
    }
}
