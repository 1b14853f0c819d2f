//! Fit tracers: read-only observers of the solver.
//!
//! The engines call, in order:
//!
//! - `initialize` once, before the first iteration
//! - `step` at the top of every iteration and once after the loop
//! - `substep(flag)` for every line-search trial
//!   (0 = full step, 1 = bisection trial, 2 = second-order correction)
//! - `finish` once, after the covariance has been computed

pub mod text;

use crate::domain::Engine;
use crate::fit::FitProblem;

pub use text::TextTracer;

pub const SUBSTEP_FULL: u32 = 0;
pub const SUBSTEP_BISECTION: u32 = 1;
pub const SUBSTEP_SECOND_ORDER: u32 = 2;

/// Callback selector for [`TracerChain::notify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    Initialize,
    Step,
    Substep(u32),
    Finish,
}

/// Line-search internals of the current step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TraceValues {
    pub alpha: f64,
    pub phi: f64,
    pub mu: f64,
    /// Determinant of the scaled system matrix from the last LU attempt.
    pub det_w: f64,
}

/// Snapshot handed to tracers.
pub struct FitView<'a> {
    pub engine: Engine,
    pub iteration: usize,
    pub chi2: f64,
    pub problem: &'a FitProblem,
    pub values: TraceValues,
    /// Error code so far (0 while no failure occurred).
    pub error_code: i32,
}

pub trait Tracer: Send {
    fn initialize(&mut self, _view: &FitView<'_>) {}

    fn step(&mut self, _view: &FitView<'_>) {}

    fn substep(&mut self, _view: &FitView<'_>, _flag: u32) {}

    fn finish(&mut self, _view: &FitView<'_>) {}
}

/// Ordered set of tracers; every callback goes to all of them.
#[derive(Default)]
pub struct TracerChain {
    tracers: Vec<Box<dyn Tracer>>,
}

impl std::fmt::Debug for TracerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracerChain")
            .field("len", &self.tracers.len())
            .finish()
    }
}

impl TracerChain {
    pub fn push(&mut self, tracer: Box<dyn Tracer>) {
        self.tracers.push(tracer);
    }

    pub fn is_empty(&self) -> bool {
        self.tracers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracers.len()
    }

    pub fn clear(&mut self) {
        self.tracers.clear();
    }

    pub fn notify(&mut self, event: TraceEvent, view: &FitView<'_>) {
        match event {
            TraceEvent::Initialize => self.initialize(view),
            TraceEvent::Step => self.step(view),
            TraceEvent::Substep(flag) => self.substep(view, flag),
            TraceEvent::Finish => self.finish(view),
        }
    }

    pub fn initialize(&mut self, view: &FitView<'_>) {
        for t in &mut self.tracers {
            t.initialize(view);
        }
    }

    pub fn step(&mut self, view: &FitView<'_>) {
        for t in &mut self.tracers {
            t.step(view);
        }
    }

    pub fn substep(&mut self, view: &FitView<'_>, flag: u32) {
        for t in &mut self.tracers {
            t.substep(view, flag);
        }
    }

    pub fn finish(&mut self, view: &FitView<'_>) {
        for t in &mut self.tracers {
            t.finish(view);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use nalgebra::DMatrix;

    use super::*;
    use crate::constraints::MassConstraint;
    use crate::domain::{FitObject, FourVector};
    use crate::fit::FitDriver;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<TraceEvent>>>);

    impl Recorder {
        fn push(&self, event: TraceEvent) {
            self.0.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<TraceEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Tracer for Recorder {
        fn initialize(&mut self, _view: &FitView<'_>) {
            self.push(TraceEvent::Initialize);
        }

        fn step(&mut self, _view: &FitView<'_>) {
            self.push(TraceEvent::Step);
        }

        fn substep(&mut self, _view: &FitView<'_>, flag: u32) {
            self.push(TraceEvent::Substep(flag));
        }

        fn finish(&mut self, _view: &FitView<'_>) {
            self.push(TraceEvent::Finish);
        }
    }

    #[test]
    fn callbacks_arrive_in_solver_order() {
        // Only px is free: the mass constraint bends hard enough that the
        // first full step and its correction are both rejected.
        let mut driver = FitDriver::default();
        let id = driver.add_fit_object(
            FitObject::px_py_pz_e("p", FourVector::new(10.0, 6.0, 0.0, 0.0), &DMatrix::identity(4, 4)).unwrap(),
        );
        for i in 1..4 {
            driver.fit_object_mut(id).unwrap().fix_param(i, true);
        }
        driver
            .add_hard_constraint(MassConstraint::new("m", 4.0, [id].into_iter().collect()))
            .unwrap();
        let recorder = Recorder::default();
        driver.add_tracer(Box::new(recorder.clone()));
        driver.fit();
        assert!(driver.error().is_none(), "{:?}", driver.error());

        let events = recorder.events();
        assert_eq!(
            &events[..6],
            &[
                TraceEvent::Initialize,
                TraceEvent::Step,
                TraceEvent::Substep(SUBSTEP_FULL),
                TraceEvent::Substep(SUBSTEP_FULL),
                TraceEvent::Substep(SUBSTEP_SECOND_ORDER),
                TraceEvent::Substep(SUBSTEP_BISECTION),
            ]
        );
        assert_eq!(events.last(), Some(&TraceEvent::Finish));
        assert_eq!(events[events.len() - 2], TraceEvent::Step);
        assert_eq!(events.iter().filter(|e| **e == TraceEvent::Initialize).count(), 1);
        assert_eq!(events.iter().filter(|e| **e == TraceEvent::Finish).count(), 1);
        for e in &events {
            if let TraceEvent::Substep(flag) = e {
                assert!(*flag <= SUBSTEP_SECOND_ORDER);
            }
        }
        // one step per iteration plus the closing one
        let steps = events.iter().filter(|e| **e == TraceEvent::Step).count();
        assert!(steps > driver.iterations());
    }

    #[test]
    fn chain_forwards_to_every_tracer() {
        let a = Recorder::default();
        let b = Recorder::default();
        let mut chain = TracerChain::default();
        assert!(chain.is_empty());
        chain.push(Box::new(a.clone()));
        chain.push(Box::new(b.clone()));
        assert_eq!(chain.len(), 2);

        let problem = FitProblem::new();
        let view = FitView {
            engine: crate::domain::Engine::Newton,
            iteration: 0,
            chi2: 0.0,
            problem: &problem,
            values: TraceValues::default(),
            error_code: 0,
        };
        chain.notify(TraceEvent::Substep(SUBSTEP_BISECTION), &view);
        chain.notify(TraceEvent::Finish, &view);
        let expected = vec![TraceEvent::Substep(SUBSTEP_BISECTION), TraceEvent::Finish];
        assert_eq!(a.events(), expected);
        assert_eq!(b.events(), expected);

        chain.clear();
        assert!(chain.is_empty());
    }
}
