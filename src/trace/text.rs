//! Line-oriented tracer.
//!
//! Rows go through `log::info!` when a logger is listening at that level,
//! otherwise straight to the wrapped writer.

use std::io::{self, Write};

use super::{FitView, SUBSTEP_BISECTION, SUBSTEP_SECOND_ORDER, Tracer};
use crate::constraints::{HardConstraint, ParticleFunction};

pub struct TextTracer<W: Write + Send> {
    out: W,
    show_substeps: bool,
    show_objects: bool,
}

impl TextTracer<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> TextTracer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            show_substeps: true,
            show_objects: true,
        }
    }

    pub fn with_substeps(mut self, show: bool) -> Self {
        self.show_substeps = show;
        self
    }

    pub fn with_objects(mut self, show: bool) -> Self {
        self.show_objects = show;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, line: &str) {
        if log::log_enabled!(log::Level::Info) {
            log::info!("{line}");
        } else {
            // Tracing must never abort a fit.
            let _ = writeln!(self.out, "{line}");
        }
    }

    fn emit_objects(&mut self, view: &FitView<'_>) {
        let rows: Vec<String> = view
            .problem
            .objects()
            .iter()
            .map(|obj| {
                let p = obj.four_momentum();
                format!(
                    "    {:<10} E {:>10.4} px {:>10.4} py {:>10.4} pz {:>10.4} chi2 {:>9.3e}",
                    obj.name(),
                    p.e,
                    p.px,
                    p.py,
                    p.pz,
                    obj.chi2()
                )
            })
            .collect();
        for row in rows {
            self.emit(&row);
        }
    }
}

impl<W: Write + Send> Tracer for TextTracer<W> {
    fn initialize(&mut self, view: &FitView<'_>) {
        let line = format!(
            "{}: {} objects, {} hard and {} soft constraints, chi2 {:.5e}",
            view.engine.display_name(),
            view.problem.objects().len(),
            view.problem.hard_constraints().len(),
            view.problem.soft_constraints().len(),
            view.chi2
        );
        self.emit(&line);
        if self.show_objects {
            self.emit_objects(view);
        }
    }

    fn step(&mut self, view: &FitView<'_>) {
        let cmax = view
            .problem
            .hard_constraints()
            .iter()
            .map(|c| c.value(view.problem.objects()).abs())
            .fold(0.0, f64::max);
        let line = format!(
            "iter {:>4} | chi2 {:>12.5e} | max|c| {:>9.2e} | alpha {:>8.3e} | mu {:>9.3e} | det {:>9.2e}",
            view.iteration, view.chi2, cmax, view.values.alpha, view.values.mu, view.values.det_w
        );
        self.emit(&line);
    }

    fn substep(&mut self, view: &FitView<'_>, flag: u32) {
        if !self.show_substeps {
            return;
        }
        let kind = match flag {
            SUBSTEP_BISECTION => "bisect",
            SUBSTEP_SECOND_ORDER => "2nd-order",
            _ => "full",
        };
        let line = format!(
            "    {:<9} alpha {:>8.3e} | phi {:>12.5e}",
            kind, view.values.alpha, view.values.phi
        );
        self.emit(&line);
    }

    fn finish(&mut self, view: &FitView<'_>) {
        let line = format!(
            "done after {} iterations: chi2 {:.5e}, error {}",
            view.iteration, view.chi2, view.error_code
        );
        self.emit(&line);
        if self.show_objects {
            self.emit_objects(view);
        }
        for c in view.problem.hard_constraints() {
            let row = format!(
                "    {:<10} value {:>11.4e} (multiplier slot {})",
                c.name(),
                c.value(view.problem.objects()),
                c.global_num().map_or_else(|| "-".to_string(), |g| g.to_string())
            );
            self.emit(&row);
        }
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::DMatrix;

    use super::*;
    use crate::constraints::MassConstraint;
    use crate::domain::{Engine, FitObject, FourVector};
    use crate::fit::FitProblem;
    use crate::trace::{SUBSTEP_FULL, TraceValues};

    fn problem() -> FitProblem {
        let mut problem = FitProblem::new();
        let cov = DMatrix::from_diagonal_element(4, 4, 1.0);
        let a = problem.add_object(FitObject::px_py_pz_e("lep", FourVector::new(40.0, 30.0, 20.0, 17.3), &cov).unwrap());
        let b = problem.add_object(FitObject::px_py_pz_e("jet", FourVector::new(60.0, -10.0, 35.0, 40.0), &cov).unwrap());
        problem
            .add_hard(MassConstraint::new("w", 80.4, [a, b].into_iter().collect()).into())
            .unwrap();
        problem
    }

    fn view(problem: &FitProblem, iteration: usize) -> FitView<'_> {
        FitView {
            engine: Engine::Newton,
            iteration,
            chi2: 1.25,
            problem,
            values: TraceValues {
                alpha: 0.5,
                phi: 3.0,
                mu: 2.0,
                det_w: 1.0,
            },
            error_code: 0,
        }
    }

    fn replay(tracer: &mut TextTracer<Vec<u8>>, problem: &FitProblem) {
        tracer.initialize(&view(problem, 0));
        tracer.step(&view(problem, 0));
        tracer.substep(&view(problem, 0), SUBSTEP_FULL);
        tracer.substep(&view(problem, 0), SUBSTEP_BISECTION);
        tracer.substep(&view(problem, 0), SUBSTEP_SECOND_ORDER);
        tracer.step(&view(problem, 1));
        tracer.finish(&view(problem, 1));
    }

    #[test]
    fn writes_rows_to_the_wrapped_writer() {
        let problem = problem();
        let mut tracer = TextTracer::new(Vec::new());
        replay(&mut tracer, &problem);
        let text = String::from_utf8(tracer.into_inner()).unwrap();

        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("Newton (line search): 2 objects, 1 hard and 0 soft constraints"));
        assert!(lines[1].trim_start().starts_with("lep"));
        assert!(lines[2].trim_start().starts_with("jet"));
        assert!(lines[3].starts_with("iter    0"));
        assert!(lines[4].trim_start().starts_with("full"));
        assert!(lines[5].trim_start().starts_with("bisect"));
        assert!(lines[6].trim_start().starts_with("2nd-order"));
        assert!(lines[7].starts_with("iter    1"));
        assert!(lines[8].starts_with("done after 1 iterations"));
        assert!(lines[8].ends_with("error 0"));
        assert!(lines.last().unwrap().trim_start().starts_with("w"));
        assert!(lines.last().unwrap().contains("multiplier slot"));
    }

    #[test]
    fn quiet_tracer_skips_substeps_and_objects() {
        let problem = problem();
        let mut tracer = TextTracer::new(Vec::new()).with_substeps(false).with_objects(false);
        replay(&mut tracer, &problem);
        let text = String::from_utf8(tracer.into_inner()).unwrap();

        assert_eq!(text.lines().count(), 5);
        assert!(!text.contains("bisect") && !text.contains("2nd-order"));
        assert!(!text.contains("lep") && !text.contains("jet "));
        assert_eq!(text.lines().filter(|l| l.starts_with("iter")).count(), 2);
        assert!(text.contains("done after 1 iterations"));
    }
}
