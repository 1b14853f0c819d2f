//! Terminal formatting of fit summaries.
//!
//! Kept apart from the solver so output changes stay local.

use crate::domain::{FitSummary, ObjectSummary};

use super::batch_stats;

/// Full report for one fitted event.
pub fn format_fit_summary(summary: &FitSummary) -> String {
    let mut out = String::new();

    out.push_str("=== kinfit - constrained kinematic fit ===\n");
    if let Some(name) = &summary.event {
        out.push_str(&format!("Event: {name}\n"));
    }
    out.push_str(&format!("Engine: {}\n", summary.engine.display_name()));
    match &summary.error {
        Some(err) => out.push_str(&format!("Status: FAILED (code {}) {err}\n", summary.error_code)),
        None => out.push_str("Status: converged\n"),
    }
    out.push_str(&format!(
        "chi2={:.4} dof={} prob={} iterations={} covariance={}\n",
        summary.chi2,
        summary.dof,
        fmt_prob(summary.probability),
        summary.iterations,
        if summary.covariance_valid { "valid" } else { "n/a" },
    ));

    out.push_str("\nObjects:\n");
    for obj in &summary.objects {
        out.push_str(&format_object(obj));
    }

    if !summary.constraints.is_empty() {
        out.push_str("\nConstraints:\n");
        out.push_str(format!("{:<20} {:<5} {:>12} {:>10}", "name", "kind", "value", "chi2").trim_end());
        out.push('\n');
        out.push_str(format!("{:-<20} {:-<5} {:-<12} {:-<10}", "", "", "", "").trim_end());
        out.push('\n');
        for c in &summary.constraints {
            let kind = if c.soft { "soft" } else { "hard" };
            let chi2 = if c.soft { format!("{:.4}", c.chi2) } else { String::new() };
            out.push_str(format!("{:<20} {:<5} {:>12.3e} {:>10}", truncate(&c.name, 20), kind, c.value, chi2).trim_end());
            out.push('\n');
        }
    }

    out
}

fn format_object(obj: &ObjectSummary) -> String {
    let mut out = String::new();
    let p = obj.four_momentum;
    out.push_str(&format!(
        "- {} [{}] E={:.4} px={:.4} py={:.4} pz={:.4} m={:.4}\n",
        obj.name,
        obj.kind,
        p.e,
        p.px,
        p.py,
        p.pz,
        p.mass()
    ));
    for (i, name) in obj.parameter_names.iter().enumerate() {
        out.push_str(
            format!(
                "    {:<6} {:>12.5} -> {:>12.5} +- {:<10.4}",
                name, obj.measured[i], obj.fitted[i], obj.errors[i]
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out
}

/// One row per event followed by the aggregate.
pub fn format_batch_summary(summaries: &[FitSummary]) -> String {
    let mut out = String::new();

    out.push_str(format!("{:<20} {:>6} {:>10} {:>4} {:>8} {:>5}", "event", "code", "chi2", "dof", "prob", "iter").trim_end());
    out.push('\n');
    out.push_str(format!("{:-<20} {:-<6} {:-<10} {:-<4} {:-<8} {:-<5}", "", "", "", "", "", "").trim_end());
    out.push('\n');

    for (i, s) in summaries.iter().enumerate() {
        let name = s.event.clone().unwrap_or_else(|| format!("#{i}"));
        out.push_str(
            format!(
                "{:<20} {:>6} {:>10.4} {:>4} {:>8} {:>5}",
                truncate(&name, 20),
                s.error_code,
                s.chi2,
                s.dof,
                fmt_prob(s.probability),
                s.iterations
            )
            .trim_end(),
        );
        out.push('\n');
    }

    let stats = batch_stats(summaries);
    out.push_str(&format!(
        "\nEvents: {} | converged: {} ({:.1}%) | mean prob: {} | mean iterations: {:.2}\n",
        stats.events,
        stats.converged,
        100.0 * stats.converged_fraction(),
        stats.mean_probability.map_or_else(|| "n/a".to_string(), |p| format!("{p:.4}")),
        stats.mean_iterations,
    ));
    out
}

fn fmt_prob(p: f64) -> String {
    if p < 0.0 { "n/a".to_string() } else { format!("{p:.4}") }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConstraintSummary, Engine, FourVector};

    fn summary(event: &str, error_code: i32, probability: f64) -> FitSummary {
        FitSummary {
            event: Some(event.to_string()),
            engine: Engine::Opal,
            probability,
            chi2: 1.5,
            dof: 1,
            iterations: 4,
            error_code,
            error: (error_code != 0).then(|| "no convergence after 201 iterations".to_string()),
            covariance_valid: error_code == 0,
            objects: vec![ObjectSummary {
                name: "j1".to_string(),
                kind: "jet".to_string(),
                parameter_names: vec!["E".to_string(), "theta".to_string(), "phi".to_string()],
                measured: vec![50.0, 1.0, 0.5],
                fitted: vec![48.0, 1.01, 0.49],
                errors: vec![3.0, 0.01, 0.01],
                four_momentum: FourVector::new(48.0, 30.0, 20.0, 25.0),
            }],
            constraints: vec![ConstraintSummary {
                name: "W mass".to_string(),
                soft: false,
                value: 1e-9,
                chi2: 0.0,
            }],
        }
    }

    #[test]
    fn fit_summary_shows_status_and_tables() {
        let text = format_fit_summary(&summary("ev", 0, 0.22));
        assert!(text.contains("Engine: OPAL"));
        assert!(text.contains("Status: converged"));
        assert!(text.contains("prob=0.2200"));
        assert!(text.contains("- j1 [jet]"));
        assert!(text.contains("W mass"));
        assert!(text.lines().all(|l| l == l.trim_end()));

        let failed = format_fit_summary(&summary("ev", 1, -1.0));
        assert!(failed.contains("FAILED (code 1)"));
        assert!(failed.contains("prob=n/a"));
    }

    #[test]
    fn batch_summary_aggregates() {
        let text = format_batch_summary(&[summary("a", 0, 0.4), summary("b", 0, 0.2), summary("c", 2, -1.0)]);
        assert!(text.contains("converged: 2 (66.7%)"));
        assert!(text.contains("mean prob: 0.3000"));
    }

    #[test]
    fn truncate_marks_cut_names() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-name", 6), "a-ver.");
    }
}
