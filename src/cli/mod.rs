//! Command-line parsing for the `kinfit` binary.
//!
//! Argument parsing and command dispatch stay separate from the solver code.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::{Engine, LineSearchMode, MeritMode, OptionOverrides, TracerKind};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "kinfit", version, about = "Constrained kinematic fitting of particle-physics events")]
pub struct Cli {
    /// More log output (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit one event and print a summary report.
    Fit(FitArgs),
    /// Fit an array of events in parallel and print one row per event.
    Batch(BatchArgs),
}

#[derive(Debug, Args, Clone)]
pub struct FitArgs {
    /// JSON event file.
    #[arg(long, value_name = "FILE")]
    pub event: PathBuf,

    #[command(flatten)]
    pub solver: SolverArgs,

    /// Print the iteration trace.
    #[arg(long, value_enum, default_value_t = TracerKind::None)]
    pub tracer: TracerKind,

    /// Export the fit summary to JSON.
    #[arg(long, value_name = "OUT")]
    pub json: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct BatchArgs {
    /// JSON file holding an array of events.
    #[arg(long, value_name = "FILE")]
    pub events: PathBuf,

    #[command(flatten)]
    pub solver: SolverArgs,

    /// Export all fit summaries to JSON.
    #[arg(long, value_name = "OUT")]
    pub json: Option<PathBuf>,
}

/// Solver flags shared by `fit` and `batch`. They override the event's own options.
#[derive(Debug, Args, Clone, Default)]
pub struct SolverArgs {
    #[arg(long, value_enum)]
    pub engine: Option<Engine>,

    #[arg(long, value_enum)]
    pub line_search: Option<LineSearchMode>,

    #[arg(long, value_enum)]
    pub merit: Option<MeritMode>,

    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Never try the second-order correction step.
    #[arg(long)]
    pub no_second_order_correction: bool,

    /// Add a fully unmeasured massless photon to every momentum and recoil constraint.
    #[arg(long)]
    pub unmeasured_photon: bool,
}

impl SolverArgs {
    pub fn overrides(&self) -> OptionOverrides {
        OptionOverrides {
            engine: self.engine,
            line_search: self.line_search,
            merit: self.merit,
            max_iterations: self.max_iterations,
            no_second_order_correction: self.no_second_order_correction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_flags_map_to_overrides() {
        let cli = Cli::parse_from([
            "kinfit", "-vv", "fit", "--event", "ev.json", "--engine", "opal", "--merit", "l1-scaled",
            "--tracer", "text", "--unmeasured-photon",
        ]);
        assert_eq!(cli.verbose, 2);
        let Command::Fit(args) = cli.command else {
            panic!("expected fit");
        };
        assert_eq!(args.tracer, TracerKind::Text);
        assert!(args.solver.unmeasured_photon);
        let overrides = args.solver.overrides();
        assert_eq!(overrides.engine, Some(Engine::Opal));
        assert_eq!(overrides.merit, Some(MeritMode::L1Scaled));
        assert_eq!(overrides.line_search, None);
    }

    #[test]
    fn batch_requires_events() {
        assert!(Cli::try_parse_from(["kinfit", "batch"]).is_err());
        let cli = Cli::parse_from(["kinfit", "batch", "--events", "all.json", "--max-iterations", "50"]);
        let Command::Batch(args) = cli.command else {
            panic!("expected batch");
        };
        assert_eq!(args.solver.max_iterations, Some(50));
    }
}
