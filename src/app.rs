//! Top-level application orchestration.
//!
//! `src/main.rs` stays tiny; this module is the real main:
//! - parses CLI arguments and installs the logger
//! - reads event files
//! - runs the fit pipeline
//! - prints reports and writes optional exports

use clap::Parser;

use crate::cli::{BatchArgs, Command, FitArgs};
use crate::domain::RunConfig;
use crate::error::AppError;

pub mod pipeline;

/// Entry point for the `kinfit` binary.
pub fn run() -> Result<(), AppError> {
    let cli = crate::cli::Cli::parse();
    init_logger(cli.verbose);

    match cli.command {
        Command::Fit(args) => handle_fit(args),
        Command::Batch(args) => handle_batch(args),
    }
}

/// `RUST_LOG` wins; otherwise warnings, raised by each `-v`.
fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format_timestamp(None).parse_default_env();
    // A second init (tests, embedding) keeps the first logger.
    let _ = builder.try_init();
}

fn handle_fit(args: FitArgs) -> Result<(), AppError> {
    let config = run_config_from_fit_args(&args);
    let event = crate::io::read_event(&config.input)?;
    let summary = pipeline::run_event(&event, &config.overrides, config.unmeasured_photon, config.tracer)?;

    println!("{}", crate::report::format_fit_summary(&summary));

    if let Some(path) = &config.export_json {
        crate::io::write_summaries_json(path, std::slice::from_ref(&summary))?;
    }
    Ok(())
}

fn handle_batch(args: BatchArgs) -> Result<(), AppError> {
    let config = run_config_from_batch_args(&args);
    let events = crate::io::read_events(&config.input)?;
    let summaries = pipeline::run_batch(&events, &config.overrides, config.unmeasured_photon)?;

    println!("{}", crate::report::format_batch_summary(&summaries));

    if let Some(path) = &config.export_json {
        crate::io::write_summaries_json(path, &summaries)?;
    }
    Ok(())
}

pub fn run_config_from_fit_args(args: &FitArgs) -> RunConfig {
    RunConfig {
        input: args.event.clone(),
        overrides: args.solver.overrides(),
        tracer: args.tracer,
        unmeasured_photon: args.solver.unmeasured_photon,
        export_json: args.json.clone(),
    }
}

pub fn run_config_from_batch_args(args: &BatchArgs) -> RunConfig {
    RunConfig {
        input: args.events.clone(),
        overrides: args.solver.overrides(),
        tracer: crate::domain::TracerKind::None,
        unmeasured_photon: args.solver.unmeasured_photon,
        export_json: args.json.clone(),
    }
}
