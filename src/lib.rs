//! `kinfit` library crate.
//!
//! Constrained kinematic fitting: measured particles are adjusted within
//! their errors until a set of kinematic constraints holds, minimizing χ².
//!
//! The binary (`kinfit`) is a thin wrapper around this library so that the
//! solver is testable without spawning processes and reusable from other
//! analysis code.

pub mod app;
pub mod cli;
pub mod constraints;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
pub mod trace;
