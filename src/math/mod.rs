//! Mathematical utilities: dense solves with fallbacks and distribution helpers.

pub mod linalg;
pub mod stats;

pub use linalg::*;
pub use stats::*;
