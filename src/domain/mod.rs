//! Domain types used throughout the fit.
//!
//! This module defines:
//!
//! - four-vectors and the (E, px, py, pz) component index (`FourVector`, `Meta`)
//! - per-object parameter storage (`ParameterSet`)
//! - fit objects and their handles (`FitObject`, `ObjectId`)
//! - configuration, event description and report types

pub mod fit_object;
pub mod four_vector;
pub mod parameters;
pub mod types;

pub use fit_object::*;
pub use four_vector::*;
pub use parameters::*;
pub use types::*;
