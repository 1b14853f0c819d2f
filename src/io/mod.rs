//! Input/output helpers.
//!
//! - JSON event files (`event`)
//! - fit summary exports (`export`)

pub mod event;
pub mod export;

pub use event::*;
pub use export::*;
