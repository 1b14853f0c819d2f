//! Export fit summaries as JSON.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::domain::FitSummary;
use crate::error::AppError;

/// Write one or more summaries; a single summary is written as an object.
pub fn write_summaries_json(path: &Path, summaries: &[FitSummary]) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create export JSON '{}': {e}", path.display())))?;
    let writer = BufWriter::new(file);

    let result = match summaries {
        [single] => serde_json::to_writer_pretty(writer, single),
        many => serde_json::to_writer_pretty(writer, many),
    };
    result.map_err(|e| AppError::new(2, format!("Failed to write export JSON: {e}")))
}
