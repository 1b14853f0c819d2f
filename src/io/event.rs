//! Read JSON event descriptions.
//!
//! A file holds either one event object or, for `batch`, an array of them.
//! Errors map to exit code 2.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::domain::EventSpec;
use crate::error::AppError;

/// Read a single event.
pub fn read_event(path: &Path) -> Result<EventSpec, AppError> {
    let reader = open(path)?;
    serde_json::from_reader(reader)
        .map_err(|e| AppError::new(2, format!("Invalid event JSON '{}': {e}", path.display())))
}

/// Read an array of events. A single event object is accepted as a batch of one.
pub fn read_events(path: &Path) -> Result<Vec<EventSpec>, AppError> {
    let reader = open(path)?;
    let value: serde_json::Value = serde_json::from_reader(reader)
        .map_err(|e| AppError::new(2, format!("Invalid JSON '{}': {e}", path.display())))?;
    parse_events(value).map_err(|e| AppError::new(2, format!("Invalid events in '{}': {e}", path.display())))
}

fn parse_events(value: serde_json::Value) -> Result<Vec<EventSpec>, serde_json::Error> {
    if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|event| vec![event])
    }
}

fn open(path: &Path) -> Result<BufReader<File>, AppError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| AppError::new(2, format!("Failed to open '{}': {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConstraintSpec, ObjectSpec};

    const EVENT: &str = r#"{
        "name": "ww",
        "objects": [
            { "kind": "jet", "name": "j1", "e": 45.0, "theta": 1.2, "phi": 0.3, "errors": [4.0, 0.02, 0.02] },
            { "kind": "neutrino", "name": "nu", "e": 30.0, "theta": 2.0, "phi": -2.5 }
        ],
        "constraints": [
            { "kind": "beam", "objects": [0, 1] },
            { "kind": "mass", "name": "W", "mass": 80.4, "objects": [0, 1] }
        ],
        "beam": { "e": 200.0, "px": 0.0, "py": 0.0, "pz": 0.0 },
        "options": { "engine": "opal" }
    }"#;

    #[test]
    fn single_event_parses() {
        let event: EventSpec = serde_json::from_str(EVENT).unwrap();
        assert_eq!(event.name.as_deref(), Some("ww"));
        assert!(matches!(event.objects[0], ObjectSpec::Jet { mass, .. } if mass == 0.0));
        assert!(matches!(event.constraints[0], ConstraintSpec::Beam { .. }));
        assert_eq!(event.beam.map(|b| b.e), Some(200.0));
    }

    #[test]
    fn single_object_is_a_batch_of_one() {
        let value: serde_json::Value = serde_json::from_str(EVENT).unwrap();
        assert_eq!(parse_events(value).unwrap().len(), 1);
        let value: serde_json::Value = serde_json::from_str(&format!("[{EVENT}, {EVENT}]")).unwrap();
        assert_eq!(parse_events(value).unwrap().len(), 2);
    }

    #[test]
    fn missing_file_is_exit_code_two() {
        let err = read_event(Path::new("/nonexistent/kinfit-event.json")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
