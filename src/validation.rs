//! ==============================================================================
//! validation.rs - sensor payload normalization and validation
//! ==============================================================================
//!
//! purpose:
//!     turns whatever json the firmware sent into a batch of NewReading,
//!     or rejects the whole batch.
//!
//! rules:
//!     - a single object is a batch of one, an array is a batch
//!     - elements are checked in order, the first bad one fails the batch
//!     - bin_id and location must be non-empty strings, level a json number
//!     - level must lie in [0, 100] before rounding
//!     - surviving levels are rounded to the nearest integer (halves up)
//!
//! ==============================================================================

use serde_json::Value;
use thiserror::Error;

use crate::domain::NewReading;

pub const MIN_LEVEL: f64 = 0.0;
pub const MAX_LEVEL: f64 = 100.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Request body must contain at least one reading")]
    EmptyBatch,

    #[error("Missing required fields: bin_id, level, location")]
    MissingFields,

    #[error("Level must be between 0 and 100 for bin {bin_id}")]
    LevelOutOfRange { bin_id: String },
}

/// normalize a parsed body into a list of candidate elements
pub fn normalize(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// validate every element and produce the rows to insert
///
/// nothing is returned unless every element passes.
pub fn validate_batch(body: Value) -> Result<Vec<NewReading>, ValidationError> {
    let items = normalize(body);
    if items.is_empty() {
        return Err(ValidationError::EmptyBatch);
    }

    items.iter().map(validate_reading).collect()
}

/// validate one element of a batch
pub fn validate_reading(item: &Value) -> Result<NewReading, ValidationError> {
    let bin_id = non_empty_str(item.get("bin_id"));
    let level = item.get("level").and_then(Value::as_f64);
    let location = non_empty_str(item.get("location"));

    let (bin_id, level, location) = match (bin_id, level, location) {
        (Some(b), Some(l), Some(loc)) => (b, l, loc),
        _ => return Err(ValidationError::MissingFields),
    };

    if !(MIN_LEVEL..=MAX_LEVEL).contains(&level) {
        return Err(ValidationError::LevelOutOfRange {
            bin_id: bin_id.to_string(),
        });
    }

    Ok(NewReading {
        bin_id: bin_id.to_string(),
        level: round_level(level),
        location: location.to_string(),
    })
}

/// nearest integer; halves go away from zero, which is half up on [0, 100]
fn round_level(level: f64) -> i32 {
    level.round() as i32
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}
