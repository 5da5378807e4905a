//! ==============================================================================
//! domain.rs - readings, bins, and the current-level view
//! ==============================================================================
//!
//! purpose:
//!     the shapes that flow between the endpoint and the store.
//!     a bin has no record of its own; it only exists through its readings.
//!
//! relationships:
//!     - produced by: validation.rs (NewReading)
//!     - persisted by: store.rs (Reading)
//!     - served by: api.rs (Reading, BinSnapshot)
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// one stored sensor report, as returned by the store
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Reading {
    /// assigned by the store on insert
    pub id: String,
    /// physical bin identifier (e.g., "001")
    pub bin_id: String,
    /// fill level in percent, 0-100
    pub level: i32,
    /// human readable placement (e.g., "Lobby")
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// a validated reading that has not been stored yet
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct NewReading {
    pub bin_id: String,
    pub level: i32,
    pub location: String,
}

/// how full a bin is, in dashboard terms
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    Available,
    HalfFull,
    NearlyFull,
    Full,
}

impl FillStatus {
    pub fn from_level(level: i32) -> Self {
        match level {
            l if l >= 90 => FillStatus::Full,
            l if l >= 75 => FillStatus::NearlyFull,
            l if l >= 50 => FillStatus::HalfFull,
            _ => FillStatus::Available,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FillStatus::Full => "FULL - Needs Collection",
            FillStatus::NearlyFull => "Nearly Full",
            FillStatus::HalfFull => "Half Full",
            FillStatus::Available => "Available",
        }
    }
}

/// current state of one bin, derived from its newest reading
#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct BinSnapshot {
    pub bin_id: String,
    pub level: i32,
    pub location: String,
    pub status: FillStatus,
    /// dashboard wording for `status`
    pub status_label: &'static str,
    pub last_updated: DateTime<Utc>,
}

impl From<&Reading> for BinSnapshot {
    fn from(r: &Reading) -> Self {
        Self {
            bin_id: r.bin_id.clone(),
            level: r.level,
            location: r.location.clone(),
            status: FillStatus::from_level(r.level),
            status_label: FillStatus::from_level(r.level).label(),
            last_updated: r.created_at,
        }
    }
}

/// reduce a reading history to the newest reading per bin
///
/// computed on every call, never cached. on equal `created_at` the reading
/// seen first wins. output is ordered newest first.
pub fn latest_per_bin(readings: &[Reading]) -> Vec<BinSnapshot> {
    let mut newest: HashMap<&str, &Reading> = HashMap::new();
    for r in readings {
        let replace = newest
            .get(r.bin_id.as_str())
            .map_or(true, |current| current.created_at < r.created_at);
        if replace {
            newest.insert(r.bin_id.as_str(), r);
        }
    }

    let mut bins: Vec<BinSnapshot> = newest.into_values().map(BinSnapshot::from).collect();
    bins.sort_by(|a, b| {
        b.last_updated
            .cmp(&a.last_updated)
            .then_with(|| a.bin_id.cmp(&b.bin_id))
    });
    bins
}
