//! Persistent store for the latest gas price snapshot
//!
//! This module provides a key-value store that keeps the raw feed snapshot,
//! one blob per city (keyed `city:<id>`), the refresh metadata, and the
//! per-widget city selections. Snapshot commits are atomic with respect to
//! readers, and every commit is announced to subscribers once it is on disk.

mod price_store;

pub use price_store::{PriceStore, StoreError, StoreView};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::CityId;

/// Identifier of a configured widget instance
pub type WidgetId = u32;

/// City shown by one widget instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetSelection {
    /// Widget instance this selection belongs to
    pub widget_id: WidgetId,
    /// Selected city
    pub city_id: CityId,
    /// City name, kept alongside so widgets can render without a lookup
    pub city_name: String,
}

/// Outcome of the most recent refresh attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    /// A new snapshot was committed
    Updated,
    /// The eligibility gate was closed; nothing was fetched
    Skipped,
    /// The feed could not be retrieved
    FetchFailed,
    /// The feed was retrieved but could not be decomposed
    DecodeFailed,
}

impl RefreshStatus {
    /// Whether the attempt produced new data
    pub fn is_success(self) -> bool {
        matches!(self, RefreshStatus::Updated)
    }
}

impl fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RefreshStatus::Updated => "updated",
            RefreshStatus::Skipped => "skipped",
            RefreshStatus::FetchFailed => "fetch failed",
            RefreshStatus::DecodeFailed => "decode failed",
        };
        f.write_str(label)
    }
}

/// What the refresh cycle records after each completed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// When the attempt finished
    pub attempted_at: DateTime<Utc>,
    /// How it ended
    pub status: RefreshStatus,
    /// When the next attempt is scheduled
    pub next_refresh: DateTime<Utc>,
}

/// Refresh bookkeeping as seen by readers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshMetadata {
    /// When the last snapshot was retrieved; absent before the first success
    pub last_updated: Option<DateTime<Utc>>,
    /// When the next refresh is scheduled
    pub next_refresh: Option<DateTime<Utc>>,
    /// When the last attempt finished, whatever its outcome
    pub last_attempt: Option<DateTime<Utc>>,
    /// Outcome of the last attempt
    pub last_status: Option<RefreshStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_status_serializes_snake_case() {
        let json = serde_json::to_string(&RefreshStatus::FetchFailed).unwrap();
        assert_eq!(json, "\"fetch_failed\"");
    }

    #[test]
    fn test_only_updated_is_success() {
        assert!(RefreshStatus::Updated.is_success());
        assert!(!RefreshStatus::Skipped.is_success());
        assert!(!RefreshStatus::FetchFailed.is_success());
        assert!(!RefreshStatus::DecodeFailed.is_success());
    }

    #[test]
    fn test_refresh_status_display() {
        assert_eq!(RefreshStatus::Updated.to_string(), "updated");
        assert_eq!(RefreshStatus::DecodeFailed.to_string(), "decode failed");
    }

    #[test]
    fn test_metadata_default_is_empty() {
        let metadata = RefreshMetadata::default();
        assert!(metadata.last_updated.is_none());
        assert!(metadata.next_refresh.is_none());
        assert!(metadata.last_attempt.is_none());
        assert!(metadata.last_status.is_none());
    }
}
