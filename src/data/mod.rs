//! Core data models for the gas price feed
//!
//! This module contains the types that flow through a refresh cycle: the raw
//! payload as it comes off the wire, the decomposed snapshot, and the
//! per-city records persisted by the store.

pub mod decomposer;
pub mod fetcher;

pub use decomposer::{decompose, DecodeError};
pub use fetcher::{FeedFetcher, FeedSource, FetchError, DEFAULT_FEED_URL};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a city in the feed (`city_id`)
pub type CityId = i64;

/// Feed body as retrieved, with the upstream sentinel already stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    /// JSON text, not yet parsed
    pub body: String,
    /// When the body was retrieved
    pub retrieved_at: DateTime<Utc>,
}

impl RawPayload {
    /// Creates a payload stamped with the current time
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            retrieved_at: Utc::now(),
        }
    }
}

/// A single city's entry from the `gasprices` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityRecord {
    /// Unique city identifier
    pub city_id: CityId,
    /// City name, when the feed provides one
    pub name: Option<String>,
    /// Every field of the feed element, prices included
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// Compact JSON of the element, stored as-is for single-city lookups
    pub payload: String,
}

/// One complete retrieved-and-parsed feed payload
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// When the underlying payload was retrieved
    pub retrieved_at: DateTime<Utc>,
    /// Full payload, pretty-printed with a three space indent
    pub raw: String,
    /// City records keyed by city id
    pub cities: BTreeMap<CityId, CityRecord>,
}

impl Snapshot {
    /// Number of cities in the snapshot
    pub fn city_count(&self) -> usize {
        self.cities.len()
    }
}
