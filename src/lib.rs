//! Gas price feed cache
//!
//! Fetches the gas price feed, splits it into per-city records, keeps the
//! latest snapshot in a local store, and refreshes it at the evening refresh
//! windows (17:00, 20:00 and midnight local time).

pub mod cli;
pub mod data;
pub mod refresh;
pub mod schedule;
pub mod store;
