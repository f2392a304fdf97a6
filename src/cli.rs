//! Command-line interface parsing for the gas price cache
//!
//! This module handles parsing of CLI arguments using clap. Global options
//! configure the feed, the store and the background-data gate; subcommands
//! select what to do with them.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use clap::{ArgAction, Parser, Subcommand};
use thiserror::Error;

use crate::data::{CityId, DEFAULT_FEED_URL};
use crate::refresh::RefreshConfig;
use crate::store::WidgetId;

/// Format accepted by `next-refresh --at`
const LOCAL_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// The feed URL is not an http(s) URL
    #[error("Invalid feed URL: '{0}'. Expected an http:// or https:// URL")]
    InvalidFeedUrl(String),

    /// The time could not be parsed or does not exist locally
    #[error("Invalid local time: '{0}'. Expected YYYY-MM-DDTHH:MM:SS")]
    InvalidTime(String),
}

/// Gas price feed cache with scheduled evening refreshes
#[derive(Parser, Debug)]
#[command(name = "gasprices")]
#[command(about = "Gas price feed cache with scheduled evening refreshes")]
#[command(version)]
pub struct Cli {
    /// Directory holding the price store (defaults to the XDG data directory)
    #[arg(long, global = true, env = "GASPRICES_STORE_DIR", value_name = "DIR")]
    pub store_dir: Option<PathBuf>,

    /// Gas price feed endpoint
    #[arg(long, global = true, env = "GASPRICES_FEED_URL", value_name = "URL", default_value = DEFAULT_FEED_URL)]
    pub feed_url: String,

    /// Whether refreshes may use the network; when false every refresh is skipped
    #[arg(
        long,
        global = true,
        env = "GASPRICES_BACKGROUND_DATA",
        value_name = "BOOL",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub background_data: bool,

    /// Request timeout for the feed fetch, in seconds
    #[arg(long, global = true, value_name = "SECONDS")]
    pub fetch_timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

/// What to do
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Refresh now, then at every refresh window until interrupted
    Run,
    /// Run a single refresh cycle and print its outcome
    Refresh,
    /// Print the cached snapshot, or one city's record
    Show {
        /// Only print this city's record
        #[arg(long, value_name = "CITY_ID")]
        city: Option<CityId>,
    },
    /// Print the refresh window that follows a local time
    NextRefresh {
        /// Local time to start from (defaults to now)
        #[arg(long, value_name = "YYYY-MM-DDTHH:MM:SS")]
        at: Option<String>,
    },
    /// Configure which city each widget shows
    #[command(subcommand)]
    Widget(WidgetCommand),
    /// Set the application-wide selected city
    SelectCity {
        /// City to select
        city_id: CityId,
    },
}

/// Widget configuration subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum WidgetCommand {
    /// Select the city shown by a widget
    Set {
        /// Widget instance id
        widget_id: WidgetId,
        /// City to show
        city_id: CityId,
        /// City name to display
        city_name: String,
    },
    /// Remove widget selections
    Clear {
        /// Widget instance ids
        #[arg(required = true)]
        widget_ids: Vec<WidgetId>,
    },
    /// List widget selections
    List,
}

impl Cli {
    /// Builds the refresh configuration from the global options
    ///
    /// # Returns
    /// * `Ok(RefreshConfig)` with the parsed settings
    /// * `Err(CliError::InvalidFeedUrl)` if the feed URL is not http(s)
    pub fn refresh_config(&self) -> Result<RefreshConfig, CliError> {
        let url = self.feed_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(CliError::InvalidFeedUrl(self.feed_url.clone()));
        }

        Ok(RefreshConfig {
            feed_url: url.to_string(),
            store_dir: self.store_dir.clone(),
            background_data: self.background_data,
            fetch_timeout: self.fetch_timeout_secs.map(Duration::from_secs),
        })
    }
}

/// Parses a local wall-clock time argument
///
/// Times repeated by a daylight-saving change resolve to the earlier instant.
pub fn parse_local_time(s: &str) -> Result<DateTime<Local>, CliError> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), LOCAL_TIME_FORMAT)
        .map_err(|_| CliError::InvalidTime(s.to_string()))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| CliError::InvalidTime(s.to_string()))
}
