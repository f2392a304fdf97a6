//! Refresh window policy and one-shot timers
//!
//! The feed publishes tomorrow's prices in the evening, so refreshes run at
//! three fixed local times: 17:00, 20:00 and midnight. [`next_refresh_time`]
//! is the pure policy; the [`RefreshTimer`] implementations arrange for the
//! refresh cycle to run again at the chosen time.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Local, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Hour of the first evening refresh window
const FIRST_WINDOW_HOUR: u32 = 17;

/// Hour of the second evening refresh window
const SECOND_WINDOW_HOUR: u32 = 20;

/// Returns the next refresh window after `last_updated`
///
/// * before 17:00 -> 17:00 the same day
/// * 17:00 to 19:59 -> 20:00 the same day
/// * 20:00 or later -> 00:00 the next day
///
/// Minutes, seconds and sub-seconds are zero in the result.
pub fn next_refresh_time<Tz: TimeZone>(last_updated: &DateTime<Tz>) -> DateTime<Tz> {
    let date = last_updated.date_naive();
    let hour = last_updated.hour();

    let window = if hour < FIRST_WINDOW_HOUR {
        date.and_time(NaiveTime::MIN) + Duration::hours(FIRST_WINDOW_HOUR.into())
    } else if hour < SECOND_WINDOW_HOUR {
        date.and_time(NaiveTime::MIN) + Duration::hours(SECOND_WINDOW_HOUR.into())
    } else {
        date.and_time(NaiveTime::MIN) + Duration::days(1)
    };

    resolve_local(&last_updated.timezone(), window)
}

/// Maps a wall-clock time to an instant in `tz`
///
/// Ambiguous times (clocks turned back) take the earlier instant. Times that
/// do not exist (clocks turned forward) move to the first instant after the gap.
fn resolve_local<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => tz
            .from_local_datetime(&(local + Duration::hours(1)))
            .earliest()
            .unwrap_or_else(|| tz.from_utc_datetime(&local)),
    }
}

/// Why a refresh cycle was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A scheduled timer fired
    Timer,
    /// A user asked for a refresh
    Manual,
}

/// Host facility that runs the refresh cycle again at a given time
///
/// Implementations must fire at or after `at`, and at most once per call.
pub trait RefreshTimer: Send + Sync {
    /// Arranges a single refresh at or after `at`
    fn schedule(&self, at: DateTime<Local>);
}

impl<T: RefreshTimer + ?Sized> RefreshTimer for Arc<T> {
    fn schedule(&self, at: DateTime<Local>) {
        (**self).schedule(at)
    }
}

/// Timer that sends [`Trigger::Timer`] into the refresh daemon's channel
///
/// Only one wake-up is pending at a time: scheduling again replaces the
/// previous one.
#[derive(Debug)]
pub struct TokioTimer {
    triggers: mpsc::Sender<Trigger>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl TokioTimer {
    /// Creates a timer that delivers into `triggers`
    pub fn new(triggers: mpsc::Sender<Trigger>) -> Self {
        Self {
            triggers,
            pending: Mutex::new(None),
        }
    }

    /// Whether a wake-up is currently pending
    pub fn is_pending(&self) -> bool {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl RefreshTimer for TokioTimer {
    /// Must be called from within a tokio runtime
    fn schedule(&self, at: DateTime<Local>) {
        let delay = (at - Local::now())
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        let triggers = self.triggers.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("Refresh timer fired");
            // The daemon may already be gone
            let _ = triggers.send(Trigger::Timer).await;
        });

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.replace(task) {
            previous.abort();
        }
        info!(at = %at.to_rfc3339(), "Scheduled next refresh");
    }
}

/// Timer for one-shot runs that leaves the wake-up to an external scheduler
///
/// The next refresh time is still persisted in the refresh metadata, where a
/// cron job or service manager can pick it up.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordOnlyTimer;

impl RefreshTimer for RecordOnlyTimer {
    fn schedule(&self, at: DateTime<Local>) {
        info!(at = %at.to_rfc3339(), "Next refresh window");
    }
}
