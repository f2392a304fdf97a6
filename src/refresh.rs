//! Refresh cycle and background refresh daemon
//!
//! A [`RefreshCycle`] fetches the feed, decomposes it, commits it to the
//! [`PriceStore`] and schedules the next run. [`RefreshHandle`] runs cycles in
//! the background whenever a timer or manual trigger arrives, and reports
//! progress to the rest of the application over a broadcast channel.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::data::{decompose, FeedFetcher, FeedSource, FetchError, DEFAULT_FEED_URL};
use crate::schedule::{next_refresh_time, RefreshTimer, Trigger};
use crate::store::{AttemptRecord, PriceStore, RefreshStatus, StoreError};

/// Capacity of the trigger channel feeding the daemon
const TRIGGER_CHANNEL_CAPACITY: usize = 8;

/// Capacity of the refresh event channel
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Errors that stop a refresh cycle or the daemon
#[derive(Debug, Error)]
pub enum RefreshError {
    /// Another cycle is in progress; this one was dropped
    #[error("A refresh is already running")]
    AlreadyRunning,

    /// The store could not be written; not recoverable mid-cycle
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The daemon task or a store write task panicked or was cancelled
    #[error("Refresh daemon failed: {0}")]
    TaskFailed(#[from] JoinError),
}

/// Messages sent from the refresh cycle to observers
#[derive(Debug, Clone)]
pub enum RefreshMessage {
    /// A cycle started
    RefreshStarted,
    /// A cycle finished, successfully or not
    RefreshCompleted(CycleReport),
}

/// Summary of one refresh cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// How the cycle ended
    pub status: RefreshStatus,
    /// Number of cities committed, when a snapshot was committed
    pub cities: Option<usize>,
    /// When the cycle finished
    pub attempted_at: DateTime<Utc>,
    /// When the next cycle is scheduled
    pub next_refresh: DateTime<Local>,
}

/// Decides whether a cycle may touch the network
pub trait EligibilityGate: Send + Sync {
    /// Returns `false` to skip the fetch
    fn is_eligible(&self) -> bool;
}

impl<F> EligibilityGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_eligible(&self) -> bool {
        self()
    }
}

/// Gate driven by the "background data" setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackgroundData {
    /// Whether background fetches are allowed
    pub enabled: bool,
}

impl EligibilityGate for BackgroundData {
    fn is_eligible(&self) -> bool {
        self.enabled
    }
}

/// Configuration for the refresh system
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Feed endpoint
    pub feed_url: String,
    /// Store directory; the XDG data directory when unset
    pub store_dir: Option<PathBuf>,
    /// Whether background fetches are allowed
    pub background_data: bool,
    /// Request timeout for the fetch; none when unset
    pub fetch_timeout: Option<Duration>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            feed_url: DEFAULT_FEED_URL.to_string(),
            store_dir: None,
            background_data: true,
            fetch_timeout: None,
        }
    }
}

impl RefreshConfig {
    /// Opens the configured store
    pub fn open_store(&self) -> Result<PriceStore, StoreError> {
        match &self.store_dir {
            Some(dir) => PriceStore::open(dir),
            None => PriceStore::open_default(),
        }
    }

    /// Builds the feed client
    pub fn fetcher(&self) -> Result<FeedFetcher, FetchError> {
        let fetcher = FeedFetcher::new(self.feed_url.clone());
        match self.fetch_timeout {
            Some(timeout) => fetcher.with_timeout(timeout),
            None => Ok(fetcher),
        }
    }

    /// The eligibility gate for this configuration
    pub fn gate(&self) -> BackgroundData {
        BackgroundData {
            enabled: self.background_data,
        }
    }
}

/// What happened before the scheduling step
struct Attempt {
    status: RefreshStatus,
    cities: Option<usize>,
    committed_at: Option<DateTime<Utc>>,
}

impl Attempt {
    fn without_commit(status: RefreshStatus) -> Self {
        Self {
            status,
            cities: None,
            committed_at: None,
        }
    }
}

/// The fetch, decompose, commit, reschedule cycle
///
/// Only one cycle runs at a time; a call to [`RefreshCycle::run`] while
/// another is in progress returns [`RefreshError::AlreadyRunning`].
pub struct RefreshCycle<S, T, G = BackgroundData> {
    store: Arc<PriceStore>,
    source: S,
    timer: T,
    gate: G,
    running: Mutex<()>,
    events: broadcast::Sender<RefreshMessage>,
}

impl<S, T, G> RefreshCycle<S, T, G>
where
    S: FeedSource,
    T: RefreshTimer,
    G: EligibilityGate,
{
    /// Creates a cycle writing into `store`
    pub fn new(store: Arc<PriceStore>, source: S, timer: T, gate: G) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            source,
            timer,
            gate,
            running: Mutex::new(()),
            events,
        }
    }

    /// The store this cycle writes into
    pub fn store(&self) -> &Arc<PriceStore> {
        &self.store
    }

    /// Registers for refresh started/completed messages
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshMessage> {
        self.events.subscribe()
    }

    /// Runs one cycle to completion
    ///
    /// Fetch and decode failures are logged and end the cycle without a
    /// commit; the previously committed snapshot stays in place. Whatever the
    /// outcome, the next refresh is scheduled and a
    /// [`RefreshMessage::RefreshCompleted`] is sent. Only store failures are
    /// returned as errors.
    pub async fn run(&self) -> Result<CycleReport, RefreshError> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| RefreshError::AlreadyRunning)?;
        let _ = self.events.send(RefreshMessage::RefreshStarted);

        let attempt = self.attempt().await?;

        // Schedule from the committed snapshot's time, or from now when nothing was committed
        let basis = attempt.committed_at.unwrap_or_else(Utc::now).with_timezone(&Local);
        let next_refresh = next_refresh_time(&basis);
        self.timer.schedule(next_refresh);

        let attempted_at = Utc::now();
        let record = AttemptRecord {
            attempted_at,
            status: attempt.status,
            next_refresh: next_refresh.with_timezone(&Utc),
        };
        self.with_store(move |store| store.record_attempt(record)).await?;

        let report = CycleReport {
            status: attempt.status,
            cities: attempt.cities,
            attempted_at,
            next_refresh,
        };
        let _ = self.events.send(RefreshMessage::RefreshCompleted(report));
        Ok(report)
    }

    /// Gate check, fetch, decompose and commit
    async fn attempt(&self) -> Result<Attempt, RefreshError> {
        if !self.gate.is_eligible() {
            info!("Background data is disabled, skipping fetch");
            return Ok(Attempt::without_commit(RefreshStatus::Skipped));
        }

        let payload = match self.source.fetch().await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to fetch gas price feed");
                return Ok(Attempt::without_commit(RefreshStatus::FetchFailed));
            }
        };

        let snapshot = match decompose(&payload) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Failed to decompose gas price feed");
                return Ok(Attempt::without_commit(RefreshStatus::DecodeFailed));
            }
        };

        let cities = snapshot.city_count();
        let committed_at = snapshot.retrieved_at;
        self.with_store(move |store| store.commit_snapshot(&snapshot)).await?;
        Ok(Attempt {
            status: RefreshStatus::Updated,
            cities: Some(cities),
            committed_at: Some(committed_at),
        })
    }

    /// Runs a store write on the blocking pool; writes sync the document to disk
    async fn with_store<F>(&self, write: F) -> Result<(), RefreshError>
    where
        F: FnOnce(&PriceStore) -> Result<(), StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || write(&store)).await??;
        Ok(())
    }
}

/// Creates the channel that carries triggers into the daemon
///
/// The sender goes to the timer and to the [`RefreshHandle`]; the receiver
/// goes to [`RefreshHandle::spawn`].
pub fn trigger_channel() -> (mpsc::Sender<Trigger>, mpsc::Receiver<Trigger>) {
    mpsc::channel(TRIGGER_CHANNEL_CAPACITY)
}

/// Handle for controlling the background refresh daemon
pub struct RefreshHandle {
    /// Sends manual triggers
    triggers: mpsc::Sender<Trigger>,
    /// Refresh events from the cycle
    events: broadcast::Sender<RefreshMessage>,
    /// Flag to signal shutdown
    shutdown_tx: mpsc::Sender<()>,
    /// The daemon task
    task: JoinHandle<Result<(), RefreshError>>,
}

impl RefreshHandle {
    /// Spawns the daemon loop
    ///
    /// The loop runs one cycle per trigger. Triggers that arrive while a cycle
    /// is running are dropped once it finishes, since that cycle has already
    /// scheduled the next window. The loop stops on shutdown or when the
    /// store fails.
    pub fn spawn<S, T, G>(
        cycle: Arc<RefreshCycle<S, T, G>>,
        triggers: mpsc::Sender<Trigger>,
        mut trigger_rx: mpsc::Receiver<Trigger>,
    ) -> Self
    where
        S: FeedSource + 'static,
        T: RefreshTimer + 'static,
        G: EligibilityGate + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let events = cycle.events.clone();

        let task = tokio::spawn(async move {
            loop {
                let trigger = tokio::select! {
                    trigger = trigger_rx.recv() => trigger,
                    _ = shutdown_rx.recv() => None,
                };
                let Some(trigger) = trigger else {
                    break;
                };

                info!(?trigger, "Refresh triggered");
                match cycle.run().await {
                    Ok(report) => info!(
                        status = ?report.status,
                        next_refresh = %report.next_refresh.to_rfc3339(),
                        "Refresh finished"
                    ),
                    Err(RefreshError::AlreadyRunning) => {
                        debug!("Refresh already running, trigger dropped")
                    }
                    Err(e) => {
                        error!(error = %e, "Stopping refresh daemon");
                        return Err(e);
                    }
                }

                let mut dropped = 0usize;
                while trigger_rx.try_recv().is_ok() {
                    dropped += 1;
                }
                if dropped > 0 {
                    debug!(dropped, "Dropped triggers received during refresh");
                }
            }
            debug!("Refresh daemon stopped");
            Ok(())
        });

        Self {
            triggers,
            events,
            shutdown_tx,
            task,
        }
    }

    /// Requests an immediate refresh
    ///
    /// Returns `false` if the request was dropped because the daemon is busy
    /// or gone.
    pub fn request_refresh(&self) -> bool {
        self.triggers.try_send(Trigger::Manual).is_ok()
    }

    /// Registers for refresh started/completed messages
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshMessage> {
        self.events.subscribe()
    }

    /// Shuts down the daemon and waits for the current cycle to finish
    pub async fn shutdown(self) -> Result<(), RefreshError> {
        let _ = self.shutdown_tx.send(()).await;
        self.task.await?
    }

    /// Runs until `signal` completes or the daemon stops on its own
    pub async fn run_until<F>(self, signal: F) -> Result<(), RefreshError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            shutdown_tx,
            mut task,
            ..
        } = self;

        tokio::select! {
            result = &mut task => return result?,
            _ = signal => info!("Shutdown requested"),
        }

        let _ = shutdown_tx.send(()).await;
        task.await?
    }
}
