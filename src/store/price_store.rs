//! Price store backed by a single JSON document
//!
//! The whole state lives in memory behind an `Arc` that is swapped on every
//! write, and on disk as `gasprices.json`. Writes go to a temporary file that
//! is renamed over the document, so both readers and the file only ever see a
//! complete state.
//!
//! Several processes may share one store directory (the daemon and one-shot
//! CLI commands). Every write holds an exclusive lock on `gasprices.lock` and
//! applies its change to the document as it is on disk, so writes made by
//! other processes are never lost.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{AttemptRecord, RefreshMetadata, WidgetId, WidgetSelection};
use crate::data::{CityId, Snapshot};

/// File name of the persisted document
const DOCUMENT_FILE: &str = "gasprices.json";

/// Lock file serializing writers across processes
const LOCK_FILE: &str = "gasprices.lock";

/// Prefix of the per-city keys
const CITY_KEY_PREFIX: &str = "city:";

/// Capacity of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Errors that can occur when reading or writing the store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the store directory failed
    #[error("Store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The state could not be serialized
    #[error("Failed to encode store document: {0}")]
    Encode(#[from] serde_json::Error),

    /// The document on disk could not be parsed
    #[error("Store document {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// No data directory could be determined for the default location
    #[error("Could not determine a data directory for the store")]
    NoDataDir,
}

/// Everything the store persists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    /// Pretty-printed feed snapshot
    #[serde(default)]
    raw_snapshot: Option<String>,
    /// Compact city payloads keyed `city:<id>`
    #[serde(default)]
    cities: BTreeMap<String, String>,
    /// Retrieval time of the committed snapshot
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    /// Bookkeeping from the last refresh attempt
    #[serde(default)]
    last_attempt: Option<AttemptRecord>,
    /// Application-wide selected city
    #[serde(default)]
    selected_city: Option<CityId>,
    /// Widget selections keyed by widget id
    #[serde(default)]
    widgets: BTreeMap<WidgetId, WidgetSelection>,
}

/// Reads the document at `path`; a missing document is an empty state
fn load_state(path: &Path) -> Result<StoreState, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(StoreState::default()),
        Err(e) => Err(e.into()),
    }
}

/// Returns the key under which a city's payload is stored
fn city_key(city_id: CityId) -> String {
    format!("{}{}", CITY_KEY_PREFIX, city_id)
}

/// A consistent, immutable view of the store at one point in time
///
/// All getters on a single view read from the same committed state, so a
/// view never mixes data from before and after a commit.
#[derive(Debug, Clone)]
pub struct StoreView {
    state: Arc<StoreState>,
}

impl StoreView {
    /// The pretty-printed feed snapshot, if one was ever committed
    pub fn raw_snapshot(&self) -> Option<&str> {
        self.state.raw_snapshot.as_deref()
    }

    /// The stored JSON for one city
    pub fn city_record(&self, city_id: CityId) -> Option<&str> {
        self.state.cities.get(&city_key(city_id)).map(String::as_str)
    }

    /// Ids of all stored cities, in ascending order
    pub fn city_ids(&self) -> Vec<CityId> {
        let mut ids: Vec<CityId> = self
            .state
            .cities
            .keys()
            .filter_map(|key| key.strip_prefix(CITY_KEY_PREFIX))
            .filter_map(|id| id.parse().ok())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Retrieval time of the committed snapshot
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.state.last_updated
    }

    /// Refresh bookkeeping
    pub fn metadata(&self) -> RefreshMetadata {
        let attempt = self.state.last_attempt;
        RefreshMetadata {
            last_updated: self.state.last_updated,
            next_refresh: attempt.map(|a| a.next_refresh),
            last_attempt: attempt.map(|a| a.attempted_at),
            last_status: attempt.map(|a| a.status),
        }
    }

    /// Selection of one widget instance
    pub fn widget_selection(&self, widget_id: WidgetId) -> Option<&WidgetSelection> {
        self.state.widgets.get(&widget_id)
    }

    /// All widget selections, ordered by widget id
    pub fn widget_selections(&self) -> impl Iterator<Item = &WidgetSelection> {
        self.state.widgets.values()
    }

    /// Application-wide selected city
    pub fn selected_city(&self) -> Option<CityId> {
        self.state.selected_city
    }
}

/// Persistent key-value store for snapshots, city records and selections
///
/// Writers are serialized on an internal lock and, across processes, on a
/// lock file in the store directory. Readers never block on a writer's disk
/// I/O; they see the previous state until the new document has been synced
/// and renamed into place. Each write also picks up whatever other processes
/// wrote since this handle last touched the disk.
#[derive(Debug)]
pub struct PriceStore {
    /// Directory holding the document
    dir: PathBuf,
    /// Current committed state
    state: RwLock<Arc<StoreState>>,
    /// Serializes writers within this process
    writer: Mutex<()>,
    /// "Data changed" notifications, sent after each snapshot commit
    changes: broadcast::Sender<()>,
}

impl PriceStore {
    /// Opens the store in the XDG-compliant data directory
    ///
    /// Uses `~/.local/share/gasprices/` on Linux, or the equivalent on other
    /// platforms.
    pub fn open_default() -> Result<Self, StoreError> {
        let project_dirs = ProjectDirs::from("", "", "gasprices").ok_or(StoreError::NoDataDir)?;
        Self::open(project_dirs.data_dir())
    }

    /// Opens the store in the given directory
    ///
    /// A missing directory or document yields an empty store; the directory
    /// is created on the first write.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(DOCUMENT_FILE);

        let state = load_state(&path)?;
        debug!(path = %path.display(), "Opened price store");

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            dir,
            state: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
            changes,
        })
    }

    /// Directory holding the store document
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Takes a consistent view of the current state
    pub fn view(&self) -> StoreView {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        StoreView {
            state: Arc::clone(&state),
        }
    }

    /// Registers for "data changed" notifications
    ///
    /// One message is sent per snapshot commit, after it is on disk. The
    /// message carries nothing; read the new data through [`PriceStore::view`].
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    /// The pretty-printed feed snapshot
    pub fn raw_snapshot(&self) -> Option<String> {
        self.view().raw_snapshot().map(str::to_string)
    }

    /// The stored JSON for one city
    pub fn city_record(&self, city_id: CityId) -> Option<String> {
        self.view().city_record(city_id).map(str::to_string)
    }

    /// Retrieval time of the committed snapshot
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.view().last_updated()
    }

    /// Refresh bookkeeping
    pub fn metadata(&self) -> RefreshMetadata {
        self.view().metadata()
    }

    /// Selection of one widget instance
    pub fn widget_selection(&self, widget_id: WidgetId) -> Option<WidgetSelection> {
        self.view().widget_selection(widget_id).cloned()
    }

    /// Application-wide selected city
    pub fn selected_city(&self) -> Option<CityId> {
        self.view().selected_city()
    }

    /// Stores a snapshot, all of its cities and its retrieval time in one step
    ///
    /// The stored city set is replaced by the snapshot's, so cities that
    /// dropped out of the feed are removed. Subscribers are notified once the
    /// new document is on disk.
    pub fn commit_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.update(|state| {
            state.raw_snapshot = Some(snapshot.raw.clone());
            state.cities = snapshot
                .cities
                .values()
                .map(|record| (city_key(record.city_id), record.payload.clone()))
                .collect();
            state.last_updated = Some(snapshot.retrieved_at);
        })?;

        info!(cities = snapshot.city_count(), "Committed gas price snapshot");
        // No subscribers is fine
        let _ = self.changes.send(());
        Ok(())
    }

    /// Records the outcome of a refresh attempt and the next scheduled time
    pub fn record_attempt(&self, attempt: AttemptRecord) -> Result<(), StoreError> {
        self.update(|state| state.last_attempt = Some(attempt))
    }

    /// Selects the city shown by a widget instance
    pub fn set_widget_selection(
        &self,
        widget_id: WidgetId,
        city_id: CityId,
        city_name: impl Into<String>,
    ) -> Result<(), StoreError> {
        let selection = WidgetSelection {
            widget_id,
            city_id,
            city_name: city_name.into(),
        };
        self.update(|state| {
            state.widgets.insert(widget_id, selection);
        })
    }

    /// Removes the selections of the given widget instances
    pub fn clear_widget_selections(&self, widget_ids: &[WidgetId]) -> Result<(), StoreError> {
        self.update(|state| {
            for widget_id in widget_ids {
                state.widgets.remove(widget_id);
            }
        })
    }

    /// Sets the application-wide selected city
    pub fn set_selected_city(&self, city_id: CityId) -> Result<(), StoreError> {
        self.update(|state| state.selected_city = Some(city_id))
    }

    /// Applies a change to the on-disk state, persists it, then publishes it
    ///
    /// The document is re-read under the cross-process lock, so the change
    /// lands on top of writes made through other handles.
    fn update<F>(&self, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreState),
    {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        fs::create_dir_all(&self.dir)?;
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(LOCK_FILE))?;
        lock.lock_exclusive()?;

        let mut next = load_state(&self.dir.join(DOCUMENT_FILE))?;
        change(&mut next);
        self.persist(&next)?;

        let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::new(next);
        // The file lock is released when `lock` is dropped
        Ok(())
    }

    /// Writes the document to a fresh temporary file, syncs it and renames it into place
    fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(state)?;
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(self.dir.join(DOCUMENT_FILE)).map_err(|e| e.error)?;
        Ok(())
    }
}
