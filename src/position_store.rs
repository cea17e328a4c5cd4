use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{fingerprinter::Fingerprint, FilePosition};

const TMP_FILE_NAME: &str = "positions.new.json";
pub const POSITION_FILE_NAME: &str = "positions.json";

/// Default bound on how many fingerprints a [`JsonPositionStore`] retains.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Durable mapping from file fingerprint to read offset.
///
/// Methods take `&self` so one store can be shared by several tailers
/// behind an `Arc`; implementations must keep per-key operations
/// linearizable.
pub trait PositionStore: Send + Sync {
    /// Look up the stored offset for `fingerprint`.
    fn get(&self, fingerprint: &Fingerprint) -> Option<FilePosition>;

    /// Record `position` for `fingerprint`, replacing any previous value.
    /// The update is immediately visible to every holder of the store;
    /// durability is deferred to the next [`flush`](PositionStore::flush).
    fn set(&self, fingerprint: Fingerprint, position: FilePosition);

    /// Persist pending updates. The tailer calls this once per poll
    /// iteration rather than per line, so a crash loses at most the
    /// updates of the current poll. Persistence failures are logged rather
    /// than returned.
    fn flush(&self) {}

    /// Flush and release any backing resources.
    fn close(&self) {}
}

/// This enum represents the file format of positions persisted to disk.
/// Right now there is only one variant, but any incompatible change will
/// require an additional variant to be added here and handled anywhere that
/// we transit this format.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "version")]
enum State {
    #[serde(rename = "1")]
    V1 { positions: BTreeSet<Entry> },
}

/// A simple JSON-friendly record of one fingerprint/offset pair. The update
/// time orders entries for eviction once the store hits its capacity.
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
struct Entry {
    fingerprint: Fingerprint,
    position: FilePosition,
    updated: DateTime<Utc>,
}

/// File-backed [`PositionStore`] holding a single JSON document under a
/// data directory.
///
/// Updates land in memory; each flush writes the state to a temp file,
/// syncs it, and renames it over the stable file, so a crash leaves at
/// least one fully valid file to recover from. A temp file found at open
/// time means the previous process died mid-write; its contents are
/// preferred and promoted.
pub struct JsonPositionStore {
    tmp_file_path: PathBuf,
    stable_file_path: PathBuf,
    max_entries: usize,
    positions: DashMap<Fingerprint, FilePosition>,
    updated_times: DashMap<Fingerprint, DateTime<Utc>>,
    last: Mutex<Option<State>>,
}

impl JsonPositionStore {
    /// Open a store rooted at `data_dir` with the default capacity,
    /// recovering any persisted state.
    pub fn open(data_dir: &Path) -> io::Result<JsonPositionStore> {
        Self::open_with_capacity(data_dir, DEFAULT_MAX_ENTRIES)
    }

    /// Open a store bounded to `max_entries` fingerprints. When the bound
    /// is exceeded the least recently updated entries are dropped at the
    /// next flush; an affected file simply re-tails from its initial
    /// position.
    pub fn open_with_capacity(
        data_dir: &Path,
        max_entries: usize,
    ) -> io::Result<JsonPositionStore> {
        fs::create_dir_all(data_dir)?;
        let store = JsonPositionStore {
            tmp_file_path: data_dir.join(TMP_FILE_NAME),
            stable_file_path: data_dir.join(POSITION_FILE_NAME),
            max_entries,
            positions: DashMap::new(),
            updated_times: DashMap::new(),
            last: Mutex::new(None),
        };
        store.read_positions();
        Ok(store)
    }

    /// Persist the current state to disk, making our best effort to do so
    /// in an atomic way that allows for recovering the previous state in
    /// the event of a crash. Unchanged state is not rewritten.
    fn write_positions(&self) -> Result<usize, io::Error> {
        self.enforce_capacity();

        let current = self.get_state();

        let mut last = self.last.lock().expect("Data poisoned.");
        if last.as_ref() != Some(&current) {
            // Write the new state to a tmp file and flush it fully to disk.
            // If the process dies anywhere in this section the existing
            // stable file is still in its previous valid state.
            let mut f = io::BufWriter::new(fs::File::create(&self.tmp_file_path)?);
            serde_json::to_writer(&mut f, &current)?;
            f.into_inner()?.sync_all()?;

            // Renaming the flushed tmp file over the stable file is atomic
            // on POSIX systems, and the stdlib claims equivalent behavior on
            // Windows.
            fs::rename(&self.tmp_file_path, &self.stable_file_path)?;

            *last = Some(current);
        }

        Ok(self.positions.len())
    }

    fn enforce_capacity(&self) {
        let excess = self.positions.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return;
        }

        // Collect candidates first; removing while iterating a DashMap can
        // lead to deadlocks, and the set is small.
        let mut by_age: Vec<(Fingerprint, DateTime<Utc>)> = self
            .updated_times
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        by_age.sort_by_key(|(_, updated)| *updated);

        for (fingerprint, _) in by_age.into_iter().take(excess) {
            warn!(
                message = "Dropping least recently updated position to stay within capacity.",
                %fingerprint
            );
            self.positions.remove(&fingerprint);
            self.updated_times.remove(&fingerprint);
        }
    }

    fn get_state(&self) -> State {
        State::V1 {
            positions: self
                .positions
                .iter()
                .map(|entry| Entry {
                    fingerprint: *entry.key(),
                    position: *entry.value(),
                    updated: self
                        .updated_times
                        .get(entry.key())
                        .map(|r| *r.value())
                        .unwrap_or_else(Utc::now),
                })
                .collect(),
        }
    }

    fn set_state(&self, state: State) {
        match state {
            State::V1 { positions } => {
                for entry in positions {
                    self.positions.insert(entry.fingerprint, entry.position);
                    self.updated_times.insert(entry.fingerprint, entry.updated);
                }
            }
        }
    }

    fn read_positions(&self) {
        // A readable tmp file means the previous process was interrupted
        // while persisting and the tmp contents are the most recent data.
        match self.read_positions_file(&self.tmp_file_path) {
            Ok(state) => {
                warn!(message = "Recovered position data from interrupted process.");
                self.set_state(state);

                // Move the tmp file to the stable location so the next
                // flush does not clobber the only copy.
                if let Err(error) = fs::rename(&self.tmp_file_path, &self.stable_file_path) {
                    warn!(message = "Error persisting recovered position file.", %error);
                }
                return;
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                // This is expected, so no warning needed
            }
            Err(error) => {
                error!(message = "Unable to recover position data from interrupted process.", %error);
            }
        }

        match self.read_positions_file(&self.stable_file_path) {
            Ok(state) => {
                info!(message = "Loaded position data.");
                self.set_state(state);
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                // This is expected, so no warning needed
            }
            Err(error) => {
                warn!(message = "Unable to load position data.", %error);
            }
        }
    }

    fn read_positions_file(&self, path: &Path) -> Result<State, io::Error> {
        let reader = io::BufReader::new(fs::File::open(path)?);
        serde_json::from_reader(reader).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl PositionStore for JsonPositionStore {
    fn get(&self, fingerprint: &Fingerprint) -> Option<FilePosition> {
        self.positions.get(fingerprint).map(|r| *r.value())
    }

    fn set(&self, fingerprint: Fingerprint, position: FilePosition) {
        // In-memory only; durability rides on the caller's flush cadence.
        self.positions.insert(fingerprint, position);
        self.updated_times.insert(fingerprint, Utc::now());
    }

    fn flush(&self) {
        if let Err(error) = self.write_positions() {
            warn!(message = "Failed to persist position data.", %error);
        }
    }

    fn close(&self) {
        if let Err(error) = self.write_positions() {
            warn!(message = "Failed to persist position data on close.", %error);
        }
    }
}

impl Drop for JsonPositionStore {
    fn drop(&mut self) {
        self.close();
    }
}

/// Position store with no durability; positions survive only as long as
/// the process. Suitable for tests and callers that accept a re-tail on
/// restart.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    positions: DashMap<Fingerprint, FilePosition>,
}

impl MemoryPositionStore {
    pub fn new() -> MemoryPositionStore {
        Default::default()
    }
}

impl PositionStore for MemoryPositionStore {
    fn get(&self, fingerprint: &Fingerprint) -> Option<FilePosition> {
        self.positions.get(fingerprint).map(|r| *r.value())
    }

    fn set(&self, fingerprint: Fingerprint, position: FilePosition) {
        self.positions.insert(fingerprint, position);
    }
}
