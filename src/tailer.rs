use std::{
    fs,
    io::{self, Seek, SeekFrom},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    fingerprinter::{Attributes, Fingerprint, Fingerprinter, HashComparison, PrefixHash},
    framer::LineFramer,
    listener::TailerListener,
    position_store::PositionStore,
    trigger::{IntervalTrigger, Trigger, Wait},
    FilePosition, InitialPosition, FINGERPRINT_BYTES,
};

/// Default poll interval between reads at end-of-file.
pub const DEFAULT_READ_INTERVAL: Duration = Duration::from_millis(500);

/// Construction failure from [`TailerBuilder::build`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("required field `file` was not provided")]
    MissingFile,
    #[error("required field `position_store` was not provided")]
    MissingPositionStore,
    #[error("required field `listener` was not provided")]
    MissingListener,
    #[error("`read_interval` must be greater than zero")]
    ZeroReadInterval,
    #[error("`fingerprint_bytes` must be greater than zero")]
    ZeroFingerprintBytes,
}

/// Cloneable control handle for a running tailer.
///
/// Handed to the listener during construction and obtainable from
/// [`StatefulTailer::handle`]. Usable from any thread.
#[derive(Clone)]
pub struct TailerHandle {
    running: Arc<AtomicBool>,
    waker: Sender<()>,
}

impl TailerHandle {
    /// Ask the tailer to stop. Observed at the top of the read loop and
    /// inside the default trigger's wait; the tailer still runs its
    /// resource release path before exiting.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.waker.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Builder for [`StatefulTailer`].
///
/// `file`, `position_store`, and `listener` are required; everything else
/// has a default. Missing or invalid values fail `build` with a
/// [`BuildError`] naming the field.
pub struct TailerBuilder<L> {
    file: Option<PathBuf>,
    position_store: Option<Arc<dyn PositionStore>>,
    listener: Option<L>,
    read_interval: Duration,
    initial_position: InitialPosition,
    fingerprint_bytes: usize,
    trigger: Option<Box<dyn Trigger>>,
}

impl<L: TailerListener> Default for TailerBuilder<L> {
    fn default() -> Self {
        TailerBuilder::new()
    }
}

impl<L: TailerListener> TailerBuilder<L> {
    pub fn new() -> TailerBuilder<L> {
        TailerBuilder {
            file: None,
            position_store: None,
            listener: None,
            read_interval: DEFAULT_READ_INTERVAL,
            initial_position: InitialPosition::default(),
            fingerprint_bytes: FINGERPRINT_BYTES,
            trigger: None,
        }
    }

    /// Path of the file to follow. Required.
    pub fn file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Durable checkpoint backing, shared with the creator. Required.
    pub fn position_store(mut self, store: Arc<dyn PositionStore>) -> Self {
        self.position_store = Some(store);
        self
    }

    /// Consumer of lines and lifecycle events. Required.
    pub fn listener(mut self, listener: L) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Poll interval of the default trigger. Defaults to 500 ms.
    pub fn read_interval(mut self, read_interval: Duration) -> Self {
        self.read_interval = read_interval;
        self
    }

    /// Where to start when no checkpoint matches the file on first open.
    /// Defaults to [`InitialPosition::Beginning`].
    pub fn initial_position(mut self, initial_position: InitialPosition) -> Self {
        self.initial_position = initial_position;
        self
    }

    /// Number of leading bytes hashed into the identity fingerprint.
    /// Defaults to [`FINGERPRINT_BYTES`].
    pub fn fingerprint_bytes(mut self, fingerprint_bytes: usize) -> Self {
        self.fingerprint_bytes = fingerprint_bytes;
        self
    }

    /// Replace the default interval trigger. A custom trigger is expected
    /// to observe stop requests on its own; the running flag is still
    /// checked at the top of every read loop iteration.
    pub fn trigger(mut self, trigger: Box<dyn Trigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn build(self) -> Result<StatefulTailer<L>, BuildError> {
        let path = self.file.ok_or(BuildError::MissingFile)?;
        let store = self.position_store.ok_or(BuildError::MissingPositionStore)?;
        let mut listener = self.listener.ok_or(BuildError::MissingListener)?;
        if self.read_interval.is_zero() {
            return Err(BuildError::ZeroReadInterval);
        }
        if self.fingerprint_bytes == 0 {
            return Err(BuildError::ZeroFingerprintBytes);
        }

        let running = Arc::new(AtomicBool::new(true));
        let (waker, wakeup) = mpsc::channel();
        let handle = TailerHandle {
            running: Arc::clone(&running),
            waker,
        };
        let trigger = self
            .trigger
            .unwrap_or_else(|| Box::new(IntervalTrigger::new(self.read_interval, wakeup)));

        listener.initialize(&handle);

        Ok(StatefulTailer {
            path,
            store,
            listener,
            trigger,
            fingerprinter: Fingerprinter::new(self.fingerprint_bytes),
            framer: LineFramer::new(),
            initial_position: self.initial_position,
            position: 0,
            hash: None,
            partial_hash: None,
            running,
            handle,
        })
    }
}

/// A stateful tailer following a single file by path.
///
/// The tailer polls rather than listening for filesystem events, so it
/// behaves the same across operating systems with POSIX semantics. Each
/// poll it snapshots the path's attributes and decides between reading
/// more lines, waiting, or concluding that the file it holds has been
/// rotated away and reopening by name. Progress is checkpointed in the
/// position store under the file's fingerprint, which lets a new instance
/// resume where a previous process left off.
pub struct StatefulTailer<L: TailerListener> {
    path: PathBuf,
    store: Arc<dyn PositionStore>,
    listener: L,
    trigger: Box<dyn Trigger>,
    fingerprinter: Fingerprinter,
    framer: LineFramer,
    initial_position: InitialPosition,
    position: FilePosition,
    /// Identity of the currently-open file, once its prefix is long enough
    /// to hash. Invariant: while set, the open file's leading bytes hash to
    /// this value, and checkpoints are written only while set.
    hash: Option<Fingerprint>,
    /// Shorter-prefix digest kept while `hash` is still unavailable, used
    /// only to compare against the path's current occupant.
    partial_hash: Option<PrefixHash>,
    running: Arc<AtomicBool>,
    handle: TailerHandle,
}

impl<L: TailerListener> std::fmt::Debug for StatefulTailer<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulTailer")
            .field("path", &self.path)
            .field("position", &self.position)
            .field("hash", &self.hash)
            .field("partial_hash", &self.partial_hash)
            .finish_non_exhaustive()
    }
}

impl<L: TailerListener> StatefulTailer<L> {
    pub fn handle(&self) -> &TailerHandle {
        &self.handle
    }

    /// Run until stopped or a fatal error occurs.
    ///
    /// Fatal errors are delivered to the listener before returning. The
    /// position store is flushed on every exit path.
    pub fn run(mut self) {
        if let Err(err) = self.tail() {
            error!(message = "Tailer stopped on fatal error.", error = %err, path = ?self.path);
            self.listener.error(&err);
        }
        self.store.close();
    }

    /// The file loop: open by name, resume, read until rotation, repeat.
    fn tail(&mut self) -> io::Result<()> {
        let mut read_from = self.initial_position;
        while self.running() {
            match fs::File::open(&self.path) {
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(message = "File not found.", path = ?self.path);
                    self.listener.file_not_found();
                    if self.trigger.wait() == Wait::Cancelled {
                        break;
                    }
                }
                Err(err) => return Err(err),
                Ok(mut file) => {
                    self.resume(&mut file, read_from)?;
                    self.read_loop(&mut file)?;
                    // Reopens within one session always start at the top of
                    // the replacement file.
                    read_from = InitialPosition::Beginning;
                }
            }
        }
        Ok(())
    }

    /// Seat the read position in a freshly opened file: at the stored
    /// checkpoint when the file's fingerprint has one, else at `read_from`.
    fn resume(&mut self, file: &mut fs::File, read_from: InitialPosition) -> io::Result<()> {
        self.hash = self.fingerprinter.fingerprint_of(file)?;
        self.partial_hash = match self.hash {
            Some(_) => None,
            None => self.fingerprinter.prefix_hash_of(file)?,
        };

        let len = file.metadata()?.len();
        let checkpoint = self.hash.as_ref().and_then(|hash| self.store.get(hash));
        let position = match checkpoint {
            Some(offset) if offset <= len => {
                info!(
                    message = "Resuming from stored position.",
                    path = ?self.path,
                    position = offset
                );
                offset
            }
            Some(offset) => {
                // A stored offset past the end means the file shrank while
                // keeping its prefix; the best we can do is re-tail it.
                debug!(
                    message = "Stored position is past the end of the file; reading from the start.",
                    path = ?self.path,
                    position = offset,
                    len
                );
                0
            }
            None => match read_from {
                InitialPosition::Beginning => 0,
                InitialPosition::End => len,
            },
        };

        file.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }

    /// The read loop: one rotation decision per poll.
    ///
    /// Returns normally either when a rotation has been handled, in which
    /// case the caller reopens by name, or when the tailer was stopped.
    fn read_loop(&mut self, file: &mut fs::File) -> io::Result<()> {
        let mut last_checked = Utc::now();
        loop {
            if !self.running() {
                return Ok(());
            }

            let attributes = match Attributes::of(&self.path, last_checked) {
                Ok(attributes) => attributes,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    // The path vanished between polls; rotation race.
                    return self.rotate(file);
                }
                Err(err) => return Err(err),
            };
            let held_len = file.metadata()?.len();

            if attributes.len() < self.position {
                // The file at the path cannot be the one we hold.
                debug!(
                    message = "File shrank below the read position.",
                    path = ?self.path,
                    len = attributes.len(),
                    position = self.position
                );
                return self.rotate(file);
            } else if held_len > self.position {
                if self.read_lines(file)? {
                    last_checked = Utc::now();
                } else {
                    // Unread bytes were promised but none arrived: the held
                    // file is gone and the replacement happens to be longer.
                    return self.rotate(file);
                }
            } else if attributes.newer() {
                // Nothing unread yet a fresh write happened: typical of a
                // periodic rewrite with identical length.
                debug!(
                    message = "File was modified without growing.",
                    path = ?self.path
                );
                return self.rotate(file);
            } else {
                match self.compare_hash()? {
                    HashComparison::Differs => return self.rotate(file),
                    HashComparison::Equal | HashComparison::Undecided => {}
                }
            }

            self.refresh_identity(file)?;

            if self.trigger.wait() == Wait::Cancelled {
                self.running.store(false, Ordering::SeqCst);
                self.checkpoint();
                self.store.flush();
                return Ok(());
            }

            self.checkpoint();
            // Durability rides on the poll cadence, not on every line.
            self.store.flush();
        }
    }

    /// The file we hold is no longer the file at the path. Grant late
    /// writes to the old file one more poll, drain them, then notify the
    /// listener and hand control back to the file loop.
    fn rotate(&mut self, file: &mut fs::File) -> io::Result<()> {
        if self.trigger.wait() == Wait::Cancelled {
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }
        self.read_lines(file)?;

        info!(message = "File rotated; reopening.", path = ?self.path);
        self.hash = None;
        self.partial_hash = None;
        self.listener.file_rotated();
        Ok(())
    }

    /// Frame and deliver whatever complete lines the held file has,
    /// checkpointing after each one.
    fn read_lines(&mut self, file: &mut fs::File) -> io::Result<bool> {
        let listener = &mut self.listener;
        let store = &self.store;
        let hash = self.hash;
        self.framer
            .read_lines(file, &mut self.position, |line, end_of_line| {
                listener.line(line);
                if let Some(hash) = hash {
                    store.set(hash, end_of_line);
                }
            })
    }

    /// While the identity hash is absent the file was too short to
    /// fingerprint; try again now that it may have grown, and refresh the
    /// shorter comparison digest otherwise.
    fn refresh_identity(&mut self, file: &mut fs::File) -> io::Result<()> {
        if self.hash.is_some() {
            return Ok(());
        }
        if let Some(hash) = self.fingerprinter.fingerprint_of(file)? {
            debug!(
                message = "File identity established.",
                path = ?self.path,
                fingerprint = %hash
            );
            self.hash = Some(hash);
            self.partial_hash = None;
            self.checkpoint();
        } else {
            self.partial_hash = self.fingerprinter.prefix_hash_of(file)?;
        }
        Ok(())
    }

    /// Compare the file now at the path against the file this tailer holds:
    /// by identity fingerprint when one is pinned, else by the captured
    /// shorter-prefix digest.
    fn compare_hash(&self) -> io::Result<HashComparison> {
        if let Some(hash) = self.hash {
            match self.fingerprinter.fingerprint(&self.path) {
                Ok(Some(on_disk)) if on_disk == hash => Ok(HashComparison::Equal),
                Ok(Some(_)) => Ok(HashComparison::Differs),
                Ok(None) => Ok(HashComparison::Undecided),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    Ok(HashComparison::Undecided)
                }
                Err(err) => Err(err),
            }
        } else if let Some(partial) = self.partial_hash {
            match self.fingerprinter.prefix_hash(&self.path, partial.bytes) {
                Ok(Some(on_disk)) if on_disk.digest == partial.digest => {
                    Ok(HashComparison::Equal)
                }
                Ok(Some(_)) => Ok(HashComparison::Differs),
                Ok(None) => Ok(HashComparison::Undecided),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    Ok(HashComparison::Undecided)
                }
                Err(err) => Err(err),
            }
        } else {
            Ok(HashComparison::Undecided)
        }
    }

    fn checkpoint(&self) {
        if let Some(hash) = self.hash {
            self.store.set(hash, self.position);
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
