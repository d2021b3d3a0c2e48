//! Durable storage for the resume checkpoint.
//!
//! The file store keeps a single text token at the configured path:
//!
//! ```text
//! <path>        # the checkpoint, e.g. `42` or `42-g1AAAA...`
//! <path>.lock   # advisory lock held while a tailer owns the checkpoint
//! <path>.tmp    # scratch file for atomic replacement
//! ```

use crate::error::{EngineError, EngineResult};
use couchtail_protocol::Checkpoint;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Reads and writes the single resume checkpoint.
///
/// Implementations must never leave a torn value behind: after a crash the
/// store holds either the previous or the new checkpoint.
pub trait CheckpointStore: Send + Sync {
    /// Returns the persisted checkpoint, or the origin if nothing usable is stored.
    fn read(&self) -> EngineResult<Checkpoint>;

    /// Persists `checkpoint`, replacing the previous value.
    fn write(&self, checkpoint: &Checkpoint) -> EngineResult<()>;
}

impl<C: CheckpointStore + ?Sized> CheckpointStore for Arc<C> {
    fn read(&self) -> EngineResult<Checkpoint> {
        (**self).read()
    }

    fn write(&self, checkpoint: &Checkpoint) -> EngineResult<()> {
        (**self).write(checkpoint)
    }
}

/// Checkpoint kept in a plain text file.
///
/// Holds an exclusive lock on `<path>.lock` for its whole lifetime so two
/// tailers cannot share one checkpoint location.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    temp_path: PathBuf,
    write_guard: Mutex<()>,
    _lock_file: File,
}

impl FileCheckpointStore {
    /// Opens the store, creating the parent directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointStoreUnavailable` if the path is a directory, the
    /// parent cannot be created, the existing file cannot be read, or
    /// another process holds the lock.
    pub fn open(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let unavailable = {
            let path = path.clone();
            move |reason: String| EngineError::store_unavailable(Some(path.clone()), reason)
        };

        if path.is_dir() {
            return Err(unavailable("path is a directory".into()));
        }
        let (lock_path, temp_path) = match (sibling(&path, ".lock"), sibling(&path, ".tmp")) {
            (Some(lock), Some(temp)) => (lock, temp),
            _ => return Err(unavailable("path has no file name".into())),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| unavailable(format!("cannot create directory: {e}")))?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| unavailable(format!("cannot open lock file: {e}")))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(unavailable(
                "checkpoint is locked by another tailer".into(),
            ));
        }

        let store = Self {
            path,
            temp_path,
            write_guard: Mutex::new(()),
            _lock_file: lock_file,
        };
        store
            .read()
            .map_err(|e| unavailable(format!("cannot read checkpoint: {e}")))?;
        Ok(store)
    }

    /// Returns the checkpoint file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> io::Result<()> {
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn read(&self) -> EngineResult<Checkpoint> {
        read_checkpoint_file(&self.path)
    }

    fn write(&self, checkpoint: &Checkpoint) -> EngineResult<()> {
        let _guard = self.write_guard.lock();
        let persist = || -> io::Result<()> {
            let mut file = File::create(&self.temp_path)?;
            file.write_all(checkpoint.as_str().as_bytes())?;
            file.sync_all()?;
            drop(file);

            fs::rename(&self.temp_path, &self.path)?;
            self.sync_directory()
        };
        persist().map_err(|e| {
            EngineError::CheckpointStore(format!("{}: {e}", self.path.display()))
        })
    }
}

/// Reads a checkpoint file without taking the lock.
///
/// Used to inspect the checkpoint of a tailer that may be running.
pub fn read_checkpoint_file(path: &Path) -> EngineResult<Checkpoint> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Checkpoint::origin()),
        Err(e) => return Err(EngineError::CheckpointStore(e.to_string())),
    };

    if text.trim().is_empty() {
        return Ok(Checkpoint::origin());
    }
    match Checkpoint::parse(&text) {
        Some(checkpoint) => Ok(checkpoint),
        None => {
            tracing::warn!(
                path = %path.display(),
                "unparseable checkpoint, starting from the beginning"
            );
            Ok(Checkpoint::origin())
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> Option<PathBuf> {
    let mut name: OsString = path.file_name()?.to_os_string();
    name.push(suffix);
    Some(path.with_file_name(name))
}

/// An in-memory checkpoint store for testing.
///
/// Records every write so tests can check the exact checkpoint history.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    current: RwLock<Option<Checkpoint>>,
    history: RwLock<Vec<Checkpoint>>,
    fail_writes: AtomicBool,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds `checkpoint`.
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        let store = Self::new();
        *store.current.write() = Some(checkpoint);
        store
    }

    /// Replaces the stored value without recording a write, like an
    /// operator editing the checkpoint file.
    pub fn set(&self, checkpoint: Checkpoint) {
        *self.current.write() = Some(checkpoint);
    }

    /// Every checkpoint written, in order.
    pub fn history(&self) -> Vec<Checkpoint> {
        self.history.read().clone()
    }

    /// Makes subsequent writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn read(&self) -> EngineResult<Checkpoint> {
        Ok(self.current.read().clone().unwrap_or_default())
    }

    fn write(&self, checkpoint: &Checkpoint) -> EngineResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::CheckpointStore("injected write failure".into()));
        }
        *self.current.write() = Some(checkpoint.clone());
        self.history.write().push(checkpoint.clone());
        Ok(())
    }
}
