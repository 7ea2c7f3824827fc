//! Persistence for [`RateLimitState`].

use super::RateLimitState;
use crate::{FetchError, Result};
use fd_lock::RwLock;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Read-modify-write access to the shared limiter state.
///
/// `update` runs the closure inside an exclusive critical section and
/// returns the state as left by it. `peek` reads without locking and treats
/// anything unreadable as the default state.
pub trait StateStore: Send + Sync {
    /// Mutate the state under exclusive access.
    fn update(&self, f: &mut dyn FnMut(&mut RateLimitState)) -> Result<RateLimitState>;

    /// Lock-free snapshot.
    fn peek(&self) -> RateLimitState;
}

/// JSON file guarded by a companion `.lock` file.
///
/// Safe across processes: every update takes an exclusive advisory lock,
/// re-reads the file, and replaces it atomically.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl FileStateStore {
    /// Store at `path`, waiting at most `lock_timeout` for the lock.
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            lock_timeout,
        }
    }

    /// Path of the JSON state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_state(&self) -> RateLimitState {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Unreadable rate limit state, treating as clear"
                );
                RateLimitState::default()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => RateLimitState::default(),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Cannot read rate limit state, treating as clear"
                );
                RateLimitState::default()
            }
        }
    }

    fn write_state(&self, state: &RateLimitState) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let json = serde_json::to_vec_pretty(state)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| FetchError::Io(e.error))?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn update(&self, f: &mut dyn FnMut(&mut RateLimitState)) -> Result<RateLimitState> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;
        let mut lock = RwLock::new(lock_file);

        let started = Instant::now();
        loop {
            match lock.try_write() {
                Ok(_guard) => {
                    let mut state = self.read_state();
                    let before = state.clone();
                    f(&mut state);
                    if state != before {
                        self.write_state(&state)?;
                    }
                    return Ok(state);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if started.elapsed() >= self.lock_timeout {
                        return Err(FetchError::LockTimeout {
                            path: self.path.clone(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    debug!(path = %self.lock_path.display(), "Rate limit state locked, retrying");
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn peek(&self) -> RateLimitState {
        self.read_state()
    }
}

/// In-process store for callers that share one runtime.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<RateLimitState>,
}

impl MemoryStateStore {
    /// Start from the default (clear) state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a given state.
    pub fn with_state(state: RateLimitState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn update(&self, f: &mut dyn FnMut(&mut RateLimitState)) -> Result<RateLimitState> {
        let mut state = self.state.lock();
        f(&mut *state);
        Ok(state.clone())
    }

    fn peek(&self) -> RateLimitState {
        self.state.lock().clone()
    }
}
