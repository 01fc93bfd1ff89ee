//! On-disk supervisor state.
//!
//! The state directory holds `state.json` (handles of projects started by an
//! earlier invocation), `pmctl.lock` (single-instance guard) and the
//! per-project log files under `logs/`.

use std::collections::BTreeMap;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SupervisorError, SupervisorResult};

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "pmctl.lock";
const LOG_DIR: &str = "logs";
const STATE_VERSION: u32 = 1;

/// A process handle as recorded between invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedHandle {
    pub pid: u32,
    /// Start time in seconds since the Unix epoch.
    pub started_at: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    processes: BTreeMap<String, PersistedHandle>,
}

/// Reads and writes `state.json` and resolves paths inside the state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Default log file of a project.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.dir.join(LOG_DIR).join(format!("{}.log", name))
    }

    /// Loads persisted handles. A missing file is an empty table; an
    /// unreadable one is logged and treated as empty.
    pub fn load(&self) -> BTreeMap<String, PersistedHandle> {
        let path = self.state_path();
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read state file");
                return BTreeMap::new();
            }
        };
        match serde_json::from_str::<StateFile>(&data) {
            Ok(state) => state.processes,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring corrupt state file");
                BTreeMap::new()
            }
        }
    }

    /// Replaces the persisted table atomically.
    pub fn save(&self, processes: BTreeMap<String, PersistedHandle>) -> SupervisorResult<()> {
        fs::create_dir_all(&self.dir)?;
        let state = StateFile {
            version: STATE_VERSION,
            processes,
        };
        let serialized = serde_json::to_string_pretty(&state)?;
        let path = self.state_path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), entries = state.processes.len(), "saved state");
        Ok(())
    }
}

/// Exclusive lock on `<state_dir>/pmctl.lock`, held for the
/// lifetime of the value.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    _file: File,
}

impl InstanceLock {
    /// Acquires the lock or fails with `InstanceLocked` when another
    /// instance holds it.
    pub fn acquire(dir: &Path) -> SupervisorResult<Self> {
        Self::try_acquire(dir)?.ok_or_else(|| SupervisorError::InstanceLocked(dir.to_path_buf()))
    }

    /// Acquires the lock without blocking; `None` when it is held elsewhere.
    pub fn try_acquire(dir: &Path) -> SupervisorResult<Option<Self>> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if let Err(err) = file.try_lock_exclusive() {
            if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Ok(None);
            }
            return Err(err.into());
        }
        // Write through the locked handle; Windows locks are mandatory.
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        Ok(Some(Self { path, _file: file }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Platform default for the state directory.
pub fn default_state_dir() -> PathBuf {
    if let Ok(path) = env::var("XDG_STATE_HOME") {
        if !path.is_empty() {
            return PathBuf::from(path).join("pmctl");
        }
    }
    if cfg!(windows) {
        if let Ok(path) = env::var("LOCALAPPDATA") {
            return PathBuf::from(path).join("pmctl");
        }
    }
    env::var("HOME")
        .map(|home| PathBuf::from(home).join(".local").join("state").join("pmctl"))
        .unwrap_or_else(|_| PathBuf::from(".pmctl"))
}
