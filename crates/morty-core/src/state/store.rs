//! JSON state file persistence.
//!
//! Saves go through a temp file in the same directory followed by a rename,
//! so a reader never sees a half-written state.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::NamedTempFile;
use thiserror::Error;

use super::ExecutionState;

/// Attempts at finding a free backup name within the same second.
const MAX_BACKUP_SUFFIX: u32 = 1000;

/// Errors raised by [`StateStore`].
#[derive(Debug, Error)]
pub enum StateError {
    /// No state file yet. Callers treat this as a first run.
    #[error("state file {} does not exist", .0.display())]
    NotFound(PathBuf),

    /// The file exists but cannot be trusted. Recover by resyncing from the
    /// plan explicitly; it is never discarded automatically.
    #[error("state file {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no free backup name for {} after {} attempts", .0.display(), MAX_BACKUP_SUFFIX)]
    BackupNameExhausted(PathBuf),
}

impl StateError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Reads and writes one state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load and validate the state file.
    pub fn load(&self) -> Result<ExecutionState, StateError> {
        read_state(&self.path)
    }

    /// Load the state file, mapping [`StateError::NotFound`] to `None`.
    pub fn load_optional(&self) -> Result<Option<ExecutionState>, StateError> {
        match self.load() {
            Ok(state) => Ok(Some(state)),
            Err(StateError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Write the full state atomically.
    pub fn save(&self, state: &ExecutionState) -> Result<(), StateError> {
        let bytes = to_bytes(state)?;
        write_atomic(&self.path, &bytes)?;
        tracing::debug!(path = %self.path.display(), "saved state");
        Ok(())
    }

    /// Copy the current state file to a timestamped backup next to it.
    ///
    /// Backups are named `<stem>_<YYYYmmdd_HHMMSS>[_N].backup.<ext>`.
    pub fn backup(&self) -> Result<PathBuf, StateError> {
        if !self.exists() {
            return Err(StateError::NotFound(self.path.clone()));
        }
        let (dir, stem, ext) = self.name_parts();
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();

        let mut target = dir.join(format!("{stem}_{stamp}.backup{ext}"));
        let mut suffix = 1;
        while target.exists() {
            if suffix > MAX_BACKUP_SUFFIX {
                return Err(StateError::BackupNameExhausted(self.path.clone()));
            }
            target = dir.join(format!("{stem}_{stamp}_{suffix}.backup{ext}"));
            suffix += 1;
        }

        fs::copy(&self.path, &target).map_err(|e| StateError::io(&target, e))?;
        tracing::info!(backup = %target.display(), "backed up state file");
        Ok(target)
    }

    /// Backups of this state file, oldest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>, StateError> {
        let (dir, stem, ext) = self.name_parts();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let prefix = format!("{stem}_");
        let suffix = format!(".backup{ext}");

        let mut backups: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|e| StateError::io(&dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(&suffix))
            })
            .collect();
        backups.sort();
        Ok(backups)
    }

    /// Validate `backup` and install it as the current state file.
    pub fn restore_from_backup(&self, backup: &Path) -> Result<ExecutionState, StateError> {
        let state = read_state(backup)?;
        self.save(&state)?;
        tracing::info!(backup = %backup.display(), "restored state from backup");
        Ok(state)
    }

    /// `(directory, file stem, ".ext" or "")` of the state path.
    fn name_parts(&self) -> (PathBuf, String, String) {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("status")
            .to_owned();
        let ext = self
            .path
            .extension()
            .and_then(|s| s.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        (dir, stem, ext)
    }
}

/// Serialize a state the way it is written to disk: pretty JSON plus a
/// trailing newline.
pub fn to_bytes(state: &ExecutionState) -> Result<Vec<u8>, StateError> {
    let mut bytes = serde_json::to_vec_pretty(state)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn read_state(path: &Path) -> Result<ExecutionState, StateError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StateError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(StateError::io(path, e)),
    };
    let corrupt = |reason: String| StateError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let state: ExecutionState =
        serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;
    state.validate().map_err(corrupt)?;
    Ok(state)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| StateError::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StateError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| StateError::io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StateError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| StateError::io(path, e.error))?;
    Ok(())
}
