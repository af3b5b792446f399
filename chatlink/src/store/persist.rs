//! Local persistence of the conversation.
//!
//! Defines the [`StateStore`] trait plus two implementations:
//! [`InMemoryStateStore`] for tests and [`FileStateStore`], which writes a
//! postcard snapshot next to the target and renames it into place.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use super::model::Message;

/// Errors that can occur while loading or saving local state.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Reading or writing the backing file failed.
    #[error("persistence I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The state could not be encoded.
    #[error("failed to encode state: {0}")]
    Encode(String),

    /// The stored bytes are not a valid state snapshot.
    #[error("failed to decode state: {0}")]
    Decode(String),
}

/// Everything that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Conversation history, oldest first.
    pub messages: Vec<Message>,
    /// Email left by the user after an ended session.
    pub email: Option<String>,
}

/// Storage for [`PersistedState`].
///
/// Implementations:
/// - [`InMemoryStateStore`]: in-memory store for testing
/// - [`FileStateStore`]: postcard snapshot on disk
pub trait StateStore: Send + Sync + 'static {
    /// Load the stored state. A store that was never written returns the
    /// default state.
    fn load(&self) -> impl Future<Output = Result<PersistedState, PersistError>> + Send;

    /// Replace the stored state with `state`.
    fn save(&self, state: &PersistedState) -> impl Future<Output = Result<(), PersistError>> + Send;
}

/// In-memory [`StateStore`] for testing.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    state: parking_lot::Mutex<PersistedState>,
    saves: AtomicUsize,
}

impl InMemoryStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `state`.
    #[must_use]
    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: parking_lot::Mutex::new(state),
            saves: AtomicUsize::new(0),
        }
    }

    /// The last saved state.
    #[must_use]
    pub fn stored(&self) -> PersistedState {
        self.state.lock().clone()
    }

    /// How many times [`StateStore::save`] was called.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }
}

impl StateStore for InMemoryStateStore {
    async fn load(&self) -> Result<PersistedState, PersistError> {
        Ok(self.state.lock().clone())
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PersistError> {
        *self.state.lock() = state.clone();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// [`StateStore`] backed by a single postcard file.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Store state at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default state file: `<data dir>/chatlink/state.bin`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("chatlink").join("state.bin"))
    }

    /// The backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    async fn load(&self) -> Result<PersistedState, PersistError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default());
            }
            Err(e) => return Err(e.into()),
        };
        postcard::from_bytes(&bytes).map_err(|e| PersistError::Decode(e.to_string()))
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PersistError> {
        let bytes = postcard::to_allocvec(state).map_err(|e| PersistError::Encode(e.to_string()))?;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::trace!(path = %self.path.display(), bytes = bytes.len(), "state saved");
        Ok(())
    }
}
