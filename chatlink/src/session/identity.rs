//! Durable client identity and the per-connection conversation id.

use std::path::{Path, PathBuf};

use chatlink_proto::message::{ClientId, ConversationId};

/// Errors that can occur while loading or persisting the client identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// Reading the identity file failed.
    #[error("failed to read identity file {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Writing the identity file failed.
    #[error("failed to write identity file {path}: {source}")]
    Write {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Who this client is, and which server session it currently holds.
///
/// The client id is generated once per installation and reused verbatim
/// on every reconnect. The conversation id is only ever the value from the
/// latest `connect_confirm` and is dropped on every disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    client_id: ClientId,
    conversation_id: Option<ConversationId>,
}

impl SessionIdentity {
    /// Identity with a known client id and no conversation.
    #[must_use]
    pub const fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            conversation_id: None,
        }
    }

    /// Default identity file: `<data dir>/chatlink/client_id`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("chatlink").join("client_id"))
    }

    /// Load the client id from `path`, generating and persisting a new one
    /// if the file is missing or empty.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the file exists but cannot be read, or
    /// a freshly generated id cannot be written.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        match std::fs::read_to_string(path) {
            Ok(contents) if !contents.trim().is_empty() => {
                let client_id = ClientId::new(contents.trim());
                tracing::debug!(client_id = %client_id, "loaded client identity");
                return Ok(Self::new(client_id));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(IdentityError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        let client_id = ClientId::generate();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| IdentityError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, client_id.as_str()).map_err(|source| IdentityError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(client_id = %client_id, "generated new client identity");
        Ok(Self::new(client_id))
    }

    /// The durable client id.
    #[must_use]
    pub const fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The active conversation, if a session is granted.
    #[must_use]
    pub const fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    /// Record the conversation granted by the server.
    pub fn begin_conversation(&mut self, conversation_id: ConversationId) {
        self.conversation_id = Some(conversation_id);
    }

    /// Forget the current conversation, returning it.
    pub const fn end_conversation(&mut self) -> Option<ConversationId> {
        self.conversation_id.take()
    }
}
