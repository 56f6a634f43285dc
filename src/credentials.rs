//! Bearer-token storage.
//!
//! The API client never reads a global: it is handed a [`CredentialProvider`]
//! at construction. The token is loaded at process start and cleared on
//! logout or when the server answers 401.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::ChatError;

pub trait CredentialProvider: Send + Sync {
    fn get(&self) -> Option<String>;
    fn set(&self, token: &str) -> Result<(), ChatError>;
    fn clear(&self) -> Result<(), ChatError>;
}

/// Process-lifetime token slot.
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    token: RwLock<Option<String>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }
}

impl CredentialProvider for MemoryCredentials {
    fn get(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    fn set(&self, token: &str) -> Result<(), ChatError> {
        let mut guard = self
            .token
            .write()
            .map_err(|_| ChatError::Io("internal: lock poisoned".to_string()))?;
        *guard = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), ChatError> {
        let mut guard = self
            .token
            .write()
            .map_err(|_| ChatError::Io("internal: lock poisoned".to_string()))?;
        *guard = None;
        Ok(())
    }
}

/// Token persisted to a file, cached in memory after the first load.
#[derive(Debug)]
pub struct FileCredentials {
    path: PathBuf,
    cache: MemoryCredentials,
}

impl FileCredentials {
    /// Open the store at `path`, loading an existing token if present.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cache = MemoryCredentials::new();
        if let Ok(text) = std::fs::read_to_string(&path) {
            let token = text.trim();
            if !token.is_empty() {
                let _ = cache.set(token);
            }
        }
        Self { path, cache }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialProvider for FileCredentials {
    fn get(&self) -> Option<String> {
        self.cache.get()
    }

    fn set(&self, token: &str) -> Result<(), ChatError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, token)?;
        self.cache.set(token)
    }

    fn clear(&self) -> Result<(), ChatError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cache.clear()
    }
}
