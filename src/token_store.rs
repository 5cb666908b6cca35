//! Durable sequence-token bookkeeping.
//!
//! CloudWatch Logs hands back a new sequence token with every accepted append.
//! Tokens are persisted per (group, stream) under the key
//! `sequenceToken-{group}:{stream}` so a restarted agent resumes with the last
//! token it saw. Several agents may share one backend without coordination;
//! staleness is corrected through the service's conflict responses.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by a token store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Token store I/O failed for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode token store {}: {source}", .path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Token store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Storage key for the token of a (group, stream) pair.
pub fn storage_key(group: &str, stream: &str) -> String {
    format!("sequenceToken-{}:{}", group, stream)
}

/// Durable key-value backend for sequence tokens.
pub trait TokenStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, token: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Process-local token store.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tokens.
    pub fn len(&self) -> usize {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tokens.get(key).cloned())
    }

    fn set(&self, key: &str, token: &str) -> Result<(), StoreError> {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.insert(key.to_string(), token.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.remove(key);
        Ok(())
    }
}

/// Token store persisted as a JSON object in a single file.
///
/// Every operation re-reads the file so tokens written by other agents are
/// observed. Writes go to a sibling temp file that is renamed into place.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            // An unreadable file only costs a token conflict; the next set rewrites it
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(tokens) => Ok(tokens),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Token store is not valid JSON, treating it as empty"
                    );
                    Ok(BTreeMap::new())
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn persist(&self, tokens: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let body = serde_json::to_vec_pretty(tokens).map_err(|source| StoreError::Encode {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, token: &str) -> Result<(), StoreError> {
        let mut tokens = self.load()?;
        tokens.insert(key.to_string(), token.to_string());
        self.persist(&tokens)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut tokens = self.load()?;
        if tokens.remove(key).is_some() {
            self.persist(&tokens)?;
        }
        Ok(())
    }
}

/// Cached view of the token for one (group, stream) pair.
///
/// The durable value is read on first access only; writes go to both the
/// cache and the backend. Backend calls run on the blocking thread pool so a
/// file-backed store never stalls the runtime.
#[derive(Debug)]
pub struct SequenceTokens {
    store: Arc<dyn TokenStore>,
    key: String,
    cached: Option<String>,
}

impl SequenceTokens {
    pub fn new(store: Arc<dyn TokenStore>, group: &str, stream: &str) -> Self {
        Self {
            store,
            key: storage_key(group, stream),
            cached: None,
        }
    }

    /// Current token, loading it from the backend if not cached yet.
    pub async fn get(&mut self) -> Result<Option<String>, StoreError> {
        if self.cached.as_deref().map_or(true, str::is_empty) {
            self.cached = self.with_store(|store, key| store.get(key)).await?;
            debug!(key = %self.key, found = self.cached.is_some(), "Loaded sequence token");
        }
        Ok(self.cached.clone())
    }

    /// Record a token. Empty tokens are ignored.
    pub async fn set(&mut self, token: &str) -> Result<(), StoreError> {
        if token.is_empty() {
            warn!(key = %self.key, "No new sequence token provided");
            return Ok(());
        }
        self.cached = Some(token.to_string());
        let token = token.to_string();
        self.with_store(move |store, key| store.set(key, &token)).await
    }

    /// Forget the token in both the cache and the backend.
    pub async fn remove(&mut self) -> Result<(), StoreError> {
        self.cached = None;
        self.with_store(|store, key| store.remove(key)).await
    }

    async fn with_store<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TokenStore, &str) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        let key = self.key.clone();
        tokio::task::spawn_blocking(move || op(store.as_ref(), &key)).await?
    }
}
