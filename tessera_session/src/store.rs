//! Durable storage for the current token set

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::TokenSet;

#[cfg(feature = "file")]
pub mod file;
pub mod in_memory;

#[cfg(feature = "file")]
pub use file::FileStore;
pub use in_memory::InMemoryStore;

/// The storage key used when none is configured
pub const DEFAULT_STORAGE_KEY: &str = "auth-tokens";

/// An error raised by a key-value store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying storage could not be accessed
    #[error("storage I/O error")]
    Io(#[from] std::io::Error),

    /// The key cannot be represented by this store
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),
}

/// A durable string key-value store
///
/// Values survive process restarts but not explicit removal.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`, if any
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Stores `value` under `key`, replacing any prior value
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removes the value stored under `key`
    ///
    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Persists a single token set under a fixed key
///
/// Storage failures are logged and otherwise swallowed: a token set that
/// cannot be read is the same as no token set at all.
#[derive(Clone)]
pub struct TokenStore {
    kv: Arc<dyn KeyValueStore>,
    key: String,
}

impl TokenStore {
    /// Constructs a token store over the given key-value store
    pub fn new(kv: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            kv,
            key: key.into(),
        }
    }

    /// The key the token set is stored under
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Writes the token set, overwriting any prior value
    pub async fn save(&self, tokens: &TokenSet) {
        let data = match serde_json::to_string(tokens) {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(
                    key = %self.key,
                    error = (&error as &dyn std::error::Error),
                    "unable to serialize token set"
                );
                return;
            }
        };

        match self.kv.set(&self.key, &data).await {
            Ok(()) => tracing::trace!(key = %self.key, "persisted token set"),
            Err(error) => tracing::warn!(
                key = %self.key,
                error = (&error as &dyn std::error::Error),
                "unable to persist token set"
            ),
        }
    }

    /// Reads the stored token set
    ///
    /// Returns `None` if nothing is stored or the stored value is unreadable.
    pub async fn load(&self) -> Option<TokenSet> {
        let data = match self.kv.get(&self.key).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                tracing::trace!(key = %self.key, "no token set in storage");
                return None;
            }
            Err(error) => {
                tracing::warn!(
                    key = %self.key,
                    error = (&error as &dyn std::error::Error),
                    "unable to read token set from storage"
                );
                return None;
            }
        };

        match serde_json::from_str(&data) {
            Ok(tokens) => Some(tokens),
            Err(error) => {
                tracing::warn!(
                    key = %self.key,
                    error = (&error as &dyn std::error::Error),
                    "stored token set is not parseable, ignoring"
                );
                None
            }
        }
    }

    /// Removes the stored token set
    pub async fn clear(&self) {
        if let Err(error) = self.kv.remove(&self.key).await {
            tracing::warn!(
                key = %self.key,
                error = (&error as &dyn std::error::Error),
                "unable to remove token set from storage"
            );
        }
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
