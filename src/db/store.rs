//! Key/value stores for small state blobs

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use rusqlite::OptionalExtension;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::DbPool;
use crate::{Error, Result};

/// Durable save/restore of named state blobs
pub trait StateStore: Send + Sync {
    /// Store `blob` under `key`, replacing any previous value
    ///
    /// # Errors
    ///
    /// Returns error if the blob cannot be written
    fn save(&self, key: &str, blob: &[u8]) -> Result<()>;

    /// Load the blob stored under `key`
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    fn restore(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Serialize `value` as JSON and save it
///
/// # Errors
///
/// Returns error if serialization or the write fails
pub fn save_json<T: Serialize + ?Sized>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let blob = serde_json::to_vec(value)?;
    store.save(key, &blob)
}

/// Restore and decode a JSON value saved with [`save_json`]
///
/// # Errors
///
/// Returns error if the read fails or the stored blob does not decode
pub fn restore_json<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    store
        .restore(key)?
        .map(|blob| serde_json::from_slice(&blob).map_err(Error::from))
        .transpose()
}

/// `SQLite`-backed store
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Create a new store over an initialized pool
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl StateStore for SqliteStore {
    fn save(&self, key: &str, blob: &[u8]) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Store(e.to_string()))?;
        conn.execute(
            "INSERT INTO state (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, blob],
        )?;
        Ok(())
    }

    fn restore(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.pool.get().map_err(|e| Error::Store(e.to_string()))?;
        let blob = conn
            .query_row("SELECT value FROM state WHERE key = ?1", [key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(blob)
    }
}

/// Volatile store for tests and the demo roles
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = blobs.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl StateStore for MemoryStore {
    fn save(&self, key: &str, blob: &[u8]) -> Result<()> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn restore(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }
}
