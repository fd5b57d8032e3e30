//! Error types for the mesh gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the mesh gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Composition data shorter than its fixed header
    #[error("composition data too short: {len} bytes, header needs {header}")]
    Composition { len: usize, header: usize },

    /// Node registry is at capacity
    #[error("node registry full ({capacity} nodes)")]
    RegistryFull { capacity: usize },

    /// Illegal capability state change
    #[error("capability error: {0}")]
    Capability(String),

    /// Mesh transport rejected a request before it left this device
    #[error("transport error: {0}")]
    Transport(String),

    /// Side-channel notifier error
    #[error("notifier error: {0}")]
    Notifier(String),

    /// Persistent state error
    #[error("store error: {0}")]
    Store(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
