//! TOML configuration file loading
//!
//! Supports `~/.config/meshlink/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct MeshlinkConfigFile {
    /// Addressing, enrollment and key settings
    #[serde(default)]
    pub mesh: MeshFileConfig,

    /// Send, monitor and timeout intervals
    #[serde(default)]
    pub timing: TimingFileConfig,

    /// Side-channel limits
    #[serde(default)]
    pub bridge: BridgeFileConfig,

    /// Storage locations
    #[serde(default)]
    pub storage: StorageFileConfig,
}

/// Mesh addressing and provisioning
#[derive(Debug, Default, Deserialize)]
pub struct MeshFileConfig {
    /// Group address for `ALL` commands (e.g. `0xC000`)
    pub group_address: Option<u16>,

    /// Address of node index 0
    pub node_base_address: Option<u16>,

    /// Provisioner's own unicast address
    pub provisioner_address: Option<u16>,

    /// Maximum fleet size
    pub max_nodes: Option<usize>,

    /// Enrollment filter as hex (e.g. "dddd")
    pub uuid_prefix: Option<String>,

    pub net_key_index: Option<u16>,
    pub app_key_index: Option<u16>,

    /// Re-issues of a timed-out bind/subscribe step
    pub bind_timeout_retries: Option<u8>,
}

/// Timing configuration, all in milliseconds
#[derive(Debug, Default, Deserialize)]
pub struct TimingFileConfig {
    pub send_ceiling_ms: Option<u64>,
    pub send_recheck_ms: Option<u64>,
    pub disarm_wait_ms: Option<u64>,
    pub monitor_interval_ms: Option<u64>,
    pub fallback_pause_ms: Option<u64>,
    pub vendor_timeout_ms: Option<u64>,
    pub onoff_timeout_ms: Option<u64>,
}

/// Side-channel configuration
#[derive(Debug, Default, Deserialize)]
pub struct BridgeFileConfig {
    /// Single-frame limit in bytes
    pub frame_limit: Option<usize>,
    /// Longest forwarded message; longer ones are truncated
    pub max_message_len: Option<usize>,
    /// Longest accepted command; longer ones are truncated
    pub max_command_len: Option<usize>,
}

/// Storage configuration
#[derive(Debug, Default, Deserialize)]
pub struct StorageFileConfig {
    /// Directory for the state database
    pub data_dir: Option<String>,
}

/// Load the TOML config file from `path`, or the standard path
///
/// Returns `MeshlinkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> MeshlinkConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return MeshlinkConfigFile::default();
    };

    if !path.exists() {
        return MeshlinkConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                MeshlinkConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            MeshlinkConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/meshlink/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("meshlink").join("config.toml"))
}
