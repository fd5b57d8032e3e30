//! Configuration management for the mesh gateway
//!
//! Values are layered env > TOML file > defaults. Environment variables use
//! the `MESHLINK_` prefix.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mesh::Address;
use crate::{Error, Result};

/// Mesh gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Addressing, enrollment and keys
    pub mesh: MeshConfig,

    /// Send serialization, monitor and transport timeouts
    pub timing: TimingConfig,

    /// Side-channel limits
    pub bridge: BridgeConfig,

    /// Path to data directory (state database)
    pub data_dir: PathBuf,
}

/// Mesh addressing and provisioning configuration
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Group every vendor server subscribes to
    pub group_address: Address,

    /// Address of node index 0; command targets are offsets from it
    pub node_base_address: Address,

    /// Provisioner's own unicast address
    pub provisioner_address: Address,

    /// Registry capacity, known-node cap and command index range
    pub max_nodes: usize,

    /// Devices whose identifier does not start with this are not enrolled
    pub uuid_prefix: Vec<u8>,

    pub net_key_index: u16,
    pub app_key_index: u16,

    /// Re-issues of a timed-out bind/subscribe step before it is given up
    pub bind_timeout_retries: u8,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            group_address: crate::mesh::GROUP_ADDRESS,
            node_base_address: Address(0x0005),
            provisioner_address: Address(0x0001),
            max_nodes: 10,
            uuid_prefix: vec![0xdd, 0xdd],
            net_key_index: 0,
            app_key_index: 0,
            bind_timeout_retries: 2,
        }
    }
}

/// Timing configuration
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Longest a unicast send may stay in flight before it is reclaimed
    pub send_ceiling: Duration,

    /// Re-check period while waiting for an in-flight send
    pub send_recheck: Duration,

    /// Bounded wait for the monitor's last poll when disarming
    pub disarm_wait: Duration,

    /// Monitor poll interval
    pub monitor_interval: Duration,

    /// Pause between on/off sends on the fallback `ALL` path
    pub fallback_pause: Duration,

    /// Delivery window passed to the transport for vendor sends
    pub vendor_timeout: Duration,

    /// Delivery window passed to the transport for on/off sends
    pub onoff_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            send_ceiling: Duration::from_millis(5000),
            send_recheck: Duration::from_millis(100),
            disarm_wait: Duration::from_millis(3000),
            monitor_interval: Duration::from_millis(1000),
            fallback_pause: Duration::from_millis(200),
            vendor_timeout: Duration::from_millis(5000),
            onoff_timeout: Duration::from_millis(2000),
        }
    }
}

/// Side-channel configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Single-frame payload limit
    pub frame_limit: usize,

    /// Longest forwarded message; longer ones are truncated
    pub max_message_len: usize,

    /// Longest accepted command; longer ones are truncated
    pub max_command_len: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            frame_limit: 20,
            max_message_len: 127,
            max_command_len: 64,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mesh: MeshConfig::default(),
            timing: TimingConfig::default(),
            bridge: BridgeConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

/// Default data directory: `~/.local/share/meshlink` on Linux
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/meshlink"),
        |d| d.data_dir().join("meshlink"),
    )
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// The file is read from `path` if given, else the standard path.
    ///
    /// # Errors
    ///
    /// Returns error if an environment value does not parse or the result is
    /// invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path);
        Self::from_sources(&fc, |name| std::env::var(name).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if an environment value does not parse or the result is
    /// invalid
    pub fn from_sources<F>(fc: &file::MeshlinkConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let uuid_prefix = match env("MESHLINK_UUID_PREFIX").or_else(|| fc.mesh.uuid_prefix.clone()) {
            Some(hex_prefix) => hex::decode(hex_prefix.trim())
                .map_err(|e| Error::Config(format!("uuid prefix is not hex: {e}")))?,
            None => defaults.mesh.uuid_prefix,
        };

        let mesh = MeshConfig {
            group_address: address(&env, "MESHLINK_GROUP_ADDRESS", fc.mesh.group_address)?
                .unwrap_or(defaults.mesh.group_address),
            node_base_address: address(&env, "MESHLINK_NODE_BASE_ADDRESS", fc.mesh.node_base_address)?
                .unwrap_or(defaults.mesh.node_base_address),
            provisioner_address: address(
                &env,
                "MESHLINK_PROVISIONER_ADDRESS",
                fc.mesh.provisioner_address,
            )?
            .unwrap_or(defaults.mesh.provisioner_address),
            max_nodes: number(&env, "MESHLINK_MAX_NODES")?
                .or(fc.mesh.max_nodes)
                .unwrap_or(defaults.mesh.max_nodes),
            uuid_prefix,
            net_key_index: number(&env, "MESHLINK_NET_KEY_INDEX")?
                .or(fc.mesh.net_key_index)
                .unwrap_or(defaults.mesh.net_key_index),
            app_key_index: number(&env, "MESHLINK_APP_KEY_INDEX")?
                .or(fc.mesh.app_key_index)
                .unwrap_or(defaults.mesh.app_key_index),
            bind_timeout_retries: number(&env, "MESHLINK_BIND_TIMEOUT_RETRIES")?
                .or(fc.mesh.bind_timeout_retries)
                .unwrap_or(defaults.mesh.bind_timeout_retries),
        };

        let t = &fc.timing;
        let d = &defaults.timing;
        let timing = TimingConfig {
            send_ceiling: millis(&env, "MESHLINK_SEND_CEILING_MS", t.send_ceiling_ms)?
                .unwrap_or(d.send_ceiling),
            send_recheck: millis(&env, "MESHLINK_SEND_RECHECK_MS", t.send_recheck_ms)?
                .unwrap_or(d.send_recheck),
            disarm_wait: millis(&env, "MESHLINK_DISARM_WAIT_MS", t.disarm_wait_ms)?
                .unwrap_or(d.disarm_wait),
            monitor_interval: millis(&env, "MESHLINK_MONITOR_INTERVAL_MS", t.monitor_interval_ms)?
                .unwrap_or(d.monitor_interval),
            fallback_pause: millis(&env, "MESHLINK_FALLBACK_PAUSE_MS", t.fallback_pause_ms)?
                .unwrap_or(d.fallback_pause),
            vendor_timeout: millis(&env, "MESHLINK_VENDOR_TIMEOUT_MS", t.vendor_timeout_ms)?
                .unwrap_or(d.vendor_timeout),
            onoff_timeout: millis(&env, "MESHLINK_ONOFF_TIMEOUT_MS", t.onoff_timeout_ms)?
                .unwrap_or(d.onoff_timeout),
        };

        let bridge = BridgeConfig {
            frame_limit: number(&env, "MESHLINK_FRAME_LIMIT")?
                .or(fc.bridge.frame_limit)
                .unwrap_or(defaults.bridge.frame_limit),
            max_message_len: number(&env, "MESHLINK_MAX_MESSAGE_LEN")?
                .or(fc.bridge.max_message_len)
                .unwrap_or(defaults.bridge.max_message_len),
            max_command_len: number(&env, "MESHLINK_MAX_COMMAND_LEN")?
                .or(fc.bridge.max_command_len)
                .unwrap_or(defaults.bridge.max_command_len),
        };

        let data_dir = env("MESHLINK_DATA_DIR")
            .or_else(|| fc.storage.data_dir.clone())
            .map_or(defaults.data_dir, PathBuf::from);

        let config = Self {
            mesh,
            timing,
            bridge,
            data_dir,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the gateway cannot run with
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.bridge.frame_limit < 2 {
            return Err(Error::Config(format!(
                "frame limit must be at least 2 bytes, got {}",
                self.bridge.frame_limit
            )));
        }
        if self.bridge.max_message_len == 0 || self.bridge.max_command_len == 0 {
            return Err(Error::Config("message and command limits must be non-zero".into()));
        }
        if self.mesh.max_nodes == 0 {
            return Err(Error::Config("max_nodes must be at least 1".into()));
        }
        if !self.mesh.group_address.is_group() {
            return Err(Error::Config(format!(
                "{} is not a group address",
                self.mesh.group_address
            )));
        }
        for (name, addr) in [
            ("node base", self.mesh.node_base_address),
            ("provisioner", self.mesh.provisioner_address),
        ] {
            if !addr.is_unicast() {
                return Err(Error::Config(format!("{name} address {addr} is not unicast")));
            }
        }
        let last = usize::from(self.mesh.node_base_address.0).saturating_add(self.mesh.max_nodes);
        if last > 0x7FFF {
            return Err(Error::Config(format!(
                "{} nodes after {} run past the unicast range",
                self.mesh.max_nodes, self.mesh.node_base_address
            )));
        }
        if self.mesh.uuid_prefix.len() > 16 {
            return Err(Error::Config("uuid prefix longer than a device id".into()));
        }
        for (name, value) in [
            ("send_recheck", self.timing.send_recheck),
            ("send_ceiling", self.timing.send_ceiling),
            ("monitor_interval", self.timing.monitor_interval),
            ("vendor_timeout", self.timing.vendor_timeout),
            ("onoff_timeout", self.timing.onoff_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    /// Path of the state database
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("meshlink.db")
    }

    /// Create the data directory if needed
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn ensure_data_dir(&self) -> Result<&Path> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(&self.data_dir)
    }
}

/// Parse a 16-bit value written as decimal or `0x` hex
fn parse_u16(raw: &str) -> Option<u16> {
    let raw = raw.trim();
    raw.strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .map_or_else(|| raw.parse().ok(), |hex| u16::from_str_radix(hex, 16).ok())
}

fn address<F>(env: &F, name: &str, file: Option<u16>) -> Result<Option<Address>>
where
    F: Fn(&str) -> Option<String>,
{
    match env(name) {
        Some(raw) => parse_u16(&raw)
            .map(|v| Some(Address(v)))
            .ok_or_else(|| Error::Config(format!("{name}: invalid address '{raw}'"))),
        None => Ok(file.map(Address)),
    }
}

fn number<F, T>(env: &F, name: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    env(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("{name}: invalid number '{raw}'")))
        })
        .transpose()
}

fn millis<F>(env: &F, name: &str, file: Option<u64>) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(number::<F, u64>(env, name)?.or(file).map(Duration::from_millis))
}
