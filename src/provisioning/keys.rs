//! Provisioner key material

use std::fmt;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::db::{StateStore, restore_json, save_json};
use crate::mesh::AppKey;

/// Store key the provisioner keys are saved under
pub const KEYS_STATE_KEY: &str = "provisioner_keys";

/// Network/application key indices and the application key
///
/// The key itself never changes after creation; the indices may be
/// reassigned by the transport when the local keys are installed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionerKeys {
    pub net_index: u16,
    pub app_index: u16,
    key: [u8; 16],
    pub created_at: DateTime<Utc>,
}

impl ProvisionerKeys {
    /// Fresh random application key
    #[must_use]
    pub fn generate(net_index: u16, app_index: u16) -> Self {
        let mut key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            net_index,
            app_index,
            key,
            created_at: Utc::now(),
        }
    }

    /// Restore saved keys, or generate and save new ones
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read or written
    pub fn load_or_generate(store: &dyn StateStore, net_index: u16, app_index: u16) -> Result<Self> {
        if let Some(keys) = restore_json::<Self>(store, KEYS_STATE_KEY)? {
            tracing::info!(fingerprint = %keys.fingerprint(), "restored provisioner keys");
            return Ok(keys);
        }

        let keys = Self::generate(net_index, app_index);
        save_json(store, KEYS_STATE_KEY, &keys)?;
        tracing::info!(fingerprint = %keys.fingerprint(), "generated provisioner keys");
        Ok(keys)
    }

    /// Record indices the transport assigned to the local keys
    pub const fn assign_indices(&mut self, net_index: u16, app_index: u16) {
        self.net_index = net_index;
        self.app_index = app_index;
    }

    /// Key material as handed to the transport
    #[must_use]
    pub const fn app_key(&self) -> AppKey {
        AppKey {
            net_index: self.net_index,
            app_index: self.app_index,
            key: self.key,
        }
    }

    /// Short non-secret identifier for logs
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.key[..2])
    }
}

impl fmt::Debug for ProvisionerKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionerKeys")
            .field("net_index", &self.net_index)
            .field("app_index", &self.app_index)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
