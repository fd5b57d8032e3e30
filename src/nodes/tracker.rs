//! Passive tracking of nodes that have answered
//!
//! Used on the gateway side, which has no static map of the fleet. `ALL`
//! commands on the reduced on/off path walk this set.

use crate::mesh::Address;

/// Ordered, deduplicated set of addresses learned from replies
#[derive(Debug, Clone)]
pub struct NodeTracker {
    own_address: Address,
    known: Vec<Address>,
    capacity: usize,
    discovery_complete: bool,
}

impl NodeTracker {
    #[must_use]
    pub const fn new(own_address: Address, capacity: usize) -> Self {
        Self {
            own_address,
            known: Vec::new(),
            capacity,
            discovery_complete: false,
        }
    }

    /// Update this device's own address once it is provisioned
    pub const fn set_own_address(&mut self, address: Address) {
        self.own_address = address;
    }

    /// Record that `address` replied
    ///
    /// Returns true if the address was new. Our own address, non-unicast
    /// addresses and addresses past capacity are not recorded.
    pub fn learn(&mut self, address: Address) -> bool {
        if address == self.own_address || !address.is_unicast() {
            return false;
        }
        if self.known.contains(&address) {
            return false;
        }
        if self.known.len() >= self.capacity {
            tracing::warn!(%address, capacity = self.capacity, "known node set full");
            return false;
        }

        self.known.push(address);
        self.discovery_complete = false;
        tracing::info!(%address, total = self.known.len(), "registered node");
        true
    }

    /// Addresses in the order they were first heard
    #[must_use]
    pub fn known(&self) -> &[Address] {
        &self.known
    }

    #[must_use]
    pub fn first(&self) -> Option<Address> {
        self.known.first().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.known.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// No node answered at a probed address past the known range
    pub fn mark_discovery_complete(&mut self) {
        self.discovery_complete = true;
    }

    #[must_use]
    pub const fn is_discovery_complete(&self) -> bool {
        self.discovery_complete
    }
}
