//! Node registry for enrolled devices

use crate::mesh::{Address, DeviceId};
use crate::{Error, Result};

use super::types::NodeRecord;

/// Registry of devices the provisioner has enrolled
///
/// Records are keyed by device identifier and never removed; re-enrollment
/// updates the existing record in place.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    nodes: Vec<NodeRecord>,
    capacity: usize,
}

impl NodeRegistry {
    /// Create an empty registry holding at most `capacity` nodes
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::new(),
            capacity,
        }
    }

    /// Rebuild a registry from persisted records
    ///
    /// Records past `capacity` are dropped.
    #[must_use]
    pub fn from_records(capacity: usize, mut records: Vec<NodeRecord>) -> Self {
        if records.len() > capacity {
            tracing::warn!(
                stored = records.len(),
                capacity,
                "persisted registry larger than capacity, truncating"
            );
            records.truncate(capacity);
        }
        Self {
            nodes: records,
            capacity,
        }
    }

    /// Insert a newly enrolled device, or update address and element span of
    /// a known one
    ///
    /// # Errors
    ///
    /// Returns error if the device is new and the registry is full
    pub fn upsert(
        &mut self,
        device_id: DeviceId,
        node_index: u16,
        address: Address,
        element_count: u8,
    ) -> Result<&mut NodeRecord> {
        if let Some(pos) = self.nodes.iter().position(|n| n.device_id == device_id) {
            let node = &mut self.nodes[pos];
            if node.address != address || node.element_count != element_count {
                tracing::info!(
                    device = %device_id,
                    old = %node.address,
                    new = %address,
                    "re-enrolled node moved"
                );
            }
            node.address = address;
            node.element_count = element_count;
            return Ok(node);
        }

        if self.is_full() {
            return Err(Error::RegistryFull {
                capacity: self.capacity,
            });
        }

        self.nodes
            .push(NodeRecord::new(device_id, node_index, address, element_count));
        let last = self.nodes.len() - 1;
        Ok(&mut self.nodes[last])
    }

    /// Get a node by device identifier
    #[must_use]
    pub fn get(&self, device_id: &DeviceId) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.device_id == *device_id)
    }

    /// Find the node whose element span covers `address`
    #[must_use]
    pub fn find_by_address(&self, address: Address) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.contains_address(address))
    }

    /// Mutable lookup by element span
    pub fn find_by_address_mut(&mut self, address: Address) -> Option<&mut NodeRecord> {
        self.nodes.iter_mut().find(|n| n.contains_address(address))
    }

    /// Whether the device has been enrolled before
    #[must_use]
    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.get(device_id).is_some()
    }

    /// All records in enrollment order
    #[must_use]
    pub fn records(&self) -> &[NodeRecord] {
        &self.nodes
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.capacity
    }

    /// Number of enrolled nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(n: u8) -> DeviceId {
        let mut raw = [0xdd; 16];
        raw[15] = n;
        DeviceId(raw)
    }

    #[test]
    fn upsert_and_get() {
        let mut registry = NodeRegistry::new(10);
        registry.upsert(device(1), 0, Address(0x0005), 1).unwrap();

        let node = registry.get(&device(1)).unwrap();
        assert_eq!(node.address, Address(0x0005));
        assert_eq!(node.display_name, "NODE-0");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn re_enrollment_updates_in_place() {
        let mut registry = NodeRegistry::new(10);
        registry.upsert(device(1), 0, Address(0x0005), 1).unwrap();
        registry.upsert(device(1), 3, Address(0x0009), 2).unwrap();

        assert_eq!(registry.len(), 1);
        let node = registry.get(&device(1)).unwrap();
        assert_eq!(node.address, Address(0x0009));
        assert_eq!(node.element_count, 2);
        // name is kept from the first enrollment
        assert_eq!(node.display_name, "NODE-0");
    }

    #[test]
    fn full_registry_rejects_new_devices() {
        let mut registry = NodeRegistry::new(2);
        registry.upsert(device(1), 0, Address(5), 1).unwrap();
        registry.upsert(device(2), 1, Address(6), 1).unwrap();
        assert!(registry.is_full());

        let err = registry.upsert(device(3), 2, Address(7), 1).unwrap_err();
        assert!(matches!(err, Error::RegistryFull { capacity: 2 }));

        // known devices can still re-enroll
        assert!(registry.upsert(device(2), 1, Address(8), 1).is_ok());
    }

    #[test]
    fn lookup_by_element_span() {
        let mut registry = NodeRegistry::new(10);
        registry.upsert(device(1), 0, Address(0x0005), 3).unwrap();
        registry.upsert(device(2), 1, Address(0x0008), 1).unwrap();

        assert_eq!(
            registry.find_by_address(Address(0x0007)).unwrap().device_id,
            device(1)
        );
        assert_eq!(
            registry.find_by_address(Address(0x0008)).unwrap().device_id,
            device(2)
        );
        assert!(registry.find_by_address(Address(0x0009)).is_none());
    }

    #[test]
    fn restore_truncates_to_capacity() {
        let records = (0..4)
            .map(|i| NodeRecord::new(device(i), u16::from(i), Address(5 + u16::from(i)), 1))
            .collect();
        let registry = NodeRegistry::from_records(3, records);
        assert_eq!(registry.len(), 3);
    }
}
