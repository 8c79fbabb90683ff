use std::sync::{Arc, Weak};

use dashmap::DashMap;

use mcm_types::Result;

use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;

/// An open fabric device, keyed by its PCI port (e.g. `"0000:31:00.0"`).
///
/// A device is shared by every connection on the same port and is released
/// when the last holder drops its `Arc`.
pub trait Device: Send + Sync {
    fn dev_port(&self) -> &str;

    /// Create a directional endpoint on this device.
    fn create_endpoint(&self, cfg: &EndpointConfig) -> Result<Arc<dyn Endpoint>>;
}

/// A fabric provider: the factory for devices.
///
/// Production code uses a transport-backed implementation; tests use the
/// scriptable mock in [`crate::testing`].
pub trait Fabric: Send + Sync {
    fn open_device(&self, dev_port: &str) -> Result<Arc<dyn Device>>;
}

/// Deduplicates live devices per PCI port.
///
/// Entries are weak: the registry never keeps a device alive, so teardown
/// stays tied to the last connection holding the `Arc`. A later `open` for
/// the same port after the device died opens it afresh.
pub struct DeviceRegistry {
    fabric: Arc<dyn Fabric>,
    devices: DashMap<String, Weak<dyn Device>>,
}

impl DeviceRegistry {
    pub fn new(fabric: Arc<dyn Fabric>) -> Self {
        Self {
            fabric,
            devices: DashMap::new(),
        }
    }

    /// Return the live device for `dev_port`, opening it if necessary.
    pub fn open(&self, dev_port: &str) -> Result<Arc<dyn Device>> {
        if let Some(entry) = self.devices.get(dev_port) {
            if let Some(device) = entry.value().upgrade() {
                return Ok(device);
            }
        }
        let device = self.fabric.open_device(dev_port)?;
        self.devices
            .insert(dev_port.to_string(), Arc::downgrade(&device));
        tracing::debug!(dev_port, "opened fabric device");
        Ok(device)
    }

    /// Number of devices still held by at least one connection.
    pub fn live_devices(&self) -> usize {
        self.devices.retain(|_, weak| weak.strong_count() > 0);
        self.devices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFabric;

    #[test]
    fn test_open_deduplicates_per_port() {
        let fabric = MockFabric::new();
        let registry = DeviceRegistry::new(fabric.provider());

        let a = registry.open("0000:31:00.0").unwrap();
        let b = registry.open("0000:31:00.0").unwrap();
        let c = registry.open("0000:4b:00.0").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(fabric.devices_opened(), 2);
        assert_eq!(registry.live_devices(), 2);
    }

    #[test]
    fn test_device_released_with_last_holder() {
        let fabric = MockFabric::new();
        let registry = DeviceRegistry::new(fabric.provider());

        let device = registry.open("0000:31:00.0").unwrap();
        assert_eq!(fabric.live_devices(), 1);

        drop(device);
        assert_eq!(fabric.live_devices(), 0);
        assert_eq!(registry.live_devices(), 0);

        // Reopening after teardown creates a fresh device.
        let _device = registry.open("0000:31:00.0").unwrap();
        assert_eq!(fabric.devices_opened(), 2);
    }

    #[test]
    fn test_open_failure_propagates() {
        let fabric = MockFabric::new();
        fabric.fail_open_device(true);
        let registry = DeviceRegistry::new(fabric.provider());

        assert!(registry.open("0000:31:00.0").is_err());
        assert_eq!(registry.live_devices(), 0);
    }
}
