//! Process-wide device registry.
//!
//! The only state shared across instances. Devices are registered under a
//! name so management code can hand the same backing store to format and
//! load paths; everything else is owned by the instance root.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use spin::RwLock;

use crate::device::BlockDevice;

static REGISTRY: RwLock<BTreeMap<String, Arc<dyn BlockDevice>>> = RwLock::new(BTreeMap::new());

/// Register a device under `name`, replacing any previous registration.
pub fn register_device(name: &str, device: Arc<dyn BlockDevice>) {
    let replaced = REGISTRY.write().insert(String::from(name), device);
    if replaced.is_some() {
        log::warn!("device registry: replaced existing device '{name}'");
    } else {
        log::info!("device registry: registered '{name}'");
    }
}

/// Look up a registered device.
pub fn get_device(name: &str) -> Option<Arc<dyn BlockDevice>> {
    REGISTRY.read().get(name).cloned()
}

/// Remove a registration; returns whether it existed.
pub fn unregister_device(name: &str) -> bool {
    REGISTRY.write().remove(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDevice;

    #[test]
    fn test_register_lookup_unregister() {
        let dev: Arc<dyn BlockDevice> = Arc::new(RamDevice::new(4));
        register_device("reg-test-a", dev);
        assert!(get_device("reg-test-a").is_some());
        assert!(get_device("reg-test-missing").is_none());
        assert!(unregister_device("reg-test-a"));
        assert!(!unregister_device("reg-test-a"));
    }
}
