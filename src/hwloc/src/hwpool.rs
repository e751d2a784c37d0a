//! Hardware pools: an owned slice of node resources.
//!
//! A pool is a cpuset plus the device records assigned to it. Pools are
//! exclusively owned by one scope at a time; splits rebuild them wholesale.

use std::sync::Arc;

use crate::bitmap::Cpuset;
use crate::device::DeviceInfo;
use crate::types::DeviceType;

#[derive(Debug, Clone, Default)]
pub struct Hwpool {
    cpuset: Cpuset,
    // Global insertion order; per-type order is the subsequence.
    devices: Vec<Arc<DeviceInfo>>,
}

impl Hwpool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cpuset(cpuset: &Cpuset) -> Self {
        Hwpool {
            cpuset: cpuset.clone(),
            devices: Vec::new(),
        }
    }

    /// Replaces the compute slice. Device assignments are untouched; use
    /// [`release_devices`](Self::release_devices) before redistribution.
    pub fn init(&mut self, cpuset: &Cpuset) {
        self.cpuset = cpuset.clone();
    }

    pub fn cpuset(&self) -> &Cpuset {
        &self.cpuset
    }

    pub fn release_devices(&mut self) {
        self.devices.clear();
    }

    pub fn add_device(&mut self, device: Arc<DeviceInfo>) {
        self.devices.push(device);
    }

    pub fn devices(&self) -> &[Arc<DeviceInfo>] {
        &self.devices
    }

    pub fn devices_of(
        &self,
        devtype: DeviceType,
    ) -> impl Iterator<Item = &Arc<DeviceInfo>> {
        self.devices.iter().filter(move |d| d.devtype == devtype)
    }

    pub fn ndevices_of(&self, devtype: DeviceType) -> usize {
        self.devices_of(devtype).count()
    }
}

// Structural equality: same slice, same devices in the same order.
impl PartialEq for Hwpool {
    fn eq(&self, other: &Self) -> bool {
        self.cpuset == other.cpuset
            && self.devices.len() == other.devices.len()
            && self
                .devices
                .iter()
                .zip(other.devices.iter())
                .all(|(a, b)| a.as_ref() == b.as_ref())
    }
}

impl Eq for Hwpool {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::synthesize_uuid;

    fn gpu(id: i32, pci: &str, affinity: &str) -> Arc<DeviceInfo> {
        Arc::new(DeviceInfo::new(
            DeviceType::Gpu,
            id,
            pci,
            &synthesize_uuid(pci),
            Cpuset::parse_list(affinity).unwrap(),
        ))
    }

    #[test]
    fn insertion_order_is_preserved_per_type() {
        let mut pool = Hwpool::with_cpuset(&Cpuset::from_range(0, 7));
        pool.add_device(gpu(1, "0000:17:00.0", "4-7"));
        pool.add_device(gpu(0, "0000:03:00.0", "0-3"));
        let order: Vec<i32> = pool.devices_of(DeviceType::Gpu).map(|d| d.id).collect();
        assert_eq!(order, [1, 0]);
        assert_eq!(pool.ndevices_of(DeviceType::Gpu), 2);
        assert_eq!(pool.ndevices_of(DeviceType::Invisible), 0);
    }

    #[test]
    fn reinit_keeps_devices_release_drops_them() {
        let mut pool = Hwpool::with_cpuset(&Cpuset::from_range(0, 3));
        pool.add_device(gpu(0, "0000:03:00.0", "0-3"));
        pool.init(&Cpuset::from_range(0, 1));
        assert_eq!(pool.cpuset().to_list_string(), "0-1");
        assert_eq!(pool.devices().len(), 1);
        pool.release_devices();
        assert!(pool.devices().is_empty());
    }

    #[test]
    fn structural_equality() {
        let mut a = Hwpool::with_cpuset(&Cpuset::from_range(0, 3));
        a.add_device(gpu(0, "0000:03:00.0", "0-3"));
        let mut b = Hwpool::with_cpuset(&Cpuset::from_range(0, 3));
        // Equal by value even without sharing the Arc.
        b.add_device(gpu(0, "0000:03:00.0", "0-3"));
        assert_eq!(a, b);
        b.add_device(gpu(1, "0000:17:00.0", "0-3"));
        assert_ne!(a, b);
    }
}
