//! OS device discovery.
//!
//! Devices are found by walking the PCI tree in sysfs and classifying by
//! device class. Vendor SMI libraries are deliberately not linked; bus
//! order stands in for SMI order and UUIDs are synthesized from the bus id
//! when the hardware exposes none.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use qv_rc::{QvResult, ReturnCode};
use uuid::Uuid;

use crate::bitmap::Cpuset;
use crate::topology::Topology;
use crate::types::{DeviceType, ObjType};

const PCI_CLASS_DISPLAY: u32 = 0x03;

/// Immutable record describing one discovered device. Shared across
/// hardware pools by reference count during splits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub devtype: DeviceType,
    /// Visible-index (ordinal) id, dense within a device type.
    pub id: i32,
    pub vendor_id: u32,
    /// System-management ordering; without a vendor SMI library this
    /// follows bus order.
    pub smi_id: i32,
    pub name: String,
    /// `dddd:bb:dd.f` form.
    pub pci_bus_id: String,
    pub uuid: String,
    /// CPUs local to the device.
    pub affinity: Cpuset,
}

impl DeviceInfo {
    pub fn new(
        devtype: DeviceType,
        id: i32,
        pci_bus_id: &str,
        uuid: &str,
        affinity: Cpuset,
    ) -> Self {
        DeviceInfo {
            devtype,
            id,
            vendor_id: 0,
            smi_id: id,
            name: String::new(),
            pci_bus_id: pci_bus_id.to_string(),
            uuid: uuid.to_string(),
            affinity,
        }
    }
}

/// Enumerates GPU-class PCI devices under `{sysroot}/bus/pci/devices`.
/// Device affinity comes from the device's NUMA node, widened to the whole
/// machine when the node is unknown.
pub fn discover_devices(
    sysroot: &Path,
    topo: &Topology,
) -> QvResult<Vec<Arc<DeviceInfo>>> {
    let pci_dir = sysroot.join("bus/pci/devices");
    let entries = match fs::read_dir(&pci_dir) {
        Ok(entries) => entries,
        // No PCI tree (containers, odd platforms): no devices.
        Err(_) => return Ok(Vec::new()),
    };

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        let Ok(class) = read_hex(&dir.join("class")) else {
            continue;
        };
        if class >> 16 != PCI_CLASS_DISPLAY {
            continue;
        }
        let pci_bus_id = entry.file_name().to_string_lossy().into_owned();
        let vendor_id = read_hex(&dir.join("vendor")).unwrap_or(0);
        let device_id = read_hex(&dir.join("device")).unwrap_or(0);

        let affinity = match read_i64(&dir.join("numa_node")) {
            Ok(node) if node >= 0 => numa_cpuset(topo, node as u32)
                .unwrap_or_else(|| topo.machine_cpuset().clone()),
            _ => topo.machine_cpuset().clone(),
        };

        found.push(DeviceInfo {
            devtype: DeviceType::Gpu,
            id: 0,
            vendor_id,
            smi_id: 0,
            name: format!("{vendor_id:04x}:{device_id:04x}"),
            pci_bus_id,
            uuid: String::new(),
            affinity,
        });
    }

    // Bus order is the stable, vendor-neutral ordering we have.
    found.sort_by(|a, b| a.pci_bus_id.cmp(&b.pci_bus_id));
    let devices = found
        .into_iter()
        .enumerate()
        .map(|(ordinal, mut dev)| {
            dev.id = ordinal as i32;
            dev.smi_id = ordinal as i32;
            dev.uuid = synthesize_uuid(&dev.pci_bus_id);
            Arc::new(dev)
        })
        .collect();
    Ok(devices)
}

/// Stable UUID derived from the PCI bus id.
pub fn synthesize_uuid(pci_bus_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, pci_bus_id.as_bytes()).to_string()
}

fn numa_cpuset(topo: &Topology, node: u32) -> Option<Cpuset> {
    let depth = topo.obj_type_depth(ObjType::NumaNode).ok()?;
    topo.objects_at_depth(depth)
        .ok()?
        .iter()
        .find(|o| o.os_index == node)
        .map(|o| o.cpuset.clone())
}

fn read_hex(path: &Path) -> QvResult<u32> {
    let raw = fs::read_to_string(path).map_err(|_| ReturnCode::FileIo)?;
    let raw = raw.trim();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    u32::from_str_radix(raw, 16).map_err(|_| ReturnCode::Sys)
}

fn read_i64(path: &Path) -> QvResult<i64> {
    fs::read_to_string(path)
        .map_err(|_| ReturnCode::FileIo)?
        .trim()
        .parse()
        .map_err(|_| ReturnCode::Sys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn finds_display_class_devices_in_bus_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for (bus, class, numa) in [
            ("0000:17:00.0", "0x030200", "1"),
            ("0000:03:00.0", "0x030000", "0"),
            ("0000:05:00.0", "0x020000", "0"), // NIC, ignored
        ] {
            let base = root.join("bus/pci/devices").join(bus);
            write(&base.join("class"), &format!("{class}\n"));
            write(&base.join("vendor"), "0x10de\n");
            write(&base.join("device"), "0x20b0\n");
            write(&base.join("numa_node"), &format!("{numa}\n"));
        }

        let topo = Topology::synthetic(2, 2, 1);
        let devices = discover_devices(root, &topo).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].pci_bus_id, "0000:03:00.0");
        assert_eq!(devices[0].id, 0);
        assert_eq!(devices[0].affinity.to_list_string(), "0-1");
        assert_eq!(devices[1].pci_bus_id, "0000:17:00.0");
        assert_eq!(devices[1].id, 1);
        assert_eq!(devices[1].affinity.to_list_string(), "2-3");
        assert_eq!(devices[0].vendor_id, 0x10de);
        assert_ne!(devices[0].uuid, devices[1].uuid);
    }

    #[test]
    fn uuid_synthesis_is_deterministic() {
        assert_eq!(
            synthesize_uuid("0000:03:00.0"),
            synthesize_uuid("0000:03:00.0")
        );
    }

    #[test]
    fn no_pci_tree_means_no_devices() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::synthetic(1, 2, 1);
        assert!(discover_devices(dir.path(), &topo).unwrap().is_empty());
    }
}
