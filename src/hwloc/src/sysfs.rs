//! Topology discovery from the Linux sysfs tree.
//!
//! Parsing /sys directly keeps us off the FFI treadmill: the information we
//! need is a handful of small text files. The `sysroot` parameter exists so
//! tests can point discovery at a fabricated tree.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use qv_rc::{QvResult, ReturnCode};

use crate::bitmap::Cpuset;
use crate::topology::TopoObject;
use crate::types::ObjType;

/// Walks `{sysroot}/devices/system` and returns the flat object list for
/// [`Topology::from_objects`](crate::Topology::from_objects).
pub(crate) fn discover(sysroot: &Path) -> QvResult<Vec<TopoObject>> {
    let cpu_dir = sysroot.join("devices/system/cpu");
    let present = read_trimmed(&cpu_dir.join("present"))?;
    let present = Cpuset::parse_list(&present)?;

    let mut pus = Vec::new();
    // (package_id, core_id) -> cpuset
    let mut cores: BTreeMap<(u32, u32), Cpuset> = BTreeMap::new();
    let mut packages: BTreeMap<u32, Cpuset> = BTreeMap::new();
    // (cache level, shared list) -> cpuset
    let mut caches: BTreeMap<(u32, String), Cpuset> = BTreeMap::new();

    for cpu in present.iter() {
        let base = cpu_dir.join(format!("cpu{cpu}"));
        // Some kernels omit the online file; treat absence as online.
        if let Ok(state) = read_trimmed(&base.join("online")) {
            if state != "1" {
                continue;
            }
        }
        let topo_dir = base.join("topology");
        let package_id = read_u32(&topo_dir.join("physical_package_id")).unwrap_or(0);
        let core_id = read_u32(&topo_dir.join("core_id")).unwrap_or(cpu);

        pus.push(TopoObject {
            obj_type: ObjType::Pu,
            os_index: cpu,
            cpuset: Cpuset::from_ids([cpu]),
        });
        cores
            .entry((package_id, core_id))
            .or_insert_with(Cpuset::new)
            .set(cpu);
        packages
            .entry(package_id)
            .or_insert_with(Cpuset::new)
            .set(cpu);

        collect_caches(&base.join("cache"), &mut caches);
    }

    if pus.is_empty() {
        return Err(ReturnCode::Hwloc);
    }
    let mut online = Cpuset::new();
    for pu in &pus {
        online.union_with(&pu.cpuset);
    }

    let mut objects = pus;
    for (index, (_, cpuset)) in cores.into_iter().enumerate() {
        objects.push(TopoObject {
            obj_type: ObjType::Core,
            os_index: index as u32,
            cpuset,
        });
    }
    for (package_id, cpuset) in packages {
        objects.push(TopoObject {
            obj_type: ObjType::Package,
            os_index: package_id,
            cpuset,
        });
    }
    for (index, ((level, _), cpuset)) in caches.into_iter().enumerate() {
        let obj_type = match level {
            1 => ObjType::L1Cache,
            2 => ObjType::L2Cache,
            3 => ObjType::L3Cache,
            _ => continue,
        };
        let cpuset = cpuset.intersection(&online);
        if cpuset.is_empty() {
            continue;
        }
        objects.push(TopoObject {
            obj_type,
            os_index: index as u32,
            cpuset,
        });
    }
    objects.extend(discover_numa_nodes(sysroot, &online)?);
    Ok(objects)
}

/// NUMA nodes from `devices/system/node`. A machine without the node tree
/// gets a single node covering nothing; the caller synthesizes the machine
/// level anyway.
fn discover_numa_nodes(sysroot: &Path, online: &Cpuset) -> QvResult<Vec<TopoObject>> {
    let node_dir = sysroot.join("devices/system/node");
    let mut nodes = Vec::new();
    let entries = match fs::read_dir(&node_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(nodes),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(id) = name.strip_prefix("node").and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let cpulist = match read_trimmed(&entry.path().join("cpulist")) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let cpuset = Cpuset::parse_list(&cpulist)?.intersection(online);
        if cpuset.is_empty() {
            // Memory-only node; not part of the CPU tree.
            continue;
        }
        nodes.push(TopoObject {
            obj_type: ObjType::NumaNode,
            os_index: id,
            cpuset,
        });
    }
    Ok(nodes)
}

fn collect_caches(cache_dir: &Path, caches: &mut BTreeMap<(u32, String), Cpuset>) {
    let entries = match fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with("index") {
            continue;
        }
        let dir = entry.path();
        let Ok(cache_type) = read_trimmed(&dir.join("type")) else {
            continue;
        };
        if cache_type != "Data" && cache_type != "Unified" {
            continue;
        }
        let (Ok(level), Ok(shared)) = (
            read_u32(&dir.join("level")),
            read_trimmed(&dir.join("shared_cpu_list")),
        ) else {
            continue;
        };
        if let Ok(cpuset) = Cpuset::parse_list(&shared) {
            caches.entry((level, shared)).or_insert(cpuset);
        }
    }
}

fn read_trimmed(path: &Path) -> QvResult<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|_| ReturnCode::FileIo)
}

fn read_u32(path: &Path) -> QvResult<u32> {
    read_trimmed(path)?.parse().map_err(|_| ReturnCode::Hwloc)
}
