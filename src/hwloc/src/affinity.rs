//! Task CPU-binding primitives.
//!
//! The daemon answers binding queries with these; the client library uses
//! them only through the RMI so the daemon stays authoritative.

use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use qv_rc::{QvResult, ReturnCode};

use crate::bitmap::Cpuset;

/// Current CPU binding of `pid` (0 selects the calling task).
pub fn task_get_cpubind(pid: i32) -> QvResult<Cpuset> {
    let set = sched_getaffinity(Pid::from_raw(pid)).map_err(|e| {
        log::error!("sched_getaffinity({pid}) failed: {e}");
        ReturnCode::Sys
    })?;
    let mut result = Cpuset::new();
    for cpu in 0..CpuSet::count() {
        if set.is_set(cpu).unwrap_or(false) {
            result.set(cpu as u32);
        }
    }
    Ok(result)
}

/// Rebinds `pid` (0 selects the calling task) to `cpuset`.
pub fn task_set_cpubind(pid: i32, cpuset: &Cpuset) -> QvResult<()> {
    if cpuset.is_empty() {
        return Err(ReturnCode::InvalidArg);
    }
    let mut set = CpuSet::new();
    for cpu in cpuset.iter() {
        set.set(cpu as usize).map_err(|_| ReturnCode::InvalidArg)?;
    }
    sched_setaffinity(Pid::from_raw(pid), &set).map_err(|e| {
        log::error!("sched_setaffinity({pid}) failed: {e}");
        ReturnCode::Sys
    })
}

/// Does the current binding of `pid` intersect the `index`-th object of
/// `obj_type`?
pub fn task_intersects_obj(
    topo: &crate::Topology,
    obj_type: crate::ObjType,
    pid: i32,
    index: usize,
) -> QvResult<bool> {
    let obj = obj_by_type_index(topo, obj_type, index)?;
    let bind = task_get_cpubind(pid)?;
    Ok(bind.intersects(&obj.cpuset))
}

/// Is the current binding of `pid` fully inside the `index`-th object of
/// `obj_type`?
pub fn task_isincluded_in_obj(
    topo: &crate::Topology,
    obj_type: crate::ObjType,
    pid: i32,
    index: usize,
) -> QvResult<bool> {
    let obj = obj_by_type_index(topo, obj_type, index)?;
    let bind = task_get_cpubind(pid)?;
    Ok(bind.is_subset_of(&obj.cpuset))
}

fn obj_by_type_index(
    topo: &crate::Topology,
    obj_type: crate::ObjType,
    index: usize,
) -> QvResult<&crate::TopoObject> {
    let depth = topo.obj_type_depth(obj_type)?;
    topo.objects_at_depth(depth)?
        .get(index)
        .ok_or(ReturnCode::NotFound)
}
