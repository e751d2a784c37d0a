//! The split engine.
//!
//! Splitting is SPMD: every participant contributes its color, task id,
//! and a copy of the parent pool; rank 0 computes the whole plan from that
//! global view and scatters one `(color', pool')` pair back to each
//! participant. The plan algorithms themselves are pure functions over the
//! gathered arrays, which is what makes them testable without a daemon.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use itertools::Itertools;
use qv_hwloc::{supported_device_types, Cpuset, Hwpool, Topology};
use qv_rc::{QvResult, ReturnCode};
use qv_wire::{Bbuff, RmiArg};

use crate::group::Group;
use crate::rmi::RmiClient;

/// Color sentinel requesting the affinity-preserving split.
pub const SCOPE_SPLIT_AFFINITY_PRESERVING: i32 = -1;

type SetMap = BTreeMap<usize, BTreeSet<usize>>;

/// Computes the split plan in place: on return every `colors[i]` names the
/// piece assigned to participant `i` and `hwpools[i]` is its new pool.
///
/// `affinities` carries each participant's current CPU binding and must be
/// present exactly when the gathered colors request the
/// affinity-preserving mode.
pub(crate) fn split_dispatch(
    topo: &Topology,
    parent: &Hwpool,
    ncolors: usize,
    colors: &mut [i32],
    affinities: Option<&[Cpuset]>,
    hwpools: &mut [Hwpool],
) -> QvResult<()> {
    let group_size = colors.len();
    if ncolors == 0 || group_size == 0 || hwpools.len() != group_size {
        return Err(ReturnCode::InvalidArg);
    }

    // Negative colors select an automatic mode; they are only valid when
    // every participant asks for the same one.
    let min = *colors.iter().min().ok_or(ReturnCode::InvalidArg)?;
    let max = *colors.iter().max().ok_or(ReturnCode::InvalidArg)?;
    if min < 0 {
        if min != max {
            return Err(ReturnCode::InvalidArg);
        }
        if min != SCOPE_SPLIT_AFFINITY_PRESERVING {
            return Err(ReturnCode::InvalidArg);
        }
        let affinities = affinities.ok_or(ReturnCode::Internal)?;
        if affinities.len() != group_size {
            return Err(ReturnCode::Internal);
        }
        return split_affinity_preserving(
            topo, parent, ncolors, colors, affinities, hwpools,
        );
    }
    split_user_defined(topo, parent, ncolors, colors, hwpools)
}

/// User-defined split: same color, same piece. Pieces are allotted to the
/// distinct colors in the order callers supplied them, clipped to
/// `ncolors`.
fn split_user_defined(
    topo: &Topology,
    parent: &Hwpool,
    ncolors: usize,
    colors: &mut [i32],
    hwpools: &mut [Hwpool],
) -> QvResult<()> {
    let distinct: Vec<i32> = colors.iter().copied().unique().take(ncolors).collect();
    for (i, color) in colors.iter().enumerate() {
        let piece = distinct
            .iter()
            .position(|c| c == color)
            .ok_or(ReturnCode::Split)?;
        let cpuset =
            topo.split_cpuset_by_color(parent.cpuset(), distinct.len(), piece)?;
        hwpools[i].init(&cpuset);
    }
    // Devices follow the same color ordering the cpuset pieces used.
    split_devices_basic(parent, &distinct, colors, hwpools)
}

/// Affinity-preserving split: bins participants by which piece their
/// current binding overlaps, then falls back to packing when bindings
/// carry no information.
fn split_affinity_preserving(
    topo: &Topology,
    parent: &Hwpool,
    ncolors: usize,
    colors: &mut [i32],
    affinities: &[Cpuset],
    hwpools: &mut [Hwpool],
) -> QvResult<()> {
    let group_size = colors.len();

    // Straightforward pieces of the parent, one per color. This is local
    // arithmetic, not an RMI round trip: it feeds the mapping below.
    let cpusets = (0..ncolors)
        .map(|color| topo.split_cpuset_by_color(parent.cpuset(), ncolors, color))
        .collect::<QvResult<Vec<_>>>()?;

    // Which participants' affinities touch which piece.
    let mut color_affinity_map = SetMap::new();
    for (color, cpuset) in cpusets.iter().enumerate() {
        for (tid, affinity) in affinities.iter().enumerate() {
            if affinity.intersects(cpuset) {
                color_affinity_map.entry(color).or_default().insert(tid);
            }
        }
    }

    let intersection = k_set_intersection(&color_affinity_map);
    let mut mapped = BTreeSet::new();

    if intersection.is_empty() {
        // Fully disjoint affinities: everyone lands on the piece they
        // already overlap.
        map_disjoint_affinity(
            ncolors,
            colors,
            &cpusets,
            &color_affinity_map,
            &mut mapped,
            hwpools,
        )?;
    } else if intersection.len() == group_size {
        // Everyone overlaps everything, typical for unbound runs; nothing
        // to preserve, so pack in rank order.
        map_packed(ncolors, colors, &cpusets, &mut mapped, hwpools)?;
    } else {
        // A strict subset shares resources: break the sharing first, then
        // place the rest by affinity, then pack the stragglers.
        let mut disjoint_map = color_affinity_map;
        make_affinity_map_disjoint(&mut disjoint_map, &intersection);
        map_disjoint_affinity(
            ncolors,
            colors,
            &cpusets,
            &disjoint_map,
            &mut mapped,
            hwpools,
        )?;
        map_packed(ncolors, colors, &cpusets, &mut mapped, hwpools)?;
    }

    if mapped.len() != group_size {
        return Err(ReturnCode::Internal);
    }
    // Distinct colors of the finished plan, in first-assignment order.
    let distinct: Vec<i32> = colors.iter().copied().unique().take(ncolors).collect();
    split_devices_basic(parent, &distinct, colors, hwpools)
}

/// Task ids present in every non-empty entry of the map.
fn k_set_intersection(map: &SetMap) -> BTreeSet<usize> {
    let mut sets = map.values();
    let Some(first) = sets.next() else {
        return BTreeSet::new();
    };
    sets.fold(first.clone(), |acc, set| {
        acc.intersection(set).copied().collect()
    })
}

fn map_disjoint_affinity(
    ncolors: usize,
    colors: &mut [i32],
    cpusets: &[Cpuset],
    color_affinity_map: &SetMap,
    mapped: &mut BTreeSet<usize>,
    hwpools: &mut [Hwpool],
) -> QvResult<()> {
    for color in 0..ncolors {
        if mapped.len() == hwpools.len() {
            break;
        }
        let Some(members) = color_affinity_map.get(&color) else {
            continue;
        };
        for &tid in members {
            // Potentially placed by an earlier mapper.
            if mapped.contains(&tid) {
                continue;
            }
            colors[tid] = color as i32;
            hwpools[tid].init(&cpusets[color]);
            if !mapped.insert(tid) {
                return Err(ReturnCode::Internal);
            }
        }
    }
    Ok(())
}

/// Contiguous placement in rank order, at most ceil(n/k) per piece.
fn map_packed(
    ncolors: usize,
    colors: &mut [i32],
    cpusets: &[Cpuset],
    mapped: &mut BTreeSet<usize>,
    hwpools: &mut [Hwpool],
) -> QvResult<()> {
    let group_size = hwpools.len();
    let max_per_color = (group_size + ncolors - 1) / ncolors;
    let mut unmapped: VecDeque<usize> =
        (0..group_size).filter(|tid| !mapped.contains(tid)).collect();
    for color in 0..ncolors {
        for _ in 0..max_per_color {
            let Some(tid) = unmapped.pop_front() else {
                return Ok(());
            };
            colors[tid] = color as i32;
            hwpools[tid].init(&cpusets[color]);
            if !mapped.insert(tid) {
                return Err(ReturnCode::Internal);
            }
        }
    }
    Ok(())
}

/// Removes sharing from the map: ids in `intersection` are dealt to the
/// colors round robin, at most ceil(|intersection|/|colors|) each; ids
/// outside the intersection stay where they are.
fn make_affinity_map_disjoint(map: &mut SetMap, intersection: &BTreeSet<usize>) {
    let ncolor = map.len().max(1);
    let max_per_color = (intersection.len() + ncolor - 1) / ncolor;

    let mut dmap = SetMap::new();
    for (color, members) in map.iter() {
        dmap.insert(
            *color,
            members.difference(intersection).copied().collect(),
        );
    }
    let mut remaining = intersection.clone();
    for (color, members) in map.iter() {
        let mut dealt = 0;
        for id in members {
            if !remaining.contains(id) {
                continue;
            }
            dmap.entry(*color).or_default().insert(*id);
            remaining.remove(id);
            dealt += 1;
            if dealt == max_per_color || remaining.is_empty() {
                break;
            }
        }
    }
    *map = dmap;
}

/// Round-robin device redistribution over `distinct`, the plan's color
/// list in the order the plan committed to it (the same list that chose
/// the cpuset pieces). Device order within a pool follows the parent
/// pool.
fn split_devices_basic(
    parent: &Hwpool,
    distinct: &[i32],
    colors: &[i32],
    hwpools: &mut [Hwpool],
) -> QvResult<()> {
    for pool in hwpools.iter_mut() {
        pool.release_devices();
    }

    for devtype in supported_device_types() {
        let devs: Vec<_> = parent.devices_of(*devtype).cloned().collect();
        // Deal devices to colors round robin, preserving device order.
        let assignment: Vec<(i32, _)> = devs
            .into_iter()
            .enumerate()
            .map(|(i, dev)| (distinct[i % distinct.len()], dev))
            .collect();
        for (i, pool) in hwpools.iter_mut().enumerate() {
            for (color, dev) in &assignment {
                if *color == colors[i] {
                    pool.add_device(dev.clone());
                }
            }
        }
    }
    Ok(())
}

// ---- The collective protocol around the plan ----

const ROOT: i32 = 0;

/// Runs the split collective over `group`: gather to rank 0, plan,
/// broadcast the outcome, scatter `(color', pool')`.
pub(crate) fn split_hardware_resources(
    group: &dyn Group,
    rmi: &Rc<RefCell<RmiClient>>,
    parent_pool: &Hwpool,
    ncolors: i32,
    color: i32,
) -> QvResult<(i32, Hwpool)> {
    if ncolors <= 0 {
        return Err(ReturnCode::InvalidArg);
    }
    let my_id = group.id();

    let task_ids = gather_i64(group, ROOT, group.task_id())?;
    let mut colors = gather_i32(group, ROOT, color)?;
    let mut pools = gather_hwpools(group, ROOT, parent_pool)?;

    let mut plan_rc = ReturnCode::Success;
    if my_id == ROOT {
        let task_ids = task_ids.ok_or(ReturnCode::Internal)?;
        let colors = colors.as_mut().ok_or(ReturnCode::Internal)?;
        let pools = pools.as_mut().ok_or(ReturnCode::Internal)?;
        plan_rc = run_plan(rmi, parent_pool, ncolors as usize, colors, &task_ids, pools);
    }

    // Share the plan outcome so no participant hangs on a failed split.
    let plan_rc = ReturnCode::from_u32(bcast_i32(group, ROOT, plan_rc.as_u32() as i32)? as u32);
    plan_rc.into_result()?;

    let colorp = scatter_i32(group, ROOT, colors.as_deref())?;
    let pool = scatter_hwpools(group, ROOT, pools.as_deref())?;
    Ok((colorp, pool))
}

fn run_plan(
    rmi: &Rc<RefCell<RmiClient>>,
    parent_pool: &Hwpool,
    ncolors: usize,
    colors: &mut [i32],
    task_ids: &[i64],
    pools: &mut [Hwpool],
) -> ReturnCode {
    // Only the affinity-preserving mode needs current bindings; fetch
    // them before planning so the plan itself stays pure.
    let wants_affinity = colors
        .iter()
        .all(|c| *c == SCOPE_SPLIT_AFFINITY_PRESERVING);
    let affinities = if wants_affinity {
        let mut client = rmi.borrow_mut();
        let mut fetched = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            match client.task_get_cpubind(*task_id) {
                Ok(affinity) => fetched.push(affinity),
                Err(rc) => return rc,
            }
        }
        Some(fetched)
    } else {
        None
    };

    let client = rmi.borrow();
    match split_dispatch(
        client.topology(),
        parent_pool,
        ncolors,
        colors,
        affinities.as_deref(),
        pools,
    ) {
        Ok(()) => ReturnCode::Success,
        Err(rc) => rc,
    }
}

fn gather_i32(group: &dyn Group, root: i32, value: i32) -> QvResult<Option<Vec<i32>>> {
    let mut raw = [0u8; 4];
    LittleEndian::write_i32(&mut raw, value);
    let mut tx = Bbuff::new();
    tx.append(&raw);
    let bufs = group.gather(&tx, root)?;
    bufs.map(|bufs| {
        bufs.iter()
            .map(|b| {
                if b.len() != 4 {
                    return Err(ReturnCode::Internal);
                }
                Ok(LittleEndian::read_i32(b.data()))
            })
            .collect()
    })
    .transpose()
}

fn gather_i64(group: &dyn Group, root: i32, value: i64) -> QvResult<Option<Vec<i64>>> {
    let mut raw = [0u8; 8];
    LittleEndian::write_i64(&mut raw, value);
    let mut tx = Bbuff::new();
    tx.append(&raw);
    let bufs = group.gather(&tx, root)?;
    bufs.map(|bufs| {
        bufs.iter()
            .map(|b| {
                if b.len() != 8 {
                    return Err(ReturnCode::Internal);
                }
                Ok(LittleEndian::read_i64(b.data()))
            })
            .collect()
    })
    .transpose()
}

fn gather_hwpools(
    group: &dyn Group,
    root: i32,
    pool: &Hwpool,
) -> QvResult<Option<Vec<Hwpool>>> {
    let mut tx = Bbuff::new();
    qv_wire::sprintf(&mut tx, "p", &[RmiArg::Hwpool(pool)]);
    let bufs = group.gather(&tx, root)?;
    bufs.map(|bufs| {
        bufs.iter()
            .map(|b| {
                qv_wire::sscanf(b.data(), "p")?
                    .into_iter()
                    .next()
                    .ok_or(ReturnCode::Internal)?
                    .into_hwpool()
            })
            .collect()
    })
    .transpose()
}

fn scatter_i32(group: &dyn Group, root: i32, values: Option<&[i32]>) -> QvResult<i32> {
    let tx: Option<Vec<Bbuff>> = values.map(|values| {
        values
            .iter()
            .map(|v| {
                let mut raw = [0u8; 4];
                LittleEndian::write_i32(&mut raw, *v);
                let mut buff = Bbuff::new();
                buff.append(&raw);
                buff
            })
            .collect()
    });
    let rx = group.scatter(tx.as_deref(), root)?;
    if rx.len() != 4 {
        return Err(ReturnCode::Internal);
    }
    Ok(LittleEndian::read_i32(rx.data()))
}

fn scatter_hwpools(
    group: &dyn Group,
    root: i32,
    pools: Option<&[Hwpool]>,
) -> QvResult<Hwpool> {
    let tx: Option<Vec<Bbuff>> = pools.map(|pools| {
        pools
            .iter()
            .map(|pool| {
                let mut buff = Bbuff::new();
                qv_wire::sprintf(&mut buff, "p", &[RmiArg::Hwpool(pool)]);
                buff
            })
            .collect()
    });
    let rx = group.scatter(tx.as_deref(), root)?;
    qv_wire::sscanf(rx.data(), "p")?
        .into_iter()
        .next()
        .ok_or(ReturnCode::Internal)?
        .into_hwpool()
}

fn bcast_i32(group: &dyn Group, root: i32, value: i32) -> QvResult<i32> {
    let tx: Option<Vec<Bbuff>> = (group.id() == root).then(|| {
        let mut raw = [0u8; 4];
        LittleEndian::write_i32(&mut raw, value);
        (0..group.size())
            .map(|_| {
                let mut buff = Bbuff::new();
                buff.append(&raw);
                buff
            })
            .collect()
    });
    let rx = group.scatter(tx.as_deref(), root)?;
    if rx.len() != 4 {
        return Err(ReturnCode::Internal);
    }
    Ok(LittleEndian::read_i32(rx.data()))
}
