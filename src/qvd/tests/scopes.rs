//! Scope-level end-to-end exercises: contexts, intrinsic scopes, splits
//! across a thread team, device redistribution, and the bind stack.

use std::sync::Arc;

use quo_vadis::{
    BindStringFormat, Context, Cpuset, DeviceIdType, DeviceType, GroupBinding,
    IntrinsicScope, ObjType, ReturnCode, ThreadTeam,
    SCOPE_SPLIT_AFFINITY_PRESERVING,
};
use qv_hwloc::{synthesize_uuid, DeviceInfo, Topology};
use qvd::config::ServerConfig;
use qvd::server::RmiServer;

fn gpu(id: i32, pci: &str, affinity: &str) -> Arc<DeviceInfo> {
    Arc::new(DeviceInfo::new(
        DeviceType::Gpu,
        id,
        pci,
        &synthesize_uuid(pci),
        Cpuset::parse_list(affinity).unwrap(),
    ))
}

fn start_server(
    tmpdir: &tempfile::TempDir,
    topo: Topology,
    devices: Vec<Arc<DeviceInfo>>,
) -> RmiServer {
    let config = ServerConfig {
        url: "tcp://127.0.0.1:0".parse().unwrap(),
        qdepth: 8,
        tmpdir: tmpdir.path().to_path_buf(),
    };
    RmiServer::start_with_topology(&config, topo, devices).unwrap()
}

fn run_team<F>(size: usize, url: &str, f: F)
where
    F: Fn(Context, usize) + Send + Sync + 'static,
{
    let team = ThreadTeam::new(size).unwrap();
    let f = Arc::new(f);
    let url = url.to_string();
    let mut handles = Vec::new();
    for rank in 0..size {
        let team = Arc::clone(&team);
        let f = Arc::clone(&f);
        let url = url.clone();
        handles.push(std::thread::spawn(move || {
            let ctx = Context::create_with_url(
                GroupBinding::Thread { team, rank },
                &url,
            )
            .unwrap();
            f(ctx, rank);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn system_scope_on_a_four_core_node() {
    let tmpdir = tempfile::tempdir().unwrap();
    let server = start_server(&tmpdir, Topology::synthetic(1, 4, 1), Vec::new());

    let ctx = Context::create_with_url(
        GroupBinding::Process,
        &server.url().to_string(),
    )
    .unwrap();
    let scope = ctx.scope_get(IntrinsicScope::System).unwrap();
    assert_eq!(scope.cpuset().to_list_string(), "0-3");
    assert_eq!(scope.nobjs(ObjType::Core).unwrap(), 4);
    assert_eq!(scope.ntasks(), 1);
    assert_eq!(scope.taskid(), 0);
    scope.free().unwrap();
}

#[test]
fn even_user_defined_split_across_a_team() {
    let tmpdir = tempfile::tempdir().unwrap();
    let server = start_server(&tmpdir, Topology::synthetic(1, 8, 1), Vec::new());

    run_team(4, &server.url().to_string(), |ctx, rank| {
        let scope = ctx.scope_get(IntrinsicScope::System).unwrap();
        assert_eq!(scope.cpuset().to_list_string(), "0-7");

        let color = (rank / 2) as i32;
        let child = scope.split(2, color).unwrap();
        let expected = if rank < 2 { "0-3" } else { "4-7" };
        assert_eq!(child.cpuset().to_list_string(), expected);
        assert_eq!(child.ntasks(), 2);
        child.free().unwrap();
        scope.free().unwrap();
    });
}

#[test]
fn affinity_preserving_split_packs_unbound_tasks() {
    let tmpdir = tempfile::tempdir().unwrap();
    let server = start_server(&tmpdir, Topology::synthetic(1, 8, 1), Vec::new());

    // All team members share the process binding, so every binding
    // overlaps every piece and the engine packs by rank: rank r gets
    // PUs [2r, 2r+1] of the parent 0-7.
    run_team(4, &server.url().to_string(), |ctx, rank| {
        let scope = ctx.scope_get(IntrinsicScope::System).unwrap();
        let child = scope
            .split(4, SCOPE_SPLIT_AFFINITY_PRESERVING)
            .unwrap();
        let r = rank as u32;
        assert_eq!(
            child.cpuset().to_list_string(),
            format!("{}-{}", 2 * r, 2 * r + 1)
        );
        assert_eq!(child.ntasks(), 1);
        child.free().unwrap();
        scope.free().unwrap();
    });
}

#[test]
fn devices_are_redistributed_round_robin() {
    let tmpdir = tempfile::tempdir().unwrap();
    let devices = vec![
        gpu(0, "0000:03:00.0", "0-7"),
        gpu(1, "0000:04:00.0", "0-7"),
        gpu(2, "0000:17:00.0", "0-7"),
        gpu(3, "0000:18:00.0", "0-7"),
    ];
    let server = start_server(&tmpdir, Topology::synthetic(1, 8, 1), devices);

    run_team(4, &server.url().to_string(), |ctx, rank| {
        let scope = ctx.scope_get(IntrinsicScope::System).unwrap();
        assert_eq!(scope.nobjs(ObjType::Gpu).unwrap(), 4);

        let color = (rank / 2) as i32;
        let child = scope.split(2, color).unwrap();
        assert_eq!(child.nobjs(ObjType::Gpu).unwrap(), 2);
        let ordinals: Vec<String> = (0..2)
            .map(|i| {
                child
                    .device_id(ObjType::Gpu, i, DeviceIdType::Ordinal)
                    .unwrap()
            })
            .collect();
        let expected = if color == 0 { ["0", "2"] } else { ["1", "3"] };
        assert_eq!(ordinals, expected);

        // UUID and PCI forms resolve for the same device.
        let uuid = child
            .device_id(ObjType::Gpu, 0, DeviceIdType::Uuid)
            .unwrap();
        let pci = child
            .device_id(ObjType::Gpu, 0, DeviceIdType::PciBusId)
            .unwrap();
        assert_eq!(uuid, synthesize_uuid(&pci));

        child.free().unwrap();
        scope.free().unwrap();
    });
}

#[test]
fn split_at_gives_one_piece_per_object() {
    let tmpdir = tempfile::tempdir().unwrap();
    let server = start_server(&tmpdir, Topology::synthetic(1, 4, 2), Vec::new());

    run_team(4, &server.url().to_string(), |ctx, rank| {
        let scope = ctx.scope_get(IntrinsicScope::System).unwrap();
        assert_eq!(scope.nobjs(ObjType::Core).unwrap(), 4);
        let child = scope.split_at(ObjType::Core, rank as i32).unwrap();
        let r = rank as u32;
        assert_eq!(
            child.cpuset().to_list_string(),
            format!("{}-{}", 2 * r, 2 * r + 1)
        );
        child.free().unwrap();
        scope.free().unwrap();
    });
}

#[test]
fn scope_create_carves_a_singleton() {
    let tmpdir = tempfile::tempdir().unwrap();
    let server = start_server(&tmpdir, Topology::synthetic(1, 4, 2), Vec::new());

    let ctx = Context::create_with_url(
        GroupBinding::Process,
        &server.url().to_string(),
    )
    .unwrap();
    let scope = ctx.scope_get(IntrinsicScope::System).unwrap();
    let sub = scope.create(ObjType::Core, 2, 0).unwrap();
    assert_eq!(sub.cpuset().to_list_string(), "0-3");
    assert_eq!(sub.ntasks(), 1);
    assert_eq!(
        scope.create(ObjType::Core, 99, 0).unwrap_err(),
        ReturnCode::ResUnavailable
    );
    sub.free().unwrap();
    scope.free().unwrap();
}

#[test]
fn bind_stack_push_pop_restores_the_binding() {
    let tmpdir = tempfile::tempdir().unwrap();
    // The synthetic machine must name real PUs for binding to succeed;
    // a single-PU shape keeps this portable.
    let server = start_server(&tmpdir, Topology::synthetic(1, 1, 1), Vec::new());

    // A team of one so pushes rebind only this thread, not the process.
    let team = ThreadTeam::new(1).unwrap();
    let mut ctx = Context::create_with_url(
        GroupBinding::Thread { team, rank: 0 },
        &server.url().to_string(),
    )
    .unwrap();
    let before = ctx.bind_string(BindStringFormat::List).unwrap();

    let scope = ctx.scope_get(IntrinsicScope::System).unwrap();
    assert_eq!(scope.cpuset().to_list_string(), "0");
    ctx.bind_push(&scope).unwrap();
    assert_eq!(ctx.bind_string(BindStringFormat::List).unwrap(), "0");
    assert_eq!(ctx.bind_depth(), 1);

    ctx.bind_pop().unwrap();
    assert_eq!(ctx.bind_string(BindStringFormat::List).unwrap(), before);
    assert_eq!(ctx.bind_pop().unwrap_err(), ReturnCode::Pop);

    let mask = ctx.bind_string(BindStringFormat::Mask).unwrap();
    assert!(mask.starts_with("0x"));
    scope.free().unwrap();
}

#[test]
fn process_scope_follows_the_current_binding() {
    let tmpdir = tempfile::tempdir().unwrap();
    let server = start_server(&tmpdir, Topology::synthetic(1, 4, 1), Vec::new());

    let ctx = Context::create_with_url(
        GroupBinding::Process,
        &server.url().to_string(),
    )
    .unwrap();
    let scope = ctx.scope_get(IntrinsicScope::Process).unwrap();
    let bind = qv_hwloc::affinity::task_get_cpubind(0).unwrap();
    assert_eq!(scope.cpuset(), &bind);
    scope.free().unwrap();
}
