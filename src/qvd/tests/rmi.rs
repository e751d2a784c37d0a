//! End-to-end RMI exercises: a live server on an ephemeral socket, a real
//! client, and a synthetic topology shared through the exported snapshot.

use std::sync::Arc;

use quo_vadis::{Cpuset, DeviceType, IntrinsicScope, ObjType, ReturnCode, RmiClient};
use qv_hwloc::{affinity, synthesize_uuid, DeviceInfo, Topology};
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

/// A 4-core machine (cpuset 0-3) with one GPU per package half.
fn start_server(tmpdir: &tempfile::TempDir) -> RmiServer {
    let config = ServerConfig {
        url: "tcp://127.0.0.1:0".parse().unwrap(),
        qdepth: 4,
        tmpdir: tmpdir.path().to_path_buf(),
    };
    let topo = Topology::synthetic(1, 4, 1);
    let devices = vec![
        gpu(0, "0000:03:00.0", "0-1"),
        gpu(1, "0000:17:00.0", "2-3"),
    ];
    RmiServer::start_with_topology(&config, topo, devices).unwrap()
}

#[test]
fn hello_imports_the_exported_topology() {
    let tmpdir = tempfile::tempdir().unwrap();
    let server = start_server(&tmpdir);
    let client = RmiClient::connect(&server.url().to_string()).unwrap();
    assert_eq!(client.topology().machine_cpuset().to_list_string(), "0-3");
    assert_eq!(client.hwtopo_path(), server.hwtopo_path());
    assert_eq!(
        client.topology().nobjs_by_type(ObjType::Core).unwrap(),
        4
    );
}

#[test]
fn cpubind_round_trip_matches_direct_query() {
    let tmpdir = tempfile::tempdir().unwrap();
    let server = start_server(&tmpdir);
    let mut client = RmiClient::connect(&server.url().to_string()).unwrap();

    let pid = std::process::id() as i64;
    let via_rmi = client.task_get_cpubind(pid).unwrap();
    let direct = affinity::task_get_cpubind(pid as i32).unwrap();
    assert_eq!(via_rmi, direct);
}

#[test]
fn set_cpubind_applies_and_restores() {
    let tmpdir = tempfile::tempdir().unwrap();
    let server = start_server(&tmpdir);
    let mut client = RmiClient::connect(&server.url().to_string()).unwrap();

    let tid = nix::unistd::gettid().as_raw() as i64;
    let original = client.task_get_cpubind(tid).unwrap();
    let narrow = Cpuset::from_ids([original.first().unwrap()]);
    client.task_set_cpubind(tid, &narrow).unwrap();
    assert_eq!(client.task_get_cpubind(tid).unwrap(), narrow);
    client.task_set_cpubind(tid, &original).unwrap();
    assert_eq!(client.task_get_cpubind(tid).unwrap(), original);
}

#[test]
fn intrinsic_pools() {
    let tmpdir = tempfile::tempdir().unwrap();
    let server = start_server(&tmpdir);
    let mut client = RmiClient::connect(&server.url().to_string()).unwrap();
    let pid = std::process::id() as i64;

    let system = client
        .scope_get_intrinsic_hwpool(pid, IntrinsicScope::System)
        .unwrap();
    assert_eq!(system.cpuset().to_list_string(), "0-3");
    assert_eq!(system.ndevices_of(DeviceType::Gpu), 2);

    let user = client
        .scope_get_intrinsic_hwpool(pid, IntrinsicScope::User)
        .unwrap();
    assert_eq!(user, system);

    // PROCESS narrows to the caller's binding at request time.
    let process = client
        .scope_get_intrinsic_hwpool(pid, IntrinsicScope::Process)
        .unwrap();
    let bind = affinity::task_get_cpubind(pid as i32).unwrap();
    assert_eq!(process.cpuset(), &bind);
}

#[test]
fn counting_and_splitting_queries() {
    let tmpdir = tempfile::tempdir().unwrap();
    let server = start_server(&tmpdir);
    let mut client = RmiClient::connect(&server.url().to_string()).unwrap();

    let machine = Cpuset::parse_list("0-3").unwrap();
    assert_eq!(
        client.get_nobjs_in_cpuset(ObjType::Core, &machine).unwrap(),
        4
    );
    assert_eq!(
        client.get_nobjs_in_cpuset(ObjType::Gpu, &machine).unwrap(),
        2
    );

    let piece = client.split_cpuset_by_color(&machine, 2, 1).unwrap();
    assert_eq!(piece.to_list_string(), "2-3");

    let two_cores = client
        .get_cpuset_for_nobjs(&machine, ObjType::Core, 2)
        .unwrap();
    assert_eq!(two_cores.to_list_string(), "0-1");

    assert_eq!(
        client.get_device_affinity(DeviceType::Gpu, 1).unwrap(),
        Cpuset::parse_list("2-3").unwrap()
    );
    // Errors travel back as codes.
    assert_eq!(
        client.get_device_affinity(DeviceType::Gpu, 99),
        Err(ReturnCode::NotFound)
    );
    assert_eq!(
        client.get_cpuset_for_nobjs(&machine, ObjType::Core, 9),
        Err(ReturnCode::ResUnavailable)
    );
}

#[test]
fn concurrent_clients_are_served() {
    let tmpdir = tempfile::tempdir().unwrap();
    let server = start_server(&tmpdir);
    let url = server.url().to_string();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let url = url.clone();
        handles.push(std::thread::spawn(move || {
            let mut client = RmiClient::connect(&url).unwrap();
            let machine = Cpuset::parse_list("0-3").unwrap();
            for color in 0..2 {
                let piece = client
                    .split_cpuset_by_color(&machine, 2, color)
                    .unwrap();
                assert_eq!(piece.weight(), 2);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn unix_socket_transport() {
    let tmpdir = tempfile::tempdir().unwrap();
    let sock = tmpdir.path().join("qv.sock");
    let config = ServerConfig {
        url: format!("unix://{}", sock.display()).parse().unwrap(),
        qdepth: 2,
        tmpdir: tmpdir.path().to_path_buf(),
    };
    let mut server = RmiServer::start_with_topology(
        &config,
        Topology::synthetic(1, 2, 1),
        Vec::new(),
    )
    .unwrap();

    let mut client = RmiClient::connect(&server.url().to_string()).unwrap();
    let machine = Cpuset::parse_list("0-1").unwrap();
    assert_eq!(
        client.get_nobjs_in_cpuset(ObjType::Core, &machine).unwrap(),
        2
    );
    drop(client);

    server.shutdown();
    assert!(!sock.exists());
}

#[test]
fn shutdown_unlinks_the_topology_snapshot() {
    let tmpdir = tempfile::tempdir().unwrap();
    let mut server = start_server(&tmpdir);
    let path = server.hwtopo_path().clone();
    assert!(path.exists());
    server.shutdown();
    assert!(!path.exists());
}
