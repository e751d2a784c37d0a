//! The RMI server.
//!
//! One listener thread accepts connections and hands them to a bounded
//! worker pool over a channel. Each worker drives one connection at a
//! time through a small receive/dispatch/send state machine; the topology
//! and device records are read-only after startup, so handlers share them
//! without locks.

use std::collections::VecDeque;
use std::fs;
use std::io::{ErrorKind, Read};
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use qv_hwloc::{
    affinity, discover_devices, Cpuset, DeviceInfo, DeviceType, Hwpool, ObjType,
    Topology,
};
use qv_rc::{QvResult, ReturnCode};
use qv_wire::{
    argv_pack, pictures, send_msg, sscanf, Channel, Funid, IntrinsicScope,
    MsgHeader, RmiArg, RmiVal, ServerUrl, HDR_SIZE,
};

use crate::config::ServerConfig;

const IDLE_POLL: Duration = Duration::from_millis(100);
const BODY_TIMEOUT: Duration = Duration::from_secs(5);

/// Read-only state shared by every worker.
struct ServerCtx {
    topo: Topology,
    devices: Vec<Arc<DeviceInfo>>,
    hwtopo_path: PathBuf,
    shutdown: AtomicBool,
}

pub struct RmiServer {
    ctx: Arc<ServerCtx>,
    url: ServerUrl,
    threads: Vec<JoinHandle<()>>,
    unix_path: Option<PathBuf>,
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    fn bind(url: &ServerUrl) -> QvResult<Self> {
        match url {
            ServerUrl::Tcp(addr) => {
                let listener = TcpListener::bind(addr).map_err(|e| {
                    log::error!("cannot bind {url}: {e}");
                    ReturnCode::Msg
                })?;
                Ok(Listener::Tcp(listener))
            }
            ServerUrl::Unix(path) => {
                if path.exists() {
                    let _ = fs::remove_file(path);
                }
                let listener = UnixListener::bind(path).map_err(|e| {
                    log::error!("cannot bind {url}: {e}");
                    ReturnCode::Msg
                })?;
                Ok(Listener::Unix(listener))
            }
        }
    }

    fn set_nonblocking(&self) -> std::io::Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(true),
            Listener::Unix(l) => l.set_nonblocking(true),
        }
    }

    fn accept(&self) -> std::io::Result<Channel> {
        match self {
            Listener::Tcp(l) => l.accept().map(|(s, _)| Channel::Tcp(s)),
            Listener::Unix(l) => l.accept().map(|(s, _)| Channel::Unix(s)),
        }
    }
}

impl RmiServer {
    /// Loads the live system topology and devices, exports the topology
    /// snapshot, and starts serving.
    pub fn start(config: &ServerConfig) -> QvResult<Self> {
        let topo = Topology::load()?;
        let devices = discover_devices(std::path::Path::new("/sys"), &topo)?;
        Self::start_with_topology(config, topo, devices)
    }

    /// Starts with a caller-supplied topology; the normal path for tests.
    pub fn start_with_topology(
        config: &ServerConfig,
        topo: Topology,
        devices: Vec<Arc<DeviceInfo>>,
    ) -> QvResult<Self> {
        let hwtopo_path = topo.export_xml(&config.tmpdir)?;
        let listener = match Listener::bind(&config.url) {
            Ok(listener) => listener,
            Err(rc) => {
                let _ = fs::remove_file(&hwtopo_path);
                return Err(rc);
            }
        };
        listener.set_nonblocking().map_err(|_| ReturnCode::Sys)?;
        // Port 0 asks the OS for an ephemeral port; report what we got.
        let url = match &listener {
            Listener::Tcp(l) => l
                .local_addr()
                .map(ServerUrl::Tcp)
                .unwrap_or_else(|_| config.url.clone()),
            Listener::Unix(_) => config.url.clone(),
        };

        let ctx = Arc::new(ServerCtx {
            topo,
            devices,
            hwtopo_path,
            shutdown: AtomicBool::new(false),
        });

        let qdepth = config.qdepth.max(1);
        let (conn_tx, conn_rx) = bounded::<Channel>(qdepth);
        let mut threads = Vec::with_capacity(qdepth + 1);

        {
            let ctx = Arc::clone(&ctx);
            threads.push(std::thread::spawn(move || {
                accept_loop(&ctx, listener, conn_tx);
            }));
        }
        for _ in 0..qdepth {
            let ctx = Arc::clone(&ctx);
            let conn_rx = conn_rx.clone();
            threads.push(std::thread::spawn(move || {
                worker_loop(&ctx, conn_rx);
            }));
        }

        log::info!("serving topology {} at {}", ctx.hwtopo_path.display(), url);
        let unix_path = match &url {
            ServerUrl::Unix(path) => Some(path.clone()),
            ServerUrl::Tcp(_) => None,
        };
        Ok(RmiServer {
            ctx,
            url,
            threads,
            unix_path,
        })
    }

    pub fn url(&self) -> &ServerUrl {
        &self.url
    }

    pub fn hwtopo_path(&self) -> &PathBuf {
        &self.ctx.hwtopo_path
    }

    /// Stops the workers, closes the socket, and unlinks the exported
    /// topology. In-flight messages complete first.
    pub fn shutdown(&mut self) {
        if self.ctx.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        let _ = fs::remove_file(&self.ctx.hwtopo_path);
        if let Some(path) = &self.unix_path {
            let _ = fs::remove_file(path);
        }
        log::info!("server at {} stopped", self.url);
    }
}

impl Drop for RmiServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(ctx: &ServerCtx, listener: Listener, conn_tx: Sender<Channel>) {
    // Accepted but not yet handed to a worker.
    let mut pending: VecDeque<Channel> = VecDeque::new();
    while !ctx.shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok(conn) => pending.push_back(conn),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if pending.is_empty() {
                    std::thread::sleep(IDLE_POLL);
                }
            }
            Err(e) => {
                log::warn!("accept failed: {e}");
                std::thread::sleep(IDLE_POLL);
            }
        }
        while let Some(conn) = pending.pop_front() {
            match conn_tx.send_timeout(conn, IDLE_POLL) {
                Ok(()) => {}
                Err(e) => {
                    // All workers busy; retry after the next accept poll.
                    pending.push_front(e.into_inner());
                    break;
                }
            }
        }
    }
}

fn worker_loop(ctx: &ServerCtx, conn_rx: Receiver<Channel>) {
    while !ctx.shutdown.load(Ordering::Relaxed) {
        match conn_rx.recv_timeout(IDLE_POLL) {
            Ok(conn) => serve_connection(ctx, conn),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Per-connection states; errors while receiving or sending drop the
/// in-flight message.
enum WorkerState {
    Init,
    Recv,
    Send(MsgHeader, Vec<u8>),
}

fn serve_connection(ctx: &ServerCtx, mut conn: Channel) {
    let mut state = WorkerState::Init;
    loop {
        if ctx.shutdown.load(Ordering::Relaxed) {
            return;
        }
        state = match state {
            WorkerState::Init => {
                if conn.set_read_timeout(Some(IDLE_POLL)).is_err() {
                    return;
                }
                WorkerState::Recv
            }
            WorkerState::Recv => match recv_step(&mut conn) {
                RecvOutcome::Request(header, payload) => {
                    WorkerState::Send(header, payload)
                }
                RecvOutcome::Idle => WorkerState::Recv,
                RecvOutcome::Closed => return,
            },
            WorkerState::Send(header, payload) => {
                match respond(ctx, &mut conn, header, payload) {
                    Ok(()) => WorkerState::Recv,
                    // Reply could not be delivered; drop the message and
                    // the connection with it.
                    Err(_) => return,
                }
            }
        };
    }
}

enum RecvOutcome {
    Request(MsgHeader, Vec<u8>),
    Idle,
    Closed,
}

/// Reads one frame. The first byte is awaited under the idle timeout so
/// shutdown stays responsive; once a frame begins, the rest must arrive
/// within the body timeout or the connection is dropped.
fn recv_step(conn: &mut Channel) -> RecvOutcome {
    let mut first = [0u8; 1];
    match conn.read(&mut first) {
        Ok(0) => return RecvOutcome::Closed,
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
            return RecvOutcome::Idle;
        }
        Err(_) => return RecvOutcome::Closed,
    }

    if conn.set_read_timeout(Some(BODY_TIMEOUT)).is_err() {
        return RecvOutcome::Closed;
    }
    let outcome = (|| {
        let mut raw = [0u8; HDR_SIZE];
        raw[0] = first[0];
        conn.read_exact(&mut raw[1..]).ok()?;
        let header = MsgHeader::decode(&raw).ok()?;
        let mut payload = vec![0u8; header.payload_len as usize];
        conn.read_exact(&mut payload).ok()?;
        Some((header, payload))
    })();
    let _ = conn.set_read_timeout(Some(IDLE_POLL));

    match outcome {
        Some((header, payload)) => RecvOutcome::Request(header, payload),
        // Partial or corrupt frame: the stream has lost sync.
        None => RecvOutcome::Closed,
    }
}

fn respond(
    ctx: &ServerCtx,
    conn: &mut Channel,
    header: MsgHeader,
    payload: Vec<u8>,
) -> QvResult<()> {
    match handle(ctx, header.funid, header.argv, &payload) {
        Ok(reply) => send_reply(conn, header.funid, &reply),
        Err(rc) => send_msg(
            conn,
            header.funid,
            pictures::STATUS_REP,
            &[RmiArg::Int(rc.as_u32() as i32)],
        ),
    }
}

/// A successful reply: the picture (leading return code included) and the
/// values following the code.
struct Reply {
    picture: &'static str,
    vals: Vec<OwnedArg>,
}

/// Owned counterparts of `RmiArg` so handlers can build replies without
/// borrow gymnastics.
enum OwnedArg {
    Int(i32),
    Str(String),
    Bitmap(Cpuset),
    Hwpool(Hwpool),
}

fn send_reply(conn: &mut Channel, funid: Funid, reply: &Reply) -> QvResult<()> {
    let mut args: Vec<RmiArg<'_>> =
        Vec::with_capacity(reply.vals.len() + 1);
    args.push(RmiArg::Int(ReturnCode::Success.as_u32() as i32));
    for val in &reply.vals {
        args.push(match val {
            OwnedArg::Int(v) => RmiArg::Int(*v),
            OwnedArg::Str(v) => RmiArg::Str(v),
            OwnedArg::Bitmap(v) => RmiArg::Bitmap(v),
            OwnedArg::Hwpool(v) => RmiArg::Hwpool(v),
        });
    }
    send_msg(conn, funid, reply.picture, &args)
}

/// Decodes and dispatches one request.
fn handle(
    ctx: &ServerCtx,
    funid: Funid,
    argv: u64,
    payload: &[u8],
) -> QvResult<Reply> {
    let req_picture = match funid {
        Funid::Hello => pictures::HELLO_REQ,
        Funid::TaskGetCpubind => pictures::TASK_GET_CPUBIND_REQ,
        Funid::TaskSetCpubindFromCpuset => pictures::TASK_SET_CPUBIND_REQ,
        Funid::ScopeGetIntrinsicHwpool => pictures::SCOPE_GET_INTRINSIC_HWPOOL_REQ,
        Funid::GetNobjsInCpuset => pictures::GET_NOBJS_IN_CPUSET_REQ,
        Funid::SplitCpusetByColor => pictures::SPLIT_CPUSET_BY_COLOR_REQ,
        Funid::GetCpusetForNobjs => pictures::GET_CPUSET_FOR_NOBJS_REQ,
        Funid::GetDeviceAffinity => pictures::GET_DEVICE_AFFINITY_REQ,
    };
    if argv != argv_pack(req_picture) {
        return Err(ReturnCode::Msg);
    }
    let vals = sscanf(payload, req_picture)?;

    match funid {
        Funid::Hello => {
            let pid = int_at(&vals, 0)?;
            log::debug!("hello from pid {pid}");
            Ok(Reply {
                picture: pictures::HELLO_REP,
                vals: vec![
                    OwnedArg::Int(0),
                    OwnedArg::Str(ctx.hwtopo_path.display().to_string()),
                ],
            })
        }
        Funid::TaskGetCpubind => {
            let task = int_at(&vals, 0)?;
            let bind = affinity::task_get_cpubind(task)?;
            Ok(Reply {
                picture: pictures::TASK_GET_CPUBIND_REP,
                vals: vec![OwnedArg::Bitmap(bind)],
            })
        }
        Funid::TaskSetCpubindFromCpuset => {
            let task = int_at(&vals, 0)?;
            let cpuset = bitmap_at(&vals, 1)?;
            affinity::task_set_cpubind(task, &cpuset)?;
            Ok(Reply {
                picture: pictures::STATUS_REP,
                vals: Vec::new(),
            })
        }
        Funid::ScopeGetIntrinsicHwpool => {
            let task = int_at(&vals, 0)?;
            let which = IntrinsicScope::from_u32(int_at(&vals, 1)? as u32)?;
            let pool = intrinsic_hwpool(ctx, task, which)?;
            Ok(Reply {
                picture: pictures::SCOPE_GET_INTRINSIC_HWPOOL_REP,
                vals: vec![OwnedArg::Hwpool(pool)],
            })
        }
        Funid::GetNobjsInCpuset => {
            let obj_type = ObjType::from_u32(int_at(&vals, 0)? as u32)?;
            let cpuset = bitmap_at(&vals, 1)?;
            let count = if obj_type == ObjType::Gpu {
                ctx.devices
                    .iter()
                    .filter(|d| d.affinity.intersects(&cpuset))
                    .count()
            } else {
                ctx.topo.nobjs_by_type_in_cpuset(obj_type, &cpuset)?
            };
            Ok(Reply {
                picture: pictures::GET_NOBJS_IN_CPUSET_REP,
                vals: vec![OwnedArg::Int(count as i32)],
            })
        }
        Funid::SplitCpusetByColor => {
            let cpuset = bitmap_at(&vals, 0)?;
            let ncolors = int_at(&vals, 1)?;
            let color = int_at(&vals, 2)?;
            if ncolors <= 0 || color < 0 {
                return Err(ReturnCode::InvalidArg);
            }
            let piece = ctx.topo.split_cpuset_by_color(
                &cpuset,
                ncolors as usize,
                color as usize,
            )?;
            Ok(Reply {
                picture: pictures::SPLIT_CPUSET_BY_COLOR_REP,
                vals: vec![OwnedArg::Bitmap(piece)],
            })
        }
        Funid::GetCpusetForNobjs => {
            let within = bitmap_at(&vals, 0)?;
            let obj_type = ObjType::from_u32(int_at(&vals, 1)? as u32)?;
            let nobjs = int_at(&vals, 2)?;
            if nobjs <= 0 {
                return Err(ReturnCode::InvalidArg);
            }
            let cpuset =
                ctx.topo.cpuset_for_nobjs(&within, obj_type, nobjs as usize)?;
            Ok(Reply {
                picture: pictures::GET_CPUSET_FOR_NOBJS_REP,
                vals: vec![OwnedArg::Bitmap(cpuset)],
            })
        }
        Funid::GetDeviceAffinity => {
            let devtype = DeviceType::from_u32(int_at(&vals, 0)? as u32)?;
            let device_id = int_at(&vals, 1)?;
            let dev = ctx
                .devices
                .iter()
                .find(|d| d.devtype == devtype && d.id == device_id)
                .ok_or(ReturnCode::NotFound)?;
            Ok(Reply {
                picture: pictures::GET_DEVICE_AFFINITY_REP,
                vals: vec![OwnedArg::Bitmap(dev.affinity.clone())],
            })
        }
    }
}

/// Builds the pool backing an intrinsic scope.
///
/// SYSTEM and USER cover the whole machine. JOB does too until an
/// external scheduler announces a narrower allocation. PROCESS is
/// narrowed to the task's binding at request time; it keeps the devices
/// whose affinity intersects that binding.
fn intrinsic_hwpool(
    ctx: &ServerCtx,
    task: i32,
    which: IntrinsicScope,
) -> QvResult<Hwpool> {
    let cpuset = match which {
        IntrinsicScope::System | IntrinsicScope::User | IntrinsicScope::Job => {
            ctx.topo.machine_cpuset().clone()
        }
        IntrinsicScope::Process => affinity::task_get_cpubind(task)?,
    };
    let mut pool = Hwpool::with_cpuset(&cpuset);
    for dev in &ctx.devices {
        if dev.affinity.intersects(&cpuset) {
            pool.add_device(Arc::clone(dev));
        }
    }
    Ok(pool)
}

fn int_at(vals: &[RmiVal], index: usize) -> QvResult<i32> {
    match vals.get(index) {
        Some(RmiVal::Int(v)) => Ok(*v),
        _ => Err(ReturnCode::Msg),
    }
}

fn bitmap_at(vals: &[RmiVal], index: usize) -> QvResult<Cpuset> {
    match vals.get(index) {
        Some(RmiVal::Bitmap(v)) => Ok(v.clone()),
        _ => Err(ReturnCode::Msg),
    }
}
