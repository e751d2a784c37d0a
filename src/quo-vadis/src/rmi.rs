//! The RMI client: typed, blocking calls to the node daemon.
//!
//! Connecting performs the HELLO exchange and imports the topology
//! snapshot the server exported, so every client reasons about the same
//! object numbering as the daemon. All calls are synchronous; the
//! per-call timeout defaults to none (block until the daemon answers).

use std::path::PathBuf;
use std::time::Duration;

use lazy_static::lazy_static;
use qv_hwloc::{Cpuset, DeviceType, Hwpool, ObjType, Topology};
use qv_rc::{QvResult, ReturnCode};
use qv_wire::{
    argv_unpack, pictures, recv_msg, send_msg, Channel, Funid, IntrinsicScope,
    RmiArg, RmiVal, ServerUrl,
};

pub const DEFAULT_PORT: u16 = 55995;

lazy_static! {
    /// Default server location; `QV_PORT` selects the TCP port.
    pub static ref DEFAULT_URL: String = {
        let port = std::env::var("QV_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        format!("tcp://127.0.0.1:{port}")
    };
}

pub struct RmiClient {
    channel: Channel,
    topo: Topology,
    hwtopo_path: PathBuf,
    capabilities: u32,
}

impl RmiClient {
    /// Connects to `url`, performs HELLO, and imports the server's
    /// topology snapshot.
    pub fn connect(url: &str) -> QvResult<Self> {
        Self::connect_with_timeout(url, None)
    }

    pub fn connect_with_timeout(
        url: &str,
        timeout: Option<Duration>,
    ) -> QvResult<Self> {
        let url: ServerUrl = url.parse()?;
        let channel = Channel::connect(&url)?;
        channel.set_read_timeout(timeout)?;

        let mut channel = channel;
        let pid = std::process::id() as i32;
        let vals = call(
            &mut channel,
            Funid::Hello,
            pictures::HELLO_REQ,
            &[RmiArg::Int(pid)],
            pictures::HELLO_REP,
        )?;
        let mut vals = vals.into_iter();
        let capabilities = vals.next().ok_or(ReturnCode::Msg)?.into_int()? as u32;
        let hwtopo_path =
            PathBuf::from(vals.next().ok_or(ReturnCode::Msg)?.into_str()?);
        let topo = Topology::from_xml_path(&hwtopo_path)?;

        Ok(RmiClient {
            channel,
            topo,
            hwtopo_path,
            capabilities,
        })
    }

    /// The topology imported at connect time.
    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    pub fn hwtopo_path(&self) -> &PathBuf {
        &self.hwtopo_path
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    /// Current CPU binding of `task_id`; the returned cpuset is freshly
    /// owned by the caller.
    pub fn task_get_cpubind(&mut self, task_id: i64) -> QvResult<Cpuset> {
        let vals = call(
            &mut self.channel,
            Funid::TaskGetCpubind,
            pictures::TASK_GET_CPUBIND_REQ,
            &[RmiArg::Int(task_id as i32)],
            pictures::TASK_GET_CPUBIND_REP,
        )?;
        single_bitmap(vals)
    }

    pub fn task_set_cpubind(
        &mut self,
        task_id: i64,
        cpuset: &Cpuset,
    ) -> QvResult<()> {
        call(
            &mut self.channel,
            Funid::TaskSetCpubindFromCpuset,
            pictures::TASK_SET_CPUBIND_REQ,
            &[RmiArg::Int(task_id as i32), RmiArg::Bitmap(cpuset)],
            pictures::STATUS_REP,
        )?;
        Ok(())
    }

    pub fn scope_get_intrinsic_hwpool(
        &mut self,
        task_id: i64,
        which: IntrinsicScope,
    ) -> QvResult<Hwpool> {
        let vals = call(
            &mut self.channel,
            Funid::ScopeGetIntrinsicHwpool,
            pictures::SCOPE_GET_INTRINSIC_HWPOOL_REQ,
            &[
                RmiArg::Int(task_id as i32),
                RmiArg::Int(which.as_u32() as i32),
            ],
            pictures::SCOPE_GET_INTRINSIC_HWPOOL_REP,
        )?;
        vals.into_iter()
            .next()
            .ok_or(ReturnCode::Msg)?
            .into_hwpool()
    }

    pub fn get_nobjs_in_cpuset(
        &mut self,
        obj_type: ObjType,
        cpuset: &Cpuset,
    ) -> QvResult<i32> {
        let vals = call(
            &mut self.channel,
            Funid::GetNobjsInCpuset,
            pictures::GET_NOBJS_IN_CPUSET_REQ,
            &[
                RmiArg::Int(obj_type.as_u32() as i32),
                RmiArg::Bitmap(cpuset),
            ],
            pictures::GET_NOBJS_IN_CPUSET_REP,
        )?;
        vals.into_iter().next().ok_or(ReturnCode::Msg)?.into_int()
    }

    pub fn split_cpuset_by_color(
        &mut self,
        cpuset: &Cpuset,
        ncolors: i32,
        color: i32,
    ) -> QvResult<Cpuset> {
        let vals = call(
            &mut self.channel,
            Funid::SplitCpusetByColor,
            pictures::SPLIT_CPUSET_BY_COLOR_REQ,
            &[
                RmiArg::Bitmap(cpuset),
                RmiArg::Int(ncolors),
                RmiArg::Int(color),
            ],
            pictures::SPLIT_CPUSET_BY_COLOR_REP,
        )?;
        single_bitmap(vals)
    }

    pub fn get_cpuset_for_nobjs(
        &mut self,
        within: &Cpuset,
        obj_type: ObjType,
        nobjs: i32,
    ) -> QvResult<Cpuset> {
        let vals = call(
            &mut self.channel,
            Funid::GetCpusetForNobjs,
            pictures::GET_CPUSET_FOR_NOBJS_REQ,
            &[
                RmiArg::Bitmap(within),
                RmiArg::Int(obj_type.as_u32() as i32),
                RmiArg::Int(nobjs),
            ],
            pictures::GET_CPUSET_FOR_NOBJS_REP,
        )?;
        single_bitmap(vals)
    }

    pub fn get_device_affinity(
        &mut self,
        devtype: DeviceType,
        device_id: i32,
    ) -> QvResult<Cpuset> {
        let vals = call(
            &mut self.channel,
            Funid::GetDeviceAffinity,
            pictures::GET_DEVICE_AFFINITY_REQ,
            &[
                RmiArg::Int(devtype.as_u32() as i32),
                RmiArg::Int(device_id),
            ],
            pictures::GET_DEVICE_AFFINITY_REP,
        )?;
        single_bitmap(vals)
    }
}

/// One request/response exchange. Replies are self describing: the
/// header's argv names the actual payload, whose first field is the
/// return code. Values after the code are returned when the call
/// succeeded and the payload matches `rep_picture`.
fn call(
    channel: &mut Channel,
    funid: Funid,
    req_picture: &str,
    args: &[RmiArg<'_>],
    rep_picture: &str,
) -> QvResult<Vec<RmiVal>> {
    send_msg(channel, funid, req_picture, args)?;
    let (header, payload) = recv_msg(channel)?;
    if header.funid != funid {
        log::error!(
            "reply function id mismatch: sent {:?}, got {:?}",
            funid,
            header.funid
        );
        return Err(ReturnCode::Msg);
    }
    let actual = argv_unpack(header.argv)?;
    if actual.is_empty() {
        return Err(ReturnCode::Msg);
    }
    let mut vals = qv_wire::sscanf(&payload, &actual)?;
    let rc = match vals.first() {
        Some(RmiVal::Int(code)) => ReturnCode::from_u32(*code as u32),
        _ => return Err(ReturnCode::Msg),
    };
    rc.into_result()?;
    if actual != rep_picture {
        return Err(ReturnCode::Msg);
    }
    vals.remove(0);
    Ok(vals)
}

fn single_bitmap(vals: Vec<RmiVal>) -> QvResult<Cpuset> {
    vals.into_iter().next().ok_or(ReturnCode::Msg)?.into_bitmap()
}
