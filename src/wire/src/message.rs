//! Fixed-size message headers and function ids.
//!
//! Every message is a 16-byte little-endian header followed by a
//! picture-encoded payload. The header's third field carries the payload
//! length so the frame is self delimiting on a stream socket.

use bytes::{Buf, BufMut};
use qv_rc::{QvResult, ReturnCode};

pub const HDR_SIZE: usize = 16;

/// Upper bound on payload size; anything larger is a corrupt frame.
pub const MAX_PAYLOAD: u32 = 16 << 20;

/// Remote functions served by the RMI server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Funid {
    Hello = 0,
    TaskGetCpubind = 1,
    TaskSetCpubindFromCpuset = 2,
    ScopeGetIntrinsicHwpool = 3,
    GetNobjsInCpuset = 4,
    SplitCpusetByColor = 5,
    GetCpusetForNobjs = 6,
    GetDeviceAffinity = 7,
}

impl Funid {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> QvResult<Self> {
        Ok(match value {
            0 => Funid::Hello,
            1 => Funid::TaskGetCpubind,
            2 => Funid::TaskSetCpubindFromCpuset,
            3 => Funid::ScopeGetIntrinsicHwpool,
            4 => Funid::GetNobjsInCpuset,
            5 => Funid::SplitCpusetByColor,
            6 => Funid::GetCpusetForNobjs,
            7 => Funid::GetDeviceAffinity,
            _ => return Err(ReturnCode::Rpc),
        })
    }
}

/// Intrinsic scope kinds understood by `SCOPE_GET_INTRINSIC_HWPOOL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum IntrinsicScope {
    System = 0,
    User = 1,
    Job = 2,
    Process = 3,
}

impl IntrinsicScope {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> QvResult<Self> {
        Ok(match value {
            0 => IntrinsicScope::System,
            1 => IntrinsicScope::User,
            2 => IntrinsicScope::Job,
            3 => IntrinsicScope::Process,
            _ => return Err(ReturnCode::InvalidArg),
        })
    }
}

// 4-bit argument type tags packed into the header's argv field; NONE
// terminates the sequence.
const TAG_NONE: u64 = 0;
const TAG_INT: u64 = 1;
const TAG_CSTR: u64 = 2;
const TAG_BITM: u64 = 3;
const TAG_HWPOOL: u64 = 4;
const TAG_BITS: u32 = 4;
const MAX_ARGS: usize = (u64::BITS / TAG_BITS) as usize;

/// Packs a picture into the header's argv field. Malformed pictures are
/// programmer errors.
pub fn argv_pack(picture: &str) -> u64 {
    assert!(
        picture.len() <= MAX_ARGS,
        "picture {picture:?} exceeds {MAX_ARGS} arguments"
    );
    let mut argv = 0u64;
    for (i, code) in picture.chars().enumerate() {
        let tag = match code {
            'i' => TAG_INT,
            's' => TAG_CSTR,
            'b' => TAG_BITM,
            'p' => TAG_HWPOOL,
            _ => panic!("malformed picture code {code:?}"),
        };
        argv |= tag << (i as u32 * TAG_BITS);
    }
    argv
}

/// Recovers the picture from a packed argv field.
pub fn argv_unpack(mut argv: u64) -> QvResult<String> {
    let mut picture = String::new();
    for _ in 0..MAX_ARGS {
        let code = match argv & ((1 << TAG_BITS) - 1) {
            TAG_NONE => break,
            TAG_INT => 'i',
            TAG_CSTR => 's',
            TAG_BITM => 'b',
            TAG_HWPOOL => 'p',
            _ => return Err(ReturnCode::Msg),
        };
        picture.push(code);
        argv >>= TAG_BITS;
    }
    Ok(picture)
}

/// Request/reply payload pictures, one pair per function id. Every reply
/// leads with an `i` carrying the return code; error replies degrade to
/// just that code.
pub mod pictures {
    pub const STATUS_REP: &str = "i";

    /// pid
    pub const HELLO_REQ: &str = "i";
    /// rc, capability flags, exported-topology path
    pub const HELLO_REP: &str = "iis";

    /// task id
    pub const TASK_GET_CPUBIND_REQ: &str = "i";
    pub const TASK_GET_CPUBIND_REP: &str = "ib";

    /// task id, cpuset
    pub const TASK_SET_CPUBIND_REQ: &str = "ib";

    /// task id, intrinsic kind
    pub const SCOPE_GET_INTRINSIC_HWPOOL_REQ: &str = "ii";
    pub const SCOPE_GET_INTRINSIC_HWPOOL_REP: &str = "ip";

    /// object type, cpuset
    pub const GET_NOBJS_IN_CPUSET_REQ: &str = "ib";
    pub const GET_NOBJS_IN_CPUSET_REP: &str = "ii";

    /// cpuset, ncolors, color
    pub const SPLIT_CPUSET_BY_COLOR_REQ: &str = "bii";
    pub const SPLIT_CPUSET_BY_COLOR_REP: &str = "ib";

    /// cpuset, object type, count
    pub const GET_CPUSET_FOR_NOBJS_REQ: &str = "bii";
    pub const GET_CPUSET_FOR_NOBJS_REP: &str = "ib";

    /// device type, device id
    pub const GET_DEVICE_AFFINITY_REQ: &str = "ii";
    pub const GET_DEVICE_AFFINITY_REP: &str = "ib";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub funid: Funid,
    pub argv: u64,
    pub payload_len: u32,
}

impl MsgHeader {
    pub fn encode(&self) -> [u8; HDR_SIZE] {
        let mut raw = [0u8; HDR_SIZE];
        let mut cursor = &mut raw[..];
        cursor.put_u32_le(self.funid.as_u32());
        cursor.put_u64_le(self.argv);
        cursor.put_u32_le(self.payload_len);
        raw
    }

    pub fn decode(raw: &[u8; HDR_SIZE]) -> QvResult<Self> {
        let mut buf = &raw[..];
        let funid = Funid::from_u32(buf.get_u32_le())?;
        let argv = buf.get_u64_le();
        let payload_len = buf.get_u32_le();
        if payload_len > MAX_PAYLOAD {
            return Err(ReturnCode::Msg);
        }
        Ok(MsgHeader {
            funid,
            argv,
            payload_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let hdr = MsgHeader {
            funid: Funid::SplitCpusetByColor,
            argv: argv_pack("bii"),
            payload_len: 42,
        };
        let raw = hdr.encode();
        assert_eq!(MsgHeader::decode(&raw).unwrap(), hdr);
    }

    #[test]
    fn header_is_little_endian() {
        let hdr = MsgHeader {
            funid: Funid::TaskGetCpubind,
            argv: 0,
            payload_len: 0x0102,
        };
        let raw = hdr.encode();
        assert_eq!(raw[0], 1);
        assert_eq!(raw[1], 0);
        assert_eq!(raw[12], 0x02);
        assert_eq!(raw[13], 0x01);
    }

    #[test]
    fn argv_round_trip() {
        for picture in ["", "i", "is", "bii", "ip", "bisp"] {
            assert_eq!(argv_unpack(argv_pack(picture)).unwrap(), picture);
        }
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut raw = MsgHeader {
            funid: Funid::Hello,
            argv: 0,
            payload_len: 0,
        }
        .encode();
        let mut cursor = &mut raw[12..];
        cursor.put_u32_le(MAX_PAYLOAD + 1);
        assert_eq!(MsgHeader::decode(&raw), Err(ReturnCode::Msg));
    }

    #[test]
    fn unknown_funid_is_an_rpc_error() {
        let mut raw = [0u8; HDR_SIZE];
        let mut cursor = &mut raw[..];
        cursor.put_u32_le(999);
        assert_eq!(MsgHeader::decode(&raw), Err(ReturnCode::Rpc));
    }
}
