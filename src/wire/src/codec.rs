//! The typed "picture string" codec.
//!
//! A picture names the field layout of a payload, one character per field:
//! `i` a little-endian i32, `s` a NUL-terminated UTF-8 string, `b` a bitmap
//! transported as its list-form string, `p` a hardware pool. Bitmaps travel
//! as strings so the payload stays independent of the in-memory bitmap
//! layout.
//!
//! [`sprintf`] and [`sscanf`] are the only entry points. A picture that
//! does not match the supplied arguments is a programmer error and panics;
//! a payload that does not match the picture is a peer error and yields
//! `ERR_MSG`.

use byteorder::{ByteOrder, LittleEndian};
use bytes::Buf;
use qv_hwloc::{Cpuset, DeviceInfo, DeviceType, Hwpool};
use qv_rc::{QvResult, ReturnCode};
use std::sync::Arc;

use crate::bbuff::Bbuff;

/// Borrowed argument for [`sprintf`].
#[derive(Debug, Clone, Copy)]
pub enum RmiArg<'a> {
    Int(i32),
    Str(&'a str),
    Bitmap(&'a Cpuset),
    Hwpool(&'a Hwpool),
}

/// Owned value produced by [`sscanf`].
#[derive(Debug, Clone, PartialEq)]
pub enum RmiVal {
    Int(i32),
    Str(String),
    Bitmap(Cpuset),
    Hwpool(Hwpool),
}

impl RmiVal {
    pub fn into_int(self) -> QvResult<i32> {
        match self {
            RmiVal::Int(v) => Ok(v),
            _ => Err(ReturnCode::Msg),
        }
    }

    pub fn into_str(self) -> QvResult<String> {
        match self {
            RmiVal::Str(v) => Ok(v),
            _ => Err(ReturnCode::Msg),
        }
    }

    pub fn into_bitmap(self) -> QvResult<Cpuset> {
        match self {
            RmiVal::Bitmap(v) => Ok(v),
            _ => Err(ReturnCode::Msg),
        }
    }

    pub fn into_hwpool(self) -> QvResult<Hwpool> {
        match self {
            RmiVal::Hwpool(v) => Ok(v),
            _ => Err(ReturnCode::Msg),
        }
    }
}

/// Appends `args` to `buff` according to `picture`.
pub fn sprintf(buff: &mut Bbuff, picture: &str, args: &[RmiArg<'_>]) {
    assert_eq!(
        picture.len(),
        args.len(),
        "picture {picture:?} does not match argument count {}",
        args.len()
    );
    for (code, arg) in picture.chars().zip(args.iter()) {
        match (code, arg) {
            ('i', RmiArg::Int(v)) => put_i32(buff, *v),
            ('s', RmiArg::Str(v)) => put_str(buff, v),
            ('b', RmiArg::Bitmap(v)) => put_str(buff, &v.to_list_string()),
            ('p', RmiArg::Hwpool(v)) => put_hwpool(buff, v),
            _ => panic!("picture code {code:?} does not match argument {arg:?}"),
        }
    }
}

/// Decodes `data` according to `picture`. The entire payload must be
/// consumed.
pub fn sscanf(data: &[u8], picture: &str) -> QvResult<Vec<RmiVal>> {
    let mut buf = data;
    let mut vals = Vec::with_capacity(picture.len());
    for code in picture.chars() {
        let val = match code {
            'i' => RmiVal::Int(take_i32(&mut buf)?),
            's' => RmiVal::Str(take_str(&mut buf)?),
            'b' => RmiVal::Bitmap(take_cpuset(&mut buf)?),
            'p' => RmiVal::Hwpool(take_hwpool(&mut buf)?),
            _ => panic!("malformed picture code {code:?}"),
        };
        vals.push(val);
    }
    if buf.remaining() != 0 {
        return Err(ReturnCode::Msg);
    }
    Ok(vals)
}

fn put_i32(buff: &mut Bbuff, value: i32) {
    let mut raw = [0u8; 4];
    LittleEndian::write_i32(&mut raw, value);
    buff.append(&raw);
}

fn put_u32(buff: &mut Bbuff, value: u32) {
    let mut raw = [0u8; 4];
    LittleEndian::write_u32(&mut raw, value);
    buff.append(&raw);
}

fn put_str(buff: &mut Bbuff, value: &str) {
    debug_assert!(!value.as_bytes().contains(&0), "NUL inside payload string");
    buff.append(value.as_bytes());
    buff.append(&[0]);
}

// A pool is self describing: compute slice, then a count-prefixed device
// sequence carrying every record field.
fn put_hwpool(buff: &mut Bbuff, pool: &Hwpool) {
    put_str(buff, &pool.cpuset().to_list_string());
    put_u32(buff, pool.devices().len() as u32);
    for dev in pool.devices() {
        put_u32(buff, dev.devtype.as_u32());
        put_i32(buff, dev.id);
        put_u32(buff, dev.vendor_id);
        put_i32(buff, dev.smi_id);
        put_str(buff, &dev.name);
        put_str(buff, &dev.pci_bus_id);
        put_str(buff, &dev.uuid);
        put_str(buff, &dev.affinity.to_list_string());
    }
}

fn take_i32(buf: &mut &[u8]) -> QvResult<i32> {
    if buf.remaining() < 4 {
        return Err(ReturnCode::Msg);
    }
    Ok(buf.get_i32_le())
}

fn take_u32(buf: &mut &[u8]) -> QvResult<u32> {
    if buf.remaining() < 4 {
        return Err(ReturnCode::Msg);
    }
    Ok(buf.get_u32_le())
}

fn take_str(buf: &mut &[u8]) -> QvResult<String> {
    // A byte-slice Buf is a single chunk, so the NUL scan sees all of it.
    let (s, consumed) = {
        let chunk = buf.chunk();
        let nul = chunk.iter().position(|b| *b == 0).ok_or(ReturnCode::Msg)?;
        let s = std::str::from_utf8(&chunk[..nul])
            .map_err(|_| ReturnCode::Msg)?
            .to_string();
        (s, nul + 1)
    };
    buf.advance(consumed);
    Ok(s)
}

fn take_cpuset(buf: &mut &[u8]) -> QvResult<Cpuset> {
    let s = take_str(buf)?;
    Cpuset::parse_list(&s).map_err(|_| ReturnCode::Msg)
}

fn take_hwpool(buf: &mut &[u8]) -> QvResult<Hwpool> {
    let cpuset = take_cpuset(buf)?;
    let mut pool = Hwpool::with_cpuset(&cpuset);
    let ndevs = take_u32(buf)?;
    for _ in 0..ndevs {
        let devtype =
            DeviceType::from_u32(take_u32(buf)?).map_err(|_| ReturnCode::Msg)?;
        let id = take_i32(buf)?;
        let vendor_id = take_u32(buf)?;
        let smi_id = take_i32(buf)?;
        let name = take_str(buf)?;
        let pci_bus_id = take_str(buf)?;
        let uuid = take_str(buf)?;
        let affinity = take_cpuset(buf)?;
        pool.add_device(Arc::new(DeviceInfo {
            devtype,
            id,
            vendor_id,
            smi_id,
            name,
            pci_bus_id,
            uuid,
            affinity,
        }));
    }
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qv_hwloc::synthesize_uuid;

    fn sample_pool() -> Hwpool {
        let mut pool = Hwpool::with_cpuset(&Cpuset::from_range(0, 7));
        for (id, pci, affinity) in
            [(0, "0000:03:00.0", "0-3"), (1, "0000:17:00.0", "4-7")]
        {
            pool.add_device(Arc::new(DeviceInfo {
                devtype: DeviceType::Gpu,
                id,
                vendor_id: 0x10de,
                smi_id: id,
                name: format!("gpu{id}"),
                pci_bus_id: pci.to_string(),
                uuid: synthesize_uuid(pci),
                affinity: Cpuset::parse_list(affinity).unwrap(),
            }));
        }
        pool
    }

    #[test]
    fn scalar_round_trip() {
        let mut buff = Bbuff::new();
        let bitmap = Cpuset::from_ids([0, 2, 3]);
        sprintf(
            &mut buff,
            "isb",
            &[
                RmiArg::Int(-7),
                RmiArg::Str("hello"),
                RmiArg::Bitmap(&bitmap),
            ],
        );
        let vals = sscanf(buff.data(), "isb").unwrap();
        assert_eq!(
            vals,
            vec![
                RmiVal::Int(-7),
                RmiVal::Str("hello".to_string()),
                RmiVal::Bitmap(bitmap),
            ]
        );
    }

    #[test]
    fn hwpool_round_trip() {
        let pool = sample_pool();
        let mut buff = Bbuff::new();
        sprintf(&mut buff, "p", &[RmiArg::Hwpool(&pool)]);
        let vals = sscanf(buff.data(), "p").unwrap();
        assert_eq!(vals[0].clone().into_hwpool().unwrap(), pool);
    }

    #[test]
    fn empty_pool_round_trip() {
        let pool = Hwpool::new();
        let mut buff = Bbuff::new();
        sprintf(&mut buff, "p", &[RmiArg::Hwpool(&pool)]);
        let vals = sscanf(buff.data(), "p").unwrap();
        assert_eq!(vals[0].clone().into_hwpool().unwrap(), pool);
    }

    #[test]
    fn identical_pools_encode_identically() {
        let mut a = Bbuff::new();
        let mut b = Bbuff::new();
        sprintf(&mut a, "p", &[RmiArg::Hwpool(&sample_pool())]);
        sprintf(&mut b, "p", &[RmiArg::Hwpool(&sample_pool())]);
        assert_eq!(a, b);
    }

    #[test]
    fn truncated_payload_is_a_msg_error() {
        let mut buff = Bbuff::new();
        sprintf(&mut buff, "i", &[RmiArg::Int(1)]);
        assert_eq!(sscanf(&buff.data()[..2], "i"), Err(ReturnCode::Msg));
        // Trailing garbage is rejected too.
        let mut long = buff.into_vec();
        long.push(0xff);
        assert_eq!(sscanf(&long, "i"), Err(ReturnCode::Msg));
    }

    #[test]
    fn unterminated_string_is_a_msg_error() {
        assert_eq!(sscanf(b"abc", "s"), Err(ReturnCode::Msg));
    }

    #[test]
    #[should_panic]
    fn picture_argument_mismatch_panics() {
        let mut buff = Bbuff::new();
        sprintf(&mut buff, "i", &[RmiArg::Str("nope")]);
    }

    #[test]
    fn value_accessors_enforce_types() {
        assert_eq!(RmiVal::Int(3).into_int().unwrap(), 3);
        assert_eq!(RmiVal::Int(3).into_str(), Err(ReturnCode::Msg));
        assert_eq!(
            RmiVal::Str("x".into()).into_bitmap(),
            Err(ReturnCode::Msg)
        );
    }
}
