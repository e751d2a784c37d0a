//! Stream transport for RMI messages.
//!
//! The daemon listens on either a loopback TCP socket or a Unix domain
//! socket; both are node local. One request/response exchange is in flight
//! per connection at a time.

use std::fmt;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use qv_rc::{QvResult, ReturnCode};

use crate::bbuff::Bbuff;
use crate::codec::{sprintf, RmiArg};
use crate::message::{argv_pack, Funid, MsgHeader, HDR_SIZE};

/// Parsed server location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerUrl {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for ServerUrl {
    type Err = ReturnCode;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = url.strip_prefix("tcp://") {
            let addr = rest
                .to_socket_addrs()
                .map_err(|_| ReturnCode::InvalidArg)?
                .next()
                .ok_or(ReturnCode::InvalidArg)?;
            Ok(ServerUrl::Tcp(addr))
        } else if let Some(path) = url.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ReturnCode::InvalidArg);
            }
            Ok(ServerUrl::Unix(PathBuf::from(path)))
        } else {
            Err(ReturnCode::InvalidArg)
        }
    }
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerUrl::Tcp(addr) => write!(f, "tcp://{addr}"),
            ServerUrl::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A connected stream to the server, TCP or Unix.
#[derive(Debug)]
pub enum Channel {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Channel {
    pub fn connect(url: &ServerUrl) -> QvResult<Self> {
        match url {
            ServerUrl::Tcp(addr) => {
                let stream = TcpStream::connect(addr).map_err(|e| {
                    log::error!("cannot connect to {url}: {e}");
                    ReturnCode::Msg
                })?;
                stream.set_nodelay(true).map_err(|_| ReturnCode::Msg)?;
                Ok(Channel::Tcp(stream))
            }
            ServerUrl::Unix(path) => UnixStream::connect(path)
                .map(Channel::Unix)
                .map_err(|e| {
                    log::error!("cannot connect to {url}: {e}");
                    ReturnCode::Msg
                }),
        }
    }

    /// Per-call receive timeout; `None` blocks indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> QvResult<()> {
        match self {
            Channel::Tcp(s) => s.set_read_timeout(timeout),
            Channel::Unix(s) => s.set_read_timeout(timeout),
        }
        .map_err(|_| ReturnCode::Msg)
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Channel::Tcp(s) => s.read(buf),
            Channel::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Channel::Tcp(s) => s.write(buf),
            Channel::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Channel::Tcp(s) => s.flush(),
            Channel::Unix(s) => s.flush(),
        }
    }
}

/// Encodes and sends one message.
pub fn send_msg<W: Write>(
    writer: &mut W,
    funid: Funid,
    picture: &str,
    args: &[RmiArg<'_>],
) -> QvResult<()> {
    let mut payload = Bbuff::new();
    sprintf(&mut payload, picture, args);
    let header = MsgHeader {
        funid,
        argv: argv_pack(picture),
        payload_len: payload.len() as u32,
    };
    writer
        .write_all(&header.encode())
        .and_then(|_| writer.write_all(payload.data()))
        .and_then(|_| writer.flush())
        .map_err(|e| {
            log::error!("message send failed: {e}");
            ReturnCode::Msg
        })
}

/// Receives one complete message. Short reads discard the frame.
pub fn recv_msg<R: Read>(reader: &mut R) -> QvResult<(MsgHeader, Vec<u8>)> {
    let mut raw = [0u8; HDR_SIZE];
    reader.read_exact(&mut raw).map_err(|_| ReturnCode::Msg)?;
    let header = MsgHeader::decode(&raw)?;
    let mut payload = vec![0u8; header.payload_len as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|_| ReturnCode::Msg)?;
    Ok((header, payload))
}
