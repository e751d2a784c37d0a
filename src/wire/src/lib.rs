//! The RMI wire layer: byte buffers, the typed picture codec, fixed-size
//! message headers, and the stream transport they ride on.

mod bbuff;
mod codec;
mod message;
mod transport;

pub use bbuff::Bbuff;
pub use codec::{sprintf, sscanf, RmiArg, RmiVal};
pub use message::{
    argv_pack, argv_unpack, pictures, Funid, IntrinsicScope, MsgHeader, HDR_SIZE,
    MAX_PAYLOAD,
};
pub use transport::{recv_msg, send_msg, Channel, ServerUrl};
