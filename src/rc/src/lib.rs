//! Return codes shared by every quo-vadis crate.
//!
//! The set is closed: codes travel over the wire as plain `u32`s, so the
//! numeric values are part of the protocol and must not be reordered.

use thiserror::Error;

/// Result alias used across the workspace. The error side is always a
/// non-success [`ReturnCode`].
pub type QvResult<T> = Result<T, ReturnCode>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum ReturnCode {
    #[error("success")]
    Success = 0,
    #[error("success, operation already complete")]
    AlreadyDone = 1,
    #[error("success, shutdown in progress")]
    Shutdown = 2,
    #[error("unspecified error")]
    Err = 3,
    #[error("environment error")]
    Env = 4,
    #[error("internal error")]
    Internal = 5,
    #[error("file I/O error")]
    FileIo = 6,
    #[error("system error")]
    Sys = 7,
    #[error("out of resources")]
    OutOfResources = 8,
    #[error("invalid argument")]
    InvalidArg = 9,
    #[error("call before initialization")]
    CallBeforeInit = 10,
    #[error("hardware topology error")]
    Hwloc = 11,
    #[error("group transport error")]
    Mpi = 12,
    #[error("wire message error")]
    Msg = 13,
    #[error("remote dispatch error")]
    Rpc = 14,
    #[error("operation not supported")]
    NotSupported = 15,
    #[error("bind stack underflow")]
    Pop = 16,
    #[error("process management error")]
    Pmi = 17,
    #[error("not found")]
    NotFound = 18,
    #[error("split error")]
    Split = 19,
    #[error("resources unavailable")]
    ResUnavailable = 20,
}

impl ReturnCode {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Inverse of [`as_u32`]. Unknown values collapse to `Err` so that a
    /// peer speaking a newer revision cannot crash us.
    pub fn from_u32(value: u32) -> Self {
        use ReturnCode::*;
        match value {
            0 => Success,
            1 => AlreadyDone,
            2 => Shutdown,
            3 => Err,
            4 => Env,
            5 => Internal,
            6 => FileIo,
            7 => Sys,
            8 => OutOfResources,
            9 => InvalidArg,
            10 => CallBeforeInit,
            11 => Hwloc,
            12 => Mpi,
            13 => Msg,
            14 => Rpc,
            15 => NotSupported,
            16 => Pop,
            17 => Pmi,
            18 => NotFound,
            19 => Split,
            20 => ResUnavailable,
            _ => Err,
        }
    }

    pub const fn is_success(self) -> bool {
        matches!(
            self,
            ReturnCode::Success | ReturnCode::AlreadyDone | ReturnCode::Shutdown
        )
    }

    /// Converts a wire code into a `Result`, mapping every success code to
    /// `Ok`.
    pub fn into_result(self) -> QvResult<ReturnCode> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self)
        }
    }
}

/// Human-readable description of a return code.
pub fn strerr(rc: ReturnCode) -> String {
    rc.to_string()
}

/// Library version as a `(major, minor, patch)` triple.
pub fn version() -> (u32, u32, u32) {
    let parse = |s: &str| s.parse().unwrap_or(0);
    (
        parse(env!("CARGO_PKG_VERSION_MAJOR")),
        parse(env!("CARGO_PKG_VERSION_MINOR")),
        parse(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        for v in 0..=20u32 {
            let rc = ReturnCode::from_u32(v);
            assert_eq!(rc.as_u32(), v);
        }
        assert_eq!(ReturnCode::from_u32(9999), ReturnCode::Err);
    }

    #[test]
    fn success_partition() {
        assert!(ReturnCode::Success.is_success());
        assert!(ReturnCode::AlreadyDone.is_success());
        assert!(ReturnCode::Shutdown.is_success());
        assert!(!ReturnCode::Split.is_success());
        assert!(ReturnCode::Success.into_result().is_ok());
        assert_eq!(
            ReturnCode::Pop.into_result(),
            Err(ReturnCode::Pop)
        );
    }

    #[test]
    fn version_triple() {
        let (major, _, _) = version();
        assert_eq!(major, 0);
    }
}
