//! Task identity carried by a context.

/// The caller's identity: OS pid, a global id within the launch (world
/// rank for multi-process groups, team rank for thread groups), and a
/// node-local id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pid: i32,
    gid: i64,
    lid: i32,
}

impl Task {
    pub fn new(pid: i32, gid: i64, lid: i32) -> Self {
        Task { pid, gid, lid }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn gid(&self) -> i64 {
        self.gid
    }

    pub fn lid(&self) -> i32 {
        self.lid
    }
}
