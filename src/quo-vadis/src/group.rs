//! The task-group abstraction consumed by scopes.
//!
//! A group is a set of cooperating tasks with rank-ordered collectives.
//! The process and thread implementations live here; an MPI-backed
//! implementation is expected to come from a glue layer that implements
//! the same trait over communicators.

use std::sync::atomic::{AtomicU64, Ordering};

use qv_rc::{QvResult, ReturnCode};
use qv_wire::Bbuff;

pub mod process;
pub mod thread;

/// Reserved group-table ids.
pub const GROUP_ID_SELF: u64 = 0;
pub const GROUP_ID_NODE: u64 = 1;
pub const GROUP_ID_WORLD: u64 = 2;
const GROUP_ID_FIRST_DYNAMIC: u64 = 3;

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(GROUP_ID_FIRST_DYNAMIC);

/// Allocates a fresh, process-global group-table id. Ids are never
/// recycled within a process.
pub fn next_group_id() -> QvResult<u64> {
    let id = NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed);
    if id == u64::MAX {
        log::error!("group id space exhausted");
        return Err(ReturnCode::OutOfResources);
    }
    Ok(id)
}

pub trait Group {
    /// Rank of the caller, in `[0, size())`.
    fn id(&self) -> i32;

    fn size(&self) -> i32;

    /// Opaque 64-bit task identifier (an OS pid or tid).
    fn task_id(&self) -> i64;

    fn barrier(&self) -> QvResult<()>;

    /// Rank-ordered gather. The root receives one buffer per rank; other
    /// ranks receive `None`.
    fn gather(&self, tx: &Bbuff, root: i32) -> QvResult<Option<Vec<Bbuff>>>;

    /// Rank-ordered scatter. Only the root supplies buffers, one per rank.
    fn scatter(&self, tx: Option<&[Bbuff]>, root: i32) -> QvResult<Bbuff>;

    /// Partitions the group: peers passing the same `color` land in the
    /// same child, ranked by `(key, parent rank)` ascending.
    fn split(&self, color: i32, key: i32) -> QvResult<Box<dyn Group>>;

    /// The singleton group containing only the caller.
    fn self_group(&self) -> QvResult<Box<dyn Group>>;

    /// A second handle to this group.
    fn dup(&self) -> QvResult<Box<dyn Group>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_ids_are_strictly_increasing() {
        let a = next_group_id().unwrap();
        let b = next_group_id().unwrap();
        let c = next_group_id().unwrap();
        assert!(a >= GROUP_ID_FIRST_DYNAMIC);
        assert!(a < b && b < c);
    }
}
