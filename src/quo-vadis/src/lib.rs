//! quo-vadis: node-local partitioning and binding of hardware resources
//! for parallel applications.
//!
//! Applications hold [`Scope`]s, handles pairing a task group with an
//! owned slice of the node (a cpuset plus devices). Scopes come from the
//! node daemon as intrinsic scopes and are refined by splitting: a
//! user-defined split honors caller-chosen colors, while the
//! affinity-preserving split places each task by the CPU binding it
//! already has. A per-task bind stack turns scopes into CPU-affinity
//! contexts that can be pushed and popped.

mod bind;
mod context;
mod group;
mod hwsplit;
mod rmi;
mod scope;
mod task;

pub use context::{Context, GroupBinding};
pub use group::process::ProcessGroup;
pub use group::thread::{ThreadGroup, ThreadTeam};
pub use group::{next_group_id, Group, GROUP_ID_NODE, GROUP_ID_SELF, GROUP_ID_WORLD};
pub use hwsplit::SCOPE_SPLIT_AFFINITY_PRESERVING;
pub use rmi::{RmiClient, DEFAULT_PORT, DEFAULT_URL};
pub use scope::{Scope, ScopeCreateHints};
pub use task::Task;

pub use qv_hwloc::{
    BindStringFormat, Cpuset, DeviceIdType, DeviceType, Hwpool, ObjType,
};
pub use qv_rc::{strerr, version, QvResult, ReturnCode};
pub use qv_wire::IntrinsicScope;
