//! Contexts: the per-task entry point of the library.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use qv_hwloc::BindStringFormat;
use qv_rc::QvResult;
use qv_wire::IntrinsicScope;

use crate::bind::{bind_string, BindStack};
use crate::group::process::ProcessGroup;
use crate::group::thread::ThreadTeam;
use crate::group::Group;
use crate::rmi::{RmiClient, DEFAULT_URL};
use crate::scope::Scope;
use crate::task::Task;

/// Selects the group transport backing a context.
pub enum GroupBinding {
    /// A single OS process; collectives are immediate.
    Process,
    /// Member `rank` of an in-process thread team. Create the context on
    /// the member's own thread.
    Thread { team: Arc<ThreadTeam>, rank: usize },
}

pub struct Context {
    rmi: Rc<RefCell<RmiClient>>,
    zgroup: Box<dyn Group>,
    task: Task,
    bind_stack: BindStack,
}

impl Context {
    /// Connects to the node daemon at the default URL (`QV_PORT` selects
    /// the port) and initializes the group transport.
    pub fn create(binding: GroupBinding) -> QvResult<Self> {
        Self::create_with_url(binding, &DEFAULT_URL)
    }

    pub fn create_with_url(binding: GroupBinding, url: &str) -> QvResult<Self> {
        Self::create_with_timeout(binding, url, None)
    }

    pub fn create_with_timeout(
        binding: GroupBinding,
        url: &str,
        timeout: Option<Duration>,
    ) -> QvResult<Self> {
        let client = RmiClient::connect_with_timeout(url, timeout)?;
        let pid = nix::unistd::getpid().as_raw();
        let (zgroup, task): (Box<dyn Group>, Task) = match binding {
            GroupBinding::Process => (Box::new(ProcessGroup::new()), Task::new(pid, 0, 0)),
            GroupBinding::Thread { team, rank } => (
                Box::new(team.group(rank)?),
                Task::new(pid, rank as i64, rank as i32),
            ),
        };
        Ok(Context {
            rmi: Rc::new(RefCell::new(client)),
            zgroup,
            task,
            bind_stack: BindStack::new(),
        })
    }

    /// Synchronizes every task sharing this context's group.
    pub fn barrier(&self) -> QvResult<()> {
        self.zgroup.barrier()
    }

    /// Retrieves an intrinsic scope from the daemon.
    pub fn scope_get(&self, intrinsic: IntrinsicScope) -> QvResult<Scope> {
        let group = match intrinsic {
            IntrinsicScope::Process => self.zgroup.self_group()?,
            _ => self.zgroup.dup()?,
        };
        let hwpool = self
            .rmi
            .borrow_mut()
            .scope_get_intrinsic_hwpool(group.task_id(), intrinsic)?;
        Ok(Scope::new(group, hwpool, Rc::clone(&self.rmi)))
    }

    /// Rebinds the calling task to the scope's cpuset; the previous
    /// binding is restored by [`bind_pop`](Self::bind_pop).
    pub fn bind_push(&mut self, scope: &Scope) -> QvResult<()> {
        let cpuset = scope.cpuset().clone();
        self.bind_stack
            .push(&self.rmi, self.zgroup.task_id(), &cpuset)
    }

    pub fn bind_pop(&mut self) -> QvResult<()> {
        self.bind_stack.pop(&self.rmi, self.zgroup.task_id())
    }

    /// Renders the calling task's current binding.
    pub fn bind_string(&self, format: BindStringFormat) -> QvResult<String> {
        bind_string(&self.rmi, self.zgroup.task_id(), format)
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn bind_depth(&self) -> usize {
        self.bind_stack.depth()
    }
}
