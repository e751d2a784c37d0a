//! The per-task bind stack.
//!
//! The stack holds owned cpuset snapshots, never references into live
//! scopes: a pushed scope may be freed while its binding is still on the
//! stack.

use std::cell::RefCell;
use std::rc::Rc;

use qv_hwloc::{BindStringFormat, Cpuset};
use qv_rc::{QvResult, ReturnCode};

use crate::rmi::RmiClient;

#[derive(Default)]
pub(crate) struct BindStack {
    stack: Vec<Cpuset>,
}

impl BindStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebinds the task to `cpuset` and remembers the previous binding.
    pub fn push(
        &mut self,
        rmi: &Rc<RefCell<RmiClient>>,
        task_id: i64,
        cpuset: &Cpuset,
    ) -> QvResult<()> {
        let mut client = rmi.borrow_mut();
        let previous = client.task_get_cpubind(task_id)?;
        client.task_set_cpubind(task_id, cpuset)?;
        self.stack.push(previous);
        Ok(())
    }

    /// Restores the binding saved by the matching push.
    pub fn pop(
        &mut self,
        rmi: &Rc<RefCell<RmiClient>>,
        task_id: i64,
    ) -> QvResult<()> {
        let previous = self.stack.pop().ok_or(ReturnCode::Pop)?;
        match rmi.borrow_mut().task_set_cpubind(task_id, &previous) {
            Ok(()) => Ok(()),
            Err(rc) => {
                // The binding was not changed, so the snapshot stays.
                self.stack.push(previous);
                Err(rc)
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

/// Renders the task's current binding.
pub(crate) fn bind_string(
    rmi: &Rc<RefCell<RmiClient>>,
    task_id: i64,
    format: BindStringFormat,
) -> QvResult<String> {
    let current = rmi.borrow_mut().task_get_cpubind(task_id)?;
    Ok(match format {
        BindStringFormat::Mask => current.to_mask_string(),
        BindStringFormat::List => current.to_list_string(),
    })
}
