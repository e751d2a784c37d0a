//! The singleton group: one task, immediate collectives.

use qv_rc::{QvResult, ReturnCode};
use qv_wire::Bbuff;

use super::Group;

#[derive(Debug, Clone)]
pub struct ProcessGroup {
    task_id: i64,
}

impl ProcessGroup {
    /// A group containing only the calling process.
    pub fn new() -> Self {
        ProcessGroup {
            task_id: nix::unistd::getpid().as_raw() as i64,
        }
    }

    /// A singleton for an explicit task id; used by `self_group` of other
    /// group kinds.
    pub fn for_task(task_id: i64) -> Self {
        ProcessGroup { task_id }
    }
}

impl Default for ProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Group for ProcessGroup {
    fn id(&self) -> i32 {
        0
    }

    fn size(&self) -> i32 {
        1
    }

    fn task_id(&self) -> i64 {
        self.task_id
    }

    fn barrier(&self) -> QvResult<()> {
        Ok(())
    }

    fn gather(&self, tx: &Bbuff, root: i32) -> QvResult<Option<Vec<Bbuff>>> {
        if root != 0 {
            return Err(ReturnCode::InvalidArg);
        }
        Ok(Some(vec![tx.clone()]))
    }

    fn scatter(&self, tx: Option<&[Bbuff]>, root: i32) -> QvResult<Bbuff> {
        if root != 0 {
            return Err(ReturnCode::InvalidArg);
        }
        let bufs = tx.ok_or(ReturnCode::InvalidArg)?;
        bufs.first().cloned().ok_or(ReturnCode::InvalidArg)
    }

    fn split(&self, _color: i32, _key: i32) -> QvResult<Box<dyn Group>> {
        Ok(Box::new(self.clone()))
    }

    fn self_group(&self) -> QvResult<Box<dyn Group>> {
        Ok(Box::new(self.clone()))
    }

    fn dup(&self) -> QvResult<Box<dyn Group>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collectives_are_immediate() {
        let group = ProcessGroup::new();
        assert_eq!(group.id(), 0);
        assert_eq!(group.size(), 1);
        group.barrier().unwrap();

        let mut tx = Bbuff::new();
        tx.append(b"payload");
        let gathered = group.gather(&tx, 0).unwrap().unwrap();
        assert_eq!(gathered.len(), 1);
        assert_eq!(gathered[0], tx);

        let rx = group.scatter(Some(&gathered), 0).unwrap();
        assert_eq!(rx, tx);

        assert!(group.gather(&tx, 1).is_err());
    }
}
