//! Scopes: the user-facing pairing of a group and a hardware pool.

use std::cell::RefCell;
use std::rc::Rc;

use qv_hwloc::{Cpuset, DeviceIdType, DeviceType, Hwpool, ObjType};
use qv_rc::{QvResult, ReturnCode};

use crate::group::Group;
use crate::hwsplit;
use crate::rmi::RmiClient;

/// Opaque hints accepted by [`Scope::create`]; reserved for future
/// admission and isolation policies.
pub type ScopeCreateHints = u32;

pub struct Scope {
    group: Box<dyn Group>,
    hwpool: Hwpool,
    rmi: Rc<RefCell<RmiClient>>,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("hwpool", &self.hwpool)
            .finish_non_exhaustive()
    }
}

impl Scope {
    pub(crate) fn new(
        group: Box<dyn Group>,
        hwpool: Hwpool,
        rmi: Rc<RefCell<RmiClient>>,
    ) -> Self {
        Scope { group, hwpool, rmi }
    }

    /// Splits this scope into `npieces` children. All group members must
    /// call this; it suspends at the underlying gather and scatter.
    ///
    /// `color` either names the child the caller wants (same color, same
    /// child) or is [`SCOPE_SPLIT_AFFINITY_PRESERVING`]
    /// (crate::SCOPE_SPLIT_AFFINITY_PRESERVING) to let the engine place
    /// tasks by their current bindings.
    pub fn split(&self, npieces: i32, color: i32) -> QvResult<Scope> {
        let (colorp, hwpool) = hwsplit::split_hardware_resources(
            self.group.as_ref(),
            &self.rmi,
            &self.hwpool,
            npieces,
            color,
        )?;
        // Group membership follows the possibly recolored plan.
        let group = self.group.split(colorp, self.group.id())?;
        Ok(Scope::new(group, hwpool, Rc::clone(&self.rmi)))
    }

    /// Splits into one child per object of `obj_type` in this scope.
    pub fn split_at(&self, obj_type: ObjType, group_id: i32) -> QvResult<Scope> {
        let npieces = self.nobjs(obj_type)?;
        self.split(npieces, group_id)
    }

    /// Carves a singleton child scope backed by exactly `nobjs` objects of
    /// `obj_type` from this scope's resources.
    pub fn create(
        &self,
        obj_type: ObjType,
        nobjs: i32,
        hints: ScopeCreateHints,
    ) -> QvResult<Scope> {
        // Hints are carried but not yet interpreted.
        let _ = hints;
        let cpuset = self.rmi.borrow_mut().get_cpuset_for_nobjs(
            self.hwpool.cpuset(),
            obj_type,
            nobjs,
        )?;
        let group = self.group.self_group()?;
        let hwpool = Hwpool::with_cpuset(&cpuset);
        Ok(Scope::new(group, hwpool, Rc::clone(&self.rmi)))
    }

    /// Number of objects of `obj_type` in this scope. Devices are counted
    /// from the local pool; CPU-side objects are counted by the daemon.
    pub fn nobjs(&self, obj_type: ObjType) -> QvResult<i32> {
        if obj_type == ObjType::Gpu {
            return Ok(self.hwpool.ndevices_of(DeviceType::Gpu) as i32);
        }
        self.rmi
            .borrow_mut()
            .get_nobjs_in_cpuset(obj_type, self.hwpool.cpuset())
    }

    /// The caller's rank within this scope's group.
    pub fn taskid(&self) -> i32 {
        self.group.id()
    }

    pub fn ntasks(&self) -> i32 {
        self.group.size()
    }

    pub fn barrier(&self) -> QvResult<()> {
        self.group.barrier()
    }

    /// Identifier of the `index`-th device of `obj_type` in this scope.
    pub fn device_id(
        &self,
        obj_type: ObjType,
        index: usize,
        id_type: DeviceIdType,
    ) -> QvResult<String> {
        let devtype = match obj_type {
            ObjType::Gpu => DeviceType::Gpu,
            _ => return Err(ReturnCode::InvalidArg),
        };
        let dev = self
            .hwpool
            .devices_of(devtype)
            .nth(index)
            .ok_or(ReturnCode::NotFound)?;
        Ok(match id_type {
            DeviceIdType::Uuid => dev.uuid.clone(),
            DeviceIdType::PciBusId => dev.pci_bus_id.clone(),
            DeviceIdType::Ordinal => dev.id.to_string(),
        })
    }

    pub fn cpuset(&self) -> &Cpuset {
        self.hwpool.cpuset()
    }

    /// Collective release: all participants must call it. The resources
    /// drop afterwards; dropping a scope without calling this is legal
    /// for singleton groups only.
    pub fn free(self) -> QvResult<()> {
        self.group.barrier()
    }
}
