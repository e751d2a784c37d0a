//! The in-memory topology model.
//!
//! A [`Topology`] is a list of levels ordered outermost-first (machine,
//! packages, NUMA nodes, caches, cores, PUs). The daemon loads it from the
//! live system; clients import the XML snapshot the daemon exports.

use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use qv_rc::{QvResult, ReturnCode};
use serde::{Deserialize, Serialize};

use crate::bitmap::Cpuset;
use crate::sysfs;
use crate::types::ObjType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopoObject {
    pub obj_type: ObjType,
    pub os_index: u32,
    pub cpuset: Cpuset,
}

#[derive(Debug, Clone)]
struct Level {
    obj_type: ObjType,
    objects: Vec<TopoObject>,
}

#[derive(Debug, Clone)]
pub struct Topology {
    levels: Vec<Level>,
}

impl Topology {
    /// Loads the topology of the running system from sysfs.
    pub fn load() -> QvResult<Self> {
        Self::load_from(Path::new("/sys"))
    }

    /// Loads a topology from an alternate sysfs root.
    pub fn load_from(sysroot: &Path) -> QvResult<Self> {
        let objects = sysfs::discover(sysroot)?;
        Self::from_objects(objects)
    }

    /// Builds a topology from a flat object list. A machine-level object is
    /// synthesized from the union of all PUs when absent.
    pub fn from_objects(mut objects: Vec<TopoObject>) -> QvResult<Self> {
        if objects.iter().all(|o| o.obj_type != ObjType::Machine) {
            let mut machine = Cpuset::new();
            let mut any_pu = false;
            for obj in objects.iter().filter(|o| o.obj_type == ObjType::Pu) {
                machine.union_with(&obj.cpuset);
                any_pu = true;
            }
            if !any_pu {
                for obj in &objects {
                    machine.union_with(&obj.cpuset);
                }
            }
            objects.push(TopoObject {
                obj_type: ObjType::Machine,
                os_index: 0,
                cpuset: machine,
            });
        }

        let mut levels: Vec<Level> = Vec::new();
        for obj in objects {
            if obj.obj_type.is_device() {
                return Err(ReturnCode::InvalidArg);
            }
            match levels.iter_mut().find(|l| l.obj_type == obj.obj_type) {
                Some(level) => level.objects.push(obj),
                None => levels.push(Level {
                    obj_type: obj.obj_type,
                    objects: vec![obj],
                }),
            }
        }
        levels.sort_by_key(|l| l.obj_type);
        for level in &mut levels {
            level
                .objects
                .sort_by_key(|o| (o.cpuset.first().unwrap_or(u32::MAX), o.os_index));
        }

        let topo = Topology { levels };
        if topo.levels.first().map(|l| l.obj_type) != Some(ObjType::Machine) {
            return Err(ReturnCode::Hwloc);
        }
        Ok(topo)
    }

    /// A regular test-friendly topology: `npackages` packages, each its own
    /// NUMA node, with `cores_per_package` cores of `pus_per_core` PUs.
    pub fn synthetic(npackages: u32, cores_per_package: u32, pus_per_core: u32) -> Self {
        let mut objects = Vec::new();
        let pus_per_package = cores_per_package * pus_per_core;
        for pkg in 0..npackages {
            let first = pkg * pus_per_package;
            let pkg_set = Cpuset::from_range(first, first + pus_per_package - 1);
            objects.push(TopoObject {
                obj_type: ObjType::Package,
                os_index: pkg,
                cpuset: pkg_set.clone(),
            });
            objects.push(TopoObject {
                obj_type: ObjType::NumaNode,
                os_index: pkg,
                cpuset: pkg_set,
            });
            for core in 0..cores_per_package {
                let cfirst = first + core * pus_per_core;
                objects.push(TopoObject {
                    obj_type: ObjType::Core,
                    os_index: pkg * cores_per_package + core,
                    cpuset: Cpuset::from_range(cfirst, cfirst + pus_per_core - 1),
                });
                for pu in 0..pus_per_core {
                    objects.push(TopoObject {
                        obj_type: ObjType::Pu,
                        os_index: cfirst + pu,
                        cpuset: Cpuset::from_ids([cfirst + pu]),
                    });
                }
            }
        }
        // Regular shapes cannot fail validation.
        Self::from_objects(objects).expect("synthetic topology is well formed")
    }

    pub fn machine_cpuset(&self) -> &Cpuset {
        &self.levels[0].objects[0].cpuset
    }

    pub fn ndepths(&self) -> usize {
        self.levels.len()
    }

    /// Depth of a CPU-side object type in this topology.
    pub fn obj_type_depth(&self, obj_type: ObjType) -> QvResult<usize> {
        if obj_type.is_device() {
            return Err(ReturnCode::InvalidArg);
        }
        self.levels
            .iter()
            .position(|l| l.obj_type == obj_type)
            .ok_or(ReturnCode::NotFound)
    }

    pub fn objects_at_depth(&self, depth: usize) -> QvResult<&[TopoObject]> {
        self.levels
            .get(depth)
            .map(|l| l.objects.as_slice())
            .ok_or(ReturnCode::InvalidArg)
    }

    pub fn nobjs_by_type(&self, obj_type: ObjType) -> QvResult<usize> {
        if obj_type.is_device() {
            return Err(ReturnCode::InvalidArg);
        }
        Ok(match self.obj_type_depth(obj_type) {
            Ok(depth) => self.levels[depth].objects.len(),
            Err(_) => 0,
        })
    }

    /// Counts objects of `obj_type` fully contained in `cpuset`.
    pub fn nobjs_by_type_in_cpuset(
        &self,
        obj_type: ObjType,
        cpuset: &Cpuset,
    ) -> QvResult<usize> {
        if obj_type.is_device() {
            return Err(ReturnCode::InvalidArg);
        }
        let depth = match self.obj_type_depth(obj_type) {
            Ok(depth) => depth,
            Err(_) => return Ok(0),
        };
        Ok(self.contained_at_depth(depth, cpuset).count())
    }

    /// The `index`-th object at `depth` whose cpuset is contained in
    /// `cpuset`, in lexicographic order.
    pub fn obj_in_cpuset_by_depth<'a>(
        &'a self,
        cpuset: &'a Cpuset,
        depth: usize,
        index: usize,
    ) -> QvResult<&'a TopoObject> {
        if depth >= self.levels.len() {
            return Err(ReturnCode::InvalidArg);
        }
        self.contained_at_depth(depth, cpuset)
            .nth(index)
            .ok_or(ReturnCode::NotFound)
    }

    /// Deterministic, balanced, lexicographic subdivision of `cpuset` into
    /// `ncolors` pieces; returns piece `color`.
    ///
    /// When the weight does not divide evenly, the lowest-numbered colors
    /// receive one extra id each. Colors beyond the weight receive the
    /// empty set.
    pub fn split_cpuset_by_color(
        &self,
        cpuset: &Cpuset,
        ncolors: usize,
        color: usize,
    ) -> QvResult<Cpuset> {
        if ncolors == 0 || color >= ncolors {
            return Err(ReturnCode::InvalidArg);
        }
        let ids: Vec<u32> = cpuset.iter().collect();
        let base = ids.len() / ncolors;
        let extra = ids.len() % ncolors;
        let chunk = base + usize::from(color < extra);
        let offset = color * base + color.min(extra);
        Ok(Cpuset::from_ids(
            ids[offset..(offset + chunk).min(ids.len())].iter().copied(),
        ))
    }

    /// The smallest cpuset within `within` backing exactly `nobjs` objects
    /// of `obj_type`, chosen lexicographically.
    pub fn cpuset_for_nobjs(
        &self,
        within: &Cpuset,
        obj_type: ObjType,
        nobjs: usize,
    ) -> QvResult<Cpuset> {
        if obj_type.is_device() || nobjs == 0 {
            return Err(ReturnCode::InvalidArg);
        }
        let depth = self.obj_type_depth(obj_type)?;
        let mut result = Cpuset::new();
        let mut taken = 0;
        for obj in self.contained_at_depth(depth, within) {
            result.union_with(&obj.cpuset);
            taken += 1;
            if taken == nobjs {
                return Ok(result);
            }
        }
        Err(ReturnCode::ResUnavailable)
    }

    fn contained_at_depth<'a>(
        &'a self,
        depth: usize,
        cpuset: &'a Cpuset,
    ) -> impl Iterator<Item = &'a TopoObject> {
        self.levels[depth]
            .objects
            .iter()
            .filter(move |o| !o.cpuset.is_empty() && o.cpuset.is_subset_of(cpuset))
    }

    // ---- XML snapshot ----

    pub fn to_xml_string(&self) -> QvResult<String> {
        let snapshot = TopologyXml {
            objects: self
                .levels
                .iter()
                .flat_map(|l| l.objects.iter())
                .map(|o| ObjectXml {
                    obj_type: o.obj_type.name().to_string(),
                    os_index: o.os_index,
                    cpuset: o.cpuset.clone(),
                })
                .collect(),
        };
        quick_xml::se::to_string(&snapshot).map_err(|_| ReturnCode::Internal)
    }

    pub fn from_xml_str(xml: &str) -> QvResult<Self> {
        let snapshot: TopologyXml =
            quick_xml::de::from_str(xml).map_err(|_| ReturnCode::Hwloc)?;
        let objects = snapshot
            .objects
            .into_iter()
            .map(|o| {
                Ok(TopoObject {
                    obj_type: ObjType::from_name(&o.obj_type)?,
                    os_index: o.os_index,
                    cpuset: o.cpuset,
                })
            })
            .collect::<QvResult<Vec<_>>>()?;
        Self::from_objects(objects)
    }

    pub fn from_xml_path(path: &Path) -> QvResult<Self> {
        let xml = fs::read_to_string(path).map_err(|e| {
            log::error!("cannot read topology snapshot {}: {}", path.display(), e);
            ReturnCode::FileIo
        })?;
        Self::from_xml_str(&xml)
    }

    /// Writes the topology under `dir` as
    /// `qv-hwtopo-<pid>-<nonce>.xml`, world readable so consumers outside
    /// our group can import it. Returns the path.
    pub fn export_xml(&self, dir: &Path) -> QvResult<PathBuf> {
        let xml = self.to_xml_string()?;
        let name = format!(
            "qv-hwtopo-{}-{}.xml",
            std::process::id(),
            fastrand::u32(..)
        );
        let path = dir.join(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&path)
            .map_err(|e| {
                log::error!("cannot export topology to {}: {}", path.display(), e);
                ReturnCode::FileIo
            })?;
        file.write_all(xml.as_bytes()).map_err(|e| {
            log::error!("short topology write to {}: {}", path.display(), e);
            ReturnCode::FileIo
        })?;
        Ok(path)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename = "topology")]
struct TopologyXml {
    #[serde(rename = "object", default)]
    objects: Vec<ObjectXml>,
}

#[derive(Serialize, Deserialize)]
struct ObjectXml {
    #[serde(rename = "@type")]
    obj_type: String,
    #[serde(rename = "@os_index")]
    os_index: u32,
    // Cpusets serialize as their list form.
    #[serde(rename = "@cpuset")]
    cpuset: Cpuset,
}
