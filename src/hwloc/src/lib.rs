//! Node hardware model: cpuset algebra, topology, devices, and the
//! hardware pools that carve a node into disjoint resource slices.
//!
//! The daemon loads a [`Topology`] from the live system and exports an XML
//! snapshot; clients import the snapshot so that every participant reasons
//! about identical object numbering.

pub mod affinity;
mod bitmap;
mod device;
mod hwpool;
mod sysfs;
mod topology;
mod types;

pub use bitmap::Cpuset;
pub use device::{discover_devices, synthesize_uuid, DeviceInfo};
pub use hwpool::Hwpool;
pub use topology::{TopoObject, Topology};
pub use types::{
    supported_device_types, BindStringFormat, DeviceIdType, DeviceType, ObjType,
};
