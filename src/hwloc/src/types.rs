use qv_rc::{QvResult, ReturnCode};

/// Hardware object types understood by topology queries.
///
/// `Gpu` is the only device type exposed here; everything else is a
/// CPU-side container. The ordering of CPU-side variants matches their
/// depth in a loaded topology, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjType {
    Machine,
    Package,
    NumaNode,
    L3Cache,
    L2Cache,
    L1Cache,
    Core,
    Pu,
    Gpu,
}

impl ObjType {
    pub const fn as_u32(self) -> u32 {
        match self {
            ObjType::Machine => 0,
            ObjType::Package => 1,
            ObjType::NumaNode => 2,
            ObjType::L3Cache => 3,
            ObjType::L2Cache => 4,
            ObjType::L1Cache => 5,
            ObjType::Core => 6,
            ObjType::Pu => 7,
            ObjType::Gpu => 8,
        }
    }

    pub fn from_u32(value: u32) -> QvResult<Self> {
        Ok(match value {
            0 => ObjType::Machine,
            1 => ObjType::Package,
            2 => ObjType::NumaNode,
            3 => ObjType::L3Cache,
            4 => ObjType::L2Cache,
            5 => ObjType::L1Cache,
            6 => ObjType::Core,
            7 => ObjType::Pu,
            8 => ObjType::Gpu,
            _ => return Err(ReturnCode::InvalidArg),
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            ObjType::Machine => "Machine",
            ObjType::Package => "Package",
            ObjType::NumaNode => "NUMANode",
            ObjType::L3Cache => "L3Cache",
            ObjType::L2Cache => "L2Cache",
            ObjType::L1Cache => "L1Cache",
            ObjType::Core => "Core",
            ObjType::Pu => "PU",
            ObjType::Gpu => "GPU",
        }
    }

    pub fn from_name(name: &str) -> QvResult<Self> {
        Ok(match name {
            "Machine" => ObjType::Machine,
            "Package" => ObjType::Package,
            "NUMANode" => ObjType::NumaNode,
            "L3Cache" => ObjType::L3Cache,
            "L2Cache" => ObjType::L2Cache,
            "L1Cache" => ObjType::L1Cache,
            "Core" => ObjType::Core,
            "PU" => ObjType::Pu,
            "GPU" => ObjType::Gpu,
            _ => return Err(ReturnCode::InvalidArg),
        })
    }

    /// True for types that live in hardware pools as device records rather
    /// than in the CPU object tree.
    pub const fn is_device(self) -> bool {
        matches!(self, ObjType::Gpu)
    }
}

/// Device classes carried by hardware pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceType {
    Gpu,
    /// Sentinel for devices hidden from the caller.
    Invisible,
}

impl DeviceType {
    pub const fn as_u32(self) -> u32 {
        match self {
            DeviceType::Gpu => 0,
            DeviceType::Invisible => u32::MAX,
        }
    }

    pub fn from_u32(value: u32) -> QvResult<Self> {
        Ok(match value {
            0 => DeviceType::Gpu,
            u32::MAX => DeviceType::Invisible,
            _ => return Err(ReturnCode::InvalidArg),
        })
    }
}

/// Device types that splits redistribute, in redistribution order.
pub const fn supported_device_types() -> &'static [DeviceType] {
    &[DeviceType::Gpu]
}

/// Identifier format accepted by device-id queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceIdType {
    Uuid,
    PciBusId,
    Ordinal,
}

/// Rendering selected by `bind_string`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStringFormat {
    /// Hex mask chunks, e.g. `0xf0`.
    Mask,
    /// Range list, e.g. `4-7`.
    List,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obj_type_codes_round_trip() {
        for v in 0..=8 {
            let t = ObjType::from_u32(v).unwrap();
            assert_eq!(t.as_u32(), v);
            assert_eq!(ObjType::from_name(t.name()).unwrap(), t);
        }
        assert!(ObjType::from_u32(42).is_err());
        assert!(ObjType::from_name("Widget").is_err());
    }

    #[test]
    fn only_gpu_is_a_device() {
        assert!(ObjType::Gpu.is_device());
        assert!(!ObjType::Core.is_device());
        assert_eq!(supported_device_types(), &[DeviceType::Gpu]);
    }
}
