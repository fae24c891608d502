// Memory-type chooser
//
// Picks a backend memory type for a resource from the memory types the
// device exposes. Device-local memory is a hard requirement; host-visible
// classes are probed in order of preference.

use bitflags::bitflags;

use crate::desc::{CpuAccess, Usage};
use crate::error::{EngineError, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryProperties: u32 {
        const DEVICE_LOCAL  = 1 << 0;
        const HOST_VISIBLE  = 1 << 1;
        const HOST_COHERENT = 1 << 2;
        const HOST_CACHED   = 1 << 3;
    }
}

/// Where the storage of a resource lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// GPU-only storage
    DeviceLocal,
    /// CPU writes, GPU reads
    Upload,
    /// GPU writes, CPU reads
    Readback,
}

impl MemoryClass {
    /// Memory class for the resident storage of a resource
    pub fn for_usage(usage: Usage, cpu_access: CpuAccess) -> Self {
        match usage {
            Usage::Staging | Usage::CpuAccessible if cpu_access == CpuAccess::READ => {
                MemoryClass::Readback
            }
            Usage::Staging | Usage::CpuAccessible => MemoryClass::Upload,
            Usage::Default | Usage::Immutable | Usage::Dynamic => MemoryClass::DeviceLocal,
        }
    }

    /// Acceptable property sets, most preferred first
    fn candidates(self) -> &'static [MemoryProperties] {
        const DEVICE_LOCAL: &[MemoryProperties] = &[MemoryProperties::DEVICE_LOCAL];
        const UPLOAD: &[MemoryProperties] = &[
            MemoryProperties::HOST_VISIBLE.union(MemoryProperties::HOST_COHERENT),
            MemoryProperties::HOST_VISIBLE,
        ];
        const READBACK: &[MemoryProperties] = &[
            MemoryProperties::HOST_VISIBLE
                .union(MemoryProperties::HOST_COHERENT)
                .union(MemoryProperties::HOST_CACHED),
            MemoryProperties::HOST_VISIBLE.union(MemoryProperties::HOST_COHERENT),
            MemoryProperties::HOST_VISIBLE,
        ];
        match self {
            MemoryClass::DeviceLocal => DEVICE_LOCAL,
            MemoryClass::Upload => UPLOAD,
            MemoryClass::Readback => READBACK,
        }
    }

    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryClass::DeviceLocal)
    }
}

/// Memory types exposed by a device, indexed like the native API indexes them
#[derive(Debug, Clone)]
pub struct MemoryTypeChooser {
    types: Vec<MemoryProperties>,
}

impl MemoryTypeChooser {
    pub fn new(types: Vec<MemoryProperties>) -> Self {
        Self { types }
    }

    pub fn memory_types(&self) -> &[MemoryProperties] {
        &self.types
    }

    /// Find a memory type allowed by `type_bits` that satisfies `class`.
    pub fn choose(&self, type_bits: u32, class: MemoryClass) -> Result<u32> {
        for required in class.candidates() {
            if let Some(index) = self.find(type_bits, *required) {
                return Ok(index);
            }
        }

        if class == MemoryClass::DeviceLocal {
            // The native APIs guarantee at least one device-local type for
            // every resource; its absence means the device is unusable.
            return Err(EngineError::ResourceExhaustion(format!(
                "No device-local memory type among allowed types {:#b}",
                type_bits
            )));
        }
        Err(EngineError::ResourceExhaustion(format!(
            "Failed to find a suitable memory type for {:?} among allowed types {:#b}",
            class, type_bits
        )))
    }

    fn find(&self, type_bits: u32, properties: MemoryProperties) -> Option<u32> {
        self.types
            .iter()
            .enumerate()
            .take(32)
            .find(|(i, flags)| (type_bits & (1 << i)) != 0 && flags.contains(properties))
            .map(|(i, _)| i as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desktop() -> MemoryTypeChooser {
        MemoryTypeChooser::new(vec![
            MemoryProperties::DEVICE_LOCAL,
            MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            MemoryProperties::HOST_VISIBLE
                | MemoryProperties::HOST_COHERENT
                | MemoryProperties::HOST_CACHED,
        ])
    }

    #[test]
    fn classes_follow_usage() {
        assert_eq!(
            MemoryClass::for_usage(Usage::CpuAccessible, CpuAccess::READ),
            MemoryClass::Readback
        );
        assert_eq!(
            MemoryClass::for_usage(Usage::Staging, CpuAccess::WRITE),
            MemoryClass::Upload
        );
        assert_eq!(
            MemoryClass::for_usage(Usage::Dynamic, CpuAccess::WRITE),
            MemoryClass::DeviceLocal
        );
    }

    #[test]
    fn readback_prefers_cached_memory() {
        let chooser = desktop();
        assert_eq!(chooser.choose(u32::MAX, MemoryClass::Readback).unwrap(), 2);
        assert_eq!(chooser.choose(u32::MAX, MemoryClass::Upload).unwrap(), 1);
        assert_eq!(chooser.choose(u32::MAX, MemoryClass::DeviceLocal).unwrap(), 0);
    }

    #[test]
    fn readback_falls_back_to_uncached() {
        let chooser = desktop();
        assert_eq!(chooser.choose(0b011, MemoryClass::Readback).unwrap(), 1);
    }

    #[test]
    fn missing_memory_type_is_an_error() {
        let chooser = desktop();
        assert!(matches!(
            chooser.choose(0b001, MemoryClass::Upload),
            Err(EngineError::ResourceExhaustion(_))
        ));
        assert!(chooser.choose(0b110, MemoryClass::DeviceLocal).is_err());
    }
}
