// Map/Unmap state machine
//
// The single place where mapping rules live. Every backend goes through
// `plan_map` and the per-context slots before touching native memory.

use bitflags::bitflags;

use crate::desc::{CpuAccess, ResourceDesc, Usage};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapType {
    Read,
    Write,
    ReadWrite,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u32 {
        /// Previous contents may be thrown away
        const DISCARD = 1 << 0;
    }
}

/// State of one (resource, context) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapState {
    #[default]
    Unmapped,
    MappedRead { flags: MapFlags },
    MappedWrite { flags: MapFlags },
}

impl MapState {
    /// Flags given to the map call, empty when unmapped
    pub fn flags(self) -> MapFlags {
        match self {
            MapState::Unmapped => MapFlags::empty(),
            MapState::MappedRead { flags } | MapState::MappedWrite { flags } => flags,
        }
    }
}

/// What a legal map request turns into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapPath {
    /// Synchronous read of CPU-visible storage after a GPU idle
    Readback,
    /// Direct map of CPU-visible storage
    PersistentWrite,
    /// Fresh allocation from the context's dynamic heap
    DynamicDiscard,
}

impl MapPath {
    fn is_exclusive(self) -> bool {
        !matches!(self, MapPath::DynamicDiscard)
    }
}

/// Decide whether `map_type`/`flags` is legal for a resource and how it is
/// carried out. Nothing is mutated here.
pub fn plan_map(
    desc: &ResourceDesc,
    map_type: MapType,
    flags: MapFlags,
    deferred_context: bool,
) -> Result<MapPath> {
    let name = desc.name();
    let usage = desc.usage();
    let cpu_access = desc.cpu_access();

    match map_type {
        MapType::ReadWrite => Err(EngineError::Unsupported(format!(
            "Resource \"{}\": MapType::ReadWrite is not supported",
            name
        ))),
        MapType::Read => {
            if !usage.is_cpu_accessible() || cpu_access != CpuAccess::READ {
                return Err(EngineError::ProtocolViolation(format!(
                    "Resource \"{}\": only cpu-accessible resources created with CPU read access can be mapped for reading (usage {:?}, access {:?})",
                    name, usage, cpu_access
                )));
            }
            if deferred_context {
                return Err(EngineError::ProtocolViolation(format!(
                    "Resource \"{}\": mapping for reading is not allowed in a deferred context",
                    name
                )));
            }
            Ok(MapPath::Readback)
        }
        MapType::Write => match usage {
            Usage::Staging | Usage::CpuAccessible if cpu_access == CpuAccess::WRITE => {
                Ok(MapPath::PersistentWrite)
            }
            Usage::Dynamic => {
                if !flags.contains(MapFlags::DISCARD) {
                    return Err(EngineError::ProtocolViolation(format!(
                        "Resource \"{}\": dynamic resources must be mapped for writing with MapFlags::DISCARD",
                        name
                    )));
                }
                Ok(MapPath::DynamicDiscard)
            }
            _ => Err(EngineError::ProtocolViolation(format!(
                "Resource \"{}\": only dynamic and cpu-writable resources can be mapped for writing (usage {:?}, access {:?})",
                name, usage, cpu_access
            ))),
        },
    }
}

/// Map markers for one resource, one slot per context (immediate first)
#[derive(Debug, Clone)]
pub struct MapSlots {
    slots: Vec<MapState>,
}

impl MapSlots {
    pub fn new(num_contexts: usize) -> Self {
        Self {
            slots: vec![MapState::Unmapped; num_contexts],
        }
    }

    pub fn get(&self, context_id: usize) -> MapState {
        self.slots.get(context_id).copied().unwrap_or_default()
    }

    /// Mark the slot as mapped if the transition is legal.
    pub fn begin(
        &mut self,
        context_id: usize,
        map_type: MapType,
        flags: MapFlags,
        path: MapPath,
    ) -> Result<()> {
        let current = *self.slots.get(context_id).ok_or_else(|| {
            EngineError::ProtocolViolation(format!("Unknown context id {}", context_id))
        })?;
        if current != MapState::Unmapped {
            return Err(EngineError::ProtocolViolation(format!(
                "Resource is already mapped in context {} ({:?}); unmap it before mapping it as {:?}",
                context_id, current, map_type
            )));
        }
        if path.is_exclusive() {
            if let Some(other) = self
                .slots
                .iter()
                .enumerate()
                .position(|(id, slot)| id != context_id && *slot != MapState::Unmapped)
            {
                return Err(EngineError::ProtocolViolation(format!(
                    "Resource is mapped in context {} and cannot be mapped in context {} at the same time",
                    other, context_id
                )));
            }
        }
        self.slots[context_id] = match map_type {
            MapType::Read => MapState::MappedRead { flags },
            _ => MapState::MappedWrite { flags },
        };
        Ok(())
    }

    /// Return the slot to `Unmapped`, checking the map type matches. With
    /// `check_flags` the flags must also be the ones given to `begin`.
    pub fn end(
        &mut self,
        context_id: usize,
        map_type: MapType,
        flags: MapFlags,
        check_flags: bool,
    ) -> Result<MapState> {
        let current = *self.slots.get(context_id).ok_or_else(|| {
            EngineError::ProtocolViolation(format!("Unknown context id {}", context_id))
        })?;
        let matches = matches!(
            (current, map_type),
            (MapState::MappedRead { .. }, MapType::Read) | (MapState::MappedWrite { .. }, MapType::Write)
        );
        if !matches {
            return Err(EngineError::ProtocolViolation(format!(
                "Unmap({:?}) does not match the map state {:?} of context {}",
                map_type, current, context_id
            )));
        }
        if check_flags && current.flags() != flags {
            return Err(EngineError::ProtocolViolation(format!(
                "Unmap flags {:?} do not match the flags {:?} given to map in context {}",
                flags,
                current.flags(),
                context_id
            )));
        }
        self.slots[context_id] = MapState::Unmapped;
        Ok(current)
    }

    /// Drop a mark set by `begin` after the map itself failed.
    pub fn rollback(&mut self, context_id: usize) {
        if let Some(slot) = self.slots.get_mut(context_id) {
            *slot = MapState::Unmapped;
        }
    }

    pub fn any_mapped(&self) -> bool {
        self.slots.iter().any(|slot| *slot != MapState::Unmapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{BindFlags, BufferDesc};

    fn buffer(usage: Usage, access: CpuAccess) -> ResourceDesc {
        ResourceDesc::Buffer(
            BufferDesc::new("b", 64)
                .usage(usage)
                .cpu_access(access)
                .bind_flags(BindFlags::UNIFORM_BUFFER),
        )
    }

    #[test]
    fn read_requires_cpu_read_access() {
        let readable = buffer(Usage::CpuAccessible, CpuAccess::READ);
        assert_eq!(
            plan_map(&readable, MapType::Read, MapFlags::empty(), false).unwrap(),
            MapPath::Readback
        );
        assert!(plan_map(&readable, MapType::Read, MapFlags::empty(), true)
            .unwrap_err()
            .is_protocol_violation());

        for desc in [
            buffer(Usage::Default, CpuAccess::empty()),
            buffer(Usage::CpuAccessible, CpuAccess::WRITE),
            buffer(Usage::Dynamic, CpuAccess::WRITE),
        ] {
            assert!(plan_map(&desc, MapType::Read, MapFlags::empty(), false)
                .unwrap_err()
                .is_protocol_violation());
        }
    }

    #[test]
    fn dynamic_write_requires_discard() {
        let dynamic = buffer(Usage::Dynamic, CpuAccess::WRITE);
        assert!(plan_map(&dynamic, MapType::Write, MapFlags::empty(), false).is_err());
        assert_eq!(
            plan_map(&dynamic, MapType::Write, MapFlags::DISCARD, true).unwrap(),
            MapPath::DynamicDiscard
        );
    }

    #[test]
    fn default_usage_is_never_mappable() {
        let desc = buffer(Usage::Default, CpuAccess::empty());
        assert!(plan_map(&desc, MapType::Write, MapFlags::DISCARD, false).is_err());
    }

    #[test]
    fn read_write_is_unsupported() {
        let desc = buffer(Usage::CpuAccessible, CpuAccess::READ);
        assert!(matches!(
            plan_map(&desc, MapType::ReadWrite, MapFlags::empty(), false),
            Err(EngineError::Unsupported(_))
        ));
    }

    #[test]
    fn slots_reject_double_map_and_mismatched_unmap() {
        let mut slots = MapSlots::new(2);
        slots
            .begin(0, MapType::Write, MapFlags::empty(), MapPath::PersistentWrite)
            .unwrap();
        assert!(slots
            .begin(0, MapType::Read, MapFlags::empty(), MapPath::Readback)
            .is_err());
        assert!(slots.end(0, MapType::Read, MapFlags::empty(), true).is_err());
        assert!(matches!(slots.get(0), MapState::MappedWrite { .. }));
        assert!(slots.end(0, MapType::Write, MapFlags::empty(), true).is_ok());
        assert_eq!(slots.get(0), MapState::Unmapped);
        assert!(slots.end(0, MapType::Write, MapFlags::empty(), true).is_err());
    }

    #[test]
    fn unmap_flags_must_match_map_flags() {
        let mut slots = MapSlots::new(1);
        slots
            .begin(0, MapType::Write, MapFlags::DISCARD, MapPath::DynamicDiscard)
            .unwrap();
        assert!(slots
            .end(0, MapType::Write, MapFlags::empty(), true)
            .unwrap_err()
            .is_protocol_violation());
        assert_eq!(slots.get(0), MapState::MappedWrite { flags: MapFlags::DISCARD });

        // Without validation only the map type is compared
        let previous = slots.end(0, MapType::Write, MapFlags::empty(), false).unwrap();
        assert_eq!(previous.flags(), MapFlags::DISCARD);
        assert_eq!(slots.get(0), MapState::Unmapped);
    }

    #[test]
    fn exclusive_maps_conflict_across_contexts() {
        let mut slots = MapSlots::new(3);
        slots
            .begin(1, MapType::Write, MapFlags::empty(), MapPath::PersistentWrite)
            .unwrap();
        assert!(slots
            .begin(2, MapType::Write, MapFlags::empty(), MapPath::PersistentWrite)
            .is_err());
        assert_eq!(slots.get(2), MapState::Unmapped);
    }

    #[test]
    fn dynamic_maps_are_independent_per_context() {
        let mut slots = MapSlots::new(2);
        slots
            .begin(0, MapType::Write, MapFlags::DISCARD, MapPath::DynamicDiscard)
            .unwrap();
        slots
            .begin(1, MapType::Write, MapFlags::DISCARD, MapPath::DynamicDiscard)
            .unwrap();
        assert!(slots.any_mapped());
        slots.rollback(1);
        assert_eq!(slots.get(1), MapState::Unmapped);
    }
}
