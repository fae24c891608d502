// Usage-state tracking
//
// Every resource carries one authoritative state for the immediate
// context's timeline. Deferred contexts record against a private overlay
// that is reconciled into the record when their command list is executed.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;

use crate::map_state::MapSlots;
use crate::resource::{ResourceCore, ResourceId};

bitflags! {
    /// GPU pipeline state of a resource
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceState: u32 {
        const UNDEFINED         = 1 << 0;
        const VERTEX_BUFFER     = 1 << 1;
        const CONSTANT_BUFFER   = 1 << 2;
        const INDEX_BUFFER      = 1 << 3;
        const RENDER_TARGET     = 1 << 4;
        const UNORDERED_ACCESS  = 1 << 5;
        const DEPTH_WRITE       = 1 << 6;
        const DEPTH_READ        = 1 << 7;
        const SHADER_RESOURCE   = 1 << 8;
        const INDIRECT_ARGUMENT = 1 << 9;
        const COPY_DEST         = 1 << 10;
        const COPY_SOURCE       = 1 << 11;
        const PRESENT           = 1 << 12;

        const GENERIC_READ = Self::VERTEX_BUFFER.bits()
            | Self::CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits()
            | Self::COPY_SOURCE.bits();
    }
}

impl ResourceState {
    const READ_ONLY: ResourceState = ResourceState::GENERIC_READ
        .union(ResourceState::DEPTH_READ)
        .union(ResourceState::PRESENT);

    /// States in which the GPU only reads the resource
    pub fn is_read_only(self) -> bool {
        !self.is_empty() && Self::READ_ONLY.contains(self)
    }
}

/// Whether moving from `current` to `required` needs a barrier. Read-only
/// states that already include the required bits are left alone.
pub fn needs_transition(current: Option<ResourceState>, required: ResourceState) -> bool {
    match current {
        None => true,
        Some(current) if current == required => false,
        Some(current) => !(current.is_read_only() && current.contains(required)),
    }
}

/// How an operation treats the state of the resources it touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionMode {
    /// Do not touch or check the state
    None,
    /// Record a barrier if needed and update the tracked state
    #[default]
    Transition,
    /// Check the tracked state and warn if it does not match
    Verify,
}

/// Per-resource record read by anything that emits a barrier
#[derive(Debug)]
pub struct UsageStateRecord {
    /// `None` when the state is unknown (adopted native objects)
    pub state: Option<ResourceState>,
    pub map_slots: MapSlots,
}

impl UsageStateRecord {
    pub fn new(state: Option<ResourceState>, num_contexts: usize) -> Self {
        Self {
            state,
            map_slots: MapSlots::new(num_contexts),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OverlayEntry {
    /// Record state observed at first use in the deferred context
    pub assumed: Option<ResourceState>,
    pub current: Option<ResourceState>,
}

/// Outcome of merging a deferred overlay entry into the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reconciled {
    /// Barrier the immediate context records before the command list
    pub fixup: Option<(Option<ResourceState>, ResourceState)>,
    pub state: Option<ResourceState>,
}

/// Merge a deferred context's view of a resource into the record.
pub(crate) fn reconcile(entry: OverlayEntry, record: Option<ResourceState>) -> Reconciled {
    let fixup = match entry.assumed {
        Some(assumed) if record != Some(assumed) => Some((record, assumed)),
        _ => None,
    };
    Reconciled {
        fixup,
        // Last writer wins
        state: entry.current.or(record),
    }
}

/// State view of one context
pub(crate) enum StateTimeline {
    Immediate,
    Deferred(StateOverlay),
}

impl StateTimeline {
    pub fn get(&self, resource: &Arc<ResourceCore>) -> Option<ResourceState> {
        match self {
            StateTimeline::Immediate => resource.record().state,
            StateTimeline::Deferred(overlay) => overlay.peek(resource),
        }
    }

    pub fn set(&mut self, resource: &Arc<ResourceCore>, state: ResourceState) {
        match self {
            StateTimeline::Immediate => resource.record().state = Some(state),
            StateTimeline::Deferred(overlay) => overlay.entry(resource).current = Some(state),
        }
    }
}

/// Deferred-context states, keyed by resource
#[derive(Default)]
pub(crate) struct StateOverlay {
    entries: HashMap<ResourceId, (Arc<ResourceCore>, OverlayEntry)>,
}

impl StateOverlay {
    /// Reads do not claim the resource for the command list
    fn peek(&self, resource: &Arc<ResourceCore>) -> Option<ResourceState> {
        match self.entries.get(&resource.id()) {
            Some((_, entry)) => entry.current,
            None => resource.record().state,
        }
    }

    fn entry(&mut self, resource: &Arc<ResourceCore>) -> &mut OverlayEntry {
        let (_, entry) = self.entries.entry(resource.id()).or_insert_with(|| {
            let snapshot = resource.record().state;
            (
                Arc::clone(resource),
                OverlayEntry {
                    assumed: snapshot,
                    current: snapshot,
                },
            )
        });
        entry
    }

    pub fn take(&mut self) -> Vec<(Arc<ResourceCore>, OverlayEntry)> {
        self.entries.drain().map(|(_, value)| value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_states_combine_without_barrier() {
        assert!(!needs_transition(
            Some(ResourceState::GENERIC_READ),
            ResourceState::SHADER_RESOURCE
        ));
        assert!(needs_transition(
            Some(ResourceState::SHADER_RESOURCE),
            ResourceState::COPY_DEST
        ));
        assert!(needs_transition(
            Some(ResourceState::SHADER_RESOURCE),
            ResourceState::VERTEX_BUFFER
        ));
        assert!(!needs_transition(
            Some(ResourceState::COPY_DEST),
            ResourceState::COPY_DEST
        ));
        assert!(needs_transition(None, ResourceState::COPY_SOURCE));
    }

    #[test]
    fn read_only_classification() {
        assert!(ResourceState::GENERIC_READ.is_read_only());
        assert!(ResourceState::COPY_SOURCE.is_read_only());
        assert!(!ResourceState::COPY_DEST.is_read_only());
        assert!(!(ResourceState::SHADER_RESOURCE | ResourceState::UNORDERED_ACCESS).is_read_only());
        assert!(!ResourceState::empty().is_read_only());
    }

    #[test]
    fn reconcile_agreeing_assumption() {
        let entry = OverlayEntry {
            assumed: Some(ResourceState::COPY_DEST),
            current: Some(ResourceState::SHADER_RESOURCE),
        };
        let merged = reconcile(entry, Some(ResourceState::COPY_DEST));
        assert_eq!(merged.fixup, None);
        assert_eq!(merged.state, Some(ResourceState::SHADER_RESOURCE));
    }

    #[test]
    fn reconcile_conflicting_assumption_needs_fixup() {
        let entry = OverlayEntry {
            assumed: Some(ResourceState::COPY_DEST),
            current: Some(ResourceState::COPY_SOURCE),
        };
        let merged = reconcile(entry, Some(ResourceState::SHADER_RESOURCE));
        assert_eq!(
            merged.fixup,
            Some((Some(ResourceState::SHADER_RESOURCE), ResourceState::COPY_DEST))
        );
        assert_eq!(merged.state, Some(ResourceState::COPY_SOURCE));
    }

    #[test]
    fn reconcile_unknown_assumption_keeps_record() {
        let entry = OverlayEntry {
            assumed: None,
            current: None,
        };
        let merged = reconcile(entry, Some(ResourceState::COPY_DEST));
        assert_eq!(merged.fixup, None);
        assert_eq!(merged.state, Some(ResourceState::COPY_DEST));
    }
}
