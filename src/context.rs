// Device contexts
//
// A context records commands for one thread. The immediate context owns the
// authoritative usage states and is the only one that submits; deferred
// contexts record into command lists that the immediate context executes.
//
// Everything a recorded command references is kept alive by the context (and
// later the command list) until the commands have been submitted, so a
// native handle released afterwards is always covered by the last submitted
// fence value.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::{Command, MapAccess, TextureSubresource};
use crate::desc::{ResourceDesc, SubresourceFootprint, Usage};
use crate::device::DeviceShared;
use crate::dynamic_heap::{DynamicAllocation, DynamicHeap, UploadPage};
use crate::error::{EngineError, Result};
use crate::map_state::{plan_map, MapFlags, MapPath, MapState, MapType};
use crate::resource::{Buffer, GpuResource, ResourceCore, Texture};
use crate::state::{
    needs_transition, reconcile, OverlayEntry, ResourceState, StateOverlay, StateTimeline,
    TransitionMode,
};
use crate::sync::Fence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Immediate,
    Deferred,
}

/// Objects referenced by recorded commands
enum KeepAlive {
    Resource(Arc<ResourceCore>),
    Page(Arc<UploadPage>),
}

/// CPU view of mapped memory.
///
/// A mapping borrows its context, so it has to be dropped before the context
/// can unmap the resource, map anything else or finish the frame:
///
/// ```compile_fail
/// # use gpu_lifetime::{Buffer, DeviceContext, MapFlags, MapType, Result};
/// # fn write(ctx: &mut DeviceContext, buffer: &Buffer) -> Result<()> {
/// let mut mapping = ctx.map_buffer(buffer, MapType::Write, MapFlags::DISCARD)?;
/// ctx.unmap_buffer(buffer, MapType::Write, MapFlags::DISCARD)?;
/// mapping.as_mut_slice().fill(0);
/// # Ok(())
/// # }
/// ```
pub struct Mapping<'ctx> {
    range: MappedRange,
    _context: PhantomData<&'ctx mut DeviceContext>,
}

/// Mapped memory and the object keeping it alive
struct MappedRange {
    ptr: NonNull<u8>,
    len: usize,
    _owner: KeepAlive,
}

// SAFETY: the memory is kept alive by `_owner` and only reachable through
// this value while the context stays borrowed.
unsafe impl Send for Mapping<'_> {}

impl Mapping<'_> {
    pub fn len(&self) -> usize {
        self.range.len
    }

    pub fn is_empty(&self) -> bool {
        self.range.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr..ptr+len lies within memory owned by `_owner`
        unsafe { std::slice::from_raw_parts(self.range.ptr.as_ptr(), self.range.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes the view unique
        unsafe { std::slice::from_raw_parts_mut(self.range.ptr.as_ptr(), self.range.len) }
    }
}

impl std::fmt::Debug for Mapping<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.range.ptr)
            .field("len", &self.range.len)
            .finish()
    }
}

/// One mapped texture subresource in its linear layout
#[derive(Debug)]
pub struct MappedSubresource<'ctx> {
    pub data: Mapping<'ctx>,
    pub row_pitch: u64,
    pub depth_pitch: u64,
}

/// Commands recorded by a deferred context
pub struct CommandList {
    context_id: usize,
    commands: Vec<Command>,
    keep_alive: Vec<KeepAlive>,
    overlay: Vec<(Arc<ResourceCore>, OverlayEntry)>,
    outstanding: Arc<AtomicUsize>,
}

impl CommandList {
    pub fn context_id(&self) -> usize {
        self.context_id
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct DeviceContext {
    id: usize,
    kind: ContextKind,
    device: Arc<DeviceShared>,
    commands: Vec<Command>,
    keep_alive: Vec<KeepAlive>,
    states: StateTimeline,
    heap: DynamicHeap,
    outstanding_lists: Arc<AtomicUsize>,
    readback_warned: bool,
}

impl DeviceContext {
    pub(crate) fn immediate(device: Arc<DeviceShared>) -> Self {
        Self::new(0, ContextKind::Immediate, device)
    }

    pub(crate) fn deferred(id: usize, device: Arc<DeviceShared>) -> Self {
        Self::new(id, ContextKind::Deferred, device)
    }

    fn new(id: usize, kind: ContextKind, device: Arc<DeviceShared>) -> Self {
        let states = match kind {
            ContextKind::Immediate => StateTimeline::Immediate,
            ContextKind::Deferred => StateTimeline::Deferred(StateOverlay::default()),
        };
        Self {
            id,
            kind,
            heap: DynamicHeap::new(id, device.heap.alignment),
            device,
            commands: Vec::new(),
            keep_alive: Vec::new(),
            states,
            outstanding_lists: Arc::new(AtomicUsize::new(0)),
            readback_warned: false,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn is_deferred(&self) -> bool {
        self.kind == ContextKind::Deferred
    }

    /// Commands recorded since the last flush or finished command list
    pub fn recorded_commands(&self) -> &[Command] {
        &self.commands
    }

    fn violation(&self, message: String) -> EngineError {
        self.device.report(EngineError::ProtocolViolation(message))
    }

    fn require_immediate(&self, operation: &str) -> Result<()> {
        if self.is_deferred() {
            return Err(self.violation(format!(
                "{} is only allowed on the immediate context (called on context {})",
                operation, self.id
            )));
        }
        Ok(())
    }

    fn require_deferred(&self, operation: &str) -> Result<()> {
        if !self.is_deferred() {
            return Err(self.violation(format!(
                "{} is only allowed on deferred contexts",
                operation
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Usage states
    // -------------------------------------------------------------------------

    /// State of `resource` as seen by this context
    pub fn get_state(&self, resource: &impl GpuResource) -> Option<ResourceState> {
        self.states.get(resource.core())
    }

    /// Overwrite the tracked state without recording a barrier
    pub fn set_state(&mut self, resource: &impl GpuResource, state: ResourceState) {
        self.states.set(resource.core(), state);
    }

    /// Record a barrier to `new_state` if the resource is not already in it
    pub fn transition_resource_state(
        &mut self,
        resource: &impl GpuResource,
        new_state: ResourceState,
    ) -> Result<()> {
        let core = resource.core();
        if core.is_aliased() {
            // Aliased dynamic buffers live in upload memory and stay readable
            if ResourceState::GENERIC_READ.contains(new_state) && !new_state.is_empty() {
                return Ok(());
            }
            return Err(self.violation(format!(
                "Resource \"{}\": aliased dynamic buffers cannot be transitioned to {:?}",
                core.desc().name(),
                new_state
            )));
        }
        self.prepare(core, new_state, TransitionMode::Transition);
        Ok(())
    }

    /// Bring `core` into `required` according to `mode` and keep it alive
    /// for the commands that follow.
    fn prepare(&mut self, core: &Arc<ResourceCore>, required: ResourceState, mode: TransitionMode) {
        match mode {
            TransitionMode::None => {}
            TransitionMode::Transition => {
                let current = self.states.get(core);
                if needs_transition(current, required) {
                    if let Some(handle) = core.native() {
                        self.commands.push(Command::Barrier {
                            handle,
                            from: current,
                            to: required,
                        });
                    }
                    self.states.set(core, required);
                }
            }
            TransitionMode::Verify => {
                if self.device.validation.enabled {
                    let current = self.states.get(core);
                    if needs_transition(current, required) {
                        log::warn!(
                            "Resource \"{}\" is in state {:?} but {:?} is required",
                            core.desc().name(),
                            current,
                            required
                        );
                    }
                }
            }
        }
        self.keep_alive.push(KeepAlive::Resource(Arc::clone(core)));
    }

    // -------------------------------------------------------------------------
    // Map / unmap
    // -------------------------------------------------------------------------

    pub fn map_buffer(
        &mut self,
        buffer: &Buffer,
        map_type: MapType,
        flags: MapFlags,
    ) -> Result<Mapping<'_>> {
        self.map_resource(buffer.core(), map_type, flags, None)
    }

    /// `map_type` and `flags` must be the ones the buffer was mapped with
    pub fn unmap_buffer(&mut self, buffer: &Buffer, map_type: MapType, flags: MapFlags) -> Result<()> {
        self.unmap_resource(buffer.core(), map_type, flags, None)
    }

    /// Map one `(mip, slice)` of a texture. The map slot covers the whole
    /// texture, so only one subresource per context can be mapped at a time.
    pub fn map_texture_subresource(
        &mut self,
        texture: &Texture,
        mip: u32,
        slice: u32,
        map_type: MapType,
        flags: MapFlags,
    ) -> Result<MappedSubresource<'_>> {
        let footprint = texture.desc().footprint(mip, slice).ok_or_else(|| {
            self.violation(format!(
                "Texture \"{}\" has no subresource (mip {}, slice {})",
                texture.desc().name,
                mip,
                slice
            ))
        })?;
        let subresource = TextureSubresource { mip, slice };
        let data = self.map_resource(texture.core(), map_type, flags, Some((subresource, footprint)))?;
        Ok(MappedSubresource {
            data,
            row_pitch: footprint.row_pitch,
            depth_pitch: footprint.depth_pitch,
        })
    }

    pub fn unmap_texture_subresource(
        &mut self,
        texture: &Texture,
        mip: u32,
        slice: u32,
        map_type: MapType,
        flags: MapFlags,
    ) -> Result<()> {
        self.unmap_resource(
            texture.core(),
            map_type,
            flags,
            Some(TextureSubresource { mip, slice }),
        )
    }

    fn map_resource(
        &mut self,
        core: &Arc<ResourceCore>,
        map_type: MapType,
        flags: MapFlags,
        subresource: Option<(TextureSubresource, SubresourceFootprint)>,
    ) -> Result<Mapping<'_>> {
        let path = plan_map(core.desc(), map_type, flags, self.is_deferred())
            .map_err(|e| self.device.report(e))?;
        core.record()
            .map_slots
            .begin(self.id, map_type, flags, path)
            .map_err(|e| self.device.report(e))?;

        let (offset, len) = match subresource {
            Some((_, footprint)) => (footprint.offset, footprint.size),
            None => (0, core.desc().byte_size()),
        };
        let result = match path {
            MapPath::Readback => self.map_readback(core, offset, len),
            MapPath::PersistentWrite => self.map_persistent(core, MapAccess::Write, offset, len),
            MapPath::DynamicDiscard => self.map_dynamic(core, len),
        };

        match result {
            Ok(range) => {
                if let Some(slot) = core.slots().get_mut(self.id) {
                    slot.subresource = subresource.map(|(subresource, _)| subresource);
                }
                Ok(Mapping {
                    range,
                    _context: PhantomData,
                })
            }
            Err(err) => {
                core.record().map_slots.rollback(self.id);
                if let Some(slot) = core.slots().get_mut(self.id) {
                    slot.subresource = None;
                }
                Err(self.device.report(err))
            }
        }
    }

    fn map_readback(&mut self, core: &Arc<ResourceCore>, offset: u64, len: u64) -> Result<MappedRange> {
        if !self.readback_warned {
            log::warn!(
                "Mapping \"{}\" for reading flushes the context and waits for the GPU to go idle",
                core.desc().name()
            );
            self.readback_warned = true;
        }
        self.submit_pending(false)?;
        self.device.timeline.idle()?;
        self.purge();
        self.map_persistent(core, MapAccess::Read, offset, len)
    }

    fn map_persistent(
        &mut self,
        core: &Arc<ResourceCore>,
        access: MapAccess,
        offset: u64,
        len: u64,
    ) -> Result<MappedRange> {
        let handle = core.native().ok_or_else(|| {
            EngineError::ProtocolViolation(format!(
                "Resource \"{}\" has no native storage to map",
                core.desc().name()
            ))
        })?;
        let base = self.device.backend().map(handle, access)?;
        // SAFETY: footprints and buffer sizes lie within the native object
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) };
        Ok(MappedRange {
            ptr,
            len: len as usize,
            _owner: KeepAlive::Resource(Arc::clone(core)),
        })
    }

    fn map_dynamic(&mut self, core: &Arc<ResourceCore>, len: u64) -> Result<MappedRange> {
        let alignment = match core.desc() {
            ResourceDesc::Texture(desc) => u64::from(desc.format.bytes_per_texel()),
            ResourceDesc::Buffer(_) => 1,
        };
        let allocation = self.heap.allocate(
            &self.device.page_pool,
            len,
            alignment,
            self.device.current_frame(),
        )?;
        let range = MappedRange {
            ptr: allocation.cpu_ptr(),
            len: len as usize,
            _owner: KeepAlive::Page(Arc::clone(allocation.page())),
        };
        if let Some(slot) = core.slots().get_mut(self.id) {
            // Supersedes whatever the previous map produced
            slot.allocation = Some(allocation);
        }
        Ok(range)
    }

    fn unmap_resource(
        &mut self,
        core: &Arc<ResourceCore>,
        map_type: MapType,
        flags: MapFlags,
        subresource: Option<TextureSubresource>,
    ) -> Result<()> {
        let mapped_subresource = core.slots().get(self.id).and_then(|slot| slot.subresource);
        let current = core.record().map_slots.get(self.id);
        if current != MapState::Unmapped && mapped_subresource != subresource {
            return Err(self.violation(format!(
                "Resource \"{}\": unmapping {:?} but {:?} is mapped",
                core.desc().name(),
                subresource,
                mapped_subresource
            )));
        }

        let previous = core
            .record()
            .map_slots
            .end(self.id, map_type, flags, self.device.validation.enabled)
            .map_err(|e| self.device.report(e))?;
        let allocation = match core.slots().get_mut(self.id) {
            Some(slot) => {
                slot.subresource = None;
                if core.desc().usage() == Usage::Dynamic {
                    slot.allocation.take()
                } else {
                    None
                }
            }
            None => None,
        };

        match previous {
            MapState::MappedRead { .. } => {
                if let Some(handle) = core.native() {
                    self.device.backend().unmap(handle, MapAccess::Read);
                }
                Ok(())
            }
            MapState::MappedWrite { .. } if core.desc().usage() == Usage::Dynamic => {
                self.finish_dynamic_write(core, allocation, subresource)
            }
            MapState::MappedWrite { .. } => {
                if let Some(handle) = core.native() {
                    self.device.backend().unmap(handle, MapAccess::Write);
                }
                Ok(())
            }
            MapState::Unmapped => Ok(()),
        }
    }

    /// Copy a dynamic allocation into resident storage, or publish it as
    /// the backing region of an aliased buffer.
    fn finish_dynamic_write(
        &mut self,
        core: &Arc<ResourceCore>,
        allocation: Option<DynamicAllocation>,
        subresource: Option<TextureSubresource>,
    ) -> Result<()> {
        let Some(allocation) = allocation else {
            return Err(self.violation(format!(
                "Resource \"{}\" has no pending dynamic allocation in context {}",
                core.desc().name(),
                self.id
            )));
        };
        let frame = self.device.current_frame();
        if self.device.validation.enabled && allocation.is_stale(frame) {
            return Err(self.violation(format!(
                "Resource \"{}\": dynamic allocation from frame {} is stale in frame {}; the written data is discarded",
                core.desc().name(),
                allocation.frame(),
                frame
            )));
        }

        let Some(handle) = core.native() else {
            if let Some(slot) = core.slots().get_mut(self.id) {
                slot.allocation = Some(allocation);
            }
            return Ok(());
        };

        self.prepare(core, ResourceState::COPY_DEST, TransitionMode::Transition);
        self.commands.push(match subresource {
            Some(subresource) => Command::CopyBufferToTexture {
                src: allocation.page_handle(),
                src_offset: allocation.gpu_offset(),
                dst: handle,
                dst_subresource: subresource,
            },
            None => Command::CopyBuffer {
                src: allocation.page_handle(),
                src_offset: allocation.gpu_offset(),
                dst: handle,
                dst_offset: 0,
                size: allocation.size(),
            },
        });
        self.keep_alive
            .push(KeepAlive::Page(Arc::clone(allocation.page())));
        Ok(())
    }

    /// Upload region currently backing a dynamic buffer in this context
    pub fn dynamic_allocation(&self, buffer: &Buffer) -> Result<DynamicAllocation> {
        let allocation = buffer
            .core()
            .slots()
            .get(self.id)
            .and_then(|slot| slot.allocation.clone());
        let Some(allocation) = allocation else {
            return Err(self.violation(format!(
                "Buffer \"{}\" has no dynamic allocation in context {}; map it with DISCARD first",
                buffer.desc().name,
                self.id
            )));
        };
        let frame = self.device.current_frame();
        if self.device.validation.enabled && allocation.is_stale(frame) {
            return Err(self.violation(format!(
                "Buffer \"{}\": dynamic allocation from frame {} is stale in frame {}; map it again",
                buffer.desc().name,
                allocation.frame(),
                frame
            )));
        }
        Ok(allocation)
    }

    // -------------------------------------------------------------------------
    // Copies
    // -------------------------------------------------------------------------

    /// Write `data` into a default-usage buffer through the dynamic heap
    pub fn update_buffer(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        data: &[u8],
        mode: TransitionMode,
    ) -> Result<()> {
        let desc = buffer.desc();
        if desc.usage != Usage::Default {
            return Err(self.violation(format!(
                "Buffer \"{}\": only default-usage buffers can be updated ({:?}); map dynamic buffers instead",
                desc.name, desc.usage
            )));
        }
        if !range_fits(offset, data.len() as u64, desc.size) {
            return Err(self.violation(format!(
                "Buffer \"{}\": update of {} bytes at offset {} exceeds the buffer size {}",
                desc.name,
                data.len(),
                offset,
                desc.size
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        let Some(handle) = buffer.native_handle() else {
            return Err(self.violation(format!("Buffer \"{}\" has no native storage", desc.name)));
        };

        let allocation = self.heap.allocate(
            &self.device.page_pool,
            data.len() as u64,
            1,
            self.device.current_frame(),
        )?;
        allocation.page().write(allocation.gpu_offset(), data)?;

        self.prepare(buffer.core(), ResourceState::COPY_DEST, mode);
        self.commands.push(Command::CopyBuffer {
            src: allocation.page_handle(),
            src_offset: allocation.gpu_offset(),
            dst: handle,
            dst_offset: offset,
            size: data.len() as u64,
        });
        self.keep_alive
            .push(KeepAlive::Page(Arc::clone(allocation.page())));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn copy_buffer(
        &mut self,
        src: &Buffer,
        src_offset: u64,
        src_mode: TransitionMode,
        dst: &Buffer,
        dst_offset: u64,
        size: u64,
        dst_mode: TransitionMode,
    ) -> Result<()> {
        let (src_desc, dst_desc) = (src.desc(), dst.desc());
        if matches!(dst_desc.usage, Usage::Dynamic | Usage::Immutable) {
            return Err(self.violation(format!(
                "Buffer \"{}\": {:?} buffers cannot be copy destinations",
                dst_desc.name, dst_desc.usage
            )));
        }
        if !range_fits(src_offset, size, src_desc.size) || !range_fits(dst_offset, size, dst_desc.size) {
            return Err(self.violation(format!(
                "Copy of {} bytes from \"{}\"+{} to \"{}\"+{} is out of range",
                size, src_desc.name, src_offset, dst_desc.name, dst_offset
            )));
        }
        if src.id() == dst.id() {
            return Err(self.device.report(EngineError::Unsupported(format!(
                "Buffer \"{}\": copies within one buffer are not supported",
                src_desc.name
            ))));
        }
        let Some(dst_handle) = dst.native_handle() else {
            return Err(self.violation(format!("Buffer \"{}\" has no native storage", dst_desc.name)));
        };
        if size == 0 {
            return Ok(());
        }

        let (src_handle, src_base) = match src.native_handle() {
            Some(handle) => {
                self.prepare(src.core(), ResourceState::COPY_SOURCE, src_mode);
                (handle, 0)
            }
            None => {
                let allocation = self.dynamic_allocation(src)?;
                self.keep_alive
                    .push(KeepAlive::Page(Arc::clone(allocation.page())));
                (allocation.page_handle(), allocation.gpu_offset())
            }
        };
        self.prepare(dst.core(), ResourceState::COPY_DEST, dst_mode);
        self.commands.push(Command::CopyBuffer {
            src: src_handle,
            src_offset: src_base + src_offset,
            dst: dst_handle,
            dst_offset,
            size,
        });
        Ok(())
    }

    pub fn copy_texture(
        &mut self,
        src: &Texture,
        src_subresource: TextureSubresource,
        src_mode: TransitionMode,
        dst: &Texture,
        dst_subresource: TextureSubresource,
        dst_mode: TransitionMode,
    ) -> Result<()> {
        let (src_desc, dst_desc) = (src.desc(), dst.desc());
        if matches!(dst_desc.usage, Usage::Dynamic | Usage::Immutable) {
            return Err(self.violation(format!(
                "Texture \"{}\": {:?} textures cannot be copy destinations",
                dst_desc.name, dst_desc.usage
            )));
        }
        if src.id() == dst.id() {
            return Err(self.device.report(EngineError::Unsupported(format!(
                "Texture \"{}\": copies between subresources of one texture are not supported",
                src_desc.name
            ))));
        }
        let src_footprint = src_desc.footprint(src_subresource.mip, src_subresource.slice);
        let dst_footprint = dst_desc.footprint(dst_subresource.mip, dst_subresource.slice);
        let (Some(src_footprint), Some(dst_footprint)) = (src_footprint, dst_footprint) else {
            return Err(self.violation(format!(
                "Copy from \"{}\" {:?} to \"{}\" {:?} addresses a missing subresource",
                src_desc.name, src_subresource, dst_desc.name, dst_subresource
            )));
        };
        if (src_footprint.width, src_footprint.height, src_footprint.depth, src_footprint.row_pitch)
            != (dst_footprint.width, dst_footprint.height, dst_footprint.depth, dst_footprint.row_pitch)
        {
            return Err(self.violation(format!(
                "Copy from \"{}\" to \"{}\": subresource extents or texel sizes differ",
                src_desc.name, dst_desc.name
            )));
        }
        let (Some(src_handle), Some(dst_handle)) = (src.native_handle(), dst.native_handle()) else {
            return Err(self.violation("Texture copy without native storage".into()));
        };

        self.prepare(src.core(), ResourceState::COPY_SOURCE, src_mode);
        self.prepare(dst.core(), ResourceState::COPY_DEST, dst_mode);
        self.commands.push(Command::CopyTexture {
            src: src_handle,
            src_subresource,
            dst: dst_handle,
            dst_subresource,
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Submission and synchronization
    // -------------------------------------------------------------------------

    /// Submit everything recorded so far
    pub fn flush(&mut self) -> Result<()> {
        self.require_immediate("Flush")?;
        self.submit_pending(false).map(|_| ())
    }

    /// Submit recorded commands together with the pages deferred contexts
    /// retired. Returns the fence value of the submission, if one was made.
    fn submit_pending(&mut self, force: bool) -> Result<Option<u64>> {
        let awaiting = self.device.page_pool.take_awaiting();
        if self.commands.is_empty() && awaiting.is_empty() && !force {
            self.purge();
            return Ok(None);
        }

        let fence = match self.device.timeline.submit(&self.commands) {
            Ok(fence) => fence,
            Err(err) => {
                self.device.page_pool.defer(awaiting);
                return Err(self.device.report(err));
            }
        };
        // The fence is published: releases triggered from here on wait for it
        self.commands.clear();
        self.keep_alive.clear();
        self.device.page_pool.retire(fence, awaiting);
        self.purge();
        Ok(Some(fence))
    }

    fn purge(&self) {
        let timeline = &self.device.timeline;
        timeline.purge();
        self.device.page_pool.reclaim(timeline.last_completed());
    }

    pub fn finish_command_list(&mut self) -> Result<CommandList> {
        self.require_deferred("FinishCommandList")?;
        let overlay = match &mut self.states {
            StateTimeline::Deferred(overlay) => overlay.take(),
            StateTimeline::Immediate => Vec::new(),
        };
        self.outstanding_lists.fetch_add(1, Ordering::AcqRel);
        Ok(CommandList {
            context_id: self.id,
            commands: std::mem::take(&mut self.commands),
            keep_alive: std::mem::take(&mut self.keep_alive),
            overlay,
            outstanding: Arc::clone(&self.outstanding_lists),
        })
    }

    /// Append a deferred command list, first reconciling the states it
    /// assumed with the states this context tracks.
    pub fn execute_command_list(&mut self, mut list: CommandList) -> Result<()> {
        self.require_immediate("ExecuteCommandList")?;

        for (core, entry) in std::mem::take(&mut list.overlay) {
            let recorded = core.record().state;
            let merged = reconcile(entry, recorded);
            if let Some((from, to)) = merged.fixup {
                if self.device.validation.enabled {
                    log::warn!(
                        "Command list from context {} expects \"{}\" in state {:?} but it is in {:?}; recording a transition",
                        list.context_id,
                        core.desc().name(),
                        to,
                        from
                    );
                }
                if let Some(handle) = core.native() {
                    self.commands.push(Command::Barrier { handle, from, to });
                }
            }
            core.record().state = merged.state;
            self.keep_alive.push(KeepAlive::Resource(core));
        }

        self.commands.append(&mut list.commands);
        self.keep_alive.append(&mut list.keep_alive);
        Ok(())
    }

    /// Signal `value` on `fence` once everything recorded so far completes
    pub fn enqueue_signal(&mut self, fence: &Fence, value: u64) -> Result<()> {
        self.require_immediate("EnqueueSignal")?;
        fence.check_next(value).map_err(|e| self.device.report(e))?;
        let queue_value = self
            .submit_pending(true)?
            .unwrap_or_else(|| self.device.timeline.last_submitted());
        fence
            .bind(queue_value, value)
            .map_err(|e| self.device.report(e))
    }

    /// Flush, wait for the GPU and release everything that was waiting on it
    pub fn wait_for_idle(&mut self) -> Result<()> {
        self.require_immediate("WaitForIdle")?;
        self.submit_pending(false)?;
        let timeline = &self.device.timeline;
        timeline.idle()?;
        timeline.release_queue().drain_all();
        self.device.page_pool.reclaim(timeline.last_completed());
        Ok(())
    }

    /// End the frame for this context.
    ///
    /// The immediate context flushes, retires its upload pages at the fence
    /// it just submitted and advances the device frame. A deferred context
    /// hands its pages to the immediate context's next submission; it must
    /// have no unfinished commands and every command list it produced must
    /// have been executed.
    pub fn finish_frame(&mut self) -> Result<()> {
        match self.kind {
            ContextKind::Immediate => {
                self.submit_pending(false)?;
                let fence = self.device.timeline.last_submitted();
                self.device.page_pool.retire(fence, self.heap.retire());
                let frame = self.device.advance_frame();
                self.purge();
                log::trace!("Frame {} started (pages retired at fence {})", frame, fence);
            }
            ContextKind::Deferred => {
                let outstanding = self.outstanding_lists.load(Ordering::Acquire);
                if outstanding > 0 {
                    return Err(self.violation(format!(
                        "Context {}: {} command list(s) have not been executed; execute them before finishing the frame",
                        self.id, outstanding
                    )));
                }
                if !self.commands.is_empty() {
                    return Err(self.violation(format!(
                        "Context {}: {} recorded commands were never finished into a command list",
                        self.id,
                        self.commands.len()
                    )));
                }
                self.device.page_pool.defer(self.heap.retire());
            }
        }
        Ok(())
    }
}

/// `offset..offset + size` lies within `limit` bytes
fn range_fits(offset: u64, size: u64, limit: u64) -> bool {
    offset.checked_add(size).is_some_and(|end| end <= limit)
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if !self.commands.is_empty() {
            log::warn!(
                "Context {} dropped with {} unsubmitted commands",
                self.id,
                self.commands.len()
            );
        }
    }
}
