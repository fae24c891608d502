// Host backend - CPU-simulated device
//
// Objects live in host memory and submitted work runs lazily: a submission
// only executes when someone waits for it (or `advance` is called), which
// makes GPU latency observable and deterministic. Every command is checked
// against the live object table, so a handle destroyed while still in use
// shows up in the statistics.

use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{Backend, BackendCaps, Command, MapAccess, RawHandle, TextureSubresource};
use crate::desc::{BufferDesc, TextureDesc};
use crate::error::{EngineError, Result};
use crate::memory::{MemoryClass, MemoryProperties, MemoryTypeChooser};
use crate::state::ResourceState;

/// Counters describing what the simulated GPU has done
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostStats {
    pub submissions: u64,
    pub barriers: u64,
    pub copies: u64,
    pub created: u64,
    pub destroyed: u64,
    /// Commands that referenced an already destroyed handle
    pub use_after_free: u64,
    /// Barriers whose `from` state disagreed with the object's state, and
    /// copies issued in the wrong state
    pub state_mismatches: u64,
}

/// Raw host allocation. Accessed only through raw pointers so CPU mappings
/// and simulated GPU copies never alias a Rust reference.
struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
}

impl HostMemory {
    fn new(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len.max(1)].into_boxed_slice();
        let len = boxed.len();
        let raw = Box::into_raw(boxed) as *mut u8;
        Self {
            // SAFETY: Box::into_raw never returns null
            ptr: unsafe { NonNull::new_unchecked(raw) },
            len,
        }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from Box::into_raw of a boxed slice of len bytes
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

enum HostObjectKind {
    Buffer,
    Texture(TextureDesc),
    UploadPage,
}

struct HostObject {
    kind: HostObjectKind,
    memory: HostMemory,
    host_visible: bool,
    state: Option<ResourceState>,
    mapped: u32,
}

struct HostState {
    objects: HashMap<RawHandle, HostObject>,
    pending: VecDeque<(u64, Vec<Command>)>,
    next_fence: u64,
    completed: u64,
    allocated_bytes: u64,
    stats: HostStats,
}

// SAFETY: HostMemory pointers are owned allocations only touched under the
// state lock or through mappings handed out to callers.
unsafe impl Send for HostState {}

pub struct HostBackend {
    caps: BackendCaps,
    chooser: MemoryTypeChooser,
    memory_budget: Option<u64>,
    auto_complete: bool,
    next_handle: AtomicU64,
    state: Mutex<HostState>,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            caps: BackendCaps {
                dynamic_aliasing: false,
            },
            chooser: MemoryTypeChooser::new(vec![
                MemoryProperties::DEVICE_LOCAL,
                MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
                MemoryProperties::HOST_VISIBLE
                    | MemoryProperties::HOST_COHERENT
                    | MemoryProperties::HOST_CACHED,
            ]),
            memory_budget: None,
            auto_complete: false,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(HostState {
                objects: HashMap::new(),
                pending: VecDeque::new(),
                next_fence: 1,
                completed: 0,
                allocated_bytes: 0,
                stats: HostStats::default(),
            }),
        }
    }

    pub fn with_caps(mut self, caps: BackendCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_memory_types(mut self, types: Vec<MemoryProperties>) -> Self {
        self.chooser = MemoryTypeChooser::new(types);
        self
    }

    /// Fail allocations once `bytes` of live memory would be exceeded
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Complete all submitted work whenever the completed fence is queried
    pub fn with_auto_complete(mut self, auto_complete: bool) -> Self {
        self.auto_complete = auto_complete;
        self
    }

    /// Execute up to `count` pending submissions
    pub fn advance(&self, count: usize) -> u64 {
        let mut state = self.state.lock();
        for _ in 0..count {
            let Some((fence, commands)) = state.pending.pop_front() else {
                break;
            };
            Self::execute(&mut state, fence, &commands);
        }
        state.completed
    }

    pub fn stats(&self) -> HostStats {
        self.state.lock().stats.clone()
    }

    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn is_alive(&self, handle: RawHandle) -> bool {
        self.state.lock().objects.contains_key(&handle)
    }

    /// State the simulated GPU last saw for `handle`
    pub fn object_state(&self, handle: RawHandle) -> Option<ResourceState> {
        self.state
            .lock()
            .objects
            .get(&handle)
            .and_then(|object| object.state)
    }

    /// Copy out the storage of an object (what the GPU would read)
    pub fn read_object(&self, handle: RawHandle) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let object = state.objects.get(&handle)?;
        let mut bytes = vec![0u8; object.memory.len];
        // SAFETY: the allocation is live while the lock is held
        unsafe {
            std::ptr::copy_nonoverlapping(
                object.memory.ptr.as_ptr(),
                bytes.as_mut_ptr(),
                object.memory.len,
            );
        }
        Some(bytes)
    }

    fn allocate(
        &self,
        kind: HostObjectKind,
        size: u64,
        class: MemoryClass,
    ) -> Result<(RawHandle, NonNull<u8>)> {
        let memory_type = self.chooser.choose(u32::MAX, class)?;
        let host_visible = self.chooser.memory_types()[memory_type as usize]
            .contains(MemoryProperties::HOST_VISIBLE);

        let mut state = self.state.lock();
        if let Some(budget) = self.memory_budget {
            if state.allocated_bytes + size > budget {
                return Err(EngineError::ResourceExhaustion(format!(
                    "Host device out of memory: {} bytes requested, {} of {} in use",
                    size, state.allocated_bytes, budget
                )));
            }
        }

        let memory = HostMemory::new(size as usize);
        let ptr = memory.ptr;
        let handle = RawHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed))
            .ok_or_else(|| EngineError::ResourceExhaustion("Handle space exhausted".into()))?;
        state.allocated_bytes += size;
        state.stats.created += 1;
        state.objects.insert(
            handle,
            HostObject {
                kind,
                memory,
                host_visible,
                state: Some(ResourceState::UNDEFINED),
                mapped: 0,
            },
        );
        log::trace!("Host object {:?} created ({} bytes, memory type {})", handle, size, memory_type);
        Ok((handle, ptr))
    }

    fn execute(state: &mut HostState, fence: u64, commands: &[Command]) {
        for command in commands {
            match command {
                Command::Barrier { handle, from, to } => {
                    state.stats.barriers += 1;
                    let Some(object) = state.objects.get_mut(handle) else {
                        log::error!("Barrier on destroyed object {:?}", handle);
                        state.stats.use_after_free += 1;
                        continue;
                    };
                    if let Some(from) = from {
                        if object.state != Some(*from) {
                            log::warn!(
                                "Barrier on {:?} expects {:?} but the object is in {:?}",
                                handle,
                                from,
                                object.state
                            );
                            state.stats.state_mismatches += 1;
                        }
                    }
                    object.state = Some(*to);
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let src_region = Self::buffer_region(state, *src, *src_offset, *size, false);
                    let dst_region = Self::buffer_region(state, *dst, *dst_offset, *size, true);
                    Self::copy(state, src_region, dst_region);
                }
                Command::CopyBufferToTexture {
                    src,
                    src_offset,
                    dst,
                    dst_subresource,
                } => {
                    let dst_region = Self::texture_region(state, *dst, *dst_subresource, true);
                    let size = dst_region.map_or(0, |(_, len)| len as u64);
                    let src_region = Self::buffer_region(state, *src, *src_offset, size, false);
                    Self::copy(state, src_region, dst_region);
                }
                Command::CopyTexture {
                    src,
                    src_subresource,
                    dst,
                    dst_subresource,
                } => {
                    let src_region = Self::texture_region(state, *src, *src_subresource, false);
                    let dst_region = Self::texture_region(state, *dst, *dst_subresource, true);
                    Self::copy(state, src_region, dst_region);
                }
            }
        }
        state.completed = fence;
    }

    /// Resolve a byte range of a buffer-like object, checking its state
    fn buffer_region(
        state: &mut HostState,
        handle: RawHandle,
        offset: u64,
        size: u64,
        write: bool,
    ) -> Option<(*mut u8, usize)> {
        let Some(object) = state.objects.get(&handle) else {
            log::error!("Copy references destroyed object {:?}", handle);
            state.stats.use_after_free += 1;
            return None;
        };
        let in_bounds = offset
            .checked_add(size)
            .is_some_and(|end| end <= object.memory.len as u64);
        if !in_bounds {
            log::error!(
                "Copy of {} bytes at offset {} exceeds object {:?} of {} bytes",
                size,
                offset,
                handle,
                object.memory.len
            );
            return None;
        }
        let mismatch = Self::copy_state_mismatch(object, write);
        let ptr = object.memory.ptr.as_ptr();
        if mismatch {
            state.stats.state_mismatches += 1;
        }
        // SAFETY: offset + size was bounds-checked above
        Some((unsafe { ptr.add(offset as usize) }, size as usize))
    }

    fn texture_region(
        state: &mut HostState,
        handle: RawHandle,
        subresource: TextureSubresource,
        write: bool,
    ) -> Option<(*mut u8, usize)> {
        let Some(object) = state.objects.get(&handle) else {
            log::error!("Copy references destroyed texture {:?}", handle);
            state.stats.use_after_free += 1;
            return None;
        };
        let HostObjectKind::Texture(desc) = &object.kind else {
            log::error!("Object {:?} is not a texture", handle);
            return None;
        };
        let footprint = desc.footprint(subresource.mip, subresource.slice)?;
        let mismatch = Self::copy_state_mismatch(object, write);
        let ptr = object.memory.ptr.as_ptr();
        if mismatch {
            state.stats.state_mismatches += 1;
        }
        // SAFETY: footprints lie within the linear size the object was created with
        Some((
            unsafe { ptr.add(footprint.offset as usize) },
            footprint.size as usize,
        ))
    }

    fn copy_state_mismatch(object: &HostObject, write: bool) -> bool {
        if matches!(object.kind, HostObjectKind::UploadPage) {
            return false;
        }
        let required = if write {
            ResourceState::COPY_DEST
        } else {
            ResourceState::COPY_SOURCE
        };
        let ok = object.state.is_some_and(|state| state.contains(required));
        if !ok {
            log::warn!(
                "Copy {} object in state {:?}",
                if write { "into" } else { "from" },
                object.state
            );
        }
        !ok
    }

    fn copy(state: &mut HostState, src: Option<(*mut u8, usize)>, dst: Option<(*mut u8, usize)>) {
        let (Some((src, src_len)), Some((dst, dst_len))) = (src, dst) else {
            return;
        };
        if src_len != dst_len {
            log::error!("Copy size mismatch: {} vs {} bytes", src_len, dst_len);
            return;
        }
        // SAFETY: both ranges were bounds-checked against live allocations;
        // `copy` tolerates overlap within the same object.
        unsafe { std::ptr::copy(src, dst, src_len) };
        state.stats.copies += 1;
    }

    fn execute_until(&self, state: &mut HostState, value: u64) {
        while let Some((fence, _)) = state.pending.front() {
            if *fence > value {
                break;
            }
            if let Some((fence, commands)) = state.pending.pop_front() {
                Self::execute(state, fence, &commands);
            }
        }
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn caps(&self) -> BackendCaps {
        self.caps
    }

    fn create_buffer(&self, desc: &BufferDesc, memory: MemoryClass) -> Result<RawHandle> {
        self.allocate(HostObjectKind::Buffer, desc.size, memory)
            .map(|(handle, _)| handle)
    }

    fn create_texture(&self, desc: &TextureDesc, memory: MemoryClass) -> Result<RawHandle> {
        self.allocate(
            HostObjectKind::Texture(desc.clone()),
            desc.linear_size(),
            memory,
        )
        .map(|(handle, _)| handle)
    }

    fn create_upload_page(&self, size: u64) -> Result<(RawHandle, NonNull<u8>)> {
        self.allocate(HostObjectKind::UploadPage, size, MemoryClass::Upload)
    }

    fn import_buffer(&self, desc: &BufferDesc, native: u64) -> Result<RawHandle> {
        log::debug!("Adopting host buffer {:#x} as \"{}\"", native, desc.name);
        let handle = self.create_buffer(
            desc,
            MemoryClass::for_usage(desc.usage, desc.cpu_access),
        )?;
        if let Some(object) = self.state.lock().objects.get_mut(&handle) {
            object.state = None;
        }
        Ok(handle)
    }

    fn map(&self, handle: RawHandle, access: MapAccess) -> Result<NonNull<u8>> {
        let mut state = self.state.lock();
        let object = state.objects.get_mut(&handle).ok_or_else(|| {
            EngineError::ProtocolViolation(format!("Mapping destroyed object {:?}", handle))
        })?;
        if !object.host_visible {
            return Err(EngineError::ProtocolViolation(format!(
                "Object {:?} is not host visible and cannot be mapped for {:?}",
                handle, access
            )));
        }
        object.mapped += 1;
        Ok(object.memory.ptr)
    }

    fn unmap(&self, handle: RawHandle, _access: MapAccess) {
        if let Some(object) = self.state.lock().objects.get_mut(&handle) {
            object.mapped = object.mapped.saturating_sub(1);
        }
    }

    fn destroy(&self, handle: RawHandle) {
        let mut state = self.state.lock();
        match state.objects.remove(&handle) {
            Some(object) => {
                if object.mapped > 0 {
                    log::warn!("Destroying object {:?} while it is still mapped", handle);
                }
                state.allocated_bytes -= object.memory.len as u64;
                state.stats.destroyed += 1;
                log::trace!("Host object {:?} destroyed", handle);
            }
            None => log::error!("Destroying unknown object {:?}", handle),
        }
    }

    fn submit(&self, commands: &[Command]) -> Result<u64> {
        let mut state = self.state.lock();
        let fence = state.next_fence;
        state.next_fence += 1;
        state.stats.submissions += 1;
        state.pending.push_back((fence, commands.to_vec()));
        Ok(fence)
    }

    fn last_completed_fence(&self) -> u64 {
        let mut state = self.state.lock();
        if self.auto_complete {
            self.execute_until(&mut state, u64::MAX);
        }
        state.completed
    }

    fn wait_for_fence(&self, value: u64) -> Result<()> {
        let mut state = self.state.lock();
        if value >= state.next_fence {
            return Err(EngineError::ProtocolViolation(format!(
                "Waiting for fence value {} that has not been submitted (last submitted {})",
                value,
                state.next_fence - 1
            )));
        }
        self.execute_until(&mut state, value);
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.execute_until(&mut state, u64::MAX);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{CpuAccess, Usage};

    fn buffer_desc(size: u64) -> BufferDesc {
        BufferDesc::new("host", size)
    }

    #[test]
    fn work_completes_only_when_waited_for() {
        let backend = HostBackend::new();
        let first = backend.submit(&[]).unwrap();
        let second = backend.submit(&[]).unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(backend.last_completed_fence(), 0);
        backend.wait_for_fence(1).unwrap();
        assert_eq!(backend.last_completed_fence(), 1);
        backend.wait_idle().unwrap();
        assert_eq!(backend.last_completed_fence(), 2);
        assert!(backend.wait_for_fence(3).is_err());
    }

    #[test]
    fn copies_run_at_completion() {
        let backend = HostBackend::new();
        let (page, ptr) = backend.create_upload_page(8).unwrap();
        let dst = backend
            .create_buffer(&buffer_desc(8), MemoryClass::DeviceLocal)
            .unwrap();
        // SAFETY: the page holds 8 bytes
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), ptr.as_ptr(), 4) };

        let fence = backend
            .submit(&[
                Command::Barrier {
                    handle: dst,
                    from: Some(ResourceState::UNDEFINED),
                    to: ResourceState::COPY_DEST,
                },
                Command::CopyBuffer {
                    src: page,
                    src_offset: 0,
                    dst,
                    dst_offset: 4,
                    size: 4,
                },
            ])
            .unwrap();
        assert_eq!(backend.read_object(dst).unwrap(), vec![0; 8]);
        backend.wait_for_fence(fence).unwrap();
        assert_eq!(backend.read_object(dst).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(backend.stats().state_mismatches, 0);
    }

    #[test]
    fn out_of_range_copies_are_dropped() {
        let backend = HostBackend::new();
        let (page, _) = backend.create_upload_page(16).unwrap();
        let dst = backend
            .create_buffer(&buffer_desc(16), MemoryClass::DeviceLocal)
            .unwrap();
        let fence = backend
            .submit(&[
                Command::Barrier {
                    handle: dst,
                    from: Some(ResourceState::UNDEFINED),
                    to: ResourceState::COPY_DEST,
                },
                Command::CopyBuffer {
                    src: page,
                    src_offset: u64::MAX - 7,
                    dst,
                    dst_offset: 0,
                    size: 16,
                },
                Command::CopyBuffer {
                    src: page,
                    src_offset: 0,
                    dst,
                    dst_offset: u64::MAX,
                    size: 1,
                },
            ])
            .unwrap();
        backend.wait_for_fence(fence).unwrap();
        assert_eq!(backend.read_object(dst).unwrap(), vec![0; 16]);
        assert_eq!(backend.stats().copies, 0);
    }

    #[test]
    fn destroyed_handles_are_detected() {
        let backend = HostBackend::new();
        let buffer = backend
            .create_buffer(&buffer_desc(4), MemoryClass::DeviceLocal)
            .unwrap();
        let fence = backend
            .submit(&[Command::Barrier {
                handle: buffer,
                from: None,
                to: ResourceState::COPY_SOURCE,
            }])
            .unwrap();
        backend.destroy(buffer);
        backend.wait_for_fence(fence).unwrap();
        assert_eq!(backend.stats().use_after_free, 1);
    }

    #[test]
    fn device_local_memory_is_not_mappable() {
        let backend = HostBackend::new();
        let local = backend
            .create_buffer(&buffer_desc(4), MemoryClass::DeviceLocal)
            .unwrap();
        assert!(backend.map(local, MapAccess::Write).is_err());

        let desc = buffer_desc(4)
            .usage(Usage::CpuAccessible)
            .cpu_access(CpuAccess::READ);
        let readback = backend.create_buffer(&desc, MemoryClass::Readback).unwrap();
        assert!(backend.map(readback, MapAccess::Read).is_ok());
    }

    #[test]
    fn budget_limits_allocations() {
        let backend = HostBackend::new().with_memory_budget(16);
        assert!(backend
            .create_buffer(&buffer_desc(12), MemoryClass::DeviceLocal)
            .is_ok());
        assert!(matches!(
            backend.create_buffer(&buffer_desc(12), MemoryClass::DeviceLocal),
            Err(EngineError::ResourceExhaustion(_))
        ));
    }
}
