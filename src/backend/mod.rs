// Backend module - native API abstraction layer
//
// One capability set implemented once per native API. The device picks a
// backend at startup and every call goes through `Arc<dyn Backend>`.

pub mod host;
pub mod vulkan;

mod buffer;
mod device;
mod sync;

use std::num::NonZeroU64;
use std::ptr::NonNull;

use crate::desc::{BufferDesc, TextureDesc};
use crate::error::Result;
use crate::memory::MemoryClass;
use crate::state::ResourceState;

pub use host::{HostBackend, HostStats};
pub use vulkan::VulkanBackend;

/// Opaque handle to a native object owned by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(NonZeroU64);

impl RawHandle {
    pub fn new(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// Optional backend features
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCaps {
    /// Dynamic buffers without SRV/UAV bindings can be bound directly from
    /// their upload allocation, so no GPU-resident copy is needed.
    pub dynamic_aliasing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAccess {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureSubresource {
    pub mip: u32,
    pub slice: u32,
}

/// Backend-neutral GPU command. Upload pages are addressed like buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Barrier {
        handle: RawHandle,
        /// `None` when the previous state is unknown
        from: Option<ResourceState>,
        to: ResourceState,
    },
    CopyBuffer {
        src: RawHandle,
        src_offset: u64,
        dst: RawHandle,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: RawHandle,
        src_offset: u64,
        dst: RawHandle,
        dst_subresource: TextureSubresource,
    },
    CopyTexture {
        src: RawHandle,
        src_subresource: TextureSubresource,
        dst: RawHandle,
        dst_subresource: TextureSubresource,
    },
}

/// Native capability set every backend provides
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn caps(&self) -> BackendCaps;

    /// Create a buffer and its backing memory
    fn create_buffer(&self, desc: &BufferDesc, memory: MemoryClass) -> Result<RawHandle>;

    /// Create a texture and its backing memory. CPU-visible textures use the
    /// linear layout of [`TextureDesc::footprint`].
    fn create_texture(&self, desc: &TextureDesc, memory: MemoryClass) -> Result<RawHandle>;

    /// Create persistently mapped upload memory of `size` bytes
    fn create_upload_page(&self, size: u64) -> Result<(RawHandle, NonNull<u8>)>;

    /// Adopt an externally created native buffer. Destroying the returned
    /// handle forgets the object without destroying it.
    fn import_buffer(&self, desc: &BufferDesc, native: u64) -> Result<RawHandle>;

    /// Pointer to the start of a CPU-visible object's storage
    fn map(&self, handle: RawHandle, access: MapAccess) -> Result<NonNull<u8>>;

    fn unmap(&self, handle: RawHandle, access: MapAccess);

    /// Deleter: destroy a native object and its memory
    fn destroy(&self, handle: RawHandle);

    /// Submit commands, returning the fence value signaled when they finish
    fn submit(&self, commands: &[Command]) -> Result<u64>;

    fn last_completed_fence(&self) -> u64;

    /// Block until `value` has been signaled
    fn wait_for_fence(&self, value: u64) -> Result<()>;

    fn wait_idle(&self) -> Result<()>;
}
