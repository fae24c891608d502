// GPU resources
//
// Buffers and textures share one reference-counted core that owns the
// native handle. Dropping the last owner never destroys the handle directly:
// it is handed to the release queue of the device timeline.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::backend::{RawHandle, TextureSubresource};
use crate::desc::{BindFlags, BufferDesc, BufferMode, ResourceDesc, TextureDesc};
use crate::dynamic_heap::DynamicAllocation;
use crate::error::{EngineError, Result};
use crate::map_state::MapState;
use crate::state::{ResourceState, UsageStateRecord};
use crate::sync::Timeline;

/// Device-unique resource identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u64);

/// Per-context data of a resource
#[derive(Debug, Default)]
pub(crate) struct ContextSlot {
    /// Current dynamic allocation: pending while mapped, then the published
    /// backing region of an aliased buffer
    pub allocation: Option<DynamicAllocation>,
    pub subresource: Option<TextureSubresource>,
}

/// Shared state behind [`Buffer`] and [`Texture`]
pub struct ResourceCore {
    id: ResourceId,
    desc: ResourceDesc,
    native: Option<RawHandle>,
    record: Mutex<UsageStateRecord>,
    slots: Mutex<Vec<ContextSlot>>,
    timeline: Arc<Timeline>,
}

impl ResourceCore {
    pub(crate) fn new(
        id: ResourceId,
        desc: ResourceDesc,
        native: Option<RawHandle>,
        initial_state: Option<ResourceState>,
        num_contexts: usize,
        timeline: Arc<Timeline>,
    ) -> Self {
        Self {
            id,
            desc,
            native,
            record: Mutex::new(UsageStateRecord::new(initial_state, num_contexts)),
            slots: Mutex::new((0..num_contexts).map(|_| ContextSlot::default()).collect()),
            timeline,
        }
    }

    pub(crate) fn id(&self) -> ResourceId {
        self.id
    }

    pub(crate) fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    pub(crate) fn native(&self) -> Option<RawHandle> {
        self.native
    }

    /// Dynamic buffers bound straight from their upload allocation
    pub(crate) fn is_aliased(&self) -> bool {
        self.native.is_none()
    }

    pub(crate) fn record(&self) -> MutexGuard<'_, UsageStateRecord> {
        self.record.lock()
    }

    pub(crate) fn slots(&self) -> MutexGuard<'_, Vec<ContextSlot>> {
        self.slots.lock()
    }
}

impl Drop for ResourceCore {
    fn drop(&mut self) {
        if let Some(handle) = self.native {
            log::debug!("Resource \"{}\" dropped, releasing {:?}", self.desc.name(), handle);
            self.timeline.safe_release(handle);
        }
    }
}

impl std::fmt::Debug for ResourceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCore")
            .field("id", &self.id)
            .field("name", &self.desc.name())
            .field("native", &self.native)
            .finish()
    }
}

/// Anything a context can record commands against
pub trait GpuResource {
    fn resource_desc(&self) -> &ResourceDesc;

    fn id(&self) -> ResourceId;

    #[doc(hidden)]
    fn core(&self) -> &Arc<ResourceCore>;

    /// Usage state on the immediate context's timeline
    fn state(&self) -> Option<ResourceState> {
        self.core().record().state
    }

    fn map_state(&self, context_id: usize) -> MapState {
        self.core().record().map_slots.get(context_id)
    }

    fn native_handle(&self) -> Option<RawHandle> {
        self.core().native()
    }
}

#[derive(Debug, Clone)]
pub struct Buffer {
    core: Arc<ResourceCore>,
}

impl Buffer {
    pub(crate) fn from_core(core: Arc<ResourceCore>) -> Self {
        Self { core }
    }

    pub fn desc(&self) -> &BufferDesc {
        match self.core.desc() {
            ResourceDesc::Buffer(desc) => desc,
            ResourceDesc::Texture(_) => unreachable!("buffer wraps a texture core"),
        }
    }

    pub fn is_aliased(&self) -> bool {
        self.core.is_aliased()
    }

    pub fn create_view(&self, view: BufferViewDesc) -> Result<BufferView> {
        view.validate(self.desc())?;
        Ok(BufferView {
            parent: Arc::downgrade(&self.core),
            desc: view,
        })
    }
}

impl GpuResource for Buffer {
    fn resource_desc(&self) -> &ResourceDesc {
        self.core.desc()
    }

    fn id(&self) -> ResourceId {
        self.core.id()
    }

    fn core(&self) -> &Arc<ResourceCore> {
        &self.core
    }
}

#[derive(Debug, Clone)]
pub struct Texture {
    core: Arc<ResourceCore>,
}

impl Texture {
    pub(crate) fn from_core(core: Arc<ResourceCore>) -> Self {
        Self { core }
    }

    pub fn desc(&self) -> &TextureDesc {
        match self.core.desc() {
            ResourceDesc::Texture(desc) => desc,
            ResourceDesc::Buffer(_) => unreachable!("texture wraps a buffer core"),
        }
    }

    pub fn create_view(&self, view: TextureViewDesc) -> Result<TextureView> {
        view.validate(self.desc())?;
        Ok(TextureView {
            parent: Arc::downgrade(&self.core),
            desc: view,
        })
    }
}

impl GpuResource for Texture {
    fn resource_desc(&self) -> &ResourceDesc {
        self.core.desc()
    }

    fn id(&self) -> ResourceId {
        self.core.id()
    }

    fn core(&self) -> &Arc<ResourceCore> {
        &self.core
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferViewType {
    ShaderResource,
    UnorderedAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferViewDesc {
    pub view_type: BufferViewType,
    pub offset: u64,
    /// Zero means the rest of the buffer
    pub size: u64,
}

impl BufferViewDesc {
    pub fn whole(view_type: BufferViewType) -> Self {
        Self {
            view_type,
            offset: 0,
            size: 0,
        }
    }

    fn validate(&self, desc: &BufferDesc) -> Result<()> {
        let required = match self.view_type {
            BufferViewType::ShaderResource => BindFlags::SHADER_RESOURCE,
            BufferViewType::UnorderedAccess => BindFlags::UNORDERED_ACCESS,
        };
        if !desc.bind_flags.contains(required) {
            return Err(view_error(
                &desc.name,
                &format!("{:?} view requires the {:?} bind flag", self.view_type, required),
            ));
        }
        let size = if self.size == 0 {
            desc.size.saturating_sub(self.offset)
        } else {
            self.size
        };
        let end = self.offset.checked_add(size).filter(|&end| end <= desc.size);
        if size == 0 || end.is_none() {
            return Err(view_error(
                &desc.name,
                &format!(
                    "view range of {} bytes at offset {} is outside the buffer ({} bytes)",
                    size, self.offset, desc.size
                ),
            ));
        }
        if desc.mode == BufferMode::Structured
            && desc.element_stride != 0
            && (self.offset % u64::from(desc.element_stride) != 0
                || size % u64::from(desc.element_stride) != 0)
        {
            return Err(view_error(
                &desc.name,
                "structured view range must be a multiple of the element stride",
            ));
        }
        Ok(())
    }
}

/// Range of a buffer. Does not keep the buffer alive.
#[derive(Debug, Clone)]
pub struct BufferView {
    parent: Weak<ResourceCore>,
    desc: BufferViewDesc,
}

impl BufferView {
    pub fn desc(&self) -> &BufferViewDesc {
        &self.desc
    }

    pub fn buffer(&self) -> Option<Buffer> {
        self.parent.upgrade().map(Buffer::from_core)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureViewType {
    ShaderResource,
    RenderTarget,
    DepthStencil,
    UnorderedAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureViewDesc {
    pub view_type: TextureViewType,
    pub most_detailed_mip: u32,
    /// Zero means every remaining mip
    pub num_mips: u32,
    pub first_slice: u32,
    /// Zero means every remaining slice
    pub num_slices: u32,
}

impl TextureViewDesc {
    pub fn whole(view_type: TextureViewType) -> Self {
        Self {
            view_type,
            most_detailed_mip: 0,
            num_mips: 0,
            first_slice: 0,
            num_slices: 0,
        }
    }

    fn validate(&self, desc: &TextureDesc) -> Result<()> {
        let required = match self.view_type {
            TextureViewType::ShaderResource => BindFlags::SHADER_RESOURCE,
            TextureViewType::RenderTarget => BindFlags::RENDER_TARGET,
            TextureViewType::DepthStencil => BindFlags::DEPTH_STENCIL,
            TextureViewType::UnorderedAccess => BindFlags::UNORDERED_ACCESS,
        };
        if !desc.bind_flags.contains(required) {
            return Err(view_error(
                &desc.name,
                &format!("{:?} view requires the {:?} bind flag", self.view_type, required),
            ));
        }

        let num_mips = if self.num_mips == 0 {
            desc.mip_levels.saturating_sub(self.most_detailed_mip)
        } else {
            self.num_mips
        };
        if num_mips == 0 || self.most_detailed_mip + num_mips > desc.mip_levels {
            return Err(view_error(
                &desc.name,
                &format!(
                    "mip range {}..{} is outside the texture ({} mips)",
                    self.most_detailed_mip,
                    self.most_detailed_mip + num_mips,
                    desc.mip_levels
                ),
            ));
        }
        if matches!(
            self.view_type,
            TextureViewType::RenderTarget | TextureViewType::DepthStencil
        ) && num_mips != 1
        {
            return Err(view_error(
                &desc.name,
                "render target and depth-stencil views address exactly one mip",
            ));
        }

        let num_slices = if self.num_slices == 0 {
            desc.array_size().saturating_sub(self.first_slice)
        } else {
            self.num_slices
        };
        if num_slices == 0 || self.first_slice + num_slices > desc.array_size() {
            return Err(view_error(
                &desc.name,
                &format!(
                    "slice range {}..{} is outside the texture ({} slices)",
                    self.first_slice,
                    self.first_slice + num_slices,
                    desc.array_size()
                ),
            ));
        }
        Ok(())
    }
}

/// Subresource range of a texture. Does not keep the texture alive.
#[derive(Debug, Clone)]
pub struct TextureView {
    parent: Weak<ResourceCore>,
    desc: TextureViewDesc,
}

impl TextureView {
    pub fn desc(&self) -> &TextureViewDesc {
        &self.desc
    }

    pub fn texture(&self) -> Option<Texture> {
        self.parent.upgrade().map(Texture::from_core)
    }
}

fn view_error(name: &str, message: &str) -> EngineError {
    EngineError::Configuration(format!("Resource \"{}\": {}", name, message))
}
