// Render device - resource factory
//
// Owns the queue timeline, the upload page pool and the frame counter that
// every context of the device shares. Resources are validated here before
// any native object exists.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{
    Backend, BackendCaps, Command, HostBackend, RawHandle, TextureSubresource, VulkanBackend,
};
use crate::config::{BackendKind, DynamicHeapConfig, EngineConfig, ValidationConfig};
use crate::context::DeviceContext;
use crate::desc::{BindFlags, BufferDesc, ResourceDesc, TextureDesc, Usage};
use crate::dynamic_heap::{PagePool, PagePoolStats, UploadPage};
use crate::error::{report, Result};
use crate::memory::MemoryClass;
use crate::resource::{Buffer, ResourceCore, ResourceId, Texture};
use crate::state::ResourceState;
use crate::sync::{Fence, Timeline};

/// State shared by the device and all of its contexts
pub(crate) struct DeviceShared {
    pub timeline: Arc<Timeline>,
    pub page_pool: PagePool,
    frame: AtomicU64,
    next_resource_id: AtomicU64,
    pub num_contexts: usize,
    pub validation: ValidationConfig,
    pub heap: DynamicHeapConfig,
    pub caps: BackendCaps,
}

impl DeviceShared {
    pub fn backend(&self) -> &Arc<dyn Backend> {
        self.timeline.backend()
    }

    pub fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    pub fn advance_frame(&self) -> u64 {
        self.frame.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Log `err` and panic on protocol violations when configured to
    pub fn report(&self, err: crate::error::EngineError) -> crate::error::EngineError {
        report(err, self.validation.assert_on_violation)
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        log::info!("Destroying render device...");
        if let Err(err) = self.timeline.idle() {
            log::error!("Failed to idle the GPU during teardown: {}", err);
        }
        self.page_pool.clear();
        let released = self.timeline.release_queue().drain_all();
        log::debug!("Released {} native objects at teardown", released);
    }
}

/// Snapshot of the lifetime machinery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub frame: u64,
    pub last_submitted_fence: u64,
    pub last_completed_fence: u64,
    pub pending_releases: usize,
    pub finalized_releases: u64,
    pub pages: PagePoolStats,
}

/// Factory for buffers, textures and fences
#[derive(Clone)]
pub struct RenderDevice {
    shared: Arc<DeviceShared>,
}

impl RenderDevice {
    /// Create a device from configuration, with its immediate context and
    /// `num_deferred_contexts` deferred contexts.
    pub fn create(config: &EngineConfig) -> Result<(RenderDevice, DeviceContext, Vec<DeviceContext>)> {
        let backend: Arc<dyn Backend> = match config.device.backend {
            BackendKind::Host => Arc::new(HostBackend::new()),
            BackendKind::Vulkan => Arc::new(VulkanBackend::new(&config.device)?),
            BackendKind::Auto => match VulkanBackend::new(&config.device) {
                Ok(backend) => Arc::new(backend),
                Err(err) => {
                    log::warn!("Vulkan backend unavailable ({}), using the host backend", err);
                    Arc::new(HostBackend::new())
                }
            },
        };
        Self::with_backend(backend, config)
    }

    pub fn with_backend(
        backend: Arc<dyn Backend>,
        config: &EngineConfig,
    ) -> Result<(RenderDevice, DeviceContext, Vec<DeviceContext>)> {
        config.validate()?;
        log::info!(
            "Creating render device on the {} backend ({} deferred contexts)",
            backend.name(),
            config.device.num_deferred_contexts
        );

        let caps = backend.caps();
        let timeline = Arc::new(Timeline::new(backend));
        let shared = Arc::new(DeviceShared {
            page_pool: PagePool::new(Arc::clone(&timeline), config.dynamic_heap.page_size),
            timeline,
            frame: AtomicU64::new(0),
            next_resource_id: AtomicU64::new(1),
            num_contexts: config.num_contexts(),
            validation: config.validation.clone(),
            heap: config.dynamic_heap.clone(),
            caps,
        });

        let immediate = DeviceContext::immediate(Arc::clone(&shared));
        let deferred = (1..shared.num_contexts)
            .map(|id| DeviceContext::deferred(id, Arc::clone(&shared)))
            .collect();
        Ok((RenderDevice { shared }, immediate, deferred))
    }

    pub fn backend_name(&self) -> &'static str {
        self.shared.backend().name()
    }

    pub fn caps(&self) -> BackendCaps {
        self.shared.caps
    }

    pub fn current_frame(&self) -> u64 {
        self.shared.current_frame()
    }

    fn next_id(&self) -> ResourceId {
        ResourceId(self.shared.next_resource_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a buffer, optionally initialized with `initial_data`.
    pub fn create_buffer(&self, desc: &BufferDesc, initial_data: Option<&[u8]>) -> Result<Buffer> {
        desc.validate(initial_data).map_err(|e| self.shared.report(e))?;

        let aliased = self.shared.caps.dynamic_aliasing
            && desc.usage == Usage::Dynamic
            && !desc
                .bind_flags
                .intersects(BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS);

        let (native, state) = if aliased {
            (None, ResourceState::GENERIC_READ)
        } else {
            let handle = self
                .shared
                .backend()
                .create_buffer(desc, MemoryClass::for_usage(desc.usage, desc.cpu_access))
                .map_err(|e| self.shared.report(e))?;
            let state = if initial_data.is_some() {
                ResourceState::COPY_DEST
            } else {
                ResourceState::UNDEFINED
            };
            (Some(handle), state)
        };

        let core = Arc::new(ResourceCore::new(
            self.next_id(),
            ResourceDesc::Buffer(desc.clone()),
            native,
            Some(state),
            self.shared.num_contexts,
            Arc::clone(&self.shared.timeline),
        ));

        if let (Some(handle), Some(data)) = (native, initial_data) {
            // On failure `core` is dropped and the native buffer released
            self.upload_initial_data(handle, desc.size, data, |page| {
                vec![Command::CopyBuffer {
                    src: page,
                    src_offset: 0,
                    dst: handle,
                    dst_offset: 0,
                    size: data.len() as u64,
                }]
            })
            .map_err(|e| self.shared.report(e))?;
        }

        log::debug!(
            "Created buffer \"{}\" ({} bytes, {:?}{})",
            desc.name,
            desc.size,
            desc.usage,
            if aliased { ", aliased" } else { "" }
        );
        Ok(Buffer::from_core(core))
    }

    /// Create a texture. Initial data uses the linear layout of
    /// [`TextureDesc::footprint`].
    pub fn create_texture(&self, desc: &TextureDesc, initial_data: Option<&[u8]>) -> Result<Texture> {
        desc.validate(initial_data).map_err(|e| self.shared.report(e))?;

        let handle = self
            .shared
            .backend()
            .create_texture(desc, MemoryClass::for_usage(desc.usage, desc.cpu_access))
            .map_err(|e| self.shared.report(e))?;
        let state = if initial_data.is_some() {
            ResourceState::COPY_DEST
        } else {
            ResourceState::UNDEFINED
        };
        let core = Arc::new(ResourceCore::new(
            self.next_id(),
            ResourceDesc::Texture(desc.clone()),
            Some(handle),
            Some(state),
            self.shared.num_contexts,
            Arc::clone(&self.shared.timeline),
        ));

        if let Some(data) = initial_data {
            self.upload_initial_data(handle, desc.linear_size(), data, |page| {
                (0..desc.array_size())
                    .flat_map(|slice| (0..desc.mip_levels).map(move |mip| (mip, slice)))
                    .filter_map(|(mip, slice)| {
                        let footprint = desc.footprint(mip, slice)?;
                        Some(Command::CopyBufferToTexture {
                            src: page,
                            src_offset: footprint.offset,
                            dst: handle,
                            dst_subresource: TextureSubresource { mip, slice },
                        })
                    })
                    .collect()
            })
            .map_err(|e| self.shared.report(e))?;
        }

        log::debug!(
            "Created texture \"{}\" ({}x{}x{}, {} mips, {:?})",
            desc.name,
            desc.width,
            desc.height,
            desc.depth_or_array_size,
            desc.mip_levels,
            desc.usage
        );
        Ok(Texture::from_core(core))
    }

    /// Stage `data` in a dedicated upload page and submit the copies right
    /// away, ahead of anything a context records against the resource.
    fn upload_initial_data(
        &self,
        handle: RawHandle,
        size: u64,
        data: &[u8],
        copies: impl FnOnce(RawHandle) -> Vec<Command>,
    ) -> Result<()> {
        let page = UploadPage::new(&self.shared.timeline, size, true)?;
        page.write(0, data)?;

        let mut commands = vec![Command::Barrier {
            handle,
            from: Some(ResourceState::UNDEFINED),
            to: ResourceState::COPY_DEST,
        }];
        commands.extend(copies(page.handle()));
        self.shared.timeline.submit(&commands)?;
        // Released after the upload's fence
        drop(page);
        Ok(())
    }

    /// Wrap an externally created native buffer. Its usage state is unknown
    /// unless `initial_state` says otherwise.
    pub fn import_buffer(
        &self,
        desc: &BufferDesc,
        native: u64,
        initial_state: Option<ResourceState>,
    ) -> Result<Buffer> {
        desc.validate(None).map_err(|e| self.shared.report(e))?;
        let handle = self
            .shared
            .backend()
            .import_buffer(desc, native)
            .map_err(|e| self.shared.report(e))?;
        log::debug!("Imported buffer \"{}\" as {:?}", desc.name, handle);
        Ok(Buffer::from_core(Arc::new(ResourceCore::new(
            self.next_id(),
            ResourceDesc::Buffer(desc.clone()),
            Some(handle),
            initial_state,
            self.shared.num_contexts,
            Arc::clone(&self.shared.timeline),
        ))))
    }

    pub fn create_fence(&self, name: impl Into<String>) -> Fence {
        Fence::new(name, Arc::clone(&self.shared.timeline))
    }

    /// Block until all submitted work has completed, then release what it
    /// was holding on to.
    pub fn idle_gpu(&self) -> Result<()> {
        self.shared.timeline.idle()?;
        self.release_stale_resources(false);
        Ok(())
    }

    /// Finalize releases whose fence has completed. `force` also releases
    /// everything else, which is only valid once the GPU is idle.
    pub fn release_stale_resources(&self, force: bool) -> usize {
        let timeline = &self.shared.timeline;
        let released = if force {
            timeline.release_queue().drain_all()
        } else {
            timeline.purge()
        };
        self.shared.page_pool.reclaim(timeline.last_completed());
        released
    }

    pub fn stats(&self) -> DeviceStats {
        let timeline = &self.shared.timeline;
        DeviceStats {
            frame: self.shared.current_frame(),
            last_submitted_fence: timeline.last_submitted(),
            last_completed_fence: timeline.last_completed(),
            pending_releases: timeline.release_queue().len(),
            finalized_releases: timeline.release_queue().finalized_count(),
            pages: self.shared.page_pool.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{CpuAccess, TextureFormat};
    use crate::resource::GpuResource;

    fn host_device(caps: BackendCaps) -> (Arc<HostBackend>, RenderDevice, DeviceContext) {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = Arc::new(HostBackend::new().with_caps(caps));
        let (device, immediate, _) =
            RenderDevice::with_backend(backend.clone(), &EngineConfig::default()).unwrap();
        (backend, device, immediate)
    }

    fn no_caps() -> BackendCaps {
        BackendCaps {
            dynamic_aliasing: false,
        }
    }

    #[test]
    fn immutable_buffer_is_uploaded_at_creation() {
        let (backend, device, _ctx) = host_device(no_caps());
        let desc = BufferDesc::new("vb", 8)
            .usage(Usage::Immutable)
            .bind_flags(BindFlags::VERTEX_BUFFER);
        assert!(device.create_buffer(&desc, None).unwrap_err().is_configuration());

        let buffer = device.create_buffer(&desc, Some(&[1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        assert_eq!(buffer.state(), Some(ResourceState::COPY_DEST));
        device.idle_gpu().unwrap();
        let handle = buffer.native_handle().unwrap();
        assert_eq!(backend.read_object(handle).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        // Only the buffer survives; the upload page went through the queue
        assert_eq!(backend.live_objects(), 1);
    }

    #[test]
    fn texture_initial_data_fills_every_subresource() {
        let (backend, device, _ctx) = host_device(no_caps());
        let desc = TextureDesc::new_2d("t", 2, 2, TextureFormat::R8Unorm).mip_levels(2);
        let data: Vec<u8> = (1..=5).collect();
        let texture = device.create_texture(&desc, Some(&data)).unwrap();
        device.idle_gpu().unwrap();
        assert_eq!(
            backend.read_object(texture.native_handle().unwrap()).unwrap(),
            data
        );
        assert_eq!(backend.stats().copies, 2);
    }

    #[test]
    fn aliased_dynamic_buffers_have_no_native_object() {
        let caps = BackendCaps {
            dynamic_aliasing: true,
        };
        let (backend, device, _ctx) = host_device(caps);
        let desc = BufferDesc::new("cb", 256)
            .usage(Usage::Dynamic)
            .bind_flags(BindFlags::UNIFORM_BUFFER)
            .cpu_access(CpuAccess::WRITE);
        let buffer = device.create_buffer(&desc, None).unwrap();
        assert!(buffer.is_aliased());
        assert_eq!(buffer.state(), Some(ResourceState::GENERIC_READ));

        let srv = device
            .create_buffer(
                &desc.clone().bind_flags(BindFlags::SHADER_RESOURCE).structured(16),
                None,
            )
            .unwrap();
        assert!(!srv.is_aliased());
        assert_eq!(backend.live_objects(), 1);
    }

    #[test]
    fn imported_buffers_start_in_unknown_state() {
        let (_backend, device, _ctx) = host_device(no_caps());
        let buffer = device
            .import_buffer(&BufferDesc::new("ext", 64), 0xdead, None)
            .unwrap();
        assert_eq!(buffer.state(), None);
    }

    #[test]
    fn exhaustion_leaves_nothing_behind() {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = Arc::new(HostBackend::new().with_memory_budget(64));
        let (device, _ctx, _) =
            RenderDevice::with_backend(backend.clone(), &EngineConfig::default()).unwrap();
        let desc = BufferDesc::new("big", 48).usage(Usage::Immutable);
        // The buffer fits, its upload page does not
        let err = device.create_buffer(&desc, Some(&[0u8; 48])).unwrap_err();
        assert!(matches!(err, crate::error::EngineError::ResourceExhaustion(_)));
        device.idle_gpu().unwrap();
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn dropping_the_device_releases_everything() {
        let (backend, device, ctx) = host_device(no_caps());
        let buffer = device.create_buffer(&BufferDesc::new("b", 16), None).unwrap();
        drop(buffer);
        drop(ctx);
        drop(device);
        assert_eq!(backend.live_objects(), 0);
    }
}
