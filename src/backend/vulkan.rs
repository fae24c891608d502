// Vulkan backend
//
// Native objects live in a handle table behind one lock. Each submission
// records the engine commands into a one-time command buffer and signals the
// next value of the queue's timeline semaphore, which is the fence value the
// release queue keys on.
//
// CPU-visible textures are linear buffers laid out like
// `TextureDesc::footprint`, so mapping them needs no image tiling queries.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use ash::vk::{self, Handle};
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use super::buffer::{
    aspect_mask, buffer_usage, create_buffer, create_image, free, memory_location,
    upload_page_usage,
};
use super::device::VulkanDevice;
use super::sync::{CommandRecycler, QueueTimeline};
use super::{Backend, BackendCaps, Command, MapAccess, RawHandle, TextureSubresource};
use crate::config::DeviceConfig;
use crate::desc::{BufferDesc, TextureDesc, TextureDimension};
use crate::error::{EngineError, Result};
use crate::memory::MemoryClass;
use crate::state::ResourceState;

enum VulkanObject {
    /// Buffers and upload pages. Imported buffers have no allocation and
    /// are only forgotten on destroy.
    Buffer {
        buffer: vk::Buffer,
        allocation: Option<Allocation>,
    },
    Image {
        image: vk::Image,
        allocation: Allocation,
        desc: TextureDesc,
    },
    LinearTexture {
        buffer: vk::Buffer,
        allocation: Allocation,
        desc: TextureDesc,
    },
}

impl VulkanObject {
    fn as_buffer(&self) -> Option<vk::Buffer> {
        match self {
            VulkanObject::Buffer { buffer, .. } | VulkanObject::LinearTexture { buffer, .. } => {
                Some(*buffer)
            }
            VulkanObject::Image { .. } => None,
        }
    }

    fn allocation(&self) -> Option<&Allocation> {
        match self {
            VulkanObject::Buffer { allocation, .. } => allocation.as_ref(),
            VulkanObject::Image { allocation, .. } | VulkanObject::LinearTexture { allocation, .. } => {
                Some(allocation)
            }
        }
    }
}

struct VulkanInner {
    objects: HashMap<RawHandle, VulkanObject>,
    next_fence: u64,
    recycler: CommandRecycler,
}

/// Access, pipeline stages and image layout implied by a usage state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StateAccess {
    access: vk::AccessFlags,
    stages: vk::PipelineStageFlags,
    layout: vk::ImageLayout,
}

fn state_table() -> [(ResourceState, vk::AccessFlags, vk::PipelineStageFlags, Option<vk::ImageLayout>); 13] {
    let shaders = vk::PipelineStageFlags::VERTEX_SHADER
        | vk::PipelineStageFlags::FRAGMENT_SHADER
        | vk::PipelineStageFlags::COMPUTE_SHADER;
    [
        (
            ResourceState::UNDEFINED,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
            Some(vk::ImageLayout::UNDEFINED),
        ),
        (
            ResourceState::VERTEX_BUFFER,
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            vk::PipelineStageFlags::VERTEX_INPUT,
            None,
        ),
        (
            ResourceState::CONSTANT_BUFFER,
            vk::AccessFlags::UNIFORM_READ,
            shaders,
            None,
        ),
        (
            ResourceState::INDEX_BUFFER,
            vk::AccessFlags::INDEX_READ,
            vk::PipelineStageFlags::VERTEX_INPUT,
            None,
        ),
        (
            ResourceState::RENDER_TARGET,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            Some(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        ),
        (
            ResourceState::UNORDERED_ACCESS,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            shaders,
            Some(vk::ImageLayout::GENERAL),
        ),
        (
            ResourceState::DEPTH_WRITE,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            Some(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        ),
        (
            ResourceState::DEPTH_READ,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            Some(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL),
        ),
        (
            ResourceState::SHADER_RESOURCE,
            vk::AccessFlags::SHADER_READ,
            shaders,
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        ),
        (
            ResourceState::INDIRECT_ARGUMENT,
            vk::AccessFlags::INDIRECT_COMMAND_READ,
            vk::PipelineStageFlags::DRAW_INDIRECT,
            None,
        ),
        (
            ResourceState::COPY_DEST,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
            Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
        ),
        (
            ResourceState::COPY_SOURCE,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
            Some(vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
        ),
        // Headless device: no swapchain layout to present from
        (
            ResourceState::PRESENT,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            Some(vk::ImageLayout::GENERAL),
        ),
    ]
}

fn state_access(state: ResourceState) -> StateAccess {
    let mut access = vk::AccessFlags::empty();
    let mut stages = vk::PipelineStageFlags::empty();
    let mut layout = None;
    for (flag, flag_access, flag_stages, flag_layout) in state_table() {
        if !state.contains(flag) {
            continue;
        }
        access |= flag_access;
        stages |= flag_stages;
        if let Some(flag_layout) = flag_layout {
            // Combined read states share the general layout
            layout = match layout {
                None => Some(flag_layout),
                Some(previous) if previous == flag_layout => Some(previous),
                Some(_) => Some(vk::ImageLayout::GENERAL),
            };
        }
    }
    StateAccess {
        access,
        stages,
        layout: layout.unwrap_or(vk::ImageLayout::GENERAL),
    }
}

/// Source and destination scopes of a barrier between two usage states
fn barrier_scopes(from: Option<ResourceState>, to: ResourceState) -> (StateAccess, StateAccess) {
    let src = match from {
        Some(from) => state_access(from),
        // Unknown history: wait for everything
        None => StateAccess {
            access: vk::AccessFlags::MEMORY_WRITE,
            stages: vk::PipelineStageFlags::ALL_COMMANDS,
            layout: vk::ImageLayout::UNDEFINED,
        },
    };
    let mut dst = state_access(to);
    if dst.layout == vk::ImageLayout::UNDEFINED {
        // Not a legal target layout
        dst.layout = vk::ImageLayout::GENERAL;
    }
    if dst.stages.is_empty() || dst.stages == vk::PipelineStageFlags::TOP_OF_PIPE {
        dst.stages = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
    }
    let src = StateAccess {
        stages: if src.stages.is_empty() {
            vk::PipelineStageFlags::TOP_OF_PIPE
        } else {
            src.stages
        },
        ..src
    };
    (src, dst)
}

fn subresource_layers(desc: &TextureDesc, subresource: TextureSubresource) -> vk::ImageSubresourceLayers {
    let (base_array_layer, layer_count) = match desc.dimension {
        TextureDimension::Tex3D => (0, 1),
        _ => (subresource.slice, 1),
    };
    vk::ImageSubresourceLayers {
        aspect_mask: aspect_mask(desc.format),
        mip_level: subresource.mip,
        base_array_layer,
        layer_count,
    }
}

/// Copy region between a tightly packed buffer range and an image subresource
fn buffer_image_region(
    desc: &TextureDesc,
    subresource: TextureSubresource,
    buffer_offset: u64,
) -> Result<vk::BufferImageCopy> {
    let footprint = desc
        .footprint(subresource.mip, subresource.slice)
        .ok_or_else(|| missing_subresource(desc, subresource))?;
    Ok(vk::BufferImageCopy {
        buffer_offset,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: subresource_layers(desc, subresource),
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width: footprint.width,
            height: footprint.height,
            depth: footprint.depth,
        },
    })
}

fn missing_subresource(desc: &TextureDesc, subresource: TextureSubresource) -> EngineError {
    EngineError::ProtocolViolation(format!(
        "Texture \"{}\" has no subresource {:?}",
        desc.name, subresource
    ))
}

pub struct VulkanBackend {
    device: Arc<VulkanDevice>,
    timeline: QueueTimeline,
    next_handle: AtomicU64,
    inner: Mutex<VulkanInner>,
}

impl VulkanBackend {
    pub fn new(config: &DeviceConfig) -> anyhow::Result<Self> {
        let device = VulkanDevice::new(&config.app_name, config.validation_layers)?;
        let timeline = QueueTimeline::new(&device.device)?;
        let recycler = match CommandRecycler::new(&device.device, device.queue_family) {
            Ok(recycler) => recycler,
            Err(err) => {
                timeline.destroy(&device.device);
                return Err(err);
            }
        };

        Ok(Self {
            device,
            timeline,
            next_handle: AtomicU64::new(1),
            inner: Mutex::new(VulkanInner {
                objects: HashMap::new(),
                next_fence: 1,
                recycler,
            }),
        })
    }

    fn next_handle(&self) -> Result<RawHandle> {
        RawHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed))
            .ok_or_else(|| EngineError::ResourceExhaustion("Handle space exhausted".into()))
    }

    fn insert(&self, handle: RawHandle, object: VulkanObject) -> RawHandle {
        self.inner.lock().objects.insert(handle, object);
        handle
    }

    fn destroy_object(&self, object: VulkanObject) {
        let device = &self.device.device;
        match object {
            VulkanObject::Buffer {
                buffer,
                allocation: Some(allocation),
            } => {
                unsafe { device.destroy_buffer(buffer, None) };
                free(&self.device, allocation);
            }
            VulkanObject::Buffer {
                buffer,
                allocation: None,
            } => {
                log::debug!("Forgetting imported buffer {:#x}", buffer.as_raw());
            }
            VulkanObject::LinearTexture {
                buffer, allocation, ..
            } => {
                unsafe { device.destroy_buffer(buffer, None) };
                free(&self.device, allocation);
            }
            VulkanObject::Image {
                image, allocation, ..
            } => {
                unsafe { device.destroy_image(image, None) };
                free(&self.device, allocation);
            }
        }
    }

    fn lookup<'a>(
        objects: &'a HashMap<RawHandle, VulkanObject>,
        handle: RawHandle,
    ) -> Result<&'a VulkanObject> {
        objects.get(&handle).ok_or_else(|| {
            EngineError::ProtocolViolation(format!("Command references destroyed object {:?}", handle))
        })
    }

    fn lookup_buffer(objects: &HashMap<RawHandle, VulkanObject>, handle: RawHandle) -> Result<vk::Buffer> {
        Self::lookup(objects, handle)?.as_buffer().ok_or_else(|| {
            EngineError::ProtocolViolation(format!("Object {:?} is not a buffer", handle))
        })
    }

    fn record_all(
        &self,
        objects: &HashMap<RawHandle, VulkanObject>,
        cmd: vk::CommandBuffer,
        commands: &[Command],
    ) -> Result<()> {
        let device = &self.device.device;
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .context("Failed to begin command buffer")?;
        for command in commands {
            self.record(objects, cmd, command)?;
        }
        unsafe { device.end_command_buffer(cmd) }.context("Failed to end command buffer")?;
        Ok(())
    }

    fn record(
        &self,
        objects: &HashMap<RawHandle, VulkanObject>,
        cmd: vk::CommandBuffer,
        command: &Command,
    ) -> Result<()> {
        let device = &self.device.device;
        match command {
            Command::Barrier { handle, from, to } => {
                let (src, dst) = barrier_scopes(*from, *to);
                match Self::lookup(objects, *handle)? {
                    VulkanObject::Image { image, desc, .. } => {
                        let barrier = vk::ImageMemoryBarrier::builder()
                            .src_access_mask(src.access)
                            .dst_access_mask(dst.access)
                            .old_layout(src.layout)
                            .new_layout(dst.layout)
                            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .image(*image)
                            .subresource_range(vk::ImageSubresourceRange {
                                aspect_mask: aspect_mask(desc.format),
                                base_mip_level: 0,
                                level_count: vk::REMAINING_MIP_LEVELS,
                                base_array_layer: 0,
                                layer_count: vk::REMAINING_ARRAY_LAYERS,
                            })
                            .build();
                        unsafe {
                            device.cmd_pipeline_barrier(
                                cmd,
                                src.stages,
                                dst.stages,
                                vk::DependencyFlags::empty(),
                                &[],
                                &[],
                                &[barrier],
                            )
                        };
                    }
                    _ => {
                        // Buffers have no layout; a global barrier covers them
                        let barrier = vk::MemoryBarrier::builder()
                            .src_access_mask(src.access)
                            .dst_access_mask(dst.access)
                            .build();
                        unsafe {
                            device.cmd_pipeline_barrier(
                                cmd,
                                src.stages,
                                dst.stages,
                                vk::DependencyFlags::empty(),
                                &[barrier],
                                &[],
                                &[],
                            )
                        };
                    }
                }
            }
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let src = Self::lookup_buffer(objects, *src)?;
                let dst = Self::lookup_buffer(objects, *dst)?;
                let region = vk::BufferCopy {
                    src_offset: *src_offset,
                    dst_offset: *dst_offset,
                    size: *size,
                };
                unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
            }
            Command::CopyBufferToTexture {
                src,
                src_offset,
                dst,
                dst_subresource,
            } => {
                let src = Self::lookup_buffer(objects, *src)?;
                match Self::lookup(objects, *dst)? {
                    VulkanObject::Image { image, desc, .. } => {
                        let region = buffer_image_region(desc, *dst_subresource, *src_offset)?;
                        unsafe {
                            device.cmd_copy_buffer_to_image(
                                cmd,
                                src,
                                *image,
                                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                                &[region],
                            )
                        };
                    }
                    VulkanObject::LinearTexture { buffer, desc, .. } => {
                        let footprint = desc
                            .footprint(dst_subresource.mip, dst_subresource.slice)
                            .ok_or_else(|| missing_subresource(desc, *dst_subresource))?;
                        let region = vk::BufferCopy {
                            src_offset: *src_offset,
                            dst_offset: footprint.offset,
                            size: footprint.size,
                        };
                        unsafe { device.cmd_copy_buffer(cmd, src, *buffer, &[region]) };
                    }
                    VulkanObject::Buffer { .. } => {
                        return Err(EngineError::ProtocolViolation(format!(
                            "Object {:?} is not a texture",
                            dst
                        )));
                    }
                }
            }
            Command::CopyTexture {
                src,
                src_subresource,
                dst,
                dst_subresource,
            } => {
                self.record_texture_copy(
                    cmd,
                    Self::lookup(objects, *src)?,
                    *src_subresource,
                    Self::lookup(objects, *dst)?,
                    *dst_subresource,
                )?;
            }
        }
        Ok(())
    }

    fn record_texture_copy(
        &self,
        cmd: vk::CommandBuffer,
        src: &VulkanObject,
        src_subresource: TextureSubresource,
        dst: &VulkanObject,
        dst_subresource: TextureSubresource,
    ) -> Result<()> {
        let device = &self.device.device;
        match (src, dst) {
            (
                VulkanObject::Image {
                    image: src_image,
                    desc: src_desc,
                    ..
                },
                VulkanObject::Image {
                    image: dst_image,
                    desc: dst_desc,
                    ..
                },
            ) => {
                let footprint = src_desc
                    .footprint(src_subresource.mip, src_subresource.slice)
                    .ok_or_else(|| missing_subresource(src_desc, src_subresource))?;
                let region = vk::ImageCopy {
                    src_subresource: subresource_layers(src_desc, src_subresource),
                    src_offset: vk::Offset3D::default(),
                    dst_subresource: subresource_layers(dst_desc, dst_subresource),
                    dst_offset: vk::Offset3D::default(),
                    extent: vk::Extent3D {
                        width: footprint.width,
                        height: footprint.height,
                        depth: footprint.depth,
                    },
                };
                unsafe {
                    device.cmd_copy_image(
                        cmd,
                        *src_image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        *dst_image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    )
                };
            }
            (
                VulkanObject::Image { image, desc, .. },
                VulkanObject::LinearTexture {
                    buffer,
                    desc: dst_desc,
                    ..
                },
            ) => {
                let footprint = dst_desc
                    .footprint(dst_subresource.mip, dst_subresource.slice)
                    .ok_or_else(|| missing_subresource(dst_desc, dst_subresource))?;
                let region = buffer_image_region(desc, src_subresource, footprint.offset)?;
                unsafe {
                    device.cmd_copy_image_to_buffer(
                        cmd,
                        *image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        *buffer,
                        &[region],
                    )
                };
            }
            (
                VulkanObject::LinearTexture {
                    buffer,
                    desc: src_desc,
                    ..
                },
                VulkanObject::Image { image, desc, .. },
            ) => {
                let footprint = src_desc
                    .footprint(src_subresource.mip, src_subresource.slice)
                    .ok_or_else(|| missing_subresource(src_desc, src_subresource))?;
                let region = buffer_image_region(desc, dst_subresource, footprint.offset)?;
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        *buffer,
                        *image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    )
                };
            }
            (
                VulkanObject::LinearTexture {
                    buffer: src_buffer,
                    desc: src_desc,
                    ..
                },
                VulkanObject::LinearTexture {
                    buffer: dst_buffer,
                    desc: dst_desc,
                    ..
                },
            ) => {
                let src_footprint = src_desc
                    .footprint(src_subresource.mip, src_subresource.slice)
                    .ok_or_else(|| missing_subresource(src_desc, src_subresource))?;
                let dst_footprint = dst_desc
                    .footprint(dst_subresource.mip, dst_subresource.slice)
                    .ok_or_else(|| missing_subresource(dst_desc, dst_subresource))?;
                let region = vk::BufferCopy {
                    src_offset: src_footprint.offset,
                    dst_offset: dst_footprint.offset,
                    size: src_footprint.size,
                };
                unsafe { device.cmd_copy_buffer(cmd, *src_buffer, *dst_buffer, &[region]) };
            }
            _ => {
                return Err(EngineError::ProtocolViolation(
                    "Texture copy between non-texture objects".into(),
                ));
            }
        }
        Ok(())
    }
}

impl Backend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn caps(&self) -> BackendCaps {
        BackendCaps {
            dynamic_aliasing: true,
        }
    }

    fn create_buffer(&self, desc: &BufferDesc, memory: MemoryClass) -> Result<RawHandle> {
        let handle = self.next_handle()?;
        let (buffer, allocation) = create_buffer(
            &self.device,
            &desc.name,
            desc.size,
            buffer_usage(desc),
            memory_location(memory),
        )?;
        Ok(self.insert(
            handle,
            VulkanObject::Buffer {
                buffer,
                allocation: Some(allocation),
            },
        ))
    }

    fn create_texture(&self, desc: &TextureDesc, memory: MemoryClass) -> Result<RawHandle> {
        let handle = self.next_handle()?;
        let object = if memory.is_host_visible() {
            let (buffer, allocation) = create_buffer(
                &self.device,
                &desc.name,
                desc.linear_size(),
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                memory_location(memory),
            )?;
            VulkanObject::LinearTexture {
                buffer,
                allocation,
                desc: desc.clone(),
            }
        } else {
            let (image, allocation) = create_image(&self.device, desc)?;
            VulkanObject::Image {
                image,
                allocation,
                desc: desc.clone(),
            }
        };
        Ok(self.insert(handle, object))
    }

    fn create_upload_page(&self, size: u64) -> Result<(RawHandle, NonNull<u8>)> {
        let handle = self.next_handle()?;
        let (buffer, allocation) = create_buffer(
            &self.device,
            "upload page",
            size,
            upload_page_usage(),
            MemoryLocation::CpuToGpu,
        )?;
        let Some(ptr) = allocation.mapped_ptr() else {
            self.destroy_object(VulkanObject::Buffer {
                buffer,
                allocation: Some(allocation),
            });
            return Err(EngineError::ResourceExhaustion(
                "Upload page memory is not host visible".into(),
            ));
        };
        let ptr = ptr.cast::<u8>();
        Ok((
            self.insert(
                handle,
                VulkanObject::Buffer {
                    buffer,
                    allocation: Some(allocation),
                },
            ),
            ptr,
        ))
    }

    fn import_buffer(&self, desc: &BufferDesc, native: u64) -> Result<RawHandle> {
        if native == 0 {
            return Err(EngineError::Configuration(format!(
                "Buffer \"{}\": cannot import a null VkBuffer",
                desc.name
            )));
        }
        let handle = self.next_handle()?;
        log::debug!("Adopting VkBuffer {:#x} as \"{}\"", native, desc.name);
        Ok(self.insert(
            handle,
            VulkanObject::Buffer {
                buffer: vk::Buffer::from_raw(native),
                allocation: None,
            },
        ))
    }

    fn map(&self, handle: RawHandle, access: MapAccess) -> Result<NonNull<u8>> {
        let inner = self.inner.lock();
        let object = inner.objects.get(&handle).ok_or_else(|| {
            EngineError::ProtocolViolation(format!("Mapping destroyed object {:?}", handle))
        })?;
        // gpu-allocator only hands out coherent host-visible memory
        object
            .allocation()
            .and_then(|allocation| allocation.mapped_ptr())
            .map(|ptr| ptr.cast::<u8>())
            .ok_or_else(|| {
                EngineError::ProtocolViolation(format!(
                    "Object {:?} is not host visible and cannot be mapped for {:?}",
                    handle, access
                ))
            })
    }

    fn unmap(&self, handle: RawHandle, access: MapAccess) {
        log::trace!("Unmapped {:?} ({:?})", handle, access);
    }

    fn destroy(&self, handle: RawHandle) {
        let object = self.inner.lock().objects.remove(&handle);
        match object {
            Some(object) => self.destroy_object(object),
            None => log::error!("Destroying unknown object {:?}", handle),
        }
    }

    fn submit(&self, commands: &[Command]) -> Result<u64> {
        let device = &self.device.device;
        let mut inner = self.inner.lock();
        let completed = self.timeline.completed(device);
        let cmd = inner.recycler.acquire(device, completed)?;

        if let Err(err) = self.record_all(&inner.objects, cmd, commands) {
            inner.recycler.release(cmd);
            return Err(err);
        }

        let value = inner.next_fence;
        let command_buffers = [cmd];
        let semaphores = [self.timeline.semaphore];
        let values = [value];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&values);
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);

        let submitted =
            unsafe { device.queue_submit(self.device.queue, &[submit_info.build()], vk::Fence::null()) };
        if let Err(err) = submitted {
            inner.recycler.release(cmd);
            return Err(anyhow::Error::from(err)
                .context("Queue submission failed")
                .into());
        }

        inner.next_fence += 1;
        inner.recycler.retire(value, cmd);
        log::trace!(
            "Submitted {} commands at fence {} ({} command buffers in flight)",
            commands.len(),
            value,
            inner.recycler.in_flight()
        );
        Ok(value)
    }

    fn last_completed_fence(&self) -> u64 {
        self.timeline.completed(&self.device.device)
    }

    fn wait_for_fence(&self, value: u64) -> Result<()> {
        let next_fence = self.inner.lock().next_fence;
        if value >= next_fence {
            return Err(EngineError::ProtocolViolation(format!(
                "Waiting for fence value {} that has not been submitted (last submitted {})",
                value,
                next_fence - 1
            )));
        }
        self.timeline.wait(&self.device.device, value)?;
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        let device = &self.device.device;
        unsafe { device.queue_wait_idle(self.device.queue) }.context("Failed to idle the queue")?;
        let completed = self.timeline.completed(device);
        self.inner.lock().recycler.reclaim(completed);
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        let mut inner = self.inner.lock();
        if !inner.objects.is_empty() {
            log::warn!(
                "Vulkan backend dropped with {} live objects",
                inner.objects.len()
            );
        }
        let objects: Vec<_> = inner.objects.drain().map(|(_, object)| object).collect();
        inner.recycler.destroy(&self.device.device);
        drop(inner);
        for object in objects {
            self.destroy_object(object);
        }
        self.timeline.destroy(&self.device.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_states_use_transfer_layouts() {
        let dst = state_access(ResourceState::COPY_DEST);
        assert_eq!(dst.layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(dst.access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst.stages, vk::PipelineStageFlags::TRANSFER);
    }

    #[test]
    fn combined_read_states_fall_back_to_general() {
        let generic = state_access(ResourceState::GENERIC_READ);
        assert_eq!(generic.layout, vk::ImageLayout::GENERAL);
        assert!(generic.access.contains(vk::AccessFlags::SHADER_READ | vk::AccessFlags::TRANSFER_READ));

        let vertex = state_access(ResourceState::VERTEX_BUFFER | ResourceState::INDEX_BUFFER);
        assert_eq!(vertex.stages, vk::PipelineStageFlags::VERTEX_INPUT);
    }

    #[test]
    fn barriers_never_target_undefined() {
        let (src, dst) = barrier_scopes(None, ResourceState::UNDEFINED);
        assert_eq!(src.stages, vk::PipelineStageFlags::ALL_COMMANDS);
        assert_eq!(src.layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(dst.layout, vk::ImageLayout::GENERAL);
        assert_eq!(dst.stages, vk::PipelineStageFlags::BOTTOM_OF_PIPE);

        let (src, _) = barrier_scopes(Some(ResourceState::UNDEFINED), ResourceState::COPY_DEST);
        assert_eq!(src.stages, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert!(src.access.is_empty());
    }

    #[test]
    fn array_slices_select_layers() {
        let mut desc = TextureDesc::new_2d("arr", 4, 4, crate::desc::TextureFormat::Rgba8Unorm);
        desc.dimension = TextureDimension::Tex2DArray;
        desc.depth_or_array_size = 3;
        desc.mip_levels = 3;
        let layers = subresource_layers(&desc, TextureSubresource { mip: 0, slice: 2 });
        assert_eq!(layers.base_array_layer, 2);
        assert_eq!(layers.layer_count, 1);

        let region = buffer_image_region(&desc, TextureSubresource { mip: 1, slice: 0 }, 256).unwrap();
        assert_eq!(region.image_extent.width, 2);
        assert_eq!(region.buffer_offset, 256);
        assert!(buffer_image_region(&desc, TextureSubresource { mip: 0, slice: 3 }, 0).is_err());
        assert!(buffer_image_region(&desc, TextureSubresource { mip: 3, slice: 0 }, 0).is_err());
    }
}
