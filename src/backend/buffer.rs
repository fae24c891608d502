// Buffer and image helpers for the Vulkan backend
//
// Translates engine descriptions into native create infos and binds memory
// through gpu-allocator.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::device::VulkanDevice;
use crate::desc::{BindFlags, BufferDesc, BufferMode, TextureDesc, TextureDimension, TextureFormat};
use crate::error::EngineError;
use crate::memory::MemoryClass;

pub fn memory_location(class: MemoryClass) -> MemoryLocation {
    match class {
        MemoryClass::DeviceLocal => MemoryLocation::GpuOnly,
        MemoryClass::Upload => MemoryLocation::CpuToGpu,
        MemoryClass::Readback => MemoryLocation::GpuToCpu,
    }
}

pub fn buffer_usage(desc: &BufferDesc) -> vk::BufferUsageFlags {
    let mut usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    let bind = desc.bind_flags;
    if bind.contains(BindFlags::VERTEX_BUFFER) {
        usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if bind.contains(BindFlags::INDEX_BUFFER) {
        usage |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if bind.contains(BindFlags::UNIFORM_BUFFER) {
        usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if bind.contains(BindFlags::INDIRECT_ARGS) {
        usage |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if bind.intersects(BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS) {
        usage |= match desc.mode {
            BufferMode::Formatted if bind.contains(BindFlags::UNORDERED_ACCESS) => {
                vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
            }
            BufferMode::Formatted => vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER,
            _ => vk::BufferUsageFlags::STORAGE_BUFFER,
        };
    }
    usage
}

/// Usage of upload pages. Aliased dynamic buffers are bound straight from
/// them, so every read-only binding is allowed.
pub fn upload_page_usage() -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::VERTEX_BUFFER
        | vk::BufferUsageFlags::INDEX_BUFFER
        | vk::BufferUsageFlags::UNIFORM_BUFFER
        | vk::BufferUsageFlags::INDIRECT_BUFFER
}

pub fn image_usage(desc: &TextureDesc) -> vk::ImageUsageFlags {
    let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    let bind = desc.bind_flags;
    if bind.contains(BindFlags::SHADER_RESOURCE) {
        usage |= vk::ImageUsageFlags::SAMPLED;
    }
    if bind.contains(BindFlags::UNORDERED_ACCESS) {
        usage |= vk::ImageUsageFlags::STORAGE;
    }
    if bind.contains(BindFlags::RENDER_TARGET) {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if bind.contains(BindFlags::DEPTH_STENCIL) {
        usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    usage
}

pub fn vk_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::Rg8Unorm => vk::Format::R8G8_UNORM,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::R16Float => vk::Format::R16_SFLOAT,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::R32Uint => vk::Format::R32_UINT,
        TextureFormat::Rg32Float => vk::Format::R32G32_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::D32Float => vk::Format::D32_SFLOAT,
    }
}

pub fn aspect_mask(format: TextureFormat) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

fn allocate(
    device: &VulkanDevice,
    name: &str,
    requirements: vk::MemoryRequirements,
    location: MemoryLocation,
    linear: bool,
) -> Result<Allocation, EngineError> {
    let mut guard = device.allocator.lock();
    let allocator = guard
        .as_mut()
        .ok_or_else(|| anyhow::anyhow!("Allocator already destroyed"))?;
    allocator
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|err| {
            EngineError::ResourceExhaustion(format!("Failed to allocate memory for \"{}\": {}", name, err))
        })
}

pub fn free(device: &VulkanDevice, allocation: Allocation) {
    if let Some(allocator) = device.allocator.lock().as_mut() {
        if let Err(err) = allocator.free(allocation) {
            log::error!("Failed to free allocation: {}", err);
        }
    }
}

/// Create a buffer and bind freshly allocated memory to it. Nothing leaks
/// when allocation or binding fails.
pub fn create_buffer(
    device: &VulkanDevice,
    name: &str,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
) -> Result<(vk::Buffer, Allocation), EngineError> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
        .with_context(|| format!("Failed to create buffer \"{}\"", name))?;

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
    let allocation = match allocate(device, name, requirements, location, true) {
        Ok(allocation) => allocation,
        Err(err) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(err);
        }
    };

    let bound = unsafe {
        device
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
    };
    if let Err(err) = bound {
        free(device, allocation);
        unsafe { device.device.destroy_buffer(buffer, None) };
        return Err(anyhow::Error::from(err)
            .context(format!("Failed to bind memory of buffer \"{}\"", name))
            .into());
    }

    Ok((buffer, allocation))
}

/// Create an optimally tiled image in device-local memory
pub fn create_image(device: &VulkanDevice, desc: &TextureDesc) -> Result<(vk::Image, Allocation), EngineError> {
    let (image_type, extent, array_layers) = match desc.dimension {
        TextureDimension::Tex1D | TextureDimension::Tex1DArray => (
            vk::ImageType::TYPE_1D,
            vk::Extent3D { width: desc.width, height: 1, depth: 1 },
            desc.array_size(),
        ),
        TextureDimension::Tex2D | TextureDimension::Tex2DArray => (
            vk::ImageType::TYPE_2D,
            vk::Extent3D { width: desc.width, height: desc.height, depth: 1 },
            desc.array_size(),
        ),
        TextureDimension::Tex3D => (
            vk::ImageType::TYPE_3D,
            vk::Extent3D { width: desc.width, height: desc.height, depth: desc.depth() },
            1,
        ),
    };

    let image_info = vk::ImageCreateInfo::builder()
        .image_type(image_type)
        .extent(extent)
        .mip_levels(desc.mip_levels)
        .array_layers(array_layers)
        .format(vk_format(desc.format))
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(image_usage(desc))
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = unsafe { device.device.create_image(&image_info, None) }
        .with_context(|| format!("Failed to create image \"{}\"", desc.name))?;

    let requirements = unsafe { device.device.get_image_memory_requirements(image) };
    let allocation = match allocate(device, &desc.name, requirements, MemoryLocation::GpuOnly, false) {
        Ok(allocation) => allocation,
        Err(err) => {
            unsafe { device.device.destroy_image(image, None) };
            return Err(err);
        }
    };

    let bound = unsafe {
        device
            .device
            .bind_image_memory(image, allocation.memory(), allocation.offset())
    };
    if let Err(err) = bound {
        free(device, allocation);
        unsafe { device.device.destroy_image(image, None) };
        return Err(anyhow::Error::from(err)
            .context(format!("Failed to bind memory of image \"{}\"", desc.name))
            .into());
    }

    Ok((image, allocation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{CpuAccess, Usage};

    #[test]
    fn bind_flags_select_buffer_usage() {
        let desc = BufferDesc::new("vb", 64).bind_flags(BindFlags::VERTEX_BUFFER | BindFlags::UNIFORM_BUFFER);
        let usage = buffer_usage(&desc);
        assert!(usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert!(usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER));

        let structured = BufferDesc::new("sb", 64)
            .bind_flags(BindFlags::SHADER_RESOURCE)
            .structured(16);
        assert!(buffer_usage(&structured).contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }

    #[test]
    fn memory_classes_map_to_locations() {
        let readback = MemoryClass::for_usage(Usage::Staging, CpuAccess::READ);
        assert_eq!(memory_location(readback), MemoryLocation::GpuToCpu);
        assert_eq!(memory_location(MemoryClass::Upload), MemoryLocation::CpuToGpu);
    }

    #[test]
    fn depth_formats_use_the_depth_aspect() {
        assert_eq!(aspect_mask(TextureFormat::D32Float), vk::ImageAspectFlags::DEPTH);
        assert_eq!(vk_format(TextureFormat::Bgra8Unorm), vk::Format::B8G8R8A8_UNORM);
    }
}
