// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (prefer discrete GPU, timeline semaphores required)
// - Logical device + queue creation
// - Memory allocator setup
//
// The device is headless: resources and copies only, no surface or swapchain.

use anyhow::{Context, Result};
use ash::{vk, Entry};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::sync::Arc;

use crate::memory::{MemoryClass, MemoryProperties, MemoryTypeChooser};

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device, see Drop
    pub allocator: Mutex<Option<gpu_allocator::vulkan::Allocator>>,
    pub device: ash::Device,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue used for every submission
    pub queue: vk::Queue,
    pub queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers
    pub fn new(app_name: &str, enable_validation: bool) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, app_name, enable_validation)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Pick physical device (GPU)
        let (physical_device, queue_family) = Self::pick_physical_device(&instance)?;

        // Step 5: Create logical device
        let (device, queue) = Self::create_logical_device(&instance, physical_device, queue_family)?;

        // Step 6: Report the device
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Step 7: Check memory types, create memory allocator
        Self::check_memory_types(&memory_properties)?;
        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        Ok(Arc::new(Self {
            allocator: Mutex::new(Some(allocator)),
            device,
            instance,
            _entry: entry,
            queue,
            queue_family,
            debug_utils,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("gpu-lifetime")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let extensions = if enable_validation {
            vec![ash::extensions::ext::DebugUtils::name().as_ptr()]
        } else {
            vec![]
        };

        // Validation layers
        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };

            if props.api_version < vk::API_VERSION_1_2 || !Self::supports_timeline(instance, device) {
                continue;
            }

            // Graphics queues also support transfers
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let queue_family = queue_families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|(i, _)| i as u32);

            if let Some(queue_family) = queue_family {
                // Score device (prefer discrete GPU)
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, queue_family));
                }
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No GPU with timeline semaphore support found"))
    }

    fn supports_timeline(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut features12);
        unsafe { instance.get_physical_device_features2(device, &mut features2) };
        features12.timeline_semaphore == vk::TRUE
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        // Timeline semaphores back the queue fence
        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder().timeline_semaphore(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .push_next(&mut features12);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok((device, queue))
    }

    /// Device-local memory is required; host-visible classes only warn.
    fn check_memory_types(memory_properties: &vk::PhysicalDeviceMemoryProperties) -> Result<()> {
        let chooser = MemoryTypeChooser::new(memory_type_properties(memory_properties));
        chooser.choose(u32::MAX, MemoryClass::DeviceLocal)?;
        for class in [MemoryClass::Upload, MemoryClass::Readback] {
            match chooser.choose(u32::MAX, class) {
                Ok(index) => log::debug!("{:?} memory: type {}", class, index),
                Err(err) => log::warn!("{}", err),
            }
        }
        Ok(())
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<gpu_allocator::vulkan::Allocator> {
        let allocator =
            gpu_allocator::vulkan::Allocator::new(&gpu_allocator::vulkan::AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })?;

        Ok(allocator)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

/// Translate native memory type flags into the engine's property sets
fn memory_type_properties(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
) -> Vec<MemoryProperties> {
    let count = memory_properties.memory_type_count as usize;
    memory_properties.memory_types[..count]
        .iter()
        .map(|memory_type| {
            let flags = memory_type.property_flags;
            let mut properties = MemoryProperties::empty();
            properties.set(
                MemoryProperties::DEVICE_LOCAL,
                flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            );
            properties.set(
                MemoryProperties::HOST_VISIBLE,
                flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
            );
            properties.set(
                MemoryProperties::HOST_COHERENT,
                flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT),
            );
            properties.set(
                MemoryProperties::HOST_CACHED,
                flags.contains(vk::MemoryPropertyFlags::HOST_CACHED),
            );
            properties
        })
        .collect()
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // The allocator frees its memory blocks through the device
        drop(self.allocator.lock().take());

        // Cleanup in reverse order
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_flags_translate_to_properties() {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            ..Default::default()
        };
        memory_properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        memory_properties.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let types = memory_type_properties(&memory_properties);
        assert_eq!(
            types,
            vec![
                MemoryProperties::DEVICE_LOCAL,
                MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            ]
        );
        assert!(VulkanDevice::check_memory_types(&memory_properties).is_ok());

        memory_properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert!(VulkanDevice::check_memory_types(&memory_properties).is_err());
    }
}
