// Synchronization primitives
//
// A timeline semaphore is the queue fence: submission N signals value N.
// Command buffers are recycled once the value they were submitted with has
// been reached.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Queue fence backed by a timeline semaphore
pub struct QueueTimeline {
    pub semaphore: vk::Semaphore,
    // Last value read back from the semaphore
    completed: AtomicU64,
}

impl QueueTimeline {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe { device.create_semaphore(&semaphore_info, None) }
            .context("Failed to create timeline semaphore")?;

        Ok(Self {
            semaphore,
            completed: AtomicU64::new(0),
        })
    }

    /// Highest value the GPU has signaled. Never goes backwards.
    pub fn completed(&self, device: &ash::Device) -> u64 {
        match unsafe { device.get_semaphore_counter_value(self.semaphore) } {
            Ok(value) => self.completed.fetch_max(value, Ordering::AcqRel).max(value),
            Err(err) => {
                log::error!("Failed to query the queue fence: {}", err);
                self.completed.load(Ordering::Acquire)
            }
        }
    }

    pub fn wait(&self, device: &ash::Device, value: u64) -> Result<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { device.wait_semaphores(&wait_info, u64::MAX) }
            .with_context(|| format!("Failed to wait for fence value {}", value))?;
        self.completed.fetch_max(value, Ordering::AcqRel);
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_semaphore(self.semaphore, None) };
    }
}

/// One-time command buffers, reused after their submission completes
pub struct CommandRecycler {
    pool: vk::CommandPool,
    free: Vec<vk::CommandBuffer>,
    in_flight: VecDeque<(u64, vk::CommandBuffer)>,
}

impl CommandRecycler {
    pub fn new(device: &ash::Device, queue_family: u32) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            // TRANSIENT: command buffers are short-lived
            // RESET: allow individual buffer reset
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );

        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            pool,
            free: Vec::new(),
            in_flight: VecDeque::new(),
        })
    }

    /// Move buffers whose fence value has completed back to the free list
    pub fn reclaim(&mut self, completed: u64) {
        while let Some(&(value, cmd)) = self.in_flight.front() {
            if value > completed {
                break;
            }
            self.in_flight.pop_front();
            self.free.push(cmd);
        }
    }

    /// A reset command buffer ready for recording
    pub fn acquire(&mut self, device: &ash::Device, completed: u64) -> Result<vk::CommandBuffer> {
        self.reclaim(completed);
        if let Some(cmd) = self.free.pop() {
            unsafe { device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty()) }
                .context("Failed to reset command buffer")?;
            return Ok(cmd);
        }

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?;
        buffers
            .into_iter()
            .next()
            .context("Driver returned no command buffer")
    }

    /// Hand back a buffer that was not submitted
    pub fn release(&mut self, cmd: vk::CommandBuffer) {
        self.free.push(cmd);
    }

    pub fn retire(&mut self, value: u64, cmd: vk::CommandBuffer) {
        self.in_flight.push_back((value, cmd));
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Frees every command buffer with the pool. The queue must be idle.
    pub fn destroy(&mut self, device: &ash::Device) {
        self.free.clear();
        self.in_flight.clear();
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}
