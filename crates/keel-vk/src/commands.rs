// SPDX-License-Identifier: CEPL-1.0
//! Per-frame command pools and primary command buffers.
//!
//! Buffers are never reset individually; the whole pool is reset at the start
//! of its frame.
use crate::error::{VkResult, VkResultExt};
use crate::state_tracker::cmd_barriers;
use crate::upload::PendingAcquires;
use ash::vk;

#[derive(Debug, Clone, Copy)]
struct FrameCommands {
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
}

pub struct CommandScheduler {
    frames: Vec<FrameCommands>,
    pending: Vec<PendingAcquires>,
}

impl CommandScheduler {
    pub fn empty() -> Self {
        Self {
            frames: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn new(device: &ash::Device, family: u32, frames_in_flight: usize) -> VkResult<Self> {
        let mut s = Self {
            frames: Vec::with_capacity(frames_in_flight),
            pending: (0..frames_in_flight).map(|_| PendingAcquires::default()).collect(),
        };
        for _ in 0..frames_in_flight {
            match create_frame_commands(device, family) {
                Ok(fc) => s.frames.push(fc),
                Err(e) => {
                    s.shutdown(device);
                    return Err(e);
                }
            }
        }
        Ok(s)
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Acquire barriers and wait semaphores the given frame must consume.
    pub fn pending_mut(&mut self, frame: usize) -> &mut PendingAcquires {
        let n = self.pending.len();
        &mut self.pending[frame % n]
    }

    pub fn command_buffer(&self, frame: usize) -> vk::CommandBuffer {
        self.frames[frame % self.frames.len()].cmd
    }

    /// Resets the frame's pool, begins its buffer and flushes queued upload
    /// acquires. The pending wait semaphores stay queued for the submit.
    pub fn begin(&mut self, device: &ash::Device, frame: usize) -> VkResult<vk::CommandBuffer> {
        let fc = self.frames[frame % self.frames.len()];
        // SAFETY: the frame fence was waited on, so no buffer from this pool is pending.
        unsafe { device.reset_command_pool(fc.pool, vk::CommandPoolResetFlags::empty()) }
            .at("vkResetCommandPool")?;
        let begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: fc.cmd was reset with its pool.
        unsafe { device.begin_command_buffer(fc.cmd, &begin) }.at("vkBeginCommandBuffer")?;

        let pending = self.pending_mut(frame);
        if !pending.is_empty() {
            tracing::trace!(
                buffers = pending.buffer_barriers.len(),
                images = pending.image_barriers.len(),
                "flushing upload acquires"
            );
        }
        cmd_barriers(device, fc.cmd, &pending.buffer_barriers, &pending.image_barriers);
        pending.buffer_barriers.clear();
        pending.image_barriers.clear();
        Ok(fc.cmd)
    }

    /// Semaphores (and their wait stages) the frame's submit must wait on.
    /// Taking them clears the list.
    pub fn take_wait_semaphores(&mut self, frame: usize) -> Vec<vk::SemaphoreSubmitInfo<'static>> {
        std::mem::take(&mut self.pending_mut(frame).wait_semaphores)
    }

    pub fn end(&self, device: &ash::Device, frame: usize) -> VkResult<vk::CommandBuffer> {
        let cmd = self.command_buffer(frame);
        // SAFETY: cmd is in the recording state.
        unsafe { device.end_command_buffer(cmd) }.at("vkEndCommandBuffer")?;
        Ok(cmd)
    }

    /// Destroying a pool frees its command buffers.
    pub fn shutdown(&mut self, device: &ash::Device) {
        for fc in self.frames.drain(..) {
            // SAFETY: the device is idle.
            unsafe { device.destroy_command_pool(fc.pool, None) };
        }
        self.pending.clear();
    }
}

impl Drop for CommandScheduler {
    fn drop(&mut self) {
        debug_assert!(self.frames.is_empty(), "CommandScheduler dropped without shutdown");
    }
}

fn create_frame_commands(device: &ash::Device, family: u32) -> VkResult<FrameCommands> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(family);
    // SAFETY: device is live and family was requested at device creation.
    let pool = unsafe { device.create_command_pool(&pool_info, None) }.at("vkCreateCommandPool")?;
    let alloc = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    // SAFETY: pool was just created on device.
    match unsafe { device.allocate_command_buffers(&alloc) }.at("vkAllocateCommandBuffers") {
        Ok(bufs) => Ok(FrameCommands { pool, cmd: bufs[0] }),
        Err(e) => {
            // SAFETY: pool has no live buffers.
            unsafe { device.destroy_command_pool(pool, None) };
            Err(e)
        }
    }
}
