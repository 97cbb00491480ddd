// SPDX-License-Identifier: CEPL-1.0
//! Staging uploads on the transfer queue.
//!
//! Two modes share one command buffer:
//! - blocking: record, submit, wait on the upload fence (engine init)
//! - batched: jobs queue up and are submitted once per frame, signalling the
//!   upload semaphore that the frame's graphics submit waits on
//!
//! When the transfer family differs from the consuming family the release
//! barrier is recorded here and the matching acquire is handed to the frame
//! through [`PendingAcquires`].
use crate::allocator::{AllocatedBuffer, MemoryUsage, ResourceAllocator};
use crate::deletion::DeletionQueue;
use crate::error::{VkError, VkResult, VkResultExt};
use crate::state_tracker::{cmd_barriers, ResourceState, ResourceStateTracker, Transition};
use ash::vk;

/// Barriers and semaphore waits a frame must consume before it reads uploaded
/// data.
#[derive(Debug, Default)]
pub struct PendingAcquires {
    pub buffer_barriers: Vec<vk::BufferMemoryBarrier2<'static>>,
    pub image_barriers: Vec<vk::ImageMemoryBarrier2<'static>>,
    pub wait_semaphores: Vec<vk::SemaphoreSubmitInfo<'static>>,
}

impl PendingAcquires {
    pub fn is_empty(&self) -> bool {
        self.buffer_barriers.is_empty() && self.image_barriers.is_empty() && self.wait_semaphores.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum UploadDestination {
    Buffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    },
    Image {
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        extent: vk::Extent2D,
    },
}

/// One staged copy. `final_state` carries the stage, access, layout (images
/// only) and queue family the consumer expects.
pub struct UploadJob {
    pub staging: AllocatedBuffer,
    pub destination: UploadDestination,
    pub size: vk::DeviceSize,
    pub final_state: ResourceState,
}

/// Barrier for the upload command buffer, plus the acquire the consumer must
/// record when ownership moves between families.
pub fn buffer_handoff(
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    transfer_family: u32,
    final_state: ResourceState,
) -> (vk::BufferMemoryBarrier2<'static>, Option<vk::BufferMemoryBarrier2<'static>>) {
    let base = vk::BufferMemoryBarrier2 {
        s_type: vk::StructureType::BUFFER_MEMORY_BARRIER_2,
        src_stage_mask: vk::PipelineStageFlags2::ALL_TRANSFER,
        src_access_mask: vk::AccessFlags2::TRANSFER_WRITE,
        dst_stage_mask: final_state.stage_mask,
        dst_access_mask: final_state.access_mask,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        buffer,
        offset,
        size,
        ..Default::default()
    };
    let dst = final_state.queue_family_index;
    if dst == vk::QUEUE_FAMILY_IGNORED || dst == transfer_family {
        return (base, None);
    }
    let release = vk::BufferMemoryBarrier2 {
        dst_stage_mask: vk::PipelineStageFlags2::NONE,
        dst_access_mask: vk::AccessFlags2::NONE,
        src_queue_family_index: transfer_family,
        dst_queue_family_index: dst,
        ..base
    };
    let acquire = vk::BufferMemoryBarrier2 {
        src_stage_mask: vk::PipelineStageFlags2::NONE,
        src_access_mask: vk::AccessFlags2::NONE,
        src_queue_family_index: transfer_family,
        dst_queue_family_index: dst,
        ..base
    };
    (release, Some(acquire))
}

/// Barriers around a copy into an image on the transfer family.
#[derive(Debug, Clone, Copy)]
pub struct ImageUploadBarriers {
    pub before_copy: Option<vk::ImageMemoryBarrier2<'static>>,
    /// Local transition, or the release half when ownership moves.
    pub after_copy: Option<vk::ImageMemoryBarrier2<'static>>,
    /// Recorded by the consuming family before first use.
    pub acquire: Option<vk::ImageMemoryBarrier2<'static>>,
}

/// Previous contents are discarded, so the transfer family takes the image
/// from UNDEFINED without a release from its last owner. No frame may still
/// be reading the image.
pub fn image_upload_barriers(
    tracker: &mut ResourceStateTracker,
    image: vk::Image,
    range: &vk::ImageSubresourceRange,
    transfer_family: u32,
    final_state: ResourceState,
) -> ImageUploadBarriers {
    tracker.assume(image, range, ResourceState::UNDEFINED.on_queue(transfer_family));
    let before_copy = match tracker.transition(image, range, ResourceState::TRANSFER_DESTINATION.on_queue(transfer_family)) {
        Transition::Local(b) => Some(b),
        Transition::QueueTransfer { .. } | Transition::None => None,
    };
    let (after_copy, acquire) = match tracker.transition(image, range, final_state) {
        Transition::None => (None, None),
        Transition::Local(b) => (Some(b), None),
        Transition::QueueTransfer { release, acquire } => (Some(release), Some(acquire)),
    };
    ImageUploadBarriers {
        before_copy,
        after_copy,
        acquire,
    }
}

/// Hands each staging buffer to `slot`'s deletion queue, including ones from
/// failed submits; `destroy` runs once per buffer when the slot drains.
pub fn retire_staging<C: 'static, B: 'static>(
    staging: impl IntoIterator<Item = B>,
    deletion: &mut DeletionQueue<C>,
    slot: usize,
    destroy: fn(&C, B),
) -> usize {
    let mut count = 0;
    for buffer in staging {
        deletion.push(slot, move |ctx: &C| destroy(ctx, buffer));
        count += 1;
    }
    count
}

pub struct UploadContext {
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    semaphore: vk::Semaphore,
    queue: vk::Queue,
    family: u32,
    batch: Vec<UploadJob>,
    /// A batched submit is pending on `fence`.
    in_flight: bool,
}

impl UploadContext {
    pub fn empty() -> Self {
        Self {
            pool: vk::CommandPool::null(),
            cmd: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
            semaphore: vk::Semaphore::null(),
            queue: vk::Queue::null(),
            family: vk::QUEUE_FAMILY_IGNORED,
            batch: Vec::new(),
            in_flight: false,
        }
    }

    pub fn new(device: &ash::Device, queue: vk::Queue, family: u32) -> VkResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(family);
        // SAFETY: device is live and family was requested at device creation.
        let pool = unsafe { device.create_command_pool(&pool_info, None) }.at("vkCreateCommandPool")?;
        let mut ctx = Self {
            pool,
            queue,
            family,
            ..Self::empty()
        };
        if let Err(e) = ctx.create_children(device) {
            ctx.shutdown(device);
            return Err(e);
        }
        Ok(ctx)
    }

    fn create_children(&mut self, device: &ash::Device) -> VkResult<()> {
        let alloc = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: the pool belongs to device.
        unsafe {
            self.cmd = device.allocate_command_buffers(&alloc).at("vkAllocateCommandBuffers")?[0];
            self.fence = device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .at("vkCreateFence")?;
            self.semaphore = device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                .at("vkCreateSemaphore")?;
        }
        Ok(())
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn pending_jobs(&self) -> usize {
        self.batch.len()
    }

    fn stage(allocator: &ResourceAllocator, bytes: &[u8]) -> VkResult<AllocatedBuffer> {
        let staging = allocator
            .create_buffer(
                bytes.len() as vk::DeviceSize,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryUsage::CpuToGpu,
            )
            .map_err(VkError::into_upload)?;
        if let Err(e) = staging.write(0, bytes) {
            allocator.destroy_buffer(staging);
            return Err(e);
        }
        Ok(staging)
    }

    fn buffer_job(
        allocator: &ResourceAllocator,
        dst: vk::Buffer,
        offset: vk::DeviceSize,
        bytes: &[u8],
        final_state: ResourceState,
    ) -> VkResult<UploadJob> {
        Ok(UploadJob {
            staging: Self::stage(allocator, bytes)?,
            destination: UploadDestination::Buffer { buffer: dst, offset },
            size: bytes.len() as vk::DeviceSize,
            final_state,
        })
    }

    fn image_job(
        allocator: &ResourceAllocator,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        extent: vk::Extent2D,
        bytes: &[u8],
        final_state: ResourceState,
    ) -> VkResult<UploadJob> {
        Ok(UploadJob {
            staging: Self::stage(allocator, bytes)?,
            destination: UploadDestination::Image { image, range, extent },
            size: bytes.len() as vk::DeviceSize,
            final_state,
        })
    }

    /// Blocking buffer upload. Returns once the copy has completed on the GPU.
    #[allow(clippy::too_many_arguments)]
    pub fn upload_buffer(
        &mut self,
        allocator: &ResourceAllocator,
        tracker: &mut ResourceStateTracker,
        deletion: &mut DeletionQueue<ResourceAllocator>,
        slot: usize,
        pending: &mut PendingAcquires,
        dst: vk::Buffer,
        bytes: &[u8],
        final_state: ResourceState,
    ) -> VkResult<()> {
        let job = Self::buffer_job(allocator, dst, 0, bytes, final_state)?;
        self.submit_blocking(allocator.device(), tracker, deletion, slot, pending, vec![job])
    }

    /// Blocking image upload ending in `final_state.layout`.
    #[allow(clippy::too_many_arguments)]
    pub fn upload_image(
        &mut self,
        allocator: &ResourceAllocator,
        tracker: &mut ResourceStateTracker,
        deletion: &mut DeletionQueue<ResourceAllocator>,
        slot: usize,
        pending: &mut PendingAcquires,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        extent: vk::Extent2D,
        bytes: &[u8],
        final_state: ResourceState,
    ) -> VkResult<()> {
        let job = Self::image_job(allocator, image, range, extent, bytes, final_state)?;
        self.submit_blocking(allocator.device(), tracker, deletion, slot, pending, vec![job])
    }

    /// Queues a buffer upload for the next [`UploadContext::flush`].
    pub fn enqueue_buffer(
        &mut self,
        allocator: &ResourceAllocator,
        dst: vk::Buffer,
        bytes: &[u8],
        final_state: ResourceState,
    ) -> VkResult<()> {
        let job = Self::buffer_job(allocator, dst, 0, bytes, final_state)?;
        self.batch.push(job);
        Ok(())
    }

    pub fn enqueue_image(
        &mut self,
        allocator: &ResourceAllocator,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        extent: vk::Extent2D,
        bytes: &[u8],
        final_state: ResourceState,
    ) -> VkResult<()> {
        let job = Self::image_job(allocator, image, range, extent, bytes, final_state)?;
        self.batch.push(job);
        Ok(())
    }

    fn wait_previous(&mut self, device: &ash::Device) -> VkResult<()> {
        if !self.in_flight {
            return Ok(());
        }
        // SAFETY: the fence belongs to device and was submitted by flush.
        unsafe {
            device
                .wait_for_fences(&[self.fence], true, u64::MAX)
                .at("vkWaitForFences")?;
            device.reset_fences(&[self.fence]).at("vkResetFences")?;
        }
        self.in_flight = false;
        Ok(())
    }

    fn record(
        &self,
        device: &ash::Device,
        tracker: &mut ResourceStateTracker,
        jobs: &[UploadJob],
        pending: &mut PendingAcquires,
    ) -> VkResult<()> {
        // SAFETY: the previous submit on this pool has completed.
        unsafe {
            device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
                .at("vkResetCommandPool")?;
            let begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(self.cmd, &begin).at("vkBeginCommandBuffer")?;
        }

        let mut image_barriers = Vec::with_capacity(jobs.len());
        for job in jobs {
            if let UploadDestination::Image { image, range, .. } = job.destination {
                image_barriers.push(image_upload_barriers(tracker, image, &range, self.family, job.final_state));
            }
        }
        let pre: Vec<_> = image_barriers.iter().filter_map(|b| b.before_copy).collect();
        cmd_barriers(device, self.cmd, &[], &pre);

        let mut post_buffers = Vec::new();
        let post_images: Vec<_> = image_barriers.iter().filter_map(|b| b.after_copy).collect();
        pending
            .image_barriers
            .extend(image_barriers.iter().filter_map(|b| b.acquire));
        for job in jobs {
            match job.destination {
                UploadDestination::Buffer { buffer, offset } => {
                    let region = vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: offset,
                        size: job.size,
                    };
                    // SAFETY: both buffers are live and the region is in bounds.
                    unsafe { device.cmd_copy_buffer(self.cmd, job.staging.buffer, buffer, &[region]) };
                    let (local, acquire) = buffer_handoff(buffer, offset, job.size, self.family, job.final_state);
                    post_buffers.push(local);
                    pending.buffer_barriers.extend(acquire);
                }
                UploadDestination::Image { image, range, extent } => {
                    let region = vk::BufferImageCopy {
                        buffer_offset: 0,
                        buffer_row_length: 0,
                        buffer_image_height: 0,
                        image_subresource: vk::ImageSubresourceLayers {
                            aspect_mask: range.aspect_mask,
                            mip_level: range.base_mip_level,
                            base_array_layer: range.base_array_layer,
                            layer_count: range.layer_count,
                        },
                        image_offset: vk::Offset3D::default(),
                        image_extent: vk::Extent3D {
                            width: extent.width,
                            height: extent.height,
                            depth: 1,
                        },
                    };
                    // SAFETY: image is in TRANSFER_DST_OPTIMAL after the barrier above.
                    unsafe {
                        device.cmd_copy_buffer_to_image(
                            self.cmd,
                            job.staging.buffer,
                            image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[region],
                        )
                    };
                }
            }
        }
        cmd_barriers(device, self.cmd, &post_buffers, &post_images);

        // SAFETY: cmd is recording.
        unsafe { device.end_command_buffer(self.cmd) }.at("vkEndCommandBuffer")
    }

    fn submit(&self, device: &ash::Device, signal: bool) -> VkResult<()> {
        let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(self.cmd)];
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(self.semaphore)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let mut submit = vk::SubmitInfo2::default().command_buffer_infos(&cmd_infos);
        if signal {
            submit = submit.signal_semaphore_infos(&signals);
        }
        // SAFETY: cmd is executable and the fence is unsignaled.
        unsafe { device.queue_submit2(self.queue, &[submit], self.fence) }.at("vkQueueSubmit2")
    }

    fn retire(jobs: Vec<UploadJob>, deletion: &mut DeletionQueue<ResourceAllocator>, slot: usize) {
        retire_staging(
            jobs.into_iter().map(|j| j.staging),
            deletion,
            slot,
            |a: &ResourceAllocator, b: AllocatedBuffer| a.destroy_buffer(b),
        );
    }

    fn submit_blocking(
        &mut self,
        device: &ash::Device,
        tracker: &mut ResourceStateTracker,
        deletion: &mut DeletionQueue<ResourceAllocator>,
        slot: usize,
        pending: &mut PendingAcquires,
        jobs: Vec<UploadJob>,
    ) -> VkResult<()> {
        let result = self.wait_previous(device).and_then(|_| {
            self.record(device, tracker, &jobs, pending)?;
            self.submit(device, false)?;
            // SAFETY: the fence was just submitted.
            unsafe {
                device
                    .wait_for_fences(&[self.fence], true, u64::MAX)
                    .at("vkWaitForFences")?;
                device.reset_fences(&[self.fence]).at("vkResetFences")
            }
        });
        // Staging is freed through the deletion queue even on failure.
        Self::retire(jobs, deletion, slot);
        result.map_err(VkError::into_upload)
    }

    /// Submits every queued job. The frame's submit must wait on the returned
    /// semaphore entry in `pending.wait_semaphores`; staging buffers are freed
    /// once frame `slot` comes round again.
    pub fn flush(
        &mut self,
        device: &ash::Device,
        tracker: &mut ResourceStateTracker,
        deletion: &mut DeletionQueue<ResourceAllocator>,
        slot: usize,
        pending: &mut PendingAcquires,
    ) -> VkResult<usize> {
        if self.batch.is_empty() {
            return Ok(0);
        }
        let jobs = std::mem::take(&mut self.batch);
        let count = jobs.len();
        let result = self.wait_previous(device).and_then(|_| {
            self.record(device, tracker, &jobs, pending)?;
            self.submit(device, true)
        });
        Self::retire(jobs, deletion, slot);
        result.map_err(VkError::into_upload)?;
        self.in_flight = true;
        pending.wait_semaphores.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(self.semaphore)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
        );
        tracing::debug!(jobs = count, "upload batch submitted");
        Ok(count)
    }

    /// Device must be idle. Unflushed jobs only own staging memory.
    pub fn shutdown(&mut self, allocator: &ResourceAllocator) {
        for job in self.batch.drain(..) {
            allocator.destroy_buffer(job.staging);
        }
        let device = allocator.device();
        // SAFETY: the device is idle.
        unsafe {
            if self.semaphore != vk::Semaphore::null() {
                device.destroy_semaphore(self.semaphore, None);
            }
            if self.fence != vk::Fence::null() {
                device.destroy_fence(self.fence, None);
            }
            if self.pool != vk::CommandPool::null() {
                device.destroy_command_pool(self.pool, None);
            }
        }
        self.semaphore = vk::Semaphore::null();
        self.fence = vk::Fence::null();
        self.pool = vk::CommandPool::null();
        self.cmd = vk::CommandBuffer::null();
        self.in_flight = false;
    }
}

impl Drop for UploadContext {
    fn drop(&mut self) {
        debug_assert!(self.pool == vk::CommandPool::null(), "UploadContext dropped without shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const VERTEX_READ: ResourceState = ResourceState {
        layout: vk::ImageLayout::UNDEFINED,
        stage_mask: vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
        access_mask: vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        queue_family_index: 0,
    };

    #[test]
    fn same_family_needs_only_a_local_barrier() {
        let (local, acquire) = buffer_handoff(vk::Buffer::from_raw(1), 0, 64, 0, VERTEX_READ);
        assert!(acquire.is_none());
        assert_eq!(local.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(local.dst_access_mask, vk::AccessFlags2::VERTEX_ATTRIBUTE_READ);
        assert_eq!(local.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(local.size, 64);
    }

    #[test]
    fn dedicated_transfer_splits_release_and_acquire() {
        let (release, acquire) = buffer_handoff(vk::Buffer::from_raw(1), 16, 1024, 2, VERTEX_READ);
        let acquire = acquire.expect("cross-family upload needs an acquire");
        assert_eq!((release.src_queue_family_index, release.dst_queue_family_index), (2, 0));
        assert_eq!((acquire.src_queue_family_index, acquire.dst_queue_family_index), (2, 0));
        assert_eq!(release.dst_access_mask, vk::AccessFlags2::NONE);
        assert_eq!(acquire.src_access_mask, vk::AccessFlags2::NONE);
        assert_eq!(acquire.dst_stage_mask, vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT);
        assert_eq!((release.offset, acquire.offset), (16, 16));
    }

    #[test]
    fn ignored_destination_family_stays_local() {
        let final_state = ResourceState {
            queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            ..VERTEX_READ
        };
        let (_, acquire) = buffer_handoff(vk::Buffer::from_raw(1), 0, 4, 2, final_state);
        assert!(acquire.is_none());
    }

    fn color() -> vk::ImageSubresourceRange {
        crate::state_tracker::full_range(vk::ImageAspectFlags::COLOR)
    }

    #[test]
    fn image_upload_on_graphics_family_stays_local() {
        let mut tracker = ResourceStateTracker::new();
        let image = vk::Image::from_raw(7);
        let sampled = ResourceState::SHADER_READ_ONLY.on_queue(0);
        let b = image_upload_barriers(&mut tracker, image, &color(), 0, sampled);

        let before = b.before_copy.expect("copy needs TRANSFER_DST");
        assert_eq!(before.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(before.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let after = b.after_copy.expect("copy result must be made visible");
        assert_eq!(after.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(after.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(after.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert!(b.acquire.is_none());
        assert_eq!(tracker.state(image, &color()), sampled);
    }

    #[test]
    fn image_upload_on_dedicated_transfer_hands_off() {
        let mut tracker = ResourceStateTracker::new();
        let image = vk::Image::from_raw(7);
        let sampled = ResourceState::SHADER_READ_ONLY.on_queue(0);
        let b = image_upload_barriers(&mut tracker, image, &color(), 2, sampled);

        let release = b.after_copy.expect("transfer queue releases");
        let acquire = b.acquire.expect("graphics queue acquires");
        assert_eq!((release.src_queue_family_index, release.dst_queue_family_index), (2, 0));
        assert_eq!((acquire.src_queue_family_index, acquire.dst_queue_family_index), (2, 0));
        assert_eq!(release.new_layout, acquire.new_layout);
        assert_eq!(acquire.dst_stage_mask, vk::PipelineStageFlags2::FRAGMENT_SHADER);
    }

    #[test]
    fn reupload_of_graphics_owned_image_needs_no_release() {
        let mut tracker = ResourceStateTracker::new();
        let image = vk::Image::from_raw(7);
        let sampled = ResourceState::SHADER_READ_ONLY.on_queue(0);
        image_upload_barriers(&mut tracker, image, &color(), 2, sampled);
        assert_eq!(tracker.state(image, &color()).queue_family_index, 0);

        let b = image_upload_barriers(&mut tracker, image, &color(), 2, sampled);
        let before = b.before_copy.expect("copy needs TRANSFER_DST");
        assert_eq!(before.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(before.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(before.dst_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert!(b.acquire.is_some());
    }

    type Freed = std::cell::RefCell<Vec<u64>>;

    fn free(log: &Freed, size: u64) {
        log.borrow_mut().push(size);
    }

    #[test]
    fn staging_is_freed_exactly_once() {
        let mut deletion = DeletionQueue::<Freed>::new(2);
        let log = Freed::default();
        // Init upload blocks, so its staging goes to slot 0; a later batch
        // flushed by frame 3 retires into slot 1.
        assert_eq!(retire_staging([4u64], &mut deletion, 0, free), 1);
        assert_eq!(retire_staging([1024u64], &mut deletion, 3 % 2, free), 1);

        assert_eq!(deletion.drain(0, &log), 1);
        assert_eq!(*log.borrow(), vec![4]);
        assert_eq!(deletion.drain(0, &log), 0);
        assert_eq!(deletion.drain_all(&log), 1);
        assert_eq!(deletion.drain_all(&log), 0);
        assert_eq!(*log.borrow(), vec![4, 1024]);
    }

    #[test]
    fn pending_acquires_start_empty() {
        let mut p = PendingAcquires::default();
        assert!(p.is_empty());
        p.wait_semaphores.push(vk::SemaphoreSubmitInfo::default());
        assert!(!p.is_empty());
    }
}
