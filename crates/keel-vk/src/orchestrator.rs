// SPDX-License-Identifier: CEPL-1.0
//! Frame orchestration: owns every Vulkan subsystem and drives the
//! acquire / record / submit / present loop.
//!
//! Per frame:
//! 1) wait the frame fence, drain its deletion queue, reset its descriptors
//! 2) acquire an image; wait on whichever frame last used it
//! 3) flush batched uploads, begin the command buffer
//! 4) move the image (and depth) to attachment layouts, begin rendering
//! 5) caller records draws
//! 6) end rendering, move the image to present, reset the fence, submit, present
//!
//! A frame that fails after its acquire is retired with an empty submit so
//! its fence and semaphores stay balanced. Swapchain recreation happens
//! between frames only, after the device idles.
use crate::allocator::{AllocatedBuffer, AllocatedImage, ImageDesc, MemoryUsage, ResourceAllocator};
use crate::commands::CommandScheduler;
use crate::config::{RendererConfig, MAX_FRAMES_IN_FLIGHT};
use crate::context::Context;
use crate::deletion::DeletionQueue;
use crate::descriptors::{DescriptorWriter, Descriptors, GLOBAL_UBO_BINDING};
use crate::device::{has_stencil, Device};
use crate::error::{VkError, VkResult, VkResultExt};
use crate::frame_sync::FrameSync;
use crate::pipeline::{GraphicsPipeline, GraphicsPipelineDescription, ShaderCache};
use crate::state_tracker::{cmd_barriers, full_range, ResourceState, ResourceStateTracker, Transition};
use crate::swapchain::{choose_extent, RecreateOutcome, SurfaceSupport, Swapchain};
use crate::upload::UploadContext;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use keel_render::{FrameStatus, NativeWindow, RenderSize};
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Recording,
}

/// Idle/Recording state plus the device-lost latch.
#[derive(Debug, Clone, Copy)]
pub struct PhaseMachine {
    phase: FramePhase,
    lost: bool,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self {
            phase: FramePhase::Idle,
            lost: false,
        }
    }
}

impl PhaseMachine {
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    pub fn begin_allowed(&self) -> VkResult<()> {
        if self.lost {
            return Err(VkError::DeviceLost { call: "begin_frame" });
        }
        match self.phase {
            FramePhase::Idle => Ok(()),
            FramePhase::Recording => Err(VkError::InvalidState("begin_frame called while recording")),
        }
    }

    pub fn start_recording(&mut self) -> VkResult<()> {
        self.begin_allowed()?;
        self.phase = FramePhase::Recording;
        Ok(())
    }

    pub fn recording(&self) -> VkResult<()> {
        match self.phase {
            FramePhase::Recording => Ok(()),
            FramePhase::Idle => Err(VkError::InvalidState("no frame is being recorded")),
        }
    }

    /// Leaves Recording. Errors when no frame was open.
    pub fn finish(&mut self) -> VkResult<()> {
        self.recording()?;
        self.phase = FramePhase::Idle;
        Ok(())
    }

    /// Once set, every later frame call fails; only shutdown remains valid.
    pub fn mark_lost(&mut self) {
        self.lost = true;
        self.phase = FramePhase::Idle;
    }
}

/// Deletion slot for resources retired right now.
///
/// While recording, the current frame's fence covers any use. Between frames
/// the last submitted frame is the newest user; before the first submit any
/// slot will do.
pub fn deferral_slot(frame_index: usize, frames_in_flight: usize, recording: bool, frames_submitted: u64) -> usize {
    let n = frames_in_flight.max(1);
    if recording || frames_submitted == 0 {
        frame_index % n
    } else {
        (frame_index + n - 1) % n
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// Copy now and wait for it.
    Blocking,
    /// Ride the next frame's upload batch.
    Batched,
}

/// Only uploads made before the first frame block. Later ones are batched,
/// which also keeps copies out of an open rendering scope.
pub fn upload_mode(frames_begun: u64) -> UploadMode {
    if frames_begun == 0 {
        UploadMode::Blocking
    } else {
        UploadMode::Batched
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

pub fn acquire_outcome(acquired: Result<(u32, bool), vk::Result>) -> VkResult<AcquireOutcome> {
    match acquired {
        Ok((index, suboptimal)) => Ok(AcquireOutcome::Image { index, suboptimal }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
        Err(r) => Err(VkError::from_result("vkAcquireNextImageKHR", r)),
    }
}

/// `Ok(true)` when the swapchain should be rebuilt before the next frame.
pub fn present_wants_recreate(presented: Result<bool, vk::Result>) -> VkResult<bool> {
    match presented {
        Ok(suboptimal) => Ok(suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
        Err(r) => Err(VkError::from_result("vkQueuePresentKHR", r)),
    }
}

/// How far the current frame got. An acquired but unsubmitted frame holds a
/// signaled acquire semaphore that someone must wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameProgress {
    Idle,
    Acquired,
    Submitted,
}

impl FrameProgress {
    pub fn needs_retire(self) -> bool {
        self == FrameProgress::Acquired
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateStep {
    /// Surface is 0x0; keep the request pending and try again next tick.
    Wait,
    Rebuild,
}

pub fn recreate_step(caps: &vk::SurfaceCapabilitiesKHR, window: RenderSize) -> RecreateStep {
    match choose_extent(caps, window) {
        Some(_) => RecreateStep::Rebuild,
        None => RecreateStep::Wait,
    }
}

/// Drops cached states of images owned by a destroyed swapchain so a reused
/// handle value starts from UNDEFINED.
fn retire_swapchain_images(tracker: &mut ResourceStateTracker, old: &[vk::Image]) {
    for &image in old {
        tracker.forget_image(image);
    }
}

/// Top-left-origin, y-up viewport: negative height flips clip space so it
/// matches GL conventions.
pub fn flipped_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: extent.height as f32,
        width: extent.width as f32,
        height: -(extent.height as f32),
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Source state for an attachment whose contents are discarded each frame:
/// layout undefined, but still ordered after the previous frame's writes.
fn discarded(state: ResourceState) -> ResourceState {
    ResourceState {
        layout: vk::ImageLayout::UNDEFINED,
        ..state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderEvent {
    /// Emitted after every successful rebuild; consumers re-create
    /// size-dependent resources.
    SwapchainRecreated { image_count: u32, color_format: vk::Format },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(pub usize);

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct SceneUniforms {
    pub view_proj: [[f32; 4]; 4],
}

#[derive(Debug, Clone, Copy)]
struct ActiveFrame {
    cmd: vk::CommandBuffer,
    image_index: u32,
    frame: usize,
    global_set: Option<vk::DescriptorSet>,
    bound: Option<PipelineId>,
}

pub struct FrameOrchestrator {
    ctx: Context,
    device: Device,
    swapchain: Swapchain,
    tracker: ResourceStateTracker,
    allocator: ResourceAllocator,
    upload: UploadContext,
    sync: FrameSync,
    commands: CommandScheduler,
    deletion: DeletionQueue<ResourceAllocator>,
    shaders: ShaderCache,
    descriptors: Descriptors,
    pipelines: Vec<GraphicsPipeline>,
    depth: Option<AllocatedImage>,
    scene_ubos: Vec<AllocatedBuffer>,
    view_proj: Mat4,
    clear_color: [f32; 4],
    vsync: bool,
    window_size: RenderSize,
    frames_in_flight: usize,
    frame_index: usize,
    frames_submitted: u64,
    frames_begun: u64,
    phase: PhaseMachine,
    progress: FrameProgress,
    recreate_pending: bool,
    active: Option<ActiveFrame>,
    events: VecDeque<RenderEvent>,
    pipeline_cache_dir: PathBuf,
    shut_down: bool,
}

impl FrameOrchestrator {
    pub fn new(window: &NativeWindow, size: RenderSize, cfg: &RendererConfig) -> VkResult<Self> {
        if !window.is_complete() {
            return Err(VkError::SurfaceCreation(format!("incomplete {:?} window handles", window.kind)));
        }
        let frames_in_flight = cfg.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT) as usize;
        let mut ctx = Context::initialize(window, cfg)?;
        let device = match Device::create(&ctx) {
            Ok(d) => d,
            Err(e) => {
                ctx.shutdown();
                return Err(e);
            }
        };
        let allocator = match ResourceAllocator::new(ctx.instance(), device.raw(), device.physical()) {
            Ok(a) => a,
            Err(e) => {
                let mut device = device;
                device.shutdown();
                ctx.shutdown();
                return Err(e);
            }
        };

        let mut this = Self {
            ctx,
            device,
            swapchain: Swapchain::empty(),
            tracker: ResourceStateTracker::new(),
            allocator,
            upload: UploadContext::empty(),
            sync: FrameSync::empty(),
            commands: CommandScheduler::empty(),
            deletion: DeletionQueue::new(frames_in_flight),
            shaders: ShaderCache::new(),
            descriptors: Descriptors::empty(),
            pipelines: Vec::new(),
            depth: None,
            scene_ubos: Vec::new(),
            view_proj: Mat4::IDENTITY,
            clear_color: cfg.clear_color,
            vsync: cfg.vsync,
            window_size: size,
            frames_in_flight,
            frame_index: 0,
            frames_submitted: 0,
            frames_begun: 0,
            phase: PhaseMachine::default(),
            progress: FrameProgress::Idle,
            recreate_pending: false,
            active: None,
            events: VecDeque::new(),
            pipeline_cache_dir: cfg.pipeline_cache_dir.clone(),
            shut_down: false,
        };
        if let Err(e) = this.build(cfg) {
            error!("renderer initialization failed: {e}");
            this.shutdown();
            return Err(e);
        }
        info!(
            "Vulkan renderer ready ({}x{}, fmt {:?}, {} frames in flight)",
            this.swapchain.extent().width,
            this.swapchain.extent().height,
            this.swapchain.format(),
            frames_in_flight
        );
        Ok(this)
    }

    fn build(&mut self, cfg: &RendererConfig) -> VkResult<()> {
        let n = self.frames_in_flight;
        self.swapchain = Swapchain::create(&self.ctx, &self.device, self.window_size, self.vsync)?;
        let d = self.device.raw();
        let families = self.device.families();
        self.upload = UploadContext::new(d, self.device.transfer_queue(), families.transfer)?;
        self.sync = FrameSync::new(d, n, self.swapchain.images().len())?;
        self.commands = CommandScheduler::new(d, families.graphics, n)?;
        self.descriptors = Descriptors::new(d, &cfg.descriptor_budget, n)?;
        for _ in 0..n {
            let ubo = self.allocator.create_buffer(
                std::mem::size_of::<SceneUniforms>() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryUsage::CpuToGpu,
            )?;
            self.scene_ubos.push(ubo);
        }
        if self.swapchain.is_valid() {
            self.rebuild_depth()?;
        }
        Ok(())
    }

    // ---------- accessors ----------

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn descriptors(&self) -> &Descriptors {
        &self.descriptors
    }

    pub fn phase(&self) -> FramePhase {
        self.phase.phase()
    }

    pub fn is_device_lost(&self) -> bool {
        self.phase.is_lost()
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    /// Frames whose recording started. Batched uploads are visible from the
    /// frame after the one they were queued in.
    pub fn frames_begun(&self) -> u64 {
        self.frames_begun
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth.as_ref().map_or(self.device.depth_format(), |d| d.format)
    }

    pub fn drain_events(&mut self) -> Vec<RenderEvent> {
        self.events.drain(..).collect()
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = rgba;
    }

    pub fn set_view_projection(&mut self, view_proj: Mat4) {
        self.view_proj = view_proj;
    }

    /// Takes effect on the next recreation, which is requested here.
    pub fn set_vsync(&mut self, on: bool) {
        if self.vsync != on {
            self.vsync = on;
            self.recreate_pending = true;
            debug!(vsync = on, "present mode change requested");
        }
    }

    pub fn resize(&mut self, size: RenderSize) {
        if size != self.window_size {
            self.window_size = size;
            self.recreate_pending = true;
        }
    }

    /// Latches device loss so later calls fail fast.
    fn check<T>(&mut self, r: VkResult<T>) -> VkResult<T> {
        if let Err(e) = &r {
            if e.is_device_lost() && !self.phase.is_lost() {
                error!("device lost: {e}");
                self.phase.mark_lost();
                self.active = None;
            }
        }
        r
    }

    fn deferral_slot(&self) -> usize {
        deferral_slot(
            self.frame_index,
            self.frames_in_flight,
            self.phase.phase() == FramePhase::Recording,
            self.frames_submitted,
        )
    }

    // ---------- frame loop ----------

    pub fn begin_frame(&mut self) -> VkResult<FrameStatus> {
        self.phase.begin_allowed()?;
        self.progress = FrameProgress::Idle;
        let r = self.begin_frame_inner();
        let r = self.check(r);
        self.settle(&r);
        r
    }

    /// Retires a frame that failed between acquire and submit.
    fn settle<T>(&mut self, r: &VkResult<T>) {
        if r.is_err() && !self.phase.is_lost() && self.progress.needs_retire() {
            self.abandon_frame();
        }
    }

    /// Waits the acquire semaphore (and any upload semaphore) with an empty
    /// submit that signals the frame fence, then requests a rebuild so the
    /// unpresented image is released.
    fn abandon_frame(&mut self) {
        let frame = self.frame_index;
        self.active = None;
        self.phase.finish().ok();
        self.progress = FrameProgress::Idle;
        self.recreate_pending = true;

        let slot = self.sync.frame(frame);
        let mut waits = vec![vk::SemaphoreSubmitInfo::default()
            .semaphore(slot.image_available)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        waits.extend(self.commands.take_wait_semaphores(frame));
        let submit = vk::SubmitInfo2::default().wait_semaphore_infos(&waits);
        let d = self.device.raw();
        let r = self.sync.reset_frame(d, frame).and_then(|_| {
            // SAFETY: the fence was just reset and every waited semaphore has a
            // pending signal.
            unsafe { d.queue_submit2(self.device.graphics_queue(), &[submit], slot.in_flight) }
                .at("vkQueueSubmit2")
        });
        match r {
            Ok(()) => warn!(frame, "frame abandoned after acquire"),
            Err(e) => {
                error!("could not retire abandoned frame: {e}");
                self.phase.mark_lost();
            }
        }
    }

    fn begin_frame_inner(&mut self) -> VkResult<FrameStatus> {
        if self.window_size.is_zero() {
            return Ok(FrameStatus::Skipped);
        }
        if self.recreate_pending || !self.swapchain.is_valid() {
            self.recreate_swapchain()?;
            if !self.swapchain.is_valid() {
                return Ok(FrameStatus::Skipped);
            }
        }

        let frame = self.frame_index;
        let slot = self.sync.frame(frame);
        let d = self.device.raw();
        self.sync.wait_frame(d, frame)?;
        self.deletion.drain(frame, &self.allocator);
        self.descriptors.reset_frame(d, frame)?;

        // SAFETY: swapchain and semaphore are live; the semaphore is unsignaled
        // because this frame's previous submit waited on it.
        let acquired = unsafe {
            self.device
                .swapchain_loader()
                .acquire_next_image(self.swapchain.handle(), u64::MAX, slot.image_available, vk::Fence::null())
        };
        let image_index = match acquire_outcome(acquired)? {
            AcquireOutcome::Image { index, suboptimal } => {
                if suboptimal {
                    self.recreate_pending = true;
                }
                index
            }
            AcquireOutcome::OutOfDate => {
                debug!("acquire: swapchain out of date");
                self.recreate_pending = true;
                return Ok(FrameStatus::Skipped);
            }
        };
        self.progress = FrameProgress::Acquired;

        let d = self.device.raw();
        self.sync.claim_image(d, frame, image_index as usize)?;
        self.upload
            .flush(d, &mut self.tracker, &mut self.deletion, frame, self.commands.pending_mut(frame))?;
        let cmd = self.commands.begin(d, frame)?;
        self.phase.start_recording()?;
        self.frames_begun += 1;

        let uniforms = SceneUniforms {
            view_proj: self.view_proj.to_cols_array_2d(),
        };
        self.scene_ubos[frame % self.scene_ubos.len()].write(0, bytemuck::bytes_of(&uniforms))?;

        let extent = self.swapchain.extent();
        let image = self.swapchain.images()[image_index as usize];
        let color_range = full_range(vk::ImageAspectFlags::COLOR);
        let mut barriers = Vec::with_capacity(2);
        self.tracker.assume(
            image,
            &color_range,
            ResourceState {
                stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                ..ResourceState::UNDEFINED
            },
        );
        if let Transition::Local(b) = self
            .tracker
            .transition(image, &color_range, ResourceState::COLOR_ATTACHMENT_WRITE)
        {
            barriers.push(b);
        }
        if let Some(depth) = self.depth.as_ref() {
            let range = depth.range();
            self.tracker
                .assume(depth.image, &range, discarded(ResourceState::DEPTH_ATTACHMENT_WRITE));
            if let Transition::Local(b) = self
                .tracker
                .transition(depth.image, &range, ResourceState::DEPTH_ATTACHMENT_WRITE)
            {
                barriers.push(b);
            }
        }
        cmd_barriers(d, cmd, &[], &barriers);

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(self.swapchain.views()[image_index as usize])
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            });
        let depth_attachment = self.depth.as_ref().map(|depth| {
            vk::RenderingAttachmentInfo::default()
                .image_view(depth.view)
                .image_layout(ResourceState::DEPTH_ATTACHMENT_WRITE.layout)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                })
        });
        let colors = [color_attachment];
        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let mut rendering = vk::RenderingInfo::default()
            .render_area(area)
            .layer_count(1)
            .color_attachments(&colors);
        if let (Some(att), Some(depth)) = (depth_attachment.as_ref(), self.depth.as_ref()) {
            rendering = rendering.depth_attachment(att);
            if has_stencil(depth.format) {
                rendering = rendering.stencil_attachment(att);
            }
        }
        // SAFETY: cmd is recording; attachments are in the layouts named above.
        unsafe {
            d.cmd_begin_rendering(cmd, &rendering);
            d.cmd_set_viewport(cmd, 0, &[flipped_viewport(extent)]);
            d.cmd_set_scissor(cmd, 0, &[area]);
        }

        self.active = Some(ActiveFrame {
            cmd,
            image_index,
            frame,
            global_set: None,
            bound: None,
        });
        Ok(FrameStatus::Recording)
    }

    pub fn end_frame(&mut self) -> VkResult<()> {
        if self.phase.is_lost() {
            return Err(VkError::DeviceLost { call: "end_frame" });
        }
        self.phase.recording()?;
        let r = self.end_frame_inner();
        let r = self.check(r);
        self.settle(&r);
        r
    }

    fn end_frame_inner(&mut self) -> VkResult<()> {
        let active = self
            .active
            .take()
            .ok_or(VkError::InvalidState("no frame is being recorded"))?;
        self.phase.finish()?;
        let d = self.device.raw();
        let cmd = active.cmd;
        let image = self.swapchain.images()[active.image_index as usize];

        // SAFETY: cmd is inside the rendering scope opened by begin_frame.
        unsafe { d.cmd_end_rendering(cmd) };
        let color_range = full_range(vk::ImageAspectFlags::COLOR);
        if let Transition::Local(b) = self.tracker.transition(image, &color_range, ResourceState::PRESENT) {
            cmd_barriers(d, cmd, &[], &[b]);
        }
        self.commands.end(d, active.frame)?;

        let slot = self.sync.frame(active.frame);
        let render_finished = self
            .sync
            .render_finished(active.image_index as usize)
            .ok_or(VkError::InvalidState("no render-finished semaphore for image"))?;
        let mut waits = vec![vk::SemaphoreSubmitInfo::default()
            .semaphore(slot.image_available)
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)];
        waits.extend(self.commands.take_wait_semaphores(active.frame));
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(render_finished)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let cmds = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&cmds)
            .signal_semaphore_infos(&signals);
        self.sync.reset_frame(d, active.frame)?;
        // SAFETY: cmd is executable and the fence was reset just above.
        unsafe { d.queue_submit2(self.device.graphics_queue(), &[submit], slot.in_flight) }
            .at("vkQueueSubmit2")?;
        self.progress = FrameProgress::Submitted;

        let swapchains = [self.swapchain.handle()];
        let indices = [active.image_index];
        let wait = [render_finished];
        let present = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);
        // SAFETY: the image was acquired this frame and is in PRESENT_SRC layout.
        let presented = unsafe {
            self.device
                .swapchain_loader()
                .queue_present(self.device.present_queue(), &present)
        };

        self.frame_index = (self.frame_index + 1) % self.frames_in_flight;
        self.frames_submitted += 1;

        if present_wants_recreate(presented)? {
            debug!("present: swapchain needs recreation");
            self.recreate_pending = true;
        }

        if self.recreate_pending && !self.window_size.is_zero() {
            self.recreate_swapchain()?;
        }
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> VkResult<()> {
        if self.phase.phase() == FramePhase::Recording {
            return Err(VkError::InvalidState("swapchain recreation while recording"));
        }
        let caps = SurfaceSupport::capabilities(&self.ctx, self.device.physical())?;
        if recreate_step(&caps, self.window_size) == RecreateStep::Wait {
            self.swapchain.invalidate();
            return Ok(());
        }
        self.device.wait_idle()?;
        let outcome = self
            .swapchain
            .recreate(&self.ctx, &self.device, self.window_size, self.vsync)?;
        let old_images = match outcome {
            RecreateOutcome::Deferred => return Ok(()),
            RecreateOutcome::Rebuilt { old_images } => old_images,
        };
        retire_swapchain_images(&mut self.tracker, &old_images);
        self.sync
            .on_swapchain_recreated(self.device.raw(), self.swapchain.images().len())?;
        self.rebuild_depth()?;

        let color = self.swapchain.format();
        let depth = self.depth_format();
        let slot = self.deferral_slot();
        let d = self.device.raw();
        for p in &mut self.pipelines {
            p.set_attachment_formats(d, &mut self.shaders, &mut self.deletion, slot, color, depth)?;
        }

        self.recreate_pending = false;
        self.events.push_back(RenderEvent::SwapchainRecreated {
            image_count: self.swapchain.image_count(),
            color_format: color,
        });
        Ok(())
    }

    /// Device must be idle.
    fn rebuild_depth(&mut self) -> VkResult<()> {
        if let Some(old) = self.depth.take() {
            self.tracker.forget_image(old.image);
            self.allocator.destroy_image(old);
        }
        let format = self.device.depth_format();
        let aspect = if has_stencil(format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        };
        let image = self.allocator.create_image(&ImageDesc {
            extent: self.swapchain.extent(),
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect,
        })?;
        self.depth = Some(image);
        Ok(())
    }

    // ---------- resources ----------

    /// Creates a device-local buffer holding `bytes`. Before the first frame
    /// the copy blocks; afterwards it rides the next frame's upload batch, so
    /// the buffer is usable from the frame after [`Self::frames_begun`].
    /// `final_state` names how the graphics queue will read it.
    pub fn create_device_buffer(
        &mut self,
        usage: vk::BufferUsageFlags,
        bytes: &[u8],
        final_state: ResourceState,
    ) -> VkResult<AllocatedBuffer> {
        if self.phase.is_lost() {
            return Err(VkError::DeviceLost { call: "create_device_buffer" });
        }
        let final_state = final_state.on_queue(self.device.families().graphics);
        let buffer = self.allocator.create_buffer(
            bytes.len() as vk::DeviceSize,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryUsage::GpuOnly,
        )?;
        let slot = self.deferral_slot();
        let r = match upload_mode(self.frames_begun) {
            UploadMode::Blocking => self.upload.upload_buffer(
                &self.allocator,
                &mut self.tracker,
                &mut self.deletion,
                slot,
                self.commands.pending_mut(slot),
                buffer.buffer,
                bytes,
                final_state,
            ),
            UploadMode::Batched => self.upload.enqueue_buffer(&self.allocator, buffer.buffer, bytes, final_state),
        };
        match self.check(r) {
            Ok(()) => Ok(buffer),
            Err(e) => {
                warn!("buffer upload failed: {e}");
                self.defer_destroy_buffer(buffer);
                Err(e)
            }
        }
    }

    /// Destroys `buffer` once every frame that might reference it retired.
    pub fn defer_destroy_buffer(&mut self, buffer: AllocatedBuffer) {
        let slot = self.deferral_slot();
        self.deletion.push(slot, move |a: &ResourceAllocator| a.destroy_buffer(buffer));
    }

    /// Creates a sampled device-local image holding `bytes` (tightly packed
    /// texels of `desc.format`). Uploads follow [`upload_mode`] like buffers.
    pub fn create_device_image(
        &mut self,
        desc: &ImageDesc,
        bytes: &[u8],
        final_state: ResourceState,
    ) -> VkResult<AllocatedImage> {
        if self.phase.is_lost() {
            return Err(VkError::DeviceLost { call: "create_device_image" });
        }
        let final_state = final_state.on_queue(self.device.families().graphics);
        let image = self.allocator.create_image(&ImageDesc {
            usage: desc.usage | vk::ImageUsageFlags::TRANSFER_DST,
            ..*desc
        })?;
        let range = image.range();
        let slot = self.deferral_slot();
        let r = match upload_mode(self.frames_begun) {
            UploadMode::Blocking => self.upload.upload_image(
                &self.allocator,
                &mut self.tracker,
                &mut self.deletion,
                slot,
                self.commands.pending_mut(slot),
                image.image,
                range,
                image.extent,
                bytes,
                final_state,
            ),
            UploadMode::Batched => {
                self.upload
                    .enqueue_image(&self.allocator, image.image, range, image.extent, bytes, final_state)
            }
        };
        match self.check(r) {
            Ok(()) => Ok(image),
            Err(e) => {
                warn!("image upload failed: {e}");
                self.defer_destroy_image(image);
                Err(e)
            }
        }
    }

    pub fn defer_destroy_image(&mut self, image: AllocatedImage) {
        self.tracker.forget_image(image.image);
        let slot = self.deferral_slot();
        self.deletion.push(slot, move |a: &ResourceAllocator| a.destroy_image(image));
    }

    pub fn create_pipeline(&mut self, desc: GraphicsPipelineDescription) -> VkResult<PipelineId> {
        let p = GraphicsPipeline::create(
            self.device.raw(),
            self.device.properties(),
            &self.pipeline_cache_dir,
            &mut self.shaders,
            desc,
        )?;
        self.pipelines.push(p);
        Ok(PipelineId(self.pipelines.len() - 1))
    }

    /// Mesh pipeline description bound to the current attachment formats and
    /// the global descriptor layout.
    pub fn mesh_pipeline_description(&self, vertex: PathBuf, fragment: PathBuf) -> GraphicsPipelineDescription {
        GraphicsPipelineDescription::mesh(
            vertex,
            fragment,
            vec![self.descriptors.global_layout()],
            self.swapchain.format(),
            self.depth_format(),
        )
    }

    /// Reloads every pipeline from disk. A failing pipeline keeps its old
    /// version; the first error is returned.
    pub fn reload_shaders(&mut self) -> VkResult<()> {
        let slot = self.deferral_slot();
        let d = self.device.raw();
        let mut first = None;
        for p in &mut self.pipelines {
            if let Err(e) = p.recreate(d, &mut self.shaders, &mut self.deletion, slot) {
                warn!(vs = %p.description().vertex_shader.display(), "shader reload failed: {e}");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    // ---------- recording ----------

    /// Binds `pipeline` (and the frame's global set) unless already bound.
    pub fn bind_pipeline(&mut self, pipeline: PipelineId) -> VkResult<vk::CommandBuffer> {
        self.phase.recording()?;
        let mut active = self
            .active
            .ok_or(VkError::InvalidState("no frame is being recorded"))?;
        let p = self
            .pipelines
            .get(pipeline.0)
            .ok_or(VkError::InvalidState("unknown pipeline"))?;
        if active.bound == Some(pipeline) {
            return Ok(active.cmd);
        }
        let d = self.device.raw();
        let set = match active.global_set {
            Some(set) => set,
            None => {
                let (set, fresh) = self.descriptors.global_set(d, active.frame)?;
                if fresh {
                    let ubo = &self.scene_ubos[active.frame % self.scene_ubos.len()];
                    DescriptorWriter::new()
                        .write_buffer(set, GLOBAL_UBO_BINDING, ubo.buffer, 0, ubo.size)
                        .update(d);
                }
                active.global_set = Some(set);
                set
            }
        };
        // SAFETY: cmd is recording inside dynamic rendering with matching formats.
        unsafe {
            d.cmd_bind_pipeline(active.cmd, vk::PipelineBindPoint::GRAPHICS, p.handle());
            d.cmd_bind_descriptor_sets(
                active.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                p.layout(),
                0,
                &[set],
                &[],
            );
        }
        active.bound = Some(pipeline);
        self.active = Some(active);
        Ok(active.cmd)
    }

    /// Records an indexed draw with `model` pushed as the vertex push constant.
    pub fn draw_indexed(
        &mut self,
        pipeline: PipelineId,
        vertex: vk::Buffer,
        index: vk::Buffer,
        index_count: u32,
        model: &Mat4,
    ) -> VkResult<()> {
        let cmd = self.bind_pipeline(pipeline)?;
        let layout = self.pipelines[pipeline.0].layout();
        let d = self.device.raw();
        let m = model.to_cols_array();
        // SAFETY: buffers are live until their deferred destruction; cmd is recording.
        unsafe {
            d.cmd_push_constants(cmd, layout, vk::ShaderStageFlags::VERTEX, 0, bytemuck::cast_slice(&m));
            d.cmd_bind_vertex_buffers(cmd, 0, &[vertex], &[0]);
            d.cmd_bind_index_buffer(cmd, index, 0, vk::IndexType::UINT32);
            d.cmd_draw_indexed(cmd, index_count, 1, 0, 0, 0);
        }
        Ok(())
    }

    // ---------- teardown ----------

    /// Idempotent. Skips the idle wait once the device is lost.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if self.active.take().is_some() {
            warn!("shutdown while a frame was recording; the frame is discarded");
        }
        if !self.phase.is_lost() {
            if let Err(e) = self.device.wait_idle() {
                error!("wait idle before shutdown failed: {e}");
            }
        }
        let drained = self.deletion.drain_all(&self.allocator);
        debug!(drained, "deletion queues flushed");
        let d = self.device.raw().clone();

        for mut p in self.pipelines.drain(..) {
            p.shutdown(&d);
        }
        self.shaders.shutdown(&d);
        self.descriptors.shutdown(&d);
        for ubo in self.scene_ubos.drain(..) {
            self.allocator.destroy_buffer(ubo);
        }
        if let Some(depth) = self.depth.take() {
            self.allocator.destroy_image(depth);
        }
        self.sync.shutdown(&d);
        self.commands.shutdown(&d);
        self.upload.shutdown(&self.allocator);
        self.allocator.shutdown();
        self.tracker.reset();
        self.swapchain.shutdown(&self.device);
        self.device.shutdown();
        self.ctx.shutdown();
        info!(frames = self.frames_submitted, "Vulkan renderer shut down");
    }
}

impl Drop for FrameOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_alternate() {
        let mut m = PhaseMachine::default();
        assert!(m.finish().is_err());
        m.start_recording().unwrap();
        assert_eq!(m.phase(), FramePhase::Recording);
        assert!(matches!(m.start_recording(), Err(VkError::InvalidState(_))));
        m.finish().unwrap();
        assert_eq!(m.phase(), FramePhase::Idle);
        assert!(m.finish().is_err());
    }

    #[test]
    fn lost_device_refuses_new_frames() {
        let mut m = PhaseMachine::default();
        m.start_recording().unwrap();
        m.mark_lost();
        assert!(m.is_lost());
        assert_eq!(m.phase(), FramePhase::Idle);
        assert!(matches!(m.begin_allowed(), Err(VkError::DeviceLost { .. })));
        assert!(m.start_recording().unwrap_err().is_device_lost());
    }

    #[test]
    fn deferral_slot_covers_newest_user() {
        // Before the first submit nothing can reference the resource.
        assert_eq!(deferral_slot(0, 2, false, 0), 0);
        // Recording frame 1 of 3: its own fence covers the use.
        assert_eq!(deferral_slot(1, 3, true, 4), 1);
        // Between frames the last submitted frame is the previous index.
        assert_eq!(deferral_slot(1, 3, false, 4), 0);
        assert_eq!(deferral_slot(0, 3, false, 3), 2);
        assert_eq!(deferral_slot(0, 1, false, 9), 0);
    }

    #[test]
    fn viewport_flips_y() {
        let v = flipped_viewport(vk::Extent2D { width: 800, height: 600 });
        assert_eq!(v.y, 600.0);
        assert_eq!(v.height, -600.0);
        assert_eq!(v.width, 800.0);
        assert_eq!((v.min_depth, v.max_depth), (0.0, 1.0));
    }

    #[test]
    fn discarded_attachment_keeps_stage() {
        let s = discarded(ResourceState::DEPTH_ATTACHMENT_WRITE);
        assert_eq!(s.layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(s.access_mask, ResourceState::DEPTH_ATTACHMENT_WRITE.access_mask);
        assert_eq!(s.stage_mask, ResourceState::DEPTH_ATTACHMENT_WRITE.stage_mask);
    }

    #[test]
    fn only_pre_frame_uploads_block() {
        assert_eq!(upload_mode(0), UploadMode::Blocking);
        assert_eq!(upload_mode(1), UploadMode::Batched);
        assert_eq!(upload_mode(500), UploadMode::Batched);
    }

    #[test]
    fn acquire_results() {
        assert_eq!(
            acquire_outcome(Ok((2, false))).unwrap(),
            AcquireOutcome::Image { index: 2, suboptimal: false }
        );
        assert_eq!(
            acquire_outcome(Ok((0, true))).unwrap(),
            AcquireOutcome::Image { index: 0, suboptimal: true }
        );
        assert_eq!(
            acquire_outcome(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert!(acquire_outcome(Err(vk::Result::ERROR_DEVICE_LOST))
            .unwrap_err()
            .is_device_lost());
        assert!(matches!(
            acquire_outcome(Err(vk::Result::ERROR_SURFACE_LOST_KHR)),
            Err(VkError::Vulkan { call: "vkAcquireNextImageKHR", .. })
        ));
    }

    #[test]
    fn present_results() {
        assert!(!present_wants_recreate(Ok(false)).unwrap());
        assert!(present_wants_recreate(Ok(true)).unwrap());
        assert!(present_wants_recreate(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap());
        assert!(present_wants_recreate(Err(vk::Result::ERROR_DEVICE_LOST))
            .unwrap_err()
            .is_device_lost());
    }

    #[test]
    fn only_unsubmitted_acquires_need_retiring() {
        assert!(!FrameProgress::Idle.needs_retire());
        assert!(FrameProgress::Acquired.needs_retire());
        assert!(!FrameProgress::Submitted.needs_retire());
    }

    fn surface(current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: current,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            ..Default::default()
        }
    }

    #[test]
    fn zero_surface_waits_even_with_sized_window() {
        let window = RenderSize::new(800, 600);
        assert_eq!(
            recreate_step(&surface(vk::Extent2D { width: 0, height: 0 }), window),
            RecreateStep::Wait
        );
        assert_eq!(
            recreate_step(&surface(vk::Extent2D { width: 800, height: 600 }), window),
            RecreateStep::Rebuild
        );
        let undefined = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        assert_eq!(recreate_step(&surface(undefined), window), RecreateStep::Rebuild);
        assert_eq!(recreate_step(&surface(undefined), RenderSize::new(0, 0)), RecreateStep::Wait);
    }

    #[test]
    fn recreated_swapchain_images_start_undefined() {
        use ash::vk::Handle;
        let color = full_range(vk::ImageAspectFlags::COLOR);
        let depth_range = full_range(vk::ImageAspectFlags::DEPTH);
        let old = [vk::Image::from_raw(1), vk::Image::from_raw(2)];
        let depth = vk::Image::from_raw(9);
        let mut tracker = ResourceStateTracker::new();
        for &img in &old {
            tracker.assume(img, &color, ResourceState::PRESENT);
        }
        tracker.assume(depth, &depth_range, ResourceState::DEPTH_ATTACHMENT_WRITE);

        retire_swapchain_images(&mut tracker, &old);
        for &img in &old {
            assert_eq!(tracker.state(img, &color), ResourceState::default());
        }
        assert_eq!(tracker.state(depth, &depth_range), ResourceState::DEPTH_ATTACHMENT_WRITE);
        assert_eq!(tracker.len(), 1);
    }

    /// Pushes a retired pipeline at the deferral slot, then replays frame
    /// begins (each draining its own slot) until it is destroyed.
    fn begins_until_destroyed(n: usize, frame_index: usize, recording: bool, submitted: u64) -> usize {
        use std::cell::Cell;
        use std::rc::Rc;
        let destroyed = Rc::new(Cell::new(false));
        let mut q = DeletionQueue::<()>::new(n);
        let flag = destroyed.clone();
        q.push(deferral_slot(frame_index, n, recording, submitted), move |_| flag.set(true));
        // A recording frame ends first, advancing the index.
        let mut frame = if recording { (frame_index + 1) % n } else { frame_index };
        for begins in 1..=2 * n {
            q.drain(frame, &());
            if destroyed.get() {
                return begins;
            }
            frame = (frame + 1) % n;
        }
        panic!("pipeline never destroyed");
    }

    #[test]
    fn reloaded_pipeline_outlives_every_frame_in_flight() {
        for n in 1..=MAX_FRAMES_IN_FLIGHT as usize {
            for frame_index in 0..n {
                assert_eq!(begins_until_destroyed(n, frame_index, false, 7), n, "between frames, n={n}");
                assert_eq!(begins_until_destroyed(n, frame_index, true, 7), n, "mid-frame, n={n}");
            }
        }
        // Nothing was ever submitted: the first begin may free it.
        assert_eq!(begins_until_destroyed(2, 0, false, 0), 1);
    }

    #[test]
    fn scene_uniforms_are_one_matrix() {
        assert_eq!(std::mem::size_of::<SceneUniforms>(), 64);
        let u = SceneUniforms {
            view_proj: Mat4::IDENTITY.to_cols_array_2d(),
        };
        let bytes = bytemuck::bytes_of(&u);
        assert_eq!(&bytes[0..4], &1.0f32.to_ne_bytes());
    }
}
