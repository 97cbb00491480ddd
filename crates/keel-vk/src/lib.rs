// SPDX-License-Identifier: CEPL-1.0
//! Vulkan 1.3 renderer core: dynamic rendering, synchronization2, per-frame
//! resource rings and explicit teardown.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod allocator;
pub mod commands;
pub mod config;
pub mod context;
pub mod deletion;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod frame_sync;
pub mod orchestrator;
pub mod pipeline;
pub mod state_tracker;
pub mod swapchain;
pub mod upload;

pub use config::{DescriptorBudget, RendererConfig, ShaderPaths, MAX_FRAMES_IN_FLIGHT};
pub use error::{VkError, VkResult};
pub use orchestrator::{FrameOrchestrator, FramePhase, PipelineId, RenderEvent, SceneUniforms};

use allocator::AllocatedBuffer;
use ash::vk;
use fnv::FnvHashMap;
use glam::Mat4;
use keel_render::{DrawItem, FrameStatus, MeshId, NativeWindow, RenderSize, Renderer, Vertex};
use state_tracker::ResourceState;
use tracing::{debug, info};

const VERTEX_INPUT: ResourceState = ResourceState {
    layout: vk::ImageLayout::UNDEFINED,
    stage_mask: vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
    access_mask: vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
    queue_family_index: vk::QUEUE_FAMILY_IGNORED,
};

const INDEX_INPUT: ResourceState = ResourceState {
    layout: vk::ImageLayout::UNDEFINED,
    stage_mask: vk::PipelineStageFlags2::INDEX_INPUT,
    access_mask: vk::AccessFlags2::INDEX_READ,
    queue_family_index: vk::QUEUE_FAMILY_IGNORED,
};

/// Rejects meshes the GPU would read out of bounds.
pub fn validate_mesh(vertices: &[Vertex], indices: &[u32]) -> VkResult<()> {
    if vertices.is_empty() || indices.is_empty() {
        return Err(VkError::InvalidState("mesh needs vertices and indices"));
    }
    if indices.iter().any(|&i| i as usize >= vertices.len()) {
        return Err(VkError::InvalidState("mesh index out of range"));
    }
    Ok(())
}

/// A mesh created while frame `ready_after` was the newest begun frame has
/// its upload flushed by the next one.
pub fn mesh_resident(ready_after: u64, frames_begun: u64) -> bool {
    frames_begun > ready_after
}

struct GpuMesh {
    vertex: AllocatedBuffer,
    index: AllocatedBuffer,
    index_count: u32,
    ready_after: u64,
}

pub struct VkRenderer {
    frames: FrameOrchestrator,
    meshes: FnvHashMap<MeshId, GpuMesh>,
    next_mesh: u32,
    mesh_pipeline: Option<PipelineId>,
    shut_down: bool,
}

impl VkRenderer {
    pub fn orchestrator(&self) -> &FrameOrchestrator {
        &self.frames
    }

    /// Swapchain events since the last call, oldest first.
    pub fn drain_events(&mut self) -> Vec<RenderEvent> {
        self.frames.drain_events()
    }

    pub fn reload_shaders(&mut self) -> VkResult<()> {
        self.frames.reload_shaders()
    }

    pub fn set_view_projection(&mut self, view_proj: Mat4) {
        self.frames.set_view_projection(view_proj);
    }

    /// Returns false for an unknown id. Buffers live until every frame that
    /// may still draw them has retired.
    pub fn destroy_mesh(&mut self, id: MeshId) -> bool {
        let Some(mesh) = self.meshes.remove(&id) else {
            return false;
        };
        self.frames.defer_destroy_buffer(mesh.vertex);
        self.frames.defer_destroy_buffer(mesh.index);
        debug!(mesh = id.0, "mesh destroyed");
        true
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    fn release(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let ids: Vec<MeshId> = self.meshes.keys().copied().collect();
        for id in ids {
            self.destroy_mesh(id);
        }
        self.frames.shutdown();
    }
}

impl Renderer for VkRenderer {
    type Error = VkError;
    type Config = RendererConfig;

    fn initialize(window: NativeWindow, size: RenderSize, config: RendererConfig) -> VkResult<Self> {
        let config = config.normalized();
        let mut frames = FrameOrchestrator::new(&window, size, &config)?;
        let mesh_pipeline = match &config.mesh_shader {
            Some(paths) => {
                let desc = frames.mesh_pipeline_description(paths.vertex.clone(), paths.fragment.clone());
                match frames.create_pipeline(desc) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        frames.shutdown();
                        return Err(e);
                    }
                }
            }
            None => {
                info!("no mesh shader configured; draw_mesh is disabled");
                None
            }
        };
        Ok(Self {
            frames,
            meshes: FnvHashMap::default(),
            next_mesh: 0,
            mesh_pipeline,
            shut_down: false,
        })
    }

    fn shutdown(&mut self) -> VkResult<()> {
        self.release();
        Ok(())
    }

    fn begin_frame(&mut self) -> VkResult<FrameStatus> {
        self.frames.begin_frame()
    }

    fn end_frame(&mut self) -> VkResult<()> {
        self.frames.end_frame()
    }

    fn resize(&mut self, size: RenderSize) -> VkResult<()> {
        self.frames.resize(size);
        Ok(())
    }

    fn draw_mesh(&mut self, item: &DrawItem) -> VkResult<()> {
        let pipeline = self
            .mesh_pipeline
            .ok_or(VkError::InvalidState("no mesh pipeline configured"))?;
        let mesh = self
            .meshes
            .get(&item.mesh)
            .ok_or(VkError::InvalidState("unknown mesh"))?;
        if !mesh_resident(mesh.ready_after, self.frames.frames_begun()) {
            debug!(mesh = item.mesh.0, "mesh upload still pending; draw skipped");
            return Ok(());
        }
        let (vertex, index, count) = (mesh.vertex.buffer, mesh.index.buffer, mesh.index_count);
        self.frames.draw_indexed(pipeline, vertex, index, count, &item.transform)
    }

    fn create_mesh(&mut self, vertices: &[Vertex], indices: &[u32]) -> VkResult<MeshId> {
        validate_mesh(vertices, indices)?;
        let vertex = self.frames.create_device_buffer(
            vk::BufferUsageFlags::VERTEX_BUFFER,
            bytemuck::cast_slice(vertices),
            VERTEX_INPUT,
        )?;
        let index = match self.frames.create_device_buffer(
            vk::BufferUsageFlags::INDEX_BUFFER,
            bytemuck::cast_slice(indices),
            INDEX_INPUT,
        ) {
            Ok(b) => b,
            Err(e) => {
                self.frames.defer_destroy_buffer(vertex);
                return Err(e);
            }
        };
        let id = MeshId(self.next_mesh);
        self.next_mesh += 1;
        self.meshes.insert(
            id,
            GpuMesh {
                vertex,
                index,
                index_count: indices.len() as u32,
                ready_after: self.frames.frames_begun(),
            },
        );
        debug!(mesh = id.0, vertices = vertices.len(), indices = indices.len(), "mesh created");
        Ok(id)
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.frames.set_clear_color(rgba);
    }

    fn set_vsync(&mut self, on: bool) {
        self.frames.set_vsync(on);
    }
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        self.release();
    }
}
