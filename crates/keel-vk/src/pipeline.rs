// SPDX-License-Identifier: CEPL-1.0
//! Shader-module cache, graphics pipelines for dynamic rendering and the
//! on-disk pipeline cache.
use crate::allocator::ResourceAllocator;
use crate::deletion::DeletionQueue;
use crate::error::{VkError, VkResult, VkResultExt};
use ash::util::read_spv;
use ash::vk;
use fnv::{FnvHashMap, FnvHasher};
use keel_render::Vertex;
use std::fs;
use std::hash::Hasher;
use std::io::Cursor;
use std::path::{Path, PathBuf};

const WRITE_ALL: vk::ColorComponentFlags = vk::ColorComponentFlags::from_raw(
    vk::ColorComponentFlags::R.as_raw()
        | vk::ColorComponentFlags::G.as_raw()
        | vk::ColorComponentFlags::B.as_raw()
        | vk::ColorComponentFlags::A.as_raw(),
);

pub const DYNAMIC_STATES: [vk::DynamicState; 2] = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];

/// Validates raw SPIR-V bytes and converts them to words.
pub fn parse_spirv(path: &Path, bytes: &[u8]) -> VkResult<Vec<u32>> {
    let fail = |reason: String| VkError::Shader {
        path: path.to_path_buf(),
        reason,
    };
    if bytes.is_empty() {
        return Err(fail("empty SPIR-V file".into()));
    }
    if bytes.len() % 4 != 0 {
        return Err(fail(format!("size {} is not a multiple of 4", bytes.len())));
    }
    read_spv(&mut Cursor::new(bytes)).map_err(|e| fail(e.to_string()))
}

pub fn load_spirv(path: &Path) -> VkResult<Vec<u32>> {
    let bytes = fs::read(path).map_err(|e| VkError::Shader {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_spirv(path, &bytes)
}

/// Shader modules keyed by SPIR-V path.
#[derive(Debug, Default)]
pub struct ShaderCache {
    modules: FnvHashMap<PathBuf, vk::ShaderModule>,
}

impl ShaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load(&mut self, device: &ash::Device, path: &Path) -> VkResult<vk::ShaderModule> {
        if let Some(&m) = self.modules.get(path) {
            return Ok(m);
        }
        let code = load_spirv(path)?;
        let info = vk::ShaderModuleCreateInfo::default().code(&code);
        // SAFETY: code is validated SPIR-V words.
        let module = unsafe { device.create_shader_module(&info, None) }.at("vkCreateShaderModule")?;
        tracing::debug!(path = %path.display(), "shader module loaded");
        self.modules.insert(path.to_path_buf(), module);
        Ok(module)
    }

    /// Drops the cached module so the next request re-reads the file.
    /// Pipelines already built from it stay valid.
    pub fn evict(&mut self, device: &ash::Device, path: &Path) -> bool {
        match self.modules.remove(path) {
            Some(m) => {
                // SAFETY: modules are only referenced during pipeline creation.
                unsafe { device.destroy_shader_module(m, None) };
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn shutdown(&mut self, device: &ash::Device) {
        for (_, m) in self.modules.drain() {
            // SAFETY: no pipeline creation is in progress.
            unsafe { device.destroy_shader_module(m, None) };
        }
    }
}

impl Drop for ShaderCache {
    fn drop(&mut self) {
        debug_assert!(self.modules.is_empty(), "ShaderCache dropped without shutdown");
    }
}

pub fn hex_bytes(b: &[u8]) -> String {
    let mut s = String::with_capacity(b.len() * 2);
    for x in b {
        use std::fmt::Write as _;
        let _ = write!(&mut s, "{x:02x}");
    }
    s
}

pub fn shader_hash(vertex: &Path, fragment: &Path) -> u64 {
    let mut h = FnvHasher::default();
    h.write(vertex.as_os_str().as_encoded_bytes());
    h.write(&[0]);
    h.write(fragment.as_os_str().as_encoded_bytes());
    h.finish()
}

/// `<dir>/<vendor>_<device>_<driver>_<uuidHex>_<shaderHash>.bin`
pub fn pipeline_cache_path(
    dir: &Path,
    props: &vk::PhysicalDeviceProperties,
    vertex: &Path,
    fragment: &Path,
) -> PathBuf {
    dir.join(format!(
        "{:04x}_{:04x}_{:08x}_{}_{:016x}.bin",
        props.vendor_id,
        props.device_id,
        props.driver_version,
        hex_bytes(&props.pipeline_cache_uuid),
        shader_hash(vertex, fragment)
    ))
}

/// Write-to-temp then rename, so readers never see a torn blob.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineDescription {
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub alpha_blend: bool,
    pub push_constants: Option<vk::PushConstantRange>,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub color_format: vk::Format,
    /// `UNDEFINED` renders without depth.
    pub depth_format: vk::Format,
}

impl GraphicsPipelineDescription {
    /// Layout used by the built-in mesh path: one interleaved [`Vertex`]
    /// stream and the model matrix as a vertex push constant.
    pub fn mesh(
        vertex_shader: PathBuf,
        fragment_shader: PathBuf,
        set_layouts: Vec<vk::DescriptorSetLayout>,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> Self {
        let vec3 = std::mem::size_of::<[f32; 3]>() as u32;
        Self {
            vertex_shader,
            fragment_shader,
            vertex_bindings: vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: std::mem::size_of::<Vertex>() as u32,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            vertex_attributes: vec![
                vk::VertexInputAttributeDescription {
                    location: 0,
                    binding: 0,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: 0,
                },
                vk::VertexInputAttributeDescription {
                    location: 1,
                    binding: 0,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: vec3,
                },
            ],
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            // Viewport height is negative, so CCW stays front-facing.
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: depth_format != vk::Format::UNDEFINED,
            depth_write: depth_format != vk::Format::UNDEFINED,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            alpha_blend: false,
            push_constants: Some(vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: std::mem::size_of::<glam::Mat4>() as u32,
            }),
            set_layouts,
            color_format,
            depth_format,
        }
    }
}

fn create_pipeline_cache(device: &ash::Device, path: &Path) -> VkResult<vk::PipelineCache> {
    let data = fs::read(path).ok();
    let mut info = vk::PipelineCacheCreateInfo::default();
    if let Some(bytes) = data.as_deref() {
        // Header compatibility is checked by the driver; a stale blob is ignored.
        info = info.initial_data(bytes);
        tracing::debug!(path = %path.display(), size = bytes.len(), "pipeline cache loaded");
    }
    // SAFETY: data outlives the call.
    unsafe { device.create_pipeline_cache(&info, None) }.at("vkCreatePipelineCache")
}

fn build_pipeline(
    device: &ash::Device,
    shaders: &mut ShaderCache,
    cache: vk::PipelineCache,
    layout: vk::PipelineLayout,
    desc: &GraphicsPipelineDescription,
) -> VkResult<vk::Pipeline> {
    let vs = shaders.get_or_load(device, &desc.vertex_shader)?;
    let fs = shaders.get_or_load(device, &desc.fragment_shader)?;
    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vs)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fs)
            .name(c"main"),
    ];

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&desc.vertex_bindings)
        .vertex_attribute_descriptions(&desc.vertex_attributes);
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: desc.topology,
        ..Default::default()
    };
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&DYNAMIC_STATES);
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: desc.polygon_mode,
        cull_mode: desc.cull_mode,
        front_face: desc.front_face,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
        depth_test_enable: desc.depth_test.into(),
        depth_write_enable: desc.depth_write.into(),
        depth_compare_op: desc.depth_compare,
        ..Default::default()
    };
    let blend_attachment = if desc.alpha_blend {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: WRITE_ALL,
        }
    } else {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::FALSE,
            color_write_mask: WRITE_ALL,
            ..Default::default()
        }
    };
    let attachments = [blend_attachment];
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);

    let color_formats = [desc.color_format];
    let mut rendering = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(desc.depth_format);
    if crate::device::has_stencil(desc.depth_format) {
        rendering = rendering.stencil_attachment_format(desc.depth_format);
    }

    let info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&raster)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering);

    // SAFETY: every referenced state struct outlives the call.
    let pipelines = unsafe { device.create_graphics_pipelines(cache, &[info], None) }
        .map_err(|(_, r)| VkError::from_result("vkCreateGraphicsPipelines", r))?;
    pipelines
        .first()
        .copied()
        .ok_or(VkError::InvalidState("vkCreateGraphicsPipelines returned nothing"))
}

pub struct GraphicsPipeline {
    desc: GraphicsPipelineDescription,
    cache: vk::PipelineCache,
    cache_path: PathBuf,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

impl GraphicsPipeline {
    pub fn create(
        device: &ash::Device,
        props: &vk::PhysicalDeviceProperties,
        cache_dir: &Path,
        shaders: &mut ShaderCache,
        desc: GraphicsPipelineDescription,
    ) -> VkResult<Self> {
        let cache_path = pipeline_cache_path(cache_dir, props, &desc.vertex_shader, &desc.fragment_shader);
        let cache = create_pipeline_cache(device, &cache_path)?;

        let push = desc.push_constants.as_slice();
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&desc.set_layouts)
            .push_constant_ranges(push);
        // SAFETY: the set layouts belong to device.
        let layout = match unsafe { device.create_pipeline_layout(&layout_info, None) }.at("vkCreatePipelineLayout") {
            Ok(l) => l,
            Err(e) => {
                // SAFETY: cache is unused.
                unsafe { device.destroy_pipeline_cache(cache, None) };
                return Err(e);
            }
        };

        match build_pipeline(device, shaders, cache, layout, &desc) {
            Ok(pipeline) => {
                tracing::info!(
                    vs = %desc.vertex_shader.display(),
                    fs = %desc.fragment_shader.display(),
                    "graphics pipeline created"
                );
                Ok(Self {
                    desc,
                    cache,
                    cache_path,
                    layout,
                    pipeline,
                })
            }
            Err(e) => {
                // SAFETY: neither object was used.
                unsafe {
                    device.destroy_pipeline_layout(layout, None);
                    device.destroy_pipeline_cache(cache, None);
                }
                Err(e)
            }
        }
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn description(&self) -> &GraphicsPipelineDescription {
        &self.desc
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    fn replace(
        &mut self,
        device: &ash::Device,
        shaders: &mut ShaderCache,
        deletion: &mut DeletionQueue<ResourceAllocator>,
        slot: usize,
    ) -> VkResult<()> {
        let new = build_pipeline(device, shaders, self.cache, self.layout, &self.desc)?;
        let old = std::mem::replace(&mut self.pipeline, new);
        // SAFETY (deferred): runs after slot's fence has signaled again.
        deletion.push(slot, move |a: &ResourceAllocator| unsafe { a.device().destroy_pipeline(old, None) });
        Ok(())
    }

    /// Re-reads both shader files and rebuilds. The old pipeline is destroyed
    /// through `slot`'s deletion queue; on failure the old pipeline stays.
    pub fn recreate(
        &mut self,
        device: &ash::Device,
        shaders: &mut ShaderCache,
        deletion: &mut DeletionQueue<ResourceAllocator>,
        slot: usize,
    ) -> VkResult<()> {
        shaders.evict(device, &self.desc.vertex_shader);
        shaders.evict(device, &self.desc.fragment_shader);
        self.replace(device, shaders, deletion, slot)?;
        tracing::info!(vs = %self.desc.vertex_shader.display(), "graphics pipeline reloaded");
        Ok(())
    }

    /// Rebuilds when the attachment formats changed (swapchain recreation).
    pub fn set_attachment_formats(
        &mut self,
        device: &ash::Device,
        shaders: &mut ShaderCache,
        deletion: &mut DeletionQueue<ResourceAllocator>,
        slot: usize,
        color: vk::Format,
        depth: vk::Format,
    ) -> VkResult<bool> {
        if self.desc.color_format == color && self.desc.depth_format == depth {
            return Ok(false);
        }
        self.desc.color_format = color;
        self.desc.depth_format = depth;
        self.replace(device, shaders, deletion, slot)?;
        Ok(true)
    }

    /// Writes the cache blob back and destroys every handle. Device must be idle.
    pub fn shutdown(&mut self, device: &ash::Device) {
        if self.cache != vk::PipelineCache::null() {
            // SAFETY: cache belongs to device.
            match unsafe { device.get_pipeline_cache_data(self.cache) } {
                Ok(bytes) if !bytes.is_empty() => match write_atomic(&self.cache_path, &bytes) {
                    Ok(()) => tracing::debug!(path = %self.cache_path.display(), size = bytes.len(), "pipeline cache saved"),
                    Err(e) => tracing::warn!(path = %self.cache_path.display(), "pipeline cache not saved: {e}"),
                },
                Ok(_) => {}
                Err(r) => tracing::warn!("vkGetPipelineCacheData failed: {r:?}"),
            }
        }
        // SAFETY: the device is idle.
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_pipeline_cache(self.cache, None);
        }
        self.pipeline = vk::Pipeline::null();
        self.layout = vk::PipelineLayout::null();
        self.cache = vk::PipelineCache::null();
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        debug_assert!(self.pipeline == vk::Pipeline::null(), "GraphicsPipeline dropped without shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = 0x0723_0203u32.to_le_bytes();

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("keel-vk-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn empty_and_misaligned_spirv_is_rejected() {
        let p = Path::new("mesh.vert.spv");
        assert!(matches!(parse_spirv(p, &[]), Err(VkError::Shader { .. })));
        let err = parse_spirv(p, &[1, 2, 3, 4, 5]).unwrap_err();
        assert!(err.to_string().contains("multiple of 4"));
    }

    #[test]
    fn spirv_needs_magic_number() {
        let p = Path::new("bad.spv");
        assert!(parse_spirv(p, &[0u8; 8]).is_err());
        let mut good = MAGIC.to_vec();
        good.extend_from_slice(&[0, 0, 1, 0]);
        assert_eq!(parse_spirv(p, &good).unwrap(), vec![0x0723_0203, 0x0001_0000]);
    }

    #[test]
    fn missing_shader_file_names_the_path() {
        let path = scratch("missing").join("nope.spv");
        match load_spirv(&path) {
            Err(VkError::Shader { path: p, .. }) => assert_eq!(p, path),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cache_path_encodes_device_and_shaders() {
        let mut props = vk::PhysicalDeviceProperties {
            vendor_id: 0x10de,
            device_id: 0x2684,
            driver_version: 0x8765_4321,
            ..Default::default()
        };
        props.pipeline_cache_uuid[0] = 0xab;
        let vs = Path::new("shaders/mesh.vert.spv");
        let fs_ = Path::new("shaders/mesh.frag.spv");
        let path = pipeline_cache_path(Path::new("PipelineCache"), &props, vs, fs_);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let expected_prefix = format!("10de_2684_87654321_ab{}_", "0".repeat(30));
        assert!(name.starts_with(&expected_prefix), "{name}");
        assert!(name.ends_with(".bin"));
        assert_eq!(path.parent(), Some(Path::new("PipelineCache")));

        let other = pipeline_cache_path(Path::new("PipelineCache"), &props, fs_, vs);
        assert_ne!(path, other);
    }

    #[test]
    fn atomic_write_replaces_and_cleans_up() {
        let dir = scratch("atomic");
        let path = dir.join("nested").join("cache.bin");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn mesh_description_matches_vertex_layout() {
        let d = GraphicsPipelineDescription::mesh(
            "a.spv".into(),
            "b.spv".into(),
            Vec::new(),
            vk::Format::B8G8R8A8_SRGB,
            vk::Format::D32_SFLOAT,
        );
        assert_eq!(d.vertex_bindings[0].stride, 24);
        assert_eq!(d.vertex_attributes[1].offset, 12);
        assert_eq!(d.push_constants.map(|p| p.size), Some(64));
        assert!(d.depth_test && d.depth_write);

        let no_depth = GraphicsPipelineDescription::mesh(
            "a.spv".into(),
            "b.spv".into(),
            Vec::new(),
            vk::Format::B8G8R8A8_SRGB,
            vk::Format::UNDEFINED,
        );
        assert!(!no_depth.depth_test);
    }

    #[test]
    fn shader_cache_starts_empty() {
        let c = ShaderCache::new();
        assert!(c.is_empty());
    }
}
