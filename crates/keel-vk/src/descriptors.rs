// SPDX-License-Identifier: CEPL-1.0
//! Per-frame descriptor pools, the two fixed set layouts and a batching
//! writer.
use crate::config::DescriptorBudget;
use crate::error::{VkError, VkResult, VkResultExt};
use ash::vk;

pub const GLOBAL_UBO_BINDING: u32 = 0;
pub const GLOBAL_SAMPLER_BINDING: u32 = 1;
pub const MATERIAL_SAMPLER_BINDING: u32 = 0;
pub const MATERIAL_STORAGE_BINDING: u32 = 1;

/// Pool sizes for one frame's pool; zero budgets are left out.
pub fn pool_sizes(budget: &DescriptorBudget) -> Vec<vk::DescriptorPoolSize> {
    [
        (vk::DescriptorType::UNIFORM_BUFFER, budget.uniform_buffers),
        (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, budget.combined_image_samplers),
        (vk::DescriptorType::STORAGE_BUFFER, budget.storage_buffers),
    ]
    .into_iter()
    .filter(|&(_, n)| n > 0)
    .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
    .collect()
}

fn binding(
    binding: u32,
    ty: vk::DescriptorType,
    stages: vk::ShaderStageFlags,
) -> vk::DescriptorSetLayoutBinding<'static> {
    vk::DescriptorSetLayoutBinding::default()
        .binding(binding)
        .descriptor_type(ty)
        .descriptor_count(1)
        .stage_flags(stages)
}

fn create_layout(
    device: &ash::Device,
    bindings: &[vk::DescriptorSetLayoutBinding<'_>],
) -> VkResult<vk::DescriptorSetLayout> {
    let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
    // SAFETY: device is live.
    unsafe { device.create_descriptor_set_layout(&info, None) }.at("vkCreateDescriptorSetLayout")
}

#[derive(Debug, Default)]
pub struct DescriptorFrame {
    pub pool: vk::DescriptorPool,
    pub global_set: Option<vk::DescriptorSet>,
    pub material_sets: Vec<vk::DescriptorSet>,
}

pub struct Descriptors {
    global_layout: vk::DescriptorSetLayout,
    material_layout: vk::DescriptorSetLayout,
    frames: Vec<DescriptorFrame>,
}

impl Descriptors {
    pub fn empty() -> Self {
        Self {
            global_layout: vk::DescriptorSetLayout::null(),
            material_layout: vk::DescriptorSetLayout::null(),
            frames: Vec::new(),
        }
    }

    pub fn new(device: &ash::Device, budget: &DescriptorBudget, frames_in_flight: usize) -> VkResult<Self> {
        let mut d = Self::empty();
        if let Err(e) = d.build(device, budget, frames_in_flight) {
            d.shutdown(device);
            return Err(e);
        }
        Ok(d)
    }

    fn build(&mut self, device: &ash::Device, budget: &DescriptorBudget, frames_in_flight: usize) -> VkResult<()> {
        let vf = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        self.global_layout = create_layout(
            device,
            &[
                binding(GLOBAL_UBO_BINDING, vk::DescriptorType::UNIFORM_BUFFER, vf),
                binding(
                    GLOBAL_SAMPLER_BINDING,
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    vk::ShaderStageFlags::FRAGMENT,
                ),
            ],
        )?;
        self.material_layout = create_layout(
            device,
            &[
                binding(
                    MATERIAL_SAMPLER_BINDING,
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    vk::ShaderStageFlags::FRAGMENT,
                ),
                binding(MATERIAL_STORAGE_BINDING, vk::DescriptorType::STORAGE_BUFFER, vf),
            ],
        )?;

        let sizes = pool_sizes(budget);
        if sizes.is_empty() || budget.max_sets == 0 {
            return Err(VkError::Config("descriptor budget is empty".into()));
        }
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(budget.max_sets)
            .pool_sizes(&sizes);
        for _ in 0..frames_in_flight {
            // SAFETY: device is live.
            let pool = unsafe { device.create_descriptor_pool(&info, None) }.at("vkCreateDescriptorPool")?;
            self.frames.push(DescriptorFrame {
                pool,
                ..Default::default()
            });
        }
        Ok(())
    }

    pub fn global_layout(&self) -> vk::DescriptorSetLayout {
        self.global_layout
    }

    pub fn material_layout(&self) -> vk::DescriptorSetLayout {
        self.material_layout
    }

    pub fn frame(&self, index: usize) -> &DescriptorFrame {
        &self.frames[index % self.frames.len()]
    }

    /// Frees every set of the frame by resetting its pool. Only call once the
    /// frame's fence has signaled.
    pub fn reset_frame(&mut self, device: &ash::Device, index: usize) -> VkResult<()> {
        let n = self.frames.len();
        let frame = &mut self.frames[index % n];
        // SAFETY: no pending command buffer references sets from this pool.
        unsafe { device.reset_descriptor_pool(frame.pool, vk::DescriptorPoolResetFlags::empty()) }
            .at("vkResetDescriptorPool")?;
        frame.global_set = None;
        frame.material_sets.clear();
        Ok(())
    }

    fn allocate(device: &ash::Device, pool: vk::DescriptorPool, layout: vk::DescriptorSetLayout) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        // SAFETY: pool and layout belong to device.
        let sets = unsafe { device.allocate_descriptor_sets(&info) }.at("vkAllocateDescriptorSets")?;
        sets.first()
            .copied()
            .ok_or(VkError::InvalidState("descriptor allocation returned no set"))
    }

    /// The frame's global set, allocated on first request.
    pub fn global_set(&mut self, device: &ash::Device, index: usize) -> VkResult<(vk::DescriptorSet, bool)> {
        let n = self.frames.len();
        let layout = self.global_layout;
        let frame = &mut self.frames[index % n];
        if let Some(set) = frame.global_set {
            return Ok((set, false));
        }
        let set = Self::allocate(device, frame.pool, layout)?;
        frame.global_set = Some(set);
        Ok((set, true))
    }

    pub fn allocate_material_set(&mut self, device: &ash::Device, index: usize) -> VkResult<vk::DescriptorSet> {
        let n = self.frames.len();
        let layout = self.material_layout;
        let frame = &mut self.frames[index % n];
        let set = Self::allocate(device, frame.pool, layout)?;
        frame.material_sets.push(set);
        Ok(set)
    }

    pub fn shutdown(&mut self, device: &ash::Device) {
        // SAFETY: the device is idle.
        unsafe {
            for f in self.frames.drain(..) {
                device.destroy_descriptor_pool(f.pool, None);
            }
            if self.material_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.material_layout, None);
            }
            if self.global_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.global_layout, None);
            }
        }
        self.material_layout = vk::DescriptorSetLayout::null();
        self.global_layout = vk::DescriptorSetLayout::null();
    }
}

impl Drop for Descriptors {
    fn drop(&mut self) {
        debug_assert!(
            self.frames.is_empty() && self.global_layout == vk::DescriptorSetLayout::null(),
            "Descriptors dropped without shutdown"
        );
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingWrite {
    Buffer {
        set: vk::DescriptorSet,
        binding: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorBufferInfo,
    },
    Image {
        set: vk::DescriptorSet,
        binding: u32,
        info: vk::DescriptorImageInfo,
    },
}

/// Collects descriptor writes and applies them with one
/// `vkUpdateDescriptorSets`.
#[derive(Debug, Default)]
pub struct DescriptorWriter {
    pending: Vec<PendingWrite>,
}

impl DescriptorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_buffer(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> &mut Self {
        self.pending.push(PendingWrite::Buffer {
            set,
            binding,
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            info: vk::DescriptorBufferInfo { buffer, offset, range },
        });
        self
    }

    pub fn write_storage_buffer(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> &mut Self {
        self.pending.push(PendingWrite::Buffer {
            set,
            binding,
            ty: vk::DescriptorType::STORAGE_BUFFER,
            info: vk::DescriptorBufferInfo { buffer, offset, range },
        });
        self
    }

    pub fn write_image_sampler(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> &mut Self {
        self.pending.push(PendingWrite::Image {
            set,
            binding,
            info: vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: layout,
            },
        });
        self
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn infos(&self) -> (Vec<vk::DescriptorBufferInfo>, Vec<vk::DescriptorImageInfo>) {
        let mut buffers = Vec::new();
        let mut images = Vec::new();
        for w in &self.pending {
            match *w {
                PendingWrite::Buffer { info, .. } => buffers.push(info),
                PendingWrite::Image { info, .. } => images.push(info),
            }
        }
        (buffers, images)
    }

    /// Writes pointing into `buffers`/`images`, which must come from
    /// [`DescriptorWriter::infos`].
    fn writes<'a>(
        &self,
        buffers: &'a [vk::DescriptorBufferInfo],
        images: &'a [vk::DescriptorImageInfo],
    ) -> Vec<vk::WriteDescriptorSet<'a>> {
        let (mut b, mut i) = (0, 0);
        self.pending
            .iter()
            .map(move |w| match *w {
                PendingWrite::Buffer { set, binding, ty, .. } => {
                    let info = std::slice::from_ref(&buffers[b]);
                    b += 1;
                    vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .descriptor_type(ty)
                        .buffer_info(info)
                }
                PendingWrite::Image { set, binding, .. } => {
                    let info = std::slice::from_ref(&images[i]);
                    i += 1;
                    vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(info)
                }
            })
            .collect()
    }

    /// Applies every queued write in a single call and clears the writer.
    pub fn update(&mut self, device: &ash::Device) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        let (buffers, images) = self.infos();
        let writes = self.writes(&buffers, &images);
        // SAFETY: every set and resource referenced is live.
        unsafe { device.update_descriptor_sets(&writes, &[]) };
        let n = writes.len();
        self.pending.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn pool_sizes_follow_budget() {
        let sizes = pool_sizes(&DescriptorBudget::default());
        assert_eq!(sizes.len(), 3);
        assert!(sizes.iter().all(|s| s.descriptor_count == 1000));
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
    }

    #[test]
    fn zero_budget_entries_are_skipped() {
        let budget = DescriptorBudget {
            storage_buffers: 0,
            ..DescriptorBudget::default()
        };
        let sizes = pool_sizes(&budget);
        assert_eq!(sizes.len(), 2);
        assert!(sizes.iter().all(|s| s.ty != vk::DescriptorType::STORAGE_BUFFER));
    }

    #[test]
    fn writer_coalesces_mixed_writes() {
        let set = vk::DescriptorSet::from_raw(1);
        let mut w = DescriptorWriter::new();
        w.write_buffer(set, 0, vk::Buffer::from_raw(2), 0, 64)
            .write_image_sampler(
                set,
                1,
                vk::ImageView::from_raw(3),
                vk::Sampler::from_raw(4),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
            .write_storage_buffer(set, 2, vk::Buffer::from_raw(5), 16, vk::WHOLE_SIZE);
        assert_eq!(w.len(), 3);

        let (buffers, images) = w.infos();
        assert_eq!((buffers.len(), images.len()), (2, 1));
        let writes = w.writes(&buffers, &images);
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(writes[1].descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(writes[2].descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(writes[2].dst_binding, 2);
        assert!(writes.iter().all(|w| w.descriptor_count == 1));
        assert_eq!(writes[2].p_buffer_info, &buffers[1] as *const _);
    }
}
