// SPDX-License-Identifier: CEPL-1.0
//! Per-subresource layout/stage/access cache that only emits the barriers a
//! transition actually needs.
use ash::vk;
use fnv::FnvHashMap;

const fn stages(a: vk::PipelineStageFlags2, b: vk::PipelineStageFlags2) -> vk::PipelineStageFlags2 {
    vk::PipelineStageFlags2::from_raw(a.as_raw() | b.as_raw())
}

const fn access(a: vk::AccessFlags2, b: vk::AccessFlags2) -> vk::AccessFlags2 {
    vk::AccessFlags2::from_raw(a.as_raw() | b.as_raw())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceState {
    pub layout: vk::ImageLayout,
    pub stage_mask: vk::PipelineStageFlags2,
    pub access_mask: vk::AccessFlags2,
    pub queue_family_index: u32,
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl ResourceState {
    pub const UNDEFINED: Self = Self {
        layout: vk::ImageLayout::UNDEFINED,
        stage_mask: vk::PipelineStageFlags2::NONE,
        access_mask: vk::AccessFlags2::NONE,
        queue_family_index: vk::QUEUE_FAMILY_IGNORED,
    };

    pub const PRESENT: Self = Self {
        layout: vk::ImageLayout::PRESENT_SRC_KHR,
        stage_mask: vk::PipelineStageFlags2::NONE,
        access_mask: vk::AccessFlags2::NONE,
        queue_family_index: vk::QUEUE_FAMILY_IGNORED,
    };

    pub const COLOR_ATTACHMENT_WRITE: Self = Self {
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access_mask: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        queue_family_index: vk::QUEUE_FAMILY_IGNORED,
    };

    pub const DEPTH_ATTACHMENT_WRITE: Self = Self {
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        stage_mask: stages(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
            vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
        ),
        access_mask: access(
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        queue_family_index: vk::QUEUE_FAMILY_IGNORED,
    };

    pub const SHADER_READ_ONLY: Self = Self {
        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        stage_mask: vk::PipelineStageFlags2::FRAGMENT_SHADER,
        access_mask: vk::AccessFlags2::SHADER_SAMPLED_READ,
        queue_family_index: vk::QUEUE_FAMILY_IGNORED,
    };

    pub const TRANSFER_SOURCE: Self = Self {
        layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        stage_mask: vk::PipelineStageFlags2::ALL_TRANSFER,
        access_mask: vk::AccessFlags2::TRANSFER_READ,
        queue_family_index: vk::QUEUE_FAMILY_IGNORED,
    };

    pub const TRANSFER_DESTINATION: Self = Self {
        layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        stage_mask: vk::PipelineStageFlags2::ALL_TRANSFER,
        access_mask: vk::AccessFlags2::TRANSFER_WRITE,
        queue_family_index: vk::QUEUE_FAMILY_IGNORED,
    };

    pub const GENERAL_COMPUTE_READ_WRITE: Self = Self {
        layout: vk::ImageLayout::GENERAL,
        stage_mask: vk::PipelineStageFlags2::COMPUTE_SHADER,
        access_mask: access(
            vk::AccessFlags2::SHADER_STORAGE_READ,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
        ),
        queue_family_index: vk::QUEUE_FAMILY_IGNORED,
    };

    pub const fn on_queue(self, family: u32) -> Self {
        Self {
            queue_family_index: family,
            ..self
        }
    }
}

/// Exact subresource bucket; overlapping ranges are tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceKey {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub base_mip: u32,
    pub level_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl SubresourceKey {
    pub fn new(image: vk::Image, range: &vk::ImageSubresourceRange) -> Self {
        Self {
            image,
            aspect: range.aspect_mask,
            base_mip: range.base_mip_level,
            level_count: range.level_count,
            base_layer: range.base_array_layer,
            layer_count: range.layer_count,
        }
    }

    pub fn range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: self.base_mip,
            level_count: self.level_count,
            base_array_layer: self.base_layer,
            layer_count: self.layer_count,
        }
    }
}

pub fn full_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Transition {
    /// Cached state already equals the target.
    None,
    Local(vk::ImageMemoryBarrier2<'static>),
    /// Release goes on the source family's queue, acquire on the destination's.
    QueueTransfer {
        release: vk::ImageMemoryBarrier2<'static>,
        acquire: vk::ImageMemoryBarrier2<'static>,
    },
}

fn image_barrier(
    key: &SubresourceKey,
    from: ResourceState,
    to: ResourceState,
    src_family: u32,
    dst_family: u32,
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2 {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
        src_stage_mask: from.stage_mask,
        src_access_mask: from.access_mask,
        dst_stage_mask: to.stage_mask,
        dst_access_mask: to.access_mask,
        old_layout: from.layout,
        new_layout: to.layout,
        src_queue_family_index: src_family,
        dst_queue_family_index: dst_family,
        image: key.image,
        subresource_range: key.range(),
        ..Default::default()
    }
}

#[derive(Debug, Default)]
pub struct ResourceStateTracker {
    states: FnvHashMap<SubresourceKey, ResourceState>,
}

impl ResourceStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, image: vk::Image, range: &vk::ImageSubresourceRange) -> ResourceState {
        self.states
            .get(&SubresourceKey::new(image, range))
            .copied()
            .unwrap_or_default()
    }

    /// Derives the barrier(s) moving `image`/`range` to `target` and caches
    /// `target` as the new state.
    pub fn transition(
        &mut self,
        image: vk::Image,
        range: &vk::ImageSubresourceRange,
        target: ResourceState,
    ) -> Transition {
        let key = SubresourceKey::new(image, range);
        let cached = self.states.get(&key).copied().unwrap_or_default();
        if cached == target {
            return Transition::None;
        }
        self.states.insert(key, target);

        let src = cached.queue_family_index;
        let dst = target.queue_family_index;
        let crosses = src != dst && src != vk::QUEUE_FAMILY_IGNORED && dst != vk::QUEUE_FAMILY_IGNORED;
        if !crosses {
            return Transition::Local(image_barrier(
                &key,
                cached,
                target,
                vk::QUEUE_FAMILY_IGNORED,
                vk::QUEUE_FAMILY_IGNORED,
            ));
        }

        let release_to = ResourceState {
            stage_mask: vk::PipelineStageFlags2::NONE,
            access_mask: vk::AccessFlags2::NONE,
            ..target
        };
        let acquire_from = ResourceState {
            stage_mask: vk::PipelineStageFlags2::NONE,
            access_mask: vk::AccessFlags2::NONE,
            ..cached
        };
        Transition::QueueTransfer {
            release: image_barrier(&key, cached, release_to, src, dst),
            acquire: image_barrier(&key, acquire_from, target, src, dst),
        }
    }

    /// Overrides the cached state without emitting a barrier. Used when an
    /// external operation (acquire semaphore, discarded contents) defines
    /// what the next barrier must wait on.
    pub fn assume(&mut self, image: vk::Image, range: &vk::ImageSubresourceRange, state: ResourceState) {
        self.states.insert(SubresourceKey::new(image, range), state);
    }

    /// Forgets every bucket. Only valid after the device went idle.
    pub fn reset(&mut self) {
        self.states.clear();
    }

    pub fn forget_image(&mut self, image: vk::Image) {
        self.states.retain(|k, _| k.image != image);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Records one `vkCmdPipelineBarrier2` for the given barriers; empty input
/// records nothing.
pub fn cmd_barriers(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffers: &[vk::BufferMemoryBarrier2<'_>],
    images: &[vk::ImageMemoryBarrier2<'_>],
) {
    if buffers.is_empty() && images.is_empty() {
        return;
    }
    let dep = vk::DependencyInfo::default()
        .buffer_memory_barriers(buffers)
        .image_memory_barriers(images);
    // SAFETY: cmd is in the recording state on device.
    unsafe { device.cmd_pipeline_barrier2(cmd, &dep) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn color() -> vk::ImageSubresourceRange {
        full_range(vk::ImageAspectFlags::COLOR)
    }

    fn expect_local(t: Transition) -> vk::ImageMemoryBarrier2<'static> {
        match t {
            Transition::Local(b) => b,
            other => panic!("expected a local barrier, got {other:?}"),
        }
    }

    #[test]
    fn unknown_image_starts_undefined() {
        let t = ResourceStateTracker::new();
        assert_eq!(t.state(vk::Image::from_raw(7), &color()), ResourceState::UNDEFINED);
    }

    #[test]
    fn barrier_chain_links_dst_to_next_src() {
        let mut t = ResourceStateTracker::new();
        let img = vk::Image::from_raw(1);
        let first = expect_local(t.transition(img, &color(), ResourceState::COLOR_ATTACHMENT_WRITE));
        assert_eq!(first.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(t.state(img, &color()), ResourceState::COLOR_ATTACHMENT_WRITE);

        let second = expect_local(t.transition(img, &color(), ResourceState::PRESENT));
        assert_eq!(second.old_layout, first.new_layout);
        assert_eq!(second.src_stage_mask, first.dst_stage_mask);
        assert_eq!(second.src_access_mask, first.dst_access_mask);
        assert_eq!(second.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(second.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }

    #[test]
    fn same_state_is_a_no_op() {
        let mut t = ResourceStateTracker::new();
        let img = vk::Image::from_raw(2);
        t.transition(img, &color(), ResourceState::SHADER_READ_ONLY);
        assert!(matches!(
            t.transition(img, &color(), ResourceState::SHADER_READ_ONLY),
            Transition::None
        ));
    }

    #[test]
    fn ranges_are_tracked_independently() {
        let mut t = ResourceStateTracker::new();
        let img = vk::Image::from_raw(3);
        let mip1 = vk::ImageSubresourceRange {
            base_mip_level: 1,
            ..color()
        };
        t.transition(img, &color(), ResourceState::TRANSFER_DESTINATION);
        assert_eq!(t.state(img, &mip1), ResourceState::UNDEFINED);
        t.transition(img, &mip1, ResourceState::TRANSFER_SOURCE);
        assert_eq!(t.len(), 2);
        assert_eq!(t.state(img, &color()), ResourceState::TRANSFER_DESTINATION);
    }

    #[test]
    fn cross_family_emits_release_and_acquire() {
        let mut t = ResourceStateTracker::new();
        let img = vk::Image::from_raw(4);
        t.transition(img, &color(), ResourceState::TRANSFER_DESTINATION.on_queue(2));
        let target = ResourceState::SHADER_READ_ONLY.on_queue(0);
        let Transition::QueueTransfer { release, acquire } = t.transition(img, &color(), target) else {
            panic!("expected an ownership transfer");
        };
        assert_eq!((release.src_queue_family_index, release.dst_queue_family_index), (2, 0));
        assert_eq!((acquire.src_queue_family_index, acquire.dst_queue_family_index), (2, 0));
        assert_eq!(release.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(release.dst_access_mask, vk::AccessFlags2::NONE);
        assert_eq!(release.dst_stage_mask, vk::PipelineStageFlags2::NONE);
        assert_eq!(acquire.src_access_mask, vk::AccessFlags2::NONE);
        assert_eq!(acquire.dst_access_mask, vk::AccessFlags2::SHADER_SAMPLED_READ);
        assert_eq!(release.new_layout, acquire.new_layout);
        assert_eq!(t.state(img, &color()), target);
    }

    #[test]
    fn ignored_family_never_transfers() {
        let mut t = ResourceStateTracker::new();
        let img = vk::Image::from_raw(5);
        let b = expect_local(t.transition(img, &color(), ResourceState::TRANSFER_DESTINATION.on_queue(1)));
        assert_eq!(b.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(b.dst_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }

    #[test]
    fn assumed_state_feeds_next_barrier() {
        let mut t = ResourceStateTracker::new();
        let img = vk::Image::from_raw(6);
        t.transition(img, &color(), ResourceState::PRESENT);
        let acquired = ResourceState {
            stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            ..ResourceState::UNDEFINED
        };
        t.assume(img, &color(), acquired);
        let b = expect_local(t.transition(img, &color(), ResourceState::COLOR_ATTACHMENT_WRITE));
        assert_eq!(b.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(b.src_stage_mask, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
    }

    #[test]
    fn forget_and_reset() {
        let mut t = ResourceStateTracker::new();
        let a = vk::Image::from_raw(10);
        let b = vk::Image::from_raw(11);
        t.transition(a, &color(), ResourceState::PRESENT);
        t.transition(
            a,
            &vk::ImageSubresourceRange {
                base_array_layer: 1,
                ..color()
            },
            ResourceState::PRESENT,
        );
        t.transition(b, &color(), ResourceState::PRESENT);
        t.forget_image(a);
        assert_eq!(t.len(), 1);
        assert_eq!(t.state(a, &color()), ResourceState::UNDEFINED);
        t.reset();
        assert!(t.is_empty());
    }
}
