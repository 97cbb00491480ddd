// SPDX-License-Identifier: CEPL-1.0
//! Fences and semaphores pacing frames in flight against swapchain images.
//!
//! Frame-level primitives (fence, image-available semaphore) live as long as
//! the renderer. Render-finished semaphores are per swapchain image and are
//! rebuilt whenever the image count may have changed.
use crate::error::{VkResult, VkResultExt};
use ash::vk;

/// Which frame fence last submitted work against each swapchain image.
#[derive(Debug, Clone)]
pub struct ImagesInFlight<F> {
    owners: Vec<Option<F>>,
}

impl<F: Copy + Eq> ImagesInFlight<F> {
    pub fn new(image_count: usize) -> Self {
        Self {
            owners: vec![None; image_count],
        }
    }

    /// Records `fence` as the image's owner. Returns the previous owner when
    /// it belongs to a different frame, which the caller must wait on before
    /// recording.
    pub fn claim(&mut self, image: usize, fence: F) -> Option<F> {
        if image >= self.owners.len() {
            self.owners.resize(image + 1, None);
        }
        let prev = self.owners[image].replace(fence);
        prev.filter(|&p| p != fence)
    }

    pub fn owner(&self, image: usize) -> Option<F> {
        self.owners.get(image).copied().flatten()
    }

    pub fn reset(&mut self, image_count: usize) {
        self.owners.clear();
        self.owners.resize(image_count, None);
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// Swaps the per-image entries for `image_count` fresh ones and forgets every
/// image owner. Old entries go to `destroy` first; on a `make` failure the
/// entries built so far stay in `entries`.
pub fn rebuild_per_image<T, F: Copy + Eq>(
    entries: &mut Vec<T>,
    owners: &mut ImagesInFlight<F>,
    image_count: usize,
    mut destroy: impl FnMut(T),
    mut make: impl FnMut() -> VkResult<T>,
) -> VkResult<()> {
    for old in entries.drain(..) {
        destroy(old);
    }
    owners.reset(image_count);
    for _ in 0..image_count {
        entries.push(make()?);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct FrameSyncSlot {
    pub in_flight: vk::Fence,
    pub image_available: vk::Semaphore,
}

pub struct FrameSync {
    frames: Vec<FrameSyncSlot>,
    render_finished: Vec<vk::Semaphore>,
    images_in_flight: ImagesInFlight<vk::Fence>,
}

fn create_semaphore(device: &ash::Device) -> VkResult<vk::Semaphore> {
    let info = vk::SemaphoreCreateInfo::default();
    // SAFETY: device is live.
    unsafe { device.create_semaphore(&info, None) }.at("vkCreateSemaphore")
}

impl FrameSync {
    pub fn empty() -> Self {
        Self {
            frames: Vec::new(),
            render_finished: Vec::new(),
            images_in_flight: ImagesInFlight::new(0),
        }
    }

    pub fn new(device: &ash::Device, frames_in_flight: usize, image_count: usize) -> VkResult<Self> {
        let mut sync = Self::empty();
        if let Err(e) = sync.build(device, frames_in_flight, image_count) {
            sync.shutdown(device);
            return Err(e);
        }
        Ok(sync)
    }

    fn build(&mut self, device: &ash::Device, frames_in_flight: usize, image_count: usize) -> VkResult<()> {
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        for _ in 0..frames_in_flight {
            // SAFETY: device is live.
            let in_flight = unsafe { device.create_fence(&fence_info, None) }.at("vkCreateFence")?;
            let image_available = match create_semaphore(device) {
                Ok(s) => s,
                Err(e) => {
                    // SAFETY: fence was never submitted.
                    unsafe { device.destroy_fence(in_flight, None) };
                    return Err(e);
                }
            };
            self.frames.push(FrameSyncSlot {
                in_flight,
                image_available,
            });
        }
        self.rebuild_image_semaphores(device, image_count)
    }

    fn rebuild_image_semaphores(&mut self, device: &ash::Device, image_count: usize) -> VkResult<()> {
        rebuild_per_image(
            &mut self.render_finished,
            &mut self.images_in_flight,
            image_count,
            // SAFETY: the device is idle when image semaphores are rebuilt.
            |s| unsafe { device.destroy_semaphore(s, None) },
            || create_semaphore(device),
        )
    }

    /// Device must be idle. Frame fences and acquire semaphores are kept.
    pub fn on_swapchain_recreated(&mut self, device: &ash::Device, image_count: usize) -> VkResult<()> {
        self.rebuild_image_semaphores(device, image_count)
    }

    pub fn frame(&self, index: usize) -> FrameSyncSlot {
        self.frames[index % self.frames.len()]
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn render_finished(&self, image: usize) -> Option<vk::Semaphore> {
        self.render_finished.get(image).copied()
    }

    pub fn image_count(&self) -> usize {
        self.render_finished.len()
    }

    pub fn wait_frame(&self, device: &ash::Device, index: usize) -> VkResult<()> {
        let fence = self.frame(index).in_flight;
        // SAFETY: fence belongs to device.
        unsafe { device.wait_for_fences(&[fence], true, u64::MAX) }.at("vkWaitForFences")
    }

    /// Waits on whichever other frame last rendered to `image`, then makes
    /// frame `index` its owner.
    pub fn claim_image(&mut self, device: &ash::Device, index: usize, image: usize) -> VkResult<()> {
        let fence = self.frame(index).in_flight;
        if let Some(prev) = self.images_in_flight.claim(image, fence) {
            tracing::trace!(image, "waiting on previous owner of swapchain image");
            // SAFETY: prev is a frame fence on device.
            unsafe { device.wait_for_fences(&[prev], true, u64::MAX) }.at("vkWaitForFences")?;
        }
        Ok(())
    }

    pub fn reset_frame(&self, device: &ash::Device, index: usize) -> VkResult<()> {
        let fence = self.frame(index).in_flight;
        // SAFETY: fence is signaled and not referenced by a pending submit.
        unsafe { device.reset_fences(&[fence]) }.at("vkResetFences")
    }

    pub fn shutdown(&mut self, device: &ash::Device) {
        // SAFETY: the device is idle.
        unsafe {
            for s in self.render_finished.drain(..) {
                device.destroy_semaphore(s, None);
            }
            for f in self.frames.drain(..) {
                device.destroy_semaphore(f.image_available, None);
                device.destroy_fence(f.in_flight, None);
            }
        }
        self.images_in_flight.reset(0);
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        debug_assert!(
            self.frames.is_empty() && self.render_finished.is_empty(),
            "FrameSync dropped without shutdown"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_claim_needs_no_wait() {
        let mut m = ImagesInFlight::<u32>::new(3);
        assert_eq!(m.claim(0, 10), None);
        assert_eq!(m.owner(0), Some(10));
    }

    #[test]
    fn other_frame_owner_must_be_waited_on() {
        let mut m = ImagesInFlight::<u32>::new(3);
        m.claim(1, 10);
        assert_eq!(m.claim(1, 11), Some(10));
        assert_eq!(m.owner(1), Some(11));
    }

    #[test]
    fn same_frame_reclaim_is_free() {
        let mut m = ImagesInFlight::<u32>::new(2);
        m.claim(0, 10);
        assert_eq!(m.claim(0, 10), None);
    }

    #[test]
    fn two_frames_three_images_cycle() {
        // Frames alternate fences 0/1; with three images every image is
        // revisited by the other frame.
        let mut m = ImagesInFlight::<u32>::new(3);
        let acquired = [0usize, 1, 2, 0, 1, 2];
        let mut waits = Vec::new();
        for (tick, &img) in acquired.iter().enumerate() {
            waits.push(m.claim(img, (tick % 2) as u32));
        }
        assert_eq!(waits, vec![None, None, None, Some(0), Some(1), Some(0)]);
    }

    #[test]
    fn image_count_change_rebuilds_everything() {
        let mut entries = vec![100u32, 101, 102];
        let mut owners = ImagesInFlight::<u32>::new(3);
        owners.claim(0, 1);
        owners.claim(2, 0);
        let mut destroyed = Vec::new();
        let mut next = 200u32;
        rebuild_per_image(
            &mut entries,
            &mut owners,
            4,
            |e| destroyed.push(e),
            || {
                next += 1;
                Ok(next)
            },
        )
        .unwrap();
        assert_eq!(destroyed, vec![100, 101, 102]);
        assert_eq!(entries, vec![201, 202, 203, 204]);
        assert_eq!(owners.len(), 4);
        assert!((0..4).all(|i| owners.owner(i).is_none()));

        rebuild_per_image(&mut entries, &mut owners, 2, |_| {}, || Ok(7)).unwrap();
        assert_eq!(entries, vec![7, 7]);
        assert_eq!(owners.len(), 2);
    }

    #[test]
    fn failed_rebuild_keeps_partial_entries_for_shutdown() {
        let mut entries = vec![9u32];
        let mut owners = ImagesInFlight::<u32>::new(1);
        let mut made = 0;
        let r = rebuild_per_image(&mut entries, &mut owners, 3, |_| {}, || {
            made += 1;
            if made == 2 {
                Err(crate::error::VkError::HostAllocation { call: "vkCreateSemaphore" })
            } else {
                Ok(made)
            }
        });
        assert!(r.is_err());
        assert_eq!(entries, vec![1]);
    }

    #[test]
    fn reset_forgets_owners_and_resizes() {
        let mut m = ImagesInFlight::<u32>::new(2);
        m.claim(0, 1);
        m.reset(4);
        assert_eq!(m.len(), 4);
        assert_eq!(m.owner(0), None);
    }
}
