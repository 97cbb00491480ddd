// SPDX-License-Identifier: CEPL-1.0
//! Buffer and image creation through VMA. Memory is sub-allocated from large
//! blocks, so resource count is not bounded by `maxMemoryAllocationCount`.
use crate::error::{VkError, VkResult, VkResultExt};
use ash::vk;
use vk_mem::Alloc as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Device-local when available; never mapped.
    GpuOnly,
    /// Host-visible and coherent; persistently mapped.
    CpuToGpu,
}

impl MemoryUsage {
    fn create_info(self) -> vk_mem::AllocationCreateInfo {
        match self {
            MemoryUsage::GpuOnly => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
            MemoryUsage::CpuToGpu => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                ..Default::default()
            },
        }
    }
}

pub fn check_write_range(size: vk::DeviceSize, offset: vk::DeviceSize, len: usize) -> VkResult<()> {
    let end = offset
        .checked_add(len as vk::DeviceSize)
        .ok_or(VkError::InvalidState("buffer write overflows"))?;
    if end > size {
        return Err(VkError::InvalidState("buffer write out of bounds"));
    }
    Ok(())
}

pub struct AllocatedBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: vk_mem::Allocation,
    mapped: *mut u8,
}

impl AllocatedBuffer {
    pub fn is_mapped(&self) -> bool {
        !self.mapped.is_null()
    }

    /// Copies `bytes` into the persistently mapped range at `offset`.
    pub fn write(&self, offset: vk::DeviceSize, bytes: &[u8]) -> VkResult<()> {
        if self.mapped.is_null() {
            return Err(VkError::InvalidState("buffer is not host visible"));
        }
        check_write_range(self.size, offset, bytes.len())?;
        // SAFETY: mapped covers [0, size) and the range was checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.mapped.add(offset as usize), bytes.len());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

pub struct AllocatedImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub aspect: vk::ImageAspectFlags,
    allocation: vk_mem::Allocation,
}

impl AllocatedImage {
    pub fn range(&self) -> vk::ImageSubresourceRange {
        crate::state_tracker::full_range(self.aspect)
    }
}

pub struct ResourceAllocator {
    device: ash::Device,
    vma: Option<vk_mem::Allocator>,
}

impl ResourceAllocator {
    pub fn new(instance: &ash::Instance, device: &ash::Device, physical: vk::PhysicalDevice) -> VkResult<Self> {
        let info = vk_mem::AllocatorCreateInfo::new(instance, device, physical);
        // SAFETY: instance and device outlive the allocator; shutdown runs
        // before the device is destroyed.
        let vma = unsafe { vk_mem::Allocator::new(info) }.at("vmaCreateAllocator")?;
        Ok(Self {
            device: device.clone(),
            vma: Some(vma),
        })
    }

    fn vma(&self) -> VkResult<&vk_mem::Allocator> {
        self.vma
            .as_ref()
            .ok_or(VkError::InvalidState("allocator already shut down"))
    }

    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory: MemoryUsage,
    ) -> VkResult<AllocatedBuffer> {
        if size == 0 {
            return Err(VkError::InvalidState("zero-sized buffer"));
        }
        let vma = self.vma()?;
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: the allocator's device is live.
        let (buffer, mut allocation) =
            unsafe { vma.create_buffer(&info, &memory.create_info()) }.at("vmaCreateBuffer")?;

        let mapped = match memory {
            MemoryUsage::GpuOnly => std::ptr::null_mut(),
            // SAFETY: the allocation is host visible and not yet mapped.
            MemoryUsage::CpuToGpu => match unsafe { vma.map_memory(&mut allocation) } {
                Ok(p) => p,
                Err(r) => {
                    // SAFETY: nothing references the new buffer yet.
                    unsafe { vma.destroy_buffer(buffer, &mut allocation) };
                    return Err(VkError::from_result("vmaMapMemory", r));
                }
            },
        };
        Ok(AllocatedBuffer {
            buffer,
            size,
            allocation,
            mapped,
        })
    }

    /// GPU work referencing the buffer must have completed.
    pub fn destroy_buffer(&self, mut buffer: AllocatedBuffer) {
        let Some(vma) = self.vma.as_ref() else {
            tracing::warn!("buffer outlived its allocator; memory leaked");
            return;
        };
        // SAFETY: the buffer and allocation came from vma and have no users.
        unsafe {
            if buffer.is_mapped() {
                vma.unmap_memory(&mut buffer.allocation);
            }
            vma.destroy_buffer(buffer.buffer, &mut buffer.allocation);
        }
    }

    pub fn create_image(&self, desc: &ImageDesc) -> VkResult<AllocatedImage> {
        let vma = self.vma()?;
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        // SAFETY: the allocator's device is live.
        let (image, mut allocation) =
            unsafe { vma.create_image(&info, &MemoryUsage::GpuOnly.create_info()) }.at("vmaCreateImage")?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(crate::state_tracker::full_range(desc.aspect));
        // SAFETY: image is bound to memory by vma.
        match unsafe { self.device.create_image_view(&view_info, None) }.at("vkCreateImageView") {
            Ok(view) => Ok(AllocatedImage {
                image,
                view,
                format: desc.format,
                extent: desc.extent,
                aspect: desc.aspect,
                allocation,
            }),
            Err(e) => {
                // SAFETY: nothing references the new image yet.
                unsafe { vma.destroy_image(image, &mut allocation) };
                Err(e)
            }
        }
    }

    /// GPU work referencing the image must have completed.
    pub fn destroy_image(&self, mut image: AllocatedImage) {
        // SAFETY: the view has no users once the image is retired.
        unsafe { self.device.destroy_image_view(image.view, None) };
        let Some(vma) = self.vma.as_ref() else {
            tracing::warn!("image outlived its allocator; memory leaked");
            return;
        };
        // SAFETY: the image and allocation came from vma and have no users.
        unsafe { vma.destroy_image(image.image, &mut image.allocation) };
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Every buffer and image must already be destroyed. Runs before the
    /// device is destroyed.
    pub fn shutdown(&mut self) {
        if self.vma.take().is_some() {
            tracing::debug!("memory allocator destroyed");
        }
    }
}
