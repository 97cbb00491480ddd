// SPDX-License-Identifier: CEPL-1.0
//! Surface-driven swapchain: format, present mode, extent and image count
//! selection, plus the recreate protocol.
use crate::context::Context;
use crate::device::Device;
use crate::error::{VkError, VkResult, VkResultExt};
use ash::vk;
use keel_render::RenderSize;

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first().copied())
}

/// MAILBOX when offered, IMMEDIATE when vsync is off, FIFO otherwise.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else if !vsync && modes.contains(&vk::PresentModeKHR::IMMEDIATE) {
        vk::PresentModeKHR::IMMEDIATE
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// `None` when the surface (or the window) is 0x0.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> Option<vk::Extent2D> {
    let extent = if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    };
    if extent.width == 0 || extent.height == 0 || want.is_zero() {
        None
    } else {
        Some(extent)
    }
}

pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

fn choose_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

fn choose_composite_alpha(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&a| caps.supported_composite_alpha.contains(a))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Snapshot of what the surface reports.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub caps: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn capabilities(ctx: &Context, physical: vk::PhysicalDevice) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        // SAFETY: physical and surface belong to ctx's instance.
        unsafe {
            ctx.surface_loader()
                .get_physical_device_surface_capabilities(physical, ctx.surface())
        }
        .at("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")
    }

    pub fn query(ctx: &Context, physical: vk::PhysicalDevice) -> VkResult<Self> {
        let caps = Self::capabilities(ctx, physical)?;
        let loader = ctx.surface_loader();
        let surface = ctx.surface();
        // SAFETY: physical and surface belong to ctx's instance.
        unsafe {
            Ok(Self {
                caps,
                formats: loader
                    .get_physical_device_surface_formats(physical, surface)
                    .at("vkGetPhysicalDeviceSurfaceFormatsKHR")?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(physical, surface)
                    .at("vkGetPhysicalDeviceSurfacePresentModesKHR")?,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainSettings {
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainSettings {
    /// `Ok(None)` means the surface is currently zero-sized.
    pub fn choose(support: &SurfaceSupport, want: RenderSize, vsync: bool) -> VkResult<Option<Self>> {
        let format = choose_surface_format(&support.formats)
            .ok_or(VkError::InvalidState("surface reports no formats"))?;
        let Some(extent) = choose_extent(&support.caps, want) else {
            return Ok(None);
        };
        Ok(Some(Self {
            format: format.format,
            color_space: format.color_space,
            present_mode: choose_present_mode(&support.present_modes, vsync),
            extent,
            image_count: choose_image_count(&support.caps),
            transform: choose_transform(&support.caps),
        }))
    }
}

#[derive(Debug)]
pub enum RecreateOutcome {
    /// Zero extent; the swapchain is marked invalid and the old one kept.
    Deferred,
    Rebuilt { old_images: Vec<vk::Image> },
}

pub struct Swapchain {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    settings: Option<SwapchainSettings>,
    valid: bool,
}

impl Swapchain {
    /// No handle yet; `recreate` builds it.
    pub fn empty() -> Self {
        Self {
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            settings: None,
            valid: false,
        }
    }

    pub fn create(ctx: &Context, device: &Device, want: RenderSize, vsync: bool) -> VkResult<Self> {
        let mut sc = Self::empty();
        match sc.recreate(ctx, device, want, vsync) {
            Ok(_) => Ok(sc),
            Err(e) => {
                sc.shutdown(device);
                Err(e)
            }
        }
    }

    /// Caller must have waited for the device to go idle.
    pub fn recreate(
        &mut self,
        ctx: &Context,
        device: &Device,
        want: RenderSize,
        vsync: bool,
    ) -> VkResult<RecreateOutcome> {
        let support = SurfaceSupport::query(ctx, device.physical())?;
        let Some(settings) = SwapchainSettings::choose(&support, want, vsync)? else {
            self.valid = false;
            tracing::debug!("surface is 0x0, swapchain recreation deferred");
            return Ok(RecreateOutcome::Deferred);
        };

        let families = device.families();
        let family_indices = [families.graphics, families.present];
        let old = self.handle;
        let mut info = vk::SwapchainCreateInfoKHR::default()
            .surface(ctx.surface())
            .min_image_count(settings.image_count)
            .image_format(settings.format)
            .image_color_space(settings.color_space)
            .image_extent(settings.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(settings.transform)
            .composite_alpha(choose_composite_alpha(&support.caps))
            .present_mode(settings.present_mode)
            .clipped(true)
            .old_swapchain(old);
        info = if families.graphics != families.present {
            info.image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        } else {
            info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let loader = device.swapchain_loader();
        // SAFETY: surface and device are live; old is either null or retired here.
        let handle = unsafe { loader.create_swapchain(&info, None) }.at("vkCreateSwapchainKHR")?;

        self.destroy_views(device);
        if old != vk::SwapchainKHR::null() {
            // SAFETY: device is idle and old has been retired by the create above.
            unsafe { loader.destroy_swapchain(old, None) };
        }
        self.handle = handle;
        let old_images = std::mem::take(&mut self.images);

        // SAFETY: handle was just created on this device.
        self.images = unsafe { loader.get_swapchain_images(handle) }.at("vkGetSwapchainImagesKHR")?;
        self.views = Vec::with_capacity(self.images.len());
        for &image in &self.images {
            let view = create_color_view(device, image, settings.format)?;
            self.views.push(view);
        }
        self.settings = Some(settings);
        self.valid = true;

        tracing::info!(
            "Swapchain: {}x{} {:?}/{:?} {:?} images={}",
            settings.extent.width,
            settings.extent.height,
            settings.format,
            settings.color_space,
            settings.present_mode,
            self.images.len()
        );
        Ok(RecreateOutcome::Rebuilt { old_images })
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn settings(&self) -> Option<&SwapchainSettings> {
        self.settings.as_ref()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.settings.map(|s| s.extent).unwrap_or_default()
    }

    pub fn format(&self) -> vk::Format {
        self.settings.map(|s| s.format).unwrap_or(vk::Format::UNDEFINED)
    }

    fn destroy_views(&mut self, device: &Device) {
        for view in self.views.drain(..) {
            // SAFETY: views are only referenced by finished command buffers.
            unsafe { device.raw().destroy_image_view(view, None) };
        }
    }

    pub fn shutdown(&mut self, device: &Device) {
        self.destroy_views(device);
        if self.handle != vk::SwapchainKHR::null() {
            // SAFETY: device is idle.
            unsafe { device.swapchain_loader().destroy_swapchain(self.handle, None) };
            self.handle = vk::SwapchainKHR::null();
        }
        self.images.clear();
        self.valid = false;
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        debug_assert!(
            self.handle == vk::SwapchainKHR::null(),
            "Swapchain dropped without shutdown"
        );
    }
}

fn create_color_view(device: &Device, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView> {
    let info = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    };
    // SAFETY: image belongs to a live swapchain on this device.
    unsafe { device.raw().create_image_view(&info, None) }.at("vkCreateImageView")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: vk::Extent2D, min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: current,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        }
    }

    const UNDEFINED_EXTENT: vk::Extent2D = vk::Extent2D {
        width: u32::MAX,
        height: u32::MAX,
    };

    fn desktop_support() -> SurfaceSupport {
        SurfaceSupport {
            caps: caps(UNDEFINED_EXTENT, 2, 3),
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![
                vk::PresentModeKHR::FIFO,
                vk::PresentModeKHR::MAILBOX,
                vk::PresentModeKHR::IMMEDIATE,
            ],
        }
    }

    #[test]
    fn cold_start_with_mailbox() {
        let s = SwapchainSettings::choose(&desktop_support(), RenderSize::new(1280, 720), false)
            .unwrap()
            .unwrap();
        assert_eq!(s.image_count, 3);
        assert_eq!(s.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(s.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(s.extent, vk::Extent2D { width: 1280, height: 720 });
    }

    #[test]
    fn identical_caps_give_identical_settings() {
        let support = desktop_support();
        let a = SwapchainSettings::choose(&support, RenderSize::new(800, 600), true).unwrap();
        let b = SwapchainSettings::choose(&support, RenderSize::new(800, 600), true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn minimized_surface_defers() {
        let mut support = desktop_support();
        support.caps.current_extent = vk::Extent2D { width: 0, height: 0 };
        assert_eq!(
            SwapchainSettings::choose(&support, RenderSize::new(1280, 720), true).unwrap(),
            None
        );
        let support = desktop_support();
        assert_eq!(
            SwapchainSettings::choose(&support, RenderSize::new(0, 0), true).unwrap(),
            None
        );
    }

    #[test]
    fn present_mode_fallbacks() {
        let no_mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(choose_present_mode(&no_mailbox, false), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(choose_present_mode(&no_mailbox, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::FIFO], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn surface_format_falls_back_to_first() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(choose_surface_format(&formats), Some(formats[0]));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn extent_uses_current_when_defined() {
        let fixed = caps(vk::Extent2D { width: 640, height: 480 }, 2, 0);
        assert_eq!(
            choose_extent(&fixed, RenderSize::new(1920, 1080)),
            Some(vk::Extent2D { width: 640, height: 480 })
        );
        let free = caps(UNDEFINED_EXTENT, 2, 0);
        assert_eq!(
            choose_extent(&free, RenderSize::new(10_000, 20)),
            Some(vk::Extent2D { width: 4096, height: 20 })
        );
    }

    #[test]
    fn image_count_respects_cap() {
        assert_eq!(choose_image_count(&caps(UNDEFINED_EXTENT, 2, 0)), 3);
        assert_eq!(choose_image_count(&caps(UNDEFINED_EXTENT, 3, 3)), 3);
        assert_eq!(choose_image_count(&caps(UNDEFINED_EXTENT, 1, 8)), 2);
    }
}
