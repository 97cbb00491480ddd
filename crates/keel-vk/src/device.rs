// SPDX-License-Identifier: CEPL-1.0
//! Physical device selection and the logical device.
use crate::context::{Context, REQUIRED_API_VERSION};
use crate::error::{VkError, VkResult, VkResultExt};
use ash::khr::swapchain;
use ash::vk;
use std::collections::BTreeSet;

/// Queue family indices resolved for one physical device.
///
/// `compute` and `transfer` fall back to `graphics` when no dedicated family
/// exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    pub fn unique(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = [self.graphics, self.present, self.compute, self.transfer]
            .into_iter()
            .collect();
        set.into_iter().collect()
    }

    pub fn has_dedicated_transfer(&self) -> bool {
        self.transfer != self.graphics
    }
}

/// Everything selection needs to know about a candidate, gathered up front so
/// scoring stays a pure function.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub has_swapchain: bool,
    pub dynamic_rendering: bool,
    pub synchronization2: bool,
    pub sampler_anisotropy: bool,
    pub max_image_dimension_2d: u32,
    pub families: Option<QueueFamilies>,
}

pub const LARGE_IMAGE_DIMENSION: u32 = 8192;

/// `None` means the device is unusable.
pub fn score_device(c: &DeviceCandidate) -> Option<i64> {
    if c.api_version < REQUIRED_API_VERSION
        || !c.has_swapchain
        || !c.dynamic_rendering
        || !c.synchronization2
        || c.families.is_none()
    {
        return None;
    }
    let mut score = match c.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 500,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 200,
        _ => 0,
    };
    if c.sampler_anisotropy {
        score += 250;
    }
    if c.max_image_dimension_2d >= LARGE_IMAGE_DIMENSION {
        score += 100;
    } else {
        score -= 200;
    }
    Some(score)
}

/// Index of the highest score; ties keep the earliest candidate.
pub fn pick_best(scores: &[Option<i64>]) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    for (i, s) in scores.iter().enumerate() {
        if let Some(s) = *s {
            match best {
                Some((_, b)) if s <= b => {}
                _ => best = Some((i, s)),
            }
        }
    }
    best.map(|(i, _)| i)
}

/// `present_support[i]` says whether family `i` can present to the surface.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    present_support: &[bool],
) -> Option<QueueFamilies> {
    let supports = |i: usize, f: vk::QueueFlags| families[i].queue_count > 0 && families[i].queue_flags.contains(f);
    let presents = |i: usize| present_support.get(i).copied().unwrap_or(false);

    let graphics_ids: Vec<usize> = (0..families.len())
        .filter(|&i| supports(i, vk::QueueFlags::GRAPHICS))
        .collect();

    // A graphics family that also presents avoids ownership transfers on present.
    let graphics = graphics_ids
        .iter()
        .copied()
        .find(|&i| presents(i))
        .or_else(|| graphics_ids.first().copied())?;
    let present = if presents(graphics) {
        graphics
    } else {
        (0..families.len()).find(|&i| presents(i))?
    };

    let compute = (0..families.len())
        .find(|&i| supports(i, vk::QueueFlags::COMPUTE) && !supports(i, vk::QueueFlags::GRAPHICS))
        .unwrap_or(graphics);

    let transfer = (0..families.len())
        .find(|&i| {
            supports(i, vk::QueueFlags::TRANSFER)
                && !supports(i, vk::QueueFlags::GRAPHICS)
                && !supports(i, vk::QueueFlags::COMPUTE)
        })
        .unwrap_or(graphics);

    Some(QueueFamilies {
        graphics: graphics as u32,
        present: present as u32,
        compute: compute as u32,
        transfer: transfer as u32,
    })
}

pub const DEPTH_CANDIDATES: [vk::Format; 4] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
];

/// First candidate whose optimal tiling supports depth attachments.
pub fn pick_depth_format(optimal_features: impl Fn(vk::Format) -> vk::FormatFeatureFlags) -> Option<vk::Format> {
    DEPTH_CANDIDATES
        .into_iter()
        .find(|&f| optimal_features(f).contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT))
}

pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT
    )
}

pub struct Device {
    physical: vk::PhysicalDevice,
    raw: ash::Device,
    swapchain_loader: swapchain::Device,
    families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    compute_queue: vk::Queue,
    transfer_queue: vk::Queue,
    properties: vk::PhysicalDeviceProperties,
    depth_format: vk::Format,
    anisotropy: bool,
    destroyed: bool,
}

fn describe(ctx: &Context, pd: vk::PhysicalDevice) -> VkResult<(DeviceCandidate, bool)> {
    let instance = ctx.instance();
    // SAFETY: pd was enumerated from this instance.
    let props = unsafe { instance.get_physical_device_properties(pd) };
    let name = props
        .device_name_as_c_str()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "<unnamed>".into());

    // SAFETY: as above.
    let exts = unsafe { instance.enumerate_device_extension_properties(pd) }
        .at("vkEnumerateDeviceExtensionProperties")?;
    let has_swapchain = exts
        .iter()
        .any(|e| e.extension_name_as_c_str() == Ok(swapchain::NAME));

    let mut f13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut f2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut f13);
    // SAFETY: as above; f13 outlives the call.
    unsafe { instance.get_physical_device_features2(pd, &mut f2) };
    let sampler_anisotropy = f2.features.sampler_anisotropy == vk::TRUE;
    let maintenance4 = f13.maintenance4 == vk::TRUE;

    // SAFETY: as above.
    let qf = unsafe { instance.get_physical_device_queue_family_properties(pd) };
    let mut present_support = Vec::with_capacity(qf.len());
    for i in 0..qf.len() as u32 {
        // SAFETY: i is a valid family index and the surface belongs to this instance.
        let ok = unsafe {
            ctx.surface_loader()
                .get_physical_device_surface_support(pd, i, ctx.surface())
        }
        .at("vkGetPhysicalDeviceSurfaceSupportKHR")?;
        present_support.push(ok);
    }

    Ok((
        DeviceCandidate {
            name,
            device_type: props.device_type,
            api_version: props.api_version,
            has_swapchain,
            dynamic_rendering: f13.dynamic_rendering == vk::TRUE,
            synchronization2: f13.synchronization2 == vk::TRUE,
            sampler_anisotropy,
            max_image_dimension_2d: props.limits.max_image_dimension2_d,
            families: select_queue_families(&qf, &present_support),
        },
        maintenance4,
    ))
}

impl Device {
    pub fn create(ctx: &Context) -> VkResult<Self> {
        let instance = ctx.instance();
        // SAFETY: instance is live.
        let pds = unsafe { instance.enumerate_physical_devices() }.at("vkEnumeratePhysicalDevices")?;
        if pds.is_empty() {
            return Err(VkError::NoSuitableDevice("no Vulkan devices found".into()));
        }

        let mut described = Vec::with_capacity(pds.len());
        for &pd in &pds {
            let (cand, maint4) = describe(ctx, pd)?;
            let score = score_device(&cand);
            tracing::debug!(device = %cand.name, ?score, "device candidate");
            described.push((pd, cand, maint4, score));
        }
        let scores: Vec<Option<i64>> = described.iter().map(|d| d.3).collect();
        let Some(best) = pick_best(&scores) else {
            let names: Vec<&str> = described.iter().map(|d| d.1.name.as_str()).collect();
            return Err(VkError::NoSuitableDevice(format!(
                "none of {names:?} meet Vulkan 1.3 + swapchain + dynamic rendering + presentation"
            )));
        };
        let (physical, cand, maintenance4, _) = described.swap_remove(best);
        let families = cand
            .families
            .ok_or_else(|| VkError::NoSuitableDevice("queue families vanished".into()))?;

        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|idx| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(idx)
                    .queue_priorities(&priorities)
            })
            .collect();

        let mut f13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true)
            .maintenance4(maintenance4);
        let core = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(cand.sampler_anisotropy);
        let mut features = vk::PhysicalDeviceFeatures2::default().features(core).push_next(&mut f13);

        let exts = [swapchain::NAME.as_ptr()];
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&exts)
            .push_next(&mut features);

        // SAFETY: physical was enumerated from instance; all chained structs outlive the call.
        let raw = unsafe { instance.create_device(physical, &create_info, None) }.at("vkCreateDevice")?;

        // SAFETY: every family index was requested with one queue.
        let (graphics_queue, present_queue, compute_queue, transfer_queue) = unsafe {
            (
                raw.get_device_queue(families.graphics, 0),
                raw.get_device_queue(families.present, 0),
                raw.get_device_queue(families.compute, 0),
                raw.get_device_queue(families.transfer, 0),
            )
        };

        // SAFETY: physical is valid for this instance.
        let properties = unsafe { instance.get_physical_device_properties(physical) };

        let depth_format = pick_depth_format(|f| {
            // SAFETY: as above.
            unsafe { instance.get_physical_device_format_properties(physical, f) }.optimal_tiling_features
        });
        let Some(depth_format) = depth_format else {
            // SAFETY: nothing was created from raw yet.
            unsafe { raw.destroy_device(None) };
            return Err(VkError::NoSuitableDevice(format!("{}: no depth attachment format", cand.name)));
        };

        let swapchain_loader = swapchain::Device::new(instance, &raw);

        tracing::info!(
            "Using GPU: {} ({:?}) families g={} p={} c={} t={} depth={:?}",
            cand.name,
            cand.device_type,
            families.graphics,
            families.present,
            families.compute,
            families.transfer,
            depth_format
        );

        Ok(Self {
            physical,
            raw,
            swapchain_loader,
            families,
            graphics_queue,
            present_queue,
            compute_queue,
            transfer_queue,
            properties,
            depth_format,
            anisotropy: cand.sampler_anisotropy,
            destroyed: false,
        })
    }

    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    pub fn physical(&self) -> vk::PhysicalDevice {
        self.physical
    }

    pub fn swapchain_loader(&self) -> &swapchain::Device {
        &self.swapchain_loader
    }

    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    pub fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn anisotropy_enabled(&self) -> bool {
        self.anisotropy
    }

    pub fn max_anisotropy(&self) -> f32 {
        if self.anisotropy {
            self.properties.limits.max_sampler_anisotropy
        } else {
            1.0
        }
    }

    pub fn wait_idle(&self) -> VkResult<()> {
        // SAFETY: device is live.
        unsafe { self.raw.device_wait_idle() }.at("vkDeviceWaitIdle")
    }

    /// Every child object must already be destroyed.
    pub fn shutdown(&mut self) {
        if self.destroyed {
            return;
        }
        // SAFETY: caller guarantees no child objects remain.
        unsafe { self.raw.destroy_device(None) };
        self.destroyed = true;
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        debug_assert!(self.destroyed, "Device dropped without shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn candidate(device_type: vk::PhysicalDeviceType) -> DeviceCandidate {
        DeviceCandidate {
            name: "gpu".into(),
            device_type,
            api_version: vk::API_VERSION_1_3,
            has_swapchain: true,
            dynamic_rendering: true,
            synchronization2: true,
            sampler_anisotropy: true,
            max_image_dimension_2d: 16384,
            families: Some(QueueFamilies {
                graphics: 0,
                present: 0,
                compute: 0,
                transfer: 0,
            }),
        }
    }

    #[test]
    fn discrete_beats_integrated() {
        let d = score_device(&candidate(vk::PhysicalDeviceType::DISCRETE_GPU)).unwrap();
        let i = score_device(&candidate(vk::PhysicalDeviceType::INTEGRATED_GPU)).unwrap();
        assert_eq!(d, 1000 + 250 + 100);
        assert_eq!(i, 500 + 250 + 100);
        assert_eq!(pick_best(&[Some(i), Some(d)]), Some(1));
    }

    #[test]
    fn small_limits_cost_points() {
        let mut c = candidate(vk::PhysicalDeviceType::VIRTUAL_GPU);
        c.sampler_anisotropy = false;
        c.max_image_dimension_2d = 4096;
        assert_eq!(score_device(&c), Some(200 - 200));
    }

    #[test]
    fn unusable_devices_are_rejected() {
        let mut old = candidate(vk::PhysicalDeviceType::DISCRETE_GPU);
        old.api_version = vk::API_VERSION_1_2;
        let mut no_swap = candidate(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_swap.has_swapchain = false;
        let mut no_present = candidate(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_present.families = None;
        for c in [old, no_swap, no_present] {
            assert_eq!(score_device(&c), None);
        }
        assert_eq!(pick_best(&[None, None]), None);
    }

    #[test]
    fn ties_keep_enumeration_order() {
        assert_eq!(pick_best(&[None, Some(700), Some(700)]), Some(1));
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let qf = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let f = select_queue_families(&qf, &[true, false, false]).unwrap();
        assert_eq!(f, QueueFamilies { graphics: 0, present: 0, compute: 1, transfer: 2 });
        assert!(f.has_dedicated_transfer());
        assert_eq!(f.unique(), vec![0, 1, 2]);
    }

    #[test]
    fn single_family_serves_everything() {
        let qf = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        let f = select_queue_families(&qf, &[true]).unwrap();
        assert_eq!(f, QueueFamilies { graphics: 0, present: 0, compute: 0, transfer: 0 });
        assert!(!f.has_dedicated_transfer());
        assert_eq!(f.unique(), vec![0]);
    }

    #[test]
    fn separate_present_family() {
        let qf = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let f = select_queue_families(&qf, &[false, true]).unwrap();
        assert_eq!(f.graphics, 0);
        assert_eq!(f.present, 1);
        assert!(select_queue_families(&qf, &[false, false]).is_none());
    }

    #[test]
    fn depth_format_follows_preference() {
        let only_d24 = |f: vk::Format| {
            if f == vk::Format::D24_UNORM_S8_UINT {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::FormatFeatureFlags::empty()
            }
        };
        assert_eq!(pick_depth_format(only_d24), Some(vk::Format::D24_UNORM_S8_UINT));
        assert_eq!(
            pick_depth_format(|_| vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT),
            Some(vk::Format::D32_SFLOAT)
        );
        assert_eq!(pick_depth_format(|_| vk::FormatFeatureFlags::empty()), None);
        assert!(has_stencil(vk::Format::D24_UNORM_S8_UINT));
        assert!(!has_stencil(vk::Format::D32_SFLOAT));
    }
}
