// SPDX-License-Identifier: CEPL-1.0
//! Instance, debug messenger and presentation surface.
//!
//! STRICT ORDER:
//! 1) Loader version check (1.3 or newer)
//! 2) VkInstance with WSI extensions, debug-utils chained into pNext
//! 3) Persistent messenger from the same descriptor
//! 4) VkSurfaceKHR from the native handle
//!
//! Teardown runs the other way round: surface, messenger, instance.
use crate::config::RendererConfig;
use crate::error::{VkError, VkResult, VkResultExt};
use ash::ext::debug_utils;
use ash::khr::surface;
use ash::{vk, Entry, Instance};
use keel_render::{NativeWindow, NativeWindowKind};
use raw_window_handle::{
    AppKitDisplayHandle, AppKitWindowHandle, RawDisplayHandle, RawWindowHandle, WaylandDisplayHandle,
    WaylandWindowHandle, Win32WindowHandle, WindowsDisplayHandle, XcbDisplayHandle, XcbWindowHandle,
};
use std::ffi::{c_void, CStr, CString};
use std::num::{NonZeroIsize, NonZeroU32};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

pub const REQUIRED_API_VERSION: u32 = vk::API_VERSION_1_3;
pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

static LIVE_INSTANCE: AtomicBool = AtomicBool::new(false);

/// Proof that this process holds the only live renderer instance.
#[derive(Debug)]
pub(crate) struct InstanceToken(());

impl InstanceToken {
    pub(crate) fn claim() -> VkResult<Self> {
        LIVE_INSTANCE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| InstanceToken(()))
            .map_err(|_| VkError::InstanceCreation("an instance is already live".into()))
    }
}

impl Drop for InstanceToken {
    fn drop(&mut self) {
        LIVE_INSTANCE.store(false, Ordering::Release);
    }
}

pub fn surface_extension(kind: NativeWindowKind) -> &'static CStr {
    match kind {
        NativeWindowKind::Win32 => ash::khr::win32_surface::NAME,
        NativeWindowKind::Xcb => ash::khr::xcb_surface::NAME,
        NativeWindowKind::Wayland => ash::khr::wayland_surface::NAME,
        NativeWindowKind::Cocoa => ash::ext::metal_surface::NAME,
    }
}

pub fn required_instance_extensions(kind: NativeWindowKind, debug: bool) -> Vec<&'static CStr> {
    let mut exts = vec![surface::NAME, surface_extension(kind)];
    if debug {
        exts.push(debug_utils::NAME);
    }
    exts
}

/// Names in `required` that `available` does not list.
pub fn missing_extensions<'a>(required: &[&'a CStr], available: &[vk::ExtensionProperties]) -> Vec<&'a CStr> {
    required
        .iter()
        .copied()
        .filter(|name| {
            !available
                .iter()
                .any(|e| e.extension_name_as_c_str() == Ok(*name))
        })
        .collect()
}

pub fn check_loader_version(version: u32) -> VkResult<()> {
    if version < REQUIRED_API_VERSION {
        return Err(VkError::InstanceCreation(format!(
            "loader reports Vulkan {}.{}, need 1.3",
            vk::api_version_major(version),
            vk::api_version_minor(version)
        )));
    }
    Ok(())
}

/// Converts the tagged host handle into `raw-window-handle` values for
/// `ash_window`.
pub fn raw_handles(window: &NativeWindow) -> VkResult<(RawDisplayHandle, RawWindowHandle)> {
    let mismatch = |what: &str| VkError::SurfaceCreation(format!("{:?} window: {what}", window.kind));
    let ptr = |v: usize| NonNull::new(v as *mut c_void);

    match window.kind {
        NativeWindowKind::Win32 => {
            let hwnd = NonZeroIsize::new(window.handle1 as isize).ok_or_else(|| mismatch("null HWND"))?;
            let mut wh = Win32WindowHandle::new(hwnd);
            wh.hinstance = NonZeroIsize::new(window.handle2 as isize);
            Ok((
                RawDisplayHandle::Windows(WindowsDisplayHandle::new()),
                RawWindowHandle::Win32(wh),
            ))
        }
        NativeWindowKind::Xcb => {
            let id = u32::try_from(window.handle1).map_err(|_| mismatch("window id exceeds 32 bits"))?;
            let id = NonZeroU32::new(id).ok_or_else(|| mismatch("null window id"))?;
            let conn = ptr(window.handle2).ok_or_else(|| mismatch("null connection"))?;
            Ok((
                RawDisplayHandle::Xcb(XcbDisplayHandle::new(Some(conn), 0)),
                RawWindowHandle::Xcb(XcbWindowHandle::new(id)),
            ))
        }
        NativeWindowKind::Wayland => {
            let surf = ptr(window.handle1).ok_or_else(|| mismatch("null wl_surface"))?;
            let display = ptr(window.handle2).ok_or_else(|| mismatch("null wl_display"))?;
            Ok((
                RawDisplayHandle::Wayland(WaylandDisplayHandle::new(display)),
                RawWindowHandle::Wayland(WaylandWindowHandle::new(surf)),
            ))
        }
        NativeWindowKind::Cocoa => {
            let view = ptr(window.handle1).ok_or_else(|| mismatch("null NSView"))?;
            Ok((
                RawDisplayHandle::AppKit(AppKitDisplayHandle::new()),
                RawWindowHandle::AppKit(AppKitWindowHandle::new(view)),
            ))
        }
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the loader hands us a valid callback struct for the duration of the call.
    let p_message = unsafe { (*data).p_message };
    if p_message.is_null() {
        return vk::FALSE;
    }
    // SAFETY: p_message is a NUL-terminated string owned by the loader.
    let msg = unsafe { CStr::from_ptr(p_message) }.to_string_lossy();

    use vk::DebugUtilsMessageSeverityFlagsEXT as S;
    if severity.contains(S::ERROR) {
        tracing::error!(target: "keel_vk::validation", ?types, "{msg}");
    } else if severity.contains(S::WARNING) {
        tracing::warn!(target: "keel_vk::validation", ?types, "{msg}");
    } else if severity.contains(S::INFO) {
        tracing::info!(target: "keel_vk::validation", ?types, "{msg}");
    } else {
        tracing::trace!(target: "keel_vk::validation", ?types, "{msg}");
    }
    vk::FALSE
}

/// Shared by the instance pNext chain and the persistent messenger.
fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
}

struct DebugMessenger {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

pub struct Context {
    entry: Entry,
    instance: Instance,
    debug: Option<DebugMessenger>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    window_kind: NativeWindowKind,
    token: Option<InstanceToken>,
}

impl Context {
    pub fn initialize(window: &NativeWindow, cfg: &RendererConfig) -> VkResult<Self> {
        let token = InstanceToken::claim()?;
        let (display_raw, window_raw) = raw_handles(window)?;

        // SAFETY: loading the system Vulkan library has no preconditions beyond
        // it being a conforming loader.
        let entry = unsafe { Entry::load() }
            .map_err(|e| VkError::InstanceCreation(format!("loading Vulkan loader: {e}")))?;

        // SAFETY: entry is a live loader.
        let version = unsafe { entry.try_enumerate_instance_version() }
            .at("vkEnumerateInstanceVersion")?
            .unwrap_or(vk::API_VERSION_1_0);
        check_loader_version(version)?;

        // SAFETY: entry is a live loader.
        let layers = unsafe { entry.enumerate_instance_layer_properties() }
            .at("vkEnumerateInstanceLayerProperties")?;
        let has_validation_layer = layers
            .iter()
            .any(|l| l.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
        let validation = cfg.validation && has_validation_layer;
        if cfg.validation && !has_validation_layer {
            tracing::warn!("validation requested but {VALIDATION_LAYER:?} is not installed");
        }

        // SAFETY: entry is a live loader.
        let available = unsafe { entry.enumerate_instance_extension_properties(None) }
            .at("vkEnumerateInstanceExtensionProperties")?;
        let mut wanted = required_instance_extensions(window.kind, false);
        let missing = missing_extensions(&wanted, &available);
        if !missing.is_empty() {
            return Err(VkError::InstanceCreation(format!(
                "missing surface extensions: {missing:?}"
            )));
        }
        let debug_utils_available = missing_extensions(&[debug_utils::NAME], &available).is_empty();
        let debug = validation && debug_utils_available;
        if debug {
            wanted.push(debug_utils::NAME);
        }

        let sync_validation = validation && {
            // SAFETY: entry is a live loader; the layer name is NUL-terminated.
            let layer_exts = unsafe { entry.enumerate_instance_extension_properties(Some(VALIDATION_LAYER)) }
                .unwrap_or_default();
            missing_extensions(&[ash::ext::validation_features::NAME], &layer_exts).is_empty()
        };
        if sync_validation {
            wanted.push(ash::ext::validation_features::NAME);
        }

        let app_name = CString::new(cfg.app_name.as_str())
            .map_err(|_| VkError::InstanceCreation("app_name contains NUL".into()))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .engine_name(c"keel")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(REQUIRED_API_VERSION);

        let ext_ptrs: Vec<*const std::ffi::c_char> = wanted.iter().map(|n| n.as_ptr()).collect();
        let layer_ptrs: Vec<*const std::ffi::c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let enabled_validation = [vk::ValidationFeatureEnableEXT::SYNCHRONIZATION_VALIDATION];
        let mut validation_features =
            vk::ValidationFeaturesEXT::default().enabled_validation_features(&enabled_validation);
        let mut chained_debug = debug_messenger_info();

        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&ext_ptrs)
            .enabled_layer_names(&layer_ptrs);
        if debug {
            // Instance creation/destruction messages go through this copy.
            create_info = create_info.push_next(&mut chained_debug);
        }
        if sync_validation {
            create_info = create_info.push_next(&mut validation_features);
        }

        // SAFETY: every pointer in create_info outlives the call.
        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|r| {
            VkError::InstanceCreation(format!("vkCreateInstance: {r:?}"))
        })?;

        let debug_state = if debug {
            let loader = debug_utils::Instance::new(&entry, &instance);
            // SAFETY: instance was created with VK_EXT_debug_utils enabled.
            match unsafe { loader.create_debug_utils_messenger(&debug_messenger_info(), None) } {
                Ok(messenger) => Some(DebugMessenger { loader, messenger }),
                Err(r) => {
                    tracing::warn!("debug messenger unavailable: {r:?}");
                    None
                }
            }
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        // SAFETY: handles were validated by raw_handles; instance enables the
        // matching platform surface extension.
        let surface = match unsafe { ash_window::create_surface(&entry, &instance, display_raw, window_raw, None) } {
            Ok(s) => s,
            Err(r) => {
                // SAFETY: nothing else was created from this instance yet.
                unsafe {
                    if let Some(d) = &debug_state {
                        d.loader.destroy_debug_utils_messenger(d.messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(VkError::SurfaceCreation(format!(
                    "{:?} surface: {r:?}",
                    window.kind
                )));
            }
        };

        tracing::info!(
            "Vulkan instance ready (loader {}.{}, validation={}, sync-validation={}, surface={:?})",
            vk::api_version_major(version),
            vk::api_version_minor(version),
            validation,
            sync_validation,
            window.kind
        );

        Ok(Self {
            entry,
            instance,
            debug: debug_state,
            surface_loader,
            surface,
            window_kind: window.kind,
            token: Some(token),
        })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn surface_loader(&self) -> &surface::Instance {
        &self.surface_loader
    }

    pub fn window_kind(&self) -> NativeWindowKind {
        self.window_kind
    }

    pub fn has_debug_messenger(&self) -> bool {
        self.debug.is_some()
    }

    /// Must run after the logical device is gone.
    pub fn shutdown(&mut self) {
        if self.token.is_none() {
            return;
        }
        // SAFETY: the device and every swapchain built on this surface were
        // destroyed by the caller.
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
            self.surface = vk::SurfaceKHR::null();
            if let Some(d) = self.debug.take() {
                d.loader.destroy_debug_utils_messenger(d.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        self.token = None;
        tracing::debug!("context destroyed");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        debug_assert!(self.surface == vk::SurfaceKHR::null(), "Context dropped without shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, src) in props.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = *src as std::ffi::c_char;
        }
        props
    }

    #[test]
    fn surface_extension_matches_kind() {
        assert_eq!(surface_extension(NativeWindowKind::Win32), c"VK_KHR_win32_surface");
        assert_eq!(surface_extension(NativeWindowKind::Xcb), c"VK_KHR_xcb_surface");
        assert_eq!(surface_extension(NativeWindowKind::Wayland), c"VK_KHR_wayland_surface");
        assert_eq!(surface_extension(NativeWindowKind::Cocoa), c"VK_EXT_metal_surface");
    }

    #[test]
    fn debug_adds_debug_utils() {
        let plain = required_instance_extensions(NativeWindowKind::Xcb, false);
        let debug = required_instance_extensions(NativeWindowKind::Xcb, true);
        assert_eq!(plain, vec![c"VK_KHR_surface", c"VK_KHR_xcb_surface"]);
        assert_eq!(debug.last().copied(), Some(c"VK_EXT_debug_utils"));
    }

    #[test]
    fn missing_surface_extension_is_reported() {
        let available = [ext(c"VK_KHR_surface")];
        let required = required_instance_extensions(NativeWindowKind::Wayland, false);
        assert_eq!(missing_extensions(&required, &available), vec![c"VK_KHR_wayland_surface"]);
    }

    #[test]
    fn old_loader_is_rejected() {
        assert!(matches!(
            check_loader_version(vk::API_VERSION_1_2),
            Err(VkError::InstanceCreation(_))
        ));
        assert!(check_loader_version(vk::API_VERSION_1_3).is_ok());
        assert!(check_loader_version(vk::make_api_version(0, 1, 4, 0)).is_ok());
    }

    #[test]
    fn handle_mismatch_is_surface_error() {
        let w = NativeWindow::new(NativeWindowKind::Wayland, 0x1000, 0);
        assert!(matches!(raw_handles(&w), Err(VkError::SurfaceCreation(_))));
        let w = NativeWindow::new(NativeWindowKind::Win32, 0, 0);
        assert!(matches!(raw_handles(&w), Err(VkError::SurfaceCreation(_))));
    }

    #[test]
    fn handles_convert_per_kind() {
        let w = NativeWindow::new(NativeWindowKind::Xcb, 42, 0x2000);
        let (d, h) = raw_handles(&w).unwrap();
        assert!(matches!(d, RawDisplayHandle::Xcb(_)));
        match h {
            RawWindowHandle::Xcb(x) => assert_eq!(x.window.get(), 42),
            other => panic!("unexpected handle {other:?}"),
        }
        let w = NativeWindow::new(NativeWindowKind::Win32, 0x10, 0x20);
        match raw_handles(&w).unwrap().1 {
            RawWindowHandle::Win32(x) => {
                assert_eq!(x.hwnd.get(), 0x10);
                assert_eq!(x.hinstance.map(|h| h.get()), Some(0x20));
            }
            other => panic!("unexpected handle {other:?}"),
        }
    }

    #[test]
    fn second_instance_token_is_refused() {
        let first = InstanceToken::claim().unwrap();
        assert!(matches!(InstanceToken::claim(), Err(VkError::InstanceCreation(_))));
        drop(first);
        let again = InstanceToken::claim();
        assert!(again.is_ok());
    }
}
