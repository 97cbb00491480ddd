// SPDX-License-Identifier: CEPL-1.0
//! Windowing glue. The renderer only ever sees a [`NativeWindow`].
use anyhow::{anyhow, Result};
use keel_render::{NativeWindow, NativeWindowKind, RenderSize};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

pub use winit;

/// Extract the raw handle pair from anything winit-like.
pub fn native_window<W>(window: &W) -> Result<NativeWindow>
where
    W: HasWindowHandle + HasDisplayHandle,
{
    let wh = window
        .window_handle()
        .map_err(|e| anyhow!("window_handle: {e}"))?
        .as_raw();
    let dh = window
        .display_handle()
        .map_err(|e| anyhow!("display_handle: {e}"))?
        .as_raw();
    let native = from_raw(wh, dh)?;
    tracing::debug!(kind = ?native.kind, "native window handle extracted");
    Ok(native)
}

pub fn from_raw(window: RawWindowHandle, display: RawDisplayHandle) -> Result<NativeWindow> {
    match (window, display) {
        (RawWindowHandle::Win32(w), _) => Ok(NativeWindow::new(
            NativeWindowKind::Win32,
            w.hwnd.get() as usize,
            w.hinstance.map(|h| h.get() as usize).unwrap_or(0),
        )),
        (RawWindowHandle::Xcb(w), RawDisplayHandle::Xcb(d)) => Ok(NativeWindow::new(
            NativeWindowKind::Xcb,
            w.window.get() as usize,
            d.connection.map(|c| c.as_ptr() as usize).unwrap_or(0),
        )),
        (RawWindowHandle::Wayland(w), RawDisplayHandle::Wayland(d)) => Ok(NativeWindow::new(
            NativeWindowKind::Wayland,
            w.surface.as_ptr() as usize,
            d.display.as_ptr() as usize,
        )),
        (RawWindowHandle::AppKit(w), _) => Ok(NativeWindow::new(
            NativeWindowKind::Cocoa,
            w.ns_view.as_ptr() as usize,
            0,
        )),
        (w, d) => Err(anyhow!("unsupported window/display handle pair: {w:?} / {d:?}")),
    }
}

pub fn render_size(size: winit::dpi::PhysicalSize<u32>) -> RenderSize {
    RenderSize::new(size.width, size.height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_window_handle::{
        Win32WindowHandle, WindowsDisplayHandle, XcbDisplayHandle, XcbWindowHandle, XlibDisplayHandle,
        XlibWindowHandle,
    };
    use std::num::{NonZeroIsize, NonZeroU32};
    use std::ptr::NonNull;

    #[test]
    fn win32_maps_hwnd_and_hinstance() {
        let mut w = Win32WindowHandle::new(NonZeroIsize::new(0x1234).unwrap());
        w.hinstance = NonZeroIsize::new(0x40);
        let native = from_raw(
            RawWindowHandle::Win32(w),
            RawDisplayHandle::Windows(WindowsDisplayHandle::new()),
        )
        .unwrap();
        assert_eq!(native.kind, NativeWindowKind::Win32);
        assert_eq!(native.handle1, 0x1234);
        assert_eq!(native.handle2, 0x40);
    }

    #[test]
    fn xcb_needs_connection() {
        let mut conn = 0u8;
        let conn_ptr = NonNull::from(&mut conn).cast();
        let native = from_raw(
            RawWindowHandle::Xcb(XcbWindowHandle::new(NonZeroU32::new(9).unwrap())),
            RawDisplayHandle::Xcb(XcbDisplayHandle::new(Some(conn_ptr), 0)),
        )
        .unwrap();
        assert_eq!(native.kind, NativeWindowKind::Xcb);
        assert_eq!(native.handle1, 9);
        assert!(native.is_complete());
    }

    #[test]
    fn xlib_is_rejected() {
        let res = from_raw(
            RawWindowHandle::Xlib(XlibWindowHandle::new(5)),
            RawDisplayHandle::Xlib(XlibDisplayHandle::new(None, 0)),
        );
        assert!(res.is_err());
    }
}
