// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimized window reports a zero-sized client area.
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Platform family of a [`NativeWindow`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NativeWindowKind {
    Win32,
    Xcb,
    Wayland,
    Cocoa,
}

/// Raw window handle pair handed to the renderer by the host.
///
/// | kind    | `handle1`             | `handle2`                |
/// |---------|-----------------------|--------------------------|
/// | Win32   | `HWND`                | `HINSTANCE` (may be 0)   |
/// | Xcb     | `xcb_window_t`        | `xcb_connection_t*`      |
/// | Wayland | `wl_surface*`         | `wl_display*`            |
/// | Cocoa   | `NSView*`             | unused                   |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeWindow {
    pub kind: NativeWindowKind,
    pub handle1: usize,
    pub handle2: usize,
}

impl NativeWindow {
    pub const fn new(kind: NativeWindowKind, handle1: usize, handle2: usize) -> Self {
        Self {
            kind,
            handle1,
            handle2,
        }
    }

    /// Whether every handle this kind needs is non-null.
    pub fn is_complete(&self) -> bool {
        match self.kind {
            NativeWindowKind::Win32 | NativeWindowKind::Cocoa => self.handle1 != 0,
            NativeWindowKind::Xcb | NativeWindowKind::Wayland => {
                self.handle1 != 0 && self.handle2 != 0
            }
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex {
    pub const fn new(pos: [f32; 3], color: [f32; 3]) -> Self {
        Self { pos, color }
    }
}

/// Opaque handle to a mesh owned by a renderer backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u32);

/// One draw emitted by a higher-level system (scene graph, UI, ...).
#[derive(Clone, Copy, Debug)]
pub struct DrawItem {
    pub mesh: MeshId,
    pub transform: Mat4,
}

impl DrawItem {
    pub fn new(mesh: MeshId, transform: Mat4) -> Self {
        Self { mesh, transform }
    }
}

/// Outcome of [`Renderer::begin_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// A command buffer is open; draw, then call `end_frame`.
    Recording,
    /// Nothing to record this tick (minimized, or the swapchain is being rebuilt).
    Skipped,
}

/// Narrow capability surface every backend implements.
pub trait Renderer {
    type Error: std::error::Error + Send + Sync + 'static;
    type Config;

    fn initialize(window: NativeWindow, size: RenderSize, config: Self::Config) -> Result<Self, Self::Error>
    where
        Self: Sized;

    fn shutdown(&mut self) -> Result<(), Self::Error>;
    fn begin_frame(&mut self) -> Result<FrameStatus, Self::Error>;
    fn end_frame(&mut self) -> Result<(), Self::Error>;
    fn resize(&mut self, size: RenderSize) -> Result<(), Self::Error>;
    fn draw_mesh(&mut self, item: &DrawItem) -> Result<(), Self::Error>;

    fn create_mesh(&mut self, vertices: &[Vertex], indices: &[u32]) -> Result<MeshId, Self::Error>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_vsync(&mut self, _on: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
        let v = [Vertex::new([1.0, 2.0, 3.0], [0.5, 0.5, 0.5])];
        let bytes: &[u8] = bytemuck::cast_slice(&v);
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[0..4], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn incomplete_handles_are_detected() {
        assert!(NativeWindow::new(NativeWindowKind::Win32, 0x10, 0).is_complete());
        assert!(!NativeWindow::new(NativeWindowKind::Win32, 0, 0x10).is_complete());
        assert!(!NativeWindow::new(NativeWindowKind::Xcb, 7, 0).is_complete());
        assert!(NativeWindow::new(NativeWindowKind::Wayland, 1, 2).is_complete());
        assert!(NativeWindow::new(NativeWindowKind::Cocoa, 1, 0).is_complete());
    }

    #[test]
    fn zero_sizes() {
        assert!(RenderSize::new(0, 600).is_zero());
        assert!(RenderSize::new(800, 0).is_zero());
        assert!(!RenderSize::new(1, 1).is_zero());
    }
}
