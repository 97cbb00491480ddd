// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::Result;
use clap::Parser;
use glam::Mat4;
use keel_core::init_tracing;
use keel_platform::{native_window, render_size};
use keel_render::{DrawItem, FrameStatus, MeshId, RenderSize, Renderer, Vertex};
use keel_vk::{RendererConfig, ShaderPaths, VkError, VkRenderer};
use tracing::{error, info, warn};

use keel_platform::winit::{
    application::ApplicationHandler,
    event::{ElementState, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Renderer config (TOML). Missing file means defaults.
    #[arg(long, default_value = "keel.toml")]
    config: PathBuf,
    /// Prefer a non-blocking present mode.
    #[arg(long)]
    no_vsync: bool,
}

/// Shaders built alongside the app, used when the config names none.
fn bundled_shaders(dir: &Path) -> Option<ShaderPaths> {
    let paths = ShaderPaths {
        vertex: dir.join("mesh.vert.spv"),
        fragment: dir.join("mesh.frag.spv"),
    };
    (paths.vertex.is_file() && paths.fragment.is_file()).then_some(paths)
}

fn load_config(args: &Args) -> Result<RendererConfig> {
    let mut cfg = RendererConfig::load(&args.config)?;
    if args.no_vsync {
        cfg.vsync = false;
    }
    if cfg.mesh_shader.is_none() {
        cfg.mesh_shader = bundled_shaders(Path::new(env!("KEEL_SHADER_DIR")));
    }
    Ok(cfg)
}

fn triangle() -> ([Vertex; 3], [u32; 3]) {
    (
        [
            Vertex::new([0.0, 0.5, 0.0], [1.0, 0.2, 0.2]),
            Vertex::new([-0.5, -0.5, 0.0], [0.2, 1.0, 0.2]),
            Vertex::new([0.5, -0.5, 0.0], [0.2, 0.2, 1.0]),
        ],
        [0, 1, 2],
    )
}

struct App {
    cfg: Option<RendererConfig>,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    mesh: Option<MeshId>,
    render_size: RenderSize,
    vsync: bool,
    started: Instant,
    frames: u32,
    last_fps_instant: Instant,
    exiting: bool,
}

impl App {
    fn new(cfg: RendererConfig) -> Self {
        Self {
            vsync: cfg.vsync,
            cfg: Some(cfg),
            window: None,
            renderer: None,
            mesh: None,
            render_size: RenderSize::new(1, 1),
            started: Instant::now(),
            frames: 0,
            last_fps_instant: Instant::now(),
            exiting: false,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = event_loop.create_window(Window::default_attributes().with_title("keel"))?;
        self.render_size = render_size(window.inner_size());
        let native = native_window(&window)?;
        let cfg = self.cfg.take().unwrap_or_default();
        let draws = cfg.mesh_shader.is_some();

        let mut renderer = VkRenderer::initialize(native, self.render_size, cfg)?;
        if draws {
            let (vertices, indices) = triangle();
            self.mesh = Some(renderer.create_mesh(&vertices, &indices)?);
        } else {
            warn!("no mesh shaders found; clearing only");
        }
        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn frame(&mut self) -> Result<(), VkError> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };
        for ev in renderer.drain_events() {
            info!("{ev:?}");
        }
        if renderer.begin_frame()? == FrameStatus::Skipped {
            return Ok(());
        }
        if let Some(mesh) = self.mesh {
            let t = self.started.elapsed().as_secs_f32();
            renderer.draw_mesh(&DrawItem::new(mesh, Mat4::from_rotation_z(t)))?;
        }
        renderer.end_frame()?;
        self.frames = self.frames.saturating_add(1);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(mut r) = self.renderer.take() {
            if let Err(e) = r.shutdown() {
                error!("renderer shutdown: {e}");
            }
        }
        self.window = None;
    }

    fn on_key(&mut self, event_loop: &ActiveEventLoop, code: KeyCode) {
        if code == KeyCode::Escape {
            self.exiting = true;
            self.teardown();
            event_loop.exit();
            return;
        }
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        match code {
            KeyCode::KeyR => match renderer.reload_shaders() {
                Ok(()) => info!("shaders reloaded"),
                Err(e) => warn!("shader reload failed: {e}"),
            },
            KeyCode::KeyV => {
                self.vsync = !self.vsync;
                renderer.set_vsync(self.vsync);
                info!("vsync = {}", self.vsync);
            }
            _ => {}
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.init(event_loop) {
                error!("startup failed: {e:#}");
                self.exiting = true;
                self.teardown();
                event_loop.exit();
                return;
            }
            info!("{}x{} window ready", self.render_size.width, self.render_size.height);
        }
        event_loop.set_control_flow(ControlFlow::Poll);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.exiting = true;
                self.teardown();
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = render_size(new_size);
                if let Some(r) = &mut self.renderer {
                    if let Err(e) = r.resize(self.render_size) {
                        error!("resize: {e}");
                    }
                }
                if self.render_size.is_zero() {
                    info!("minimized, rendering paused");
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state == ElementState::Pressed && !event.repeat {
                    if let PhysicalKey::Code(code) = event.physical_key {
                        self.on_key(event_loop, code);
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting {
                    return;
                }
                if let Err(e) = self.frame() {
                    error!("render error: {e}");
                    if e.is_fatal() {
                        self.exiting = true;
                        self.teardown();
                        event_loop.exit();
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if self.render_size.is_zero() {
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = load_config(&args)?;
    info!(
        config = %args.config.display(),
        vsync = cfg.vsync,
        frames_in_flight = cfg.frames_in_flight,
        validation = cfg.validation,
        "starting keel"
    );

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;
    Ok(())
}
