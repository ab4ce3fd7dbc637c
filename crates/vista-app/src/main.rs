// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};
use vista_core::{init_tracing, load_config};
use vista_render::{RenderSize, Renderer};
use vista_render_vk::{
    DeviceSelector, PixelBuffer, RendererConfig, SelectorOptions, VkPresentMode, VkRenderer,
};

use vista_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file with a [render] table
    #[arg(long, default_value = "vista.toml")]
    config: PathBuf,
    /// Number of windows; all of them share one device when possible
    #[arg(long)]
    windows: Option<u32>,
    /// Draw vertex colours only
    #[arg(long)]
    no_texture: bool,
    /// Enable the validation layer
    #[arg(long)]
    validation: bool,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
struct RenderCfg {
    width: u32,
    height: u32,
    clear_color: [f32; 4],
    present_mode: PresentModeCfg,
    textured: bool,
    validation: bool,
    windows: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
enum PresentModeCfg {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Deserialize, Default)]
struct AppCfg {
    #[serde(default)]
    render: RenderCfg,
}

impl Default for RenderCfg {
    fn default() -> Self {
        let size = RenderSize::default();
        RenderCfg {
            width: size.width,
            height: size.height,
            clear_color: [0.02, 0.02, 0.04, 1.0],
            present_mode: PresentModeCfg::Mailbox,
            textured: true,
            validation: cfg!(debug_assertions),
            windows: 1,
        }
    }
}

fn load_cfg(args: &Args) -> AppCfg {
    let mut cfg = match load_config::<AppCfg>(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("{e}; using defaults");
            AppCfg::default()
        }
    };
    if let Some(n) = args.windows {
        cfg.render.windows = n;
    }
    if args.no_texture {
        cfg.render.textured = false;
    }
    if args.validation {
        cfg.render.validation = true;
    }
    cfg.render.windows = cfg.render.windows.max(1);
    cfg
}

fn renderer_config(cfg: &RenderCfg, size: RenderSize) -> RendererConfig {
    let texture = if cfg.textured {
        match PixelBuffer::checkerboard(256, 32, [235, 235, 235, 255], [40, 40, 48, 255]) {
            Ok(px) => Some(px),
            Err(e) => {
                warn!("texture disabled: {e}");
                None
            }
        }
    } else {
        None
    };
    RendererConfig {
        target_extent: size,
        clear_color: cfg.clear_color,
        present_mode: match cfg.present_mode {
            PresentModeCfg::Fifo => VkPresentMode::Fifo,
            PresentModeCfg::Mailbox => VkPresentMode::Mailbox,
        },
        texture,
        shader_dir: None,
    }
}

// The renderer owns a surface created from the window, so it is declared
// (and therefore dropped) first.
struct View {
    renderer: VkRenderer,
    window: Window,
    paused: bool,
}

struct App {
    cfg: AppCfg,
    selector: Option<DeviceSelector>,
    views: Vec<View>,

    exiting: bool,
    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn open_windows(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let size = RenderSize::new(self.cfg.render.width, self.cfg.render.height);
        for i in 0..self.cfg.render.windows {
            let title = if self.cfg.render.windows == 1 {
                "vista".to_owned()
            } else {
                format!("vista #{}", i + 1)
            };
            let window =
                event_loop.create_window(vista_platform::window_attributes(&title, size))?;

            // The first window's display roots the instance for all of them.
            let selector = match &mut self.selector {
                Some(selector) => selector,
                slot @ None => {
                    let options = SelectorOptions {
                        application_name: "vista".to_owned(),
                        validation: self.cfg.render.validation,
                    };
                    slot.insert(DeviceSelector::new(&window, options)?)
                }
            };

            let inner = vista_platform::render_size(window.inner_size());
            let renderer = selector.make_renderer(&window, renderer_config(&self.cfg.render, inner))?;
            info!(
                "window {} on {}: {}x{}",
                i + 1,
                renderer.device().name(),
                renderer.extent().width,
                renderer.extent().height
            );
            window.request_redraw();
            self.views.push(View {
                renderer,
                window,
                paused: inner.is_empty(),
            });
        }
        if let Some(selector) = &self.selector {
            info!(
                "{} window(s) on {} device(s)",
                self.views.len(),
                selector.devices().len()
            );
        }
        Ok(())
    }

    /// A failed renderer refuses further work, so its window goes with it.
    fn close_view(&mut self, idx: usize, event_loop: &ActiveEventLoop) {
        self.views.remove(idx);
        if self.views.is_empty() {
            self.exiting = true;
            self.selector = None;
            event_loop.exit();
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.views.is_empty() {
            if let Err(e) = self.open_windows(event_loop) {
                error!("startup failed: {e:#}");
                self.exiting = true;
                event_loop.exit();
                return;
            }
        }
        event_loop.set_control_flow(ControlFlow::Wait);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        let Some(idx) = self.views.iter().position(|v| v.window.id() == window_id) else {
            return;
        };

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.close_view(idx, event_loop);
            }

            WindowEvent::Resized(new_size) => {
                let view = &mut self.views[idx];
                let size = vista_platform::render_size(new_size);
                view.paused = size.is_empty();
                info!(
                    "Resized → {}x{} (paused={})",
                    size.width, size.height, view.paused
                );
                // Always forwarded: a zero size pauses the renderer itself.
                if let Err(e) = Renderer::resize(&mut view.renderer, size) {
                    error!("resize error, closing window: {e:#}");
                    self.close_view(idx, event_loop);
                    return;
                }
                if !view.paused {
                    view.window.request_redraw();
                }
            }

            WindowEvent::RedrawRequested => {
                let view = &mut self.views[idx];
                if self.exiting || view.paused {
                    return;
                }
                match view.renderer.draw() {
                    Ok(()) => self.frames = self.frames.saturating_add(1),
                    Err(e) => {
                        error!("draw error, closing window: {e:#}");
                        self.close_view(idx, event_loop);
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        for view in self.views.iter().filter(|v| !v.paused) {
            view.window.request_redraw();
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
    let cfg = load_cfg(&args);
    info!("render cfg = {:?}", cfg.render);

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App {
        cfg,
        selector: None,
        views: Vec::new(),
        exiting: false,
        frames: 0,
        last_fps_instant: Instant::now(),
    };

    event_loop.run_app(&mut app)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: AppCfg = vista_core::parse_config("").unwrap();
        assert_eq!(cfg.render.width, 230);
        assert_eq!(cfg.render.windows, 1);
        assert!(cfg.render.textured);
    }

    #[test]
    fn render_table_is_parsed() {
        let text = r#"
            [render]
            width = 800
            height = 600
            present_mode = "fifo"
            windows = 2
            textured = false
        "#;
        let cfg: AppCfg = vista_core::parse_config(text).unwrap();
        assert_eq!((cfg.render.width, cfg.render.height), (800, 600));
        assert!(matches!(cfg.render.present_mode, PresentModeCfg::Fifo));
        assert_eq!(cfg.render.windows, 2);
        assert!(!cfg.render.textured);
        // Unset keys keep their defaults.
        assert_eq!(cfg.render.clear_color, RenderCfg::default().clear_color);
    }

    #[test]
    fn cli_overrides_config() {
        let args = Args::parse_from([
            "vista",
            "--config",
            "/nonexistent/vista.toml",
            "--windows",
            "3",
            "--no-texture",
        ]);
        let cfg = load_cfg(&args);
        assert_eq!(cfg.render.windows, 3);
        assert!(!cfg.render.textured);
    }

    #[test]
    fn renderer_config_maps_present_mode() {
        let render = RenderCfg {
            present_mode: PresentModeCfg::Fifo,
            textured: false,
            ..RenderCfg::default()
        };
        let rc = renderer_config(&render, RenderSize::new(10, 20));
        assert_eq!(rc.present_mode, VkPresentMode::Fifo);
        assert!(rc.texture.is_none());
        assert_eq!(rc.target_extent, RenderSize::new(10, 20));
    }
}
