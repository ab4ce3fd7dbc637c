// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use vista_render::RenderSize;
use winit::dpi::PhysicalSize;
use winit::window::WindowAttributes;

pub fn window_attributes(title: &str, size: RenderSize) -> WindowAttributes {
    winit::window::Window::default_attributes()
        .with_title(title)
        .with_inner_size(PhysicalSize::new(size.width, size.height))
}

pub fn render_size(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize::new(size.width, size.height)
}
