// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A zero dimension means there is nothing to present into (minimised window).
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

impl Default for RenderSize {
    fn default() -> Self {
        Self::new(230, 230)
    }
}

/// What the window shell needs from a presentation backend.
pub trait Renderer {
    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn draw(&mut self) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sizes() {
        assert!(RenderSize::new(0, 10).is_empty());
        assert!(RenderSize::new(10, 0).is_empty());
        assert!(!RenderSize::new(1, 1).is_empty());
    }

    #[test]
    fn aspect_of_zero_height_is_one() {
        assert_eq!(RenderSize::new(800, 0).aspect(), 1.0);
        assert_eq!(RenderSize::new(800, 400).aspect(), 2.0);
    }
}
