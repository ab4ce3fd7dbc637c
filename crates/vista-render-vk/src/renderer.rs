// SPDX-License-Identifier: CEPL-1.0
//! One presentation target: its swapchain, per-image resources, recorded
//! command buffers, and the draw loop.
use anyhow::{Context, Result};
use ash::vk;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use vista_render::{RenderSize, Renderer};

use crate::device::GraphicsDevice;
use crate::error::VkResultExt;
use crate::frame::{
    self, AcquireOutcome, FrameOps, FrameScheduler, FrameState, PresentOutcome, SyncTriplet,
};
use crate::geometry::INDEX_TYPE;
use crate::instance::PresentSurface;
use crate::pipeline::PipelineManager;
use crate::resources::ResourceManager;
use crate::shader::ShaderSet;
use crate::swapchain::{self, SwapchainManager};
use crate::texture::PixelBuffer;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VkPresentMode {
    /// Lowest latency without tearing; falls back to FIFO when unsupported.
    #[default]
    Mailbox,
    Fifo,
}

impl VkPresentMode {
    fn vk(self) -> vk::PresentModeKHR {
        match self {
            VkPresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
            VkPresentMode::Fifo => vk::PresentModeKHR::FIFO,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub target_extent: RenderSize,
    pub clear_color: [f32; 4],
    pub present_mode: VkPresentMode,
    /// Sampled by the fragment shader when present; vertex colour only otherwise.
    pub texture: Option<PixelBuffer>,
    /// Directory holding `vert.spv` / `frag.spv`. Defaults to the modules
    /// compiled by the build script.
    pub shader_dir: Option<PathBuf>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            target_extent: RenderSize::default(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            present_mode: VkPresentMode::default(),
            texture: None,
            shader_dir: None,
        }
    }
}

// STRICT TEARDOWN ORDER (Drop):
// 1) device idle
// 2) sync objects, per-image resources, geometry/texture
// 3) framebuffers, views, swapchain
// 4) command pool (frees its buffers), pipeline objects
// 5) fields in declaration order: surface (through the instance), then our
//    device Arc
pub struct VkRenderer {
    surface: PresentSurface,
    device: Arc<GraphicsDevice>,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    target: vk::Extent2D,
    clear: vk::ClearValue,
    pipeline: PipelineManager,
    command_pool: vk::CommandPool,
    swapchain: SwapchainManager,
    resources: Option<ResourceManager>,
    command_buffers: Vec<vk::CommandBuffer>,
    sync: Option<SyncTriplet>,
    scheduler: FrameScheduler,
    /// Surface has a zero extent; draw() is a no-op until the next resize.
    paused: bool,
}

impl VkRenderer {
    /// STRICT ORDER: pipeline -> command pool -> swapchain -> resources ->
    /// command buffers -> sync. A failure part-way is unwound by Drop.
    pub(crate) fn new(
        device: Arc<GraphicsDevice>,
        surface: PresentSurface,
        config: RendererConfig,
    ) -> Result<Self> {
        let surface_format = swapchain::query_surface_format(&device, surface.handle())?;
        let textured = config.texture.is_some();
        let shaders = match &config.shader_dir {
            Some(dir) => ShaderSet::in_dir(dir),
            None => ShaderSet::builtin(textured),
        };
        let pipeline = PipelineManager::build(&device, surface_format.format, &shaders, textured)
            .context("building pipeline")?;

        let mut r = Self {
            device,
            surface,
            surface_format,
            present_mode: config.present_mode.vk(),
            target: extent_of(config.target_extent),
            clear: clear_value(config.clear_color),
            pipeline,
            command_pool: vk::CommandPool::null(),
            swapchain: SwapchainManager::default(),
            resources: None,
            command_buffers: Vec::new(),
            sync: None,
            scheduler: FrameScheduler::new(),
            paused: false,
        };

        r.command_pool = r.device.create_graphics_command_pool()?;
        r.build_swapchain()?;
        r.resources = Some(ResourceManager::create(
            &r.device,
            r.command_pool,
            config.texture.as_ref(),
        )?);
        r.build_per_image()?;
        r.sync = Some(SyncTriplet::create(&r.device)?);

        info!(
            "renderer ready on {}: {}x{}, {} images",
            r.device.name(),
            r.swapchain.extent().width,
            r.swapchain.extent().height,
            r.swapchain.image_count()
        );
        Ok(r)
    }

    /// Create the chain for the current target, or pause on a zero extent.
    fn build_swapchain(&mut self) -> Result<()> {
        let extent =
            swapchain::current_extent_for(&self.device, self.surface.handle(), self.target)?;
        if extent.width == 0 || extent.height == 0 {
            if !self.paused {
                info!("surface extent is 0x0, pausing");
            }
            self.paused = true;
            return Ok(());
        }
        self.paused = false;
        self.swapchain = SwapchainManager::create(
            &self.device,
            self.surface.handle(),
            self.surface_format,
            self.present_mode,
            extent,
        )?;
        self.swapchain.create_images(&self.device)?;
        self.swapchain
            .create_framebuffers(&self.device, self.pipeline.render_pass)?;
        Ok(())
    }

    /// Uniforms, descriptors and command buffers for the current image count.
    fn build_per_image(&mut self) -> Result<()> {
        if self.paused {
            return Ok(());
        }
        let image_count = self.swapchain.image_count();
        if let Some(resources) = self.resources.as_mut() {
            resources.reset_per_image(&self.device, image_count, self.pipeline.set_layout)?;
        }

        let alloc = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: image_count as u32,
            ..Default::default()
        };
        self.command_buffers = unsafe { self.device.logical().allocate_command_buffers(&alloc) }
            .vk_call("vkAllocateCommandBuffers")?;
        self.record_command_buffers()
    }

    /// Device must be idle.
    fn teardown_per_image(&mut self) {
        if !self.command_buffers.is_empty() {
            unsafe {
                self.device
                    .logical()
                    .free_command_buffers(self.command_pool, &self.command_buffers)
            };
            self.command_buffers.clear();
        }
        if let Some(resources) = self.resources.as_mut() {
            resources.destroy_per_image(&self.device);
        }
        self.swapchain.destroy(&self.device);
    }

    // STRICT ORDER (recreate):
    // 1) device_wait_idle() so nothing references the old chain
    // 2) free command buffers, per-image uniforms/descriptors, framebuffers,
    //    views, swapchain
    // 3) build swapchain -> per-image resources -> command buffers -> record
    // Pipeline, render pass, geometry and texture are untouched.
    fn recreate(&mut self) -> Result<()> {
        self.device.wait_idle()?;
        self.teardown_per_image();
        self.build_swapchain()?;
        self.build_per_image()?;
        debug!(
            "swapchain recreated: {}x{}, {} images",
            self.swapchain.extent().width,
            self.swapchain.extent().height,
            self.swapchain.image_count()
        );
        Ok(())
    }

    /// Re-record every per-image command buffer. Buffers must not be pending.
    pub fn record_command_buffers(&mut self) -> Result<()> {
        let Some(resources) = self.resources.as_ref() else {
            return Ok(());
        };
        let d = self.device.logical();
        let extent = self.swapchain.extent();
        let sets = resources.descriptor_sets();
        for (i, (&cmd, &framebuffer)) in self
            .command_buffers
            .iter()
            .zip(self.swapchain.framebuffers())
            .enumerate()
        {
            unsafe {
                d.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                    .vk_call("vkResetCommandBuffer")?;
                let begin = vk::CommandBufferBeginInfo {
                    s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                    ..Default::default()
                };
                d.begin_command_buffer(cmd, &begin)
                    .vk_call("vkBeginCommandBuffer")?;

                let rp_begin = vk::RenderPassBeginInfo {
                    s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
                    render_pass: self.pipeline.render_pass,
                    framebuffer,
                    render_area: vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent,
                    },
                    clear_value_count: 1,
                    p_clear_values: &self.clear,
                    ..Default::default()
                };
                d.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
                d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);

                // Dynamic viewport/scissor: positive height, origin top-left.
                let viewport = vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                let scissor = vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                };
                d.cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
                d.cmd_set_scissor(cmd, 0, std::slice::from_ref(&scissor));

                d.cmd_bind_vertex_buffers(cmd, 0, &[resources.vertex_buffer()], &[0]);
                d.cmd_bind_index_buffer(cmd, resources.index_buffer(), 0, INDEX_TYPE);
                if let Some(&set) = sets.get(i) {
                    d.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.pipeline.layout,
                        0,
                        std::slice::from_ref(&set),
                        &[],
                    );
                }
                d.cmd_draw_indexed(cmd, resources.index_count(), 1, 0, 0, 0);

                d.cmd_end_render_pass(cmd);
                d.end_command_buffer(cmd).vk_call("vkEndCommandBuffer")?;
            }
        }
        Ok(())
    }

    /// Acquire, update uniforms, submit, present. Out-of-date chains are
    /// rebuilt and the acquire retried once; a second out-of-date skips the
    /// frame. After any error the renderer is poisoned and every later call
    /// fails with [`RenderError::Poisoned`](crate::RenderError::Poisoned).
    pub fn draw(&mut self) -> Result<()> {
        self.scheduler.ensure_usable()?;
        if self.paused {
            return Ok(());
        }
        let mut scheduler = std::mem::take(&mut self.scheduler);
        let res = scheduler.run(self);
        self.scheduler = scheduler;
        res.map(|_| ())
    }

    /// Record the new target and rebuild the whole chain. A zero dimension
    /// pauses drawing instead.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.scheduler.ensure_usable()?;
        self.target = vk::Extent2D { width, height };
        let res = self.recreate();
        if res.is_err() {
            self.scheduler.poison();
        }
        res
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) -> Result<()> {
        self.scheduler.ensure_usable()?;
        self.clear = clear_value(rgba);
        let res = self
            .device
            .wait_idle()
            .and_then(|()| self.record_command_buffers());
        if res.is_err() {
            self.scheduler.poison();
        }
        res
    }

    fn sync(&self) -> Result<&SyncTriplet> {
        self.sync.as_ref().context("renderer has no sync objects")
    }

    pub fn device(&self) -> &Arc<GraphicsDevice> {
        &self.device
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.swapchain.present_mode()
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    pub fn view_count(&self) -> usize {
        self.swapchain.view_count()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.swapchain.framebuffers().len()
    }

    pub fn command_buffer_count(&self) -> usize {
        self.command_buffers.len()
    }

    pub fn descriptor_set_count(&self) -> usize {
        self.resources
            .as_ref()
            .map_or(0, |r| r.descriptor_sets().len())
    }

    pub fn frame_state(&self) -> FrameState {
        self.scheduler.state()
    }

    pub fn is_poisoned(&self) -> bool {
        self.scheduler.is_poisoned()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn in_flight_signaled(&self) -> Result<bool> {
        self.sync()?.in_flight_signaled(&self.device)
    }
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        // After the idle wait nothing this renderer recorded is pending.
        self.device.wait_idle().ok();
        if let Some(mut sync) = self.sync.take() {
            sync.destroy(&self.device);
        }
        self.teardown_per_image();
        if let Some(mut resources) = self.resources.take() {
            resources.destroy(&self.device);
        }
        if self.command_pool != vk::CommandPool::null() {
            self.device.destroy_command_pool(self.command_pool);
            self.command_pool = vk::CommandPool::null();
        }
        self.pipeline.destroy(&self.device);
        debug!("renderer destroyed");
    }
}

impl FrameOps for VkRenderer {
    fn wait_previous(&mut self) -> Result<()> {
        self.sync()?.wait_in_flight(&self.device)
    }

    fn acquire_image(&mut self) -> Result<AcquireOutcome> {
        frame::acquire(&self.device, self.swapchain.handle(), self.sync()?)
    }

    fn rebuild_chain(&mut self) -> Result<bool> {
        self.recreate()?;
        Ok(!self.paused)
    }

    fn write_uniforms(&mut self, index: u32) -> Result<()> {
        let resources = self
            .resources
            .as_ref()
            .context("renderer has no resources")?;
        resources.update_uniform_buffers(&self.device, index as usize, self.swapchain.extent())
    }

    fn reset_fence(&mut self) -> Result<()> {
        self.sync()?.reset_in_flight(&self.device)
    }

    fn submit_image(&mut self, index: u32) -> Result<()> {
        let cmd = *self
            .command_buffers
            .get(index as usize)
            .with_context(|| format!("no command buffer for image {index}"))?;
        frame::submit(&self.device, cmd, self.sync()?)
    }

    fn present_image(&mut self, index: u32) -> Result<PresentOutcome> {
        frame::present(&self.device, self.swapchain.handle(), index, self.sync()?)
    }
}

impl Renderer for VkRenderer {
    fn resize(&mut self, size: RenderSize) -> Result<()> {
        VkRenderer::resize(self, size.width, size.height)
    }

    fn draw(&mut self) -> Result<()> {
        VkRenderer::draw(self)
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) -> Result<()> {
        VkRenderer::set_clear_color(self, rgba)
    }
}

fn extent_of(size: RenderSize) -> vk::Extent2D {
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

fn clear_value(rgba: [f32; 4]) -> vk::ClearValue {
    vk::ClearValue {
        color: vk::ClearColorValue { float32: rgba },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = RendererConfig::default();
        assert_eq!(cfg.target_extent, RenderSize::new(230, 230));
        assert_eq!(cfg.present_mode, VkPresentMode::Mailbox);
        assert!(cfg.texture.is_none());
        assert_eq!(cfg.clear_color[3], 1.0);
    }

    #[test]
    fn present_mode_mapping() {
        assert_eq!(VkPresentMode::Mailbox.vk(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(VkPresentMode::Fifo.vk(), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn clear_value_carries_rgba() {
        let v = clear_value([0.1, 0.2, 0.3, 0.4]);
        // SAFETY: written through the color member just above.
        let c = unsafe { v.color.float32 };
        assert_eq!(c, [0.1, 0.2, 0.3, 0.4]);
    }
}
