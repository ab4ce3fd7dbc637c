// SPDX-License-Identifier: CEPL-1.0
//! Root object: owns the instance, picks (or reuses) a device per surface,
//! and builds renderers.
//!
//! STRICT ORDER (make_renderer):
//! 1) Bind a presentation surface FROM OUR instance
//! 2) Reuse a known device whose present family supports it, else
//! 3) Enumerate physical devices, filter, score, create a logical device
//! 4) Build the renderer on that device
use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use tracing::{debug, info};

use crate::device::{
    device_type_name, device_type_score, pick_queue_families, supports_swapchain, GraphicsDevice,
    QueueFamilies,
};
use crate::error::{RenderError, VkResultExt};
use crate::instance::{InstanceContext, PresentSurface, SelectorOptions, SurfaceSource};
use crate::renderer::{RendererConfig, VkRenderer};

pub struct DeviceSelector {
    context: Arc<InstanceContext>,
    devices: Vec<Arc<GraphicsDevice>>,
}

impl DeviceSelector {
    /// Root on a window-system display. Every window later passed to
    /// [`Self::make_renderer`] must belong to this display.
    pub fn new(display: &dyn HasDisplayHandle, options: SelectorOptions) -> Result<Self> {
        let display = display
            .display_handle()
            .map_err(|e| RenderError::WindowHandle(e.to_string()))?
            .as_raw();
        let context = InstanceContext::new(SurfaceSource::Display(display), &options)
            .context("creating instance")?;
        Ok(Self {
            context,
            devices: Vec::new(),
        })
    }

    /// Root on off-screen presentable surfaces (`VK_EXT_headless_surface`).
    pub fn headless(options: SelectorOptions) -> Result<Self> {
        let context = InstanceContext::new(SurfaceSource::Headless, &options)
            .context("creating headless instance")?;
        Ok(Self {
            context,
            devices: Vec::new(),
        })
    }

    pub fn make_renderer(
        &mut self,
        window: &dyn HasWindowHandle,
        config: RendererConfig,
    ) -> Result<VkRenderer> {
        let window = window
            .window_handle()
            .map_err(|e| RenderError::WindowHandle(e.to_string()))?
            .as_raw();
        let surface = PresentSurface::from_window(&self.context, window)?;
        self.finish(surface, config)
    }

    pub fn make_headless_renderer(&mut self, config: RendererConfig) -> Result<VkRenderer> {
        let surface = PresentSurface::headless(&self.context)?;
        self.finish(surface, config)
    }

    fn finish(&mut self, surface: PresentSurface, config: RendererConfig) -> Result<VkRenderer> {
        let device = self.device_for(surface.handle())?;
        VkRenderer::new(device, surface, config)
    }

    /// Devices created so far, in creation order.
    pub fn devices(&self) -> &[Arc<GraphicsDevice>] {
        &self.devices
    }

    pub fn context(&self) -> &Arc<InstanceContext> {
        &self.context
    }

    fn device_for(&mut self, surface: vk::SurfaceKHR) -> Result<Arc<GraphicsDevice>> {
        if let Some(existing) = self.devices.iter().find(|d| d.can_present_to(surface)) {
            debug!("reusing device {} for new surface", existing.name());
            return Ok(Arc::clone(existing));
        }

        let (physical, families) = self.select_physical(surface)?;
        let device = Arc::new(GraphicsDevice::create(&self.context, physical, families)?);
        self.devices.push(Arc::clone(&device));
        Ok(device)
    }

    fn select_physical(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let instance = self.context.instance();
        let surface_loader = self.context.surface_loader();
        let physicals = unsafe { instance.enumerate_physical_devices() }
            .vk_call("vkEnumeratePhysicalDevices")?;

        let mut best: Option<(u32, vk::PhysicalDevice, QueueFamilies)> = None;
        for physical in physicals {
            // SAFETY: physical comes from this instance, surface from this instance.
            let props = unsafe { instance.get_physical_device_properties(physical) };
            let name = props
                .device_name_as_c_str()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let queue_props =
                unsafe { instance.get_physical_device_queue_family_properties(physical) };
            let families = pick_queue_families(&queue_props, |i| unsafe {
                surface_loader.get_physical_device_surface_support(physical, i, surface)
            })
            .vk_call("vkGetPhysicalDeviceSurfaceSupportKHR")?;
            let Some(families) = families else {
                debug!("skipping {name}: no graphics + present queue families");
                continue;
            };
            if !supports_swapchain(instance, physical)? {
                debug!("skipping {name}: no VK_KHR_swapchain");
                continue;
            }
            let (formats, modes) = unsafe {
                (
                    surface_loader
                        .get_physical_device_surface_formats(physical, surface)
                        .unwrap_or_default(),
                    surface_loader
                        .get_physical_device_surface_present_modes(physical, surface)
                        .unwrap_or_default(),
                )
            };
            if formats.is_empty() || modes.is_empty() {
                debug!("skipping {name}: surface offers no formats or present modes");
                continue;
            }

            let score = device_type_score(props.device_type);
            debug!(
                "candidate {name} ({}), score {score}",
                device_type_name(props.device_type)
            );
            // Ties keep enumeration order.
            if best.map_or(true, |(s, _, _)| score > s) {
                best = Some((score, physical, families));
            }
        }

        let (_, physical, families) = best.ok_or(RenderError::NoSuitableDevice)?;
        info!(
            "selected physical device (graphics family {}, present family {})",
            families.graphics, families.present
        );
        Ok((physical, families))
    }
}
