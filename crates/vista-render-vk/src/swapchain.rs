// SPDX-License-Identifier: CEPL-1.0
//! Presentable image chain plus its per-image views and framebuffers.
//!
//! STRICT ORDER (build):
//! 1) create(): swapchain against the surface's current capabilities
//! 2) create_images(): one color view per presentable image
//! 3) create_framebuffers(): one single-attachment framebuffer per view
//!
//! Rebuilds are wholesale. The caller waits for the device to go idle, calls
//! destroy(), then runs the three steps again.
use anyhow::{Context, Result};
use ash::vk;
use tracing::{debug, info, warn};

use crate::device::GraphicsDevice;
use crate::error::{RenderError, VkResultExt};
use crate::transfer::color_subresource_range;

pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Minimum + 1, capped by the maximum when the surface reports one.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        wanted
    } else {
        wanted.min(caps.max_image_count)
    }
}

/// Requested size clamped into the surface's supported range.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, want: vk::Extent2D) -> vk::Extent2D {
    let min = caps.min_image_extent;
    // Drivers report `max < min` for some minimised surfaces; never let clamp panic.
    let max_w = caps.max_image_extent.width.max(min.width);
    let max_h = caps.max_image_extent.height.max(min.height);
    vk::Extent2D {
        width: want.width.clamp(min.width, max_w),
        height: want.height.clamp(min.height, max_h),
    }
}

/// `preferred` when reported, FIFO otherwise (always supported).
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        if preferred != vk::PresentModeKHR::FIFO {
            warn!(
                "present mode {} unavailable, falling back to FIFO",
                present_mode_name(preferred)
            );
        }
        vk::PresentModeKHR::FIFO
    }
}

/// 8-bit sRGB BGRA when reported, otherwise whatever the driver lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let exact = formats.iter().copied().find(|f| {
        f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space
    });
    if exact.is_some() {
        return exact;
    }
    // UNDEFINED means "no preference".
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Some(PREFERRED_FORMAT);
        }
    }
    let first = formats.first().copied();
    if let Some(f) = first {
        warn!(
            "{:?}/{:?} not offered, using {:?}/{:?}",
            PREFERRED_FORMAT.format, PREFERRED_FORMAT.color_space, f.format, f.color_space
        );
    }
    first
}

// Info only
fn present_mode_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

/// Query the surface format once per renderer; the render pass is built on it.
pub fn query_surface_format(
    device: &GraphicsDevice,
    surface: vk::SurfaceKHR,
) -> Result<vk::SurfaceFormatKHR> {
    let loader = device.context().surface_loader();
    let formats = unsafe { loader.get_physical_device_surface_formats(device.physical(), surface) }
        .vk_call("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
    debug!("surface formats: {formats:?}");
    choose_surface_format(&formats).context("surface reports no formats")
}

/// The extent a swapchain built now would get. Zero in either dimension
/// means the surface is currently unpresentable (minimised).
pub fn current_extent_for(
    device: &GraphicsDevice,
    surface: vk::SurfaceKHR,
    want: vk::Extent2D,
) -> Result<vk::Extent2D> {
    if want.width == 0 || want.height == 0 {
        return Ok(vk::Extent2D::default());
    }
    let caps = unsafe {
        device
            .context()
            .surface_loader()
            .get_physical_device_surface_capabilities(device.physical(), surface)
    }
    .vk_call("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
    Ok(choose_extent(&caps, want))
}

#[derive(Default)]
pub struct SwapchainManager {
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
}

impl SwapchainManager {
    /// Build the image chain for `want`. `format` is the renderer-lifetime
    /// choice from [`query_surface_format`].
    pub fn create(
        device: &GraphicsDevice,
        surface: vk::SurfaceKHR,
        format: vk::SurfaceFormatKHR,
        preferred_mode: vk::PresentModeKHR,
        want: vk::Extent2D,
    ) -> Result<Self> {
        let loader = device.context().surface_loader();
        let phys = device.physical();
        let (caps, modes) = unsafe {
            (
                loader
                    .get_physical_device_surface_capabilities(phys, surface)
                    .vk_call("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?,
                loader
                    .get_physical_device_surface_present_modes(phys, surface)
                    .vk_call("vkGetPhysicalDeviceSurfacePresentModesKHR")?,
            )
        };
        debug!(
            "surface caps: images {}..{}, extent {}x{}..{}x{}, current {}x{}; modes {:?}",
            caps.min_image_count,
            caps.max_image_count,
            caps.min_image_extent.width,
            caps.min_image_extent.height,
            caps.max_image_extent.width,
            caps.max_image_extent.height,
            caps.current_extent.width,
            caps.current_extent.height,
            modes,
        );

        let present_mode = choose_present_mode(&modes, preferred_mode);
        let extent = choose_extent(&caps, want);
        let min_image_count = choose_image_count(&caps);

        // Prefer IDENTITY if supported, otherwise current to avoid extra blits.
        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };
        let composite_alpha = [
            vk::CompositeAlphaFlagsKHR::OPAQUE,
            vk::CompositeAlphaFlagsKHR::INHERIT,
            vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
            vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        ]
        .into_iter()
        .find(|&a| caps.supported_composite_alpha.contains(a))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE);

        let families = device.families();
        let family_indices = [families.graphics, families.present];
        let (image_sharing_mode, queue_family_index_count, p_queue_family_indices) =
            if families.shared() {
                (vk::SharingMode::EXCLUSIVE, 0, std::ptr::null())
            } else {
                (vk::SharingMode::CONCURRENT, 2, family_indices.as_ptr())
            };

        let info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface,
            min_image_count,
            image_format: format.format,
            image_color_space: format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode,
            queue_family_index_count,
            p_queue_family_indices,
            pre_transform,
            composite_alpha,
            present_mode,
            clipped: vk::TRUE,
            ..Default::default()
        };
        // SAFETY: family_indices outlives the call; the old chain (if any) was
        // destroyed by the caller after a device-idle wait.
        let swapchain = unsafe { device.swapchain_loader().create_swapchain(&info, None) }
            .vk_call("vkCreateSwapchainKHR")?;
        let images = match unsafe { device.swapchain_loader().get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(result) => {
                unsafe { device.swapchain_loader().destroy_swapchain(swapchain, None) };
                return Err(RenderError::Vulkan {
                    call: "vkGetSwapchainImagesKHR",
                    result,
                }
                .into());
            }
        };

        info!(
            "swapchain: {:?} / {:?}, {}, {}x{}, {} images (min {})",
            format.format,
            format.color_space,
            present_mode_name(present_mode),
            extent.width,
            extent.height,
            images.len(),
            caps.min_image_count,
        );

        Ok(Self {
            swapchain,
            format,
            present_mode,
            extent,
            images,
            views: Vec::new(),
            framebuffers: Vec::new(),
        })
    }

    /// One 2D color view per presentable image, identity swizzle.
    pub fn create_images(&mut self, device: &GraphicsDevice) -> Result<()> {
        let d = device.logical();
        self.views.reserve(self.images.len());
        for &image in &self.images {
            let info = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: self.format.format,
                components: vk::ComponentMapping::default(),
                subresource_range: color_subresource_range(),
                ..Default::default()
            };
            let view = unsafe { d.create_image_view(&info, None) }.vk_call("vkCreateImageView")?;
            self.views.push(view);
        }
        Ok(())
    }

    pub fn create_framebuffers(
        &mut self,
        device: &GraphicsDevice,
        render_pass: vk::RenderPass,
    ) -> Result<()> {
        let d = device.logical();
        self.framebuffers.reserve(self.views.len());
        for view in &self.views {
            let info = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass,
                attachment_count: 1,
                p_attachments: view,
                width: self.extent.width,
                height: self.extent.height,
                layers: 1,
                ..Default::default()
            };
            let fb = unsafe { d.create_framebuffer(&info, None) }.vk_call("vkCreateFramebuffer")?;
            self.framebuffers.push(fb);
        }
        Ok(())
    }

    /// Device must be idle. Safe to call on a partially built chain.
    pub fn destroy(&mut self, device: &GraphicsDevice) {
        let d = device.logical();
        unsafe {
            for fb in self.framebuffers.drain(..) {
                d.destroy_framebuffer(fb, None);
            }
            for view in self.views.drain(..) {
                d.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                device.swapchain_loader().destroy_swapchain(self.swapchain, None);
            }
        }
        self.swapchain = vk::SwapchainKHR::null();
        self.images.clear();
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            ..Default::default()
        }
    }

    #[test]
    fn image_count_is_min_plus_one() {
        assert_eq!(choose_image_count(&caps(2, 8)), 3);
        // max == 0 means unbounded.
        assert_eq!(choose_image_count(&caps(3, 0)), 4);
    }

    #[test]
    fn image_count_respects_max() {
        assert_eq!(choose_image_count(&caps(2, 2)), 2);
    }

    #[test]
    fn extent_passes_through_when_in_range() {
        let e = choose_extent(
            &caps(2, 0),
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        );
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn extent_is_clamped() {
        let c = caps(2, 0);
        let big = choose_extent(
            &c,
            vk::Extent2D {
                width: 10_000,
                height: 10_000,
            },
        );
        assert_eq!((big.width, big.height), (4096, 2048));
        let small = choose_extent(
            &c,
            vk::Extent2D {
                width: 0,
                height: 0,
            },
        );
        assert_eq!((small.width, small.height), (1, 1));
    }

    #[test]
    fn extent_tolerates_inverted_range() {
        let mut c = caps(2, 0);
        c.max_image_extent = vk::Extent2D {
            width: 0,
            height: 0,
        };
        let e = choose_extent(
            &c,
            vk::Extent2D {
                width: 50,
                height: 50,
            },
        );
        assert_eq!((e.width, e.height), (1, 1));
    }

    #[test]
    fn present_mode_preference_and_fallback() {
        let all = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&all, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&fifo_only, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&all, vk::PresentModeKHR::FIFO),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn surface_format_prefers_srgb_bgra() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let picked = choose_surface_format(&[unorm, PREFERRED_FORMAT]).unwrap();
        assert_eq!(picked.format, vk::Format::B8G8R8A8_SRGB);

        let picked = choose_surface_format(&[unorm]).unwrap();
        assert_eq!(picked.format, vk::Format::B8G8R8A8_UNORM);

        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn undefined_format_means_free_choice() {
        let any = vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let picked = choose_surface_format(&[any]).unwrap();
        assert_eq!(picked.format, PREFERRED_FORMAT.format);
    }
}
