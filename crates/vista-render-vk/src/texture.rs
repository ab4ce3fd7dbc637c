// SPDX-License-Identifier: CEPL-1.0
//! Decoded pixel buffers and the sampled texture built from one.
use anyhow::Result;
use ash::vk;
use tracing::debug;

use crate::device::GraphicsDevice;
use crate::error::{RenderError, VkResultExt};
use crate::memory::allocate_memory;
use crate::transfer::{color_subresource_range, StagingTransfer};

const MAX_ANISOTROPY: f32 = 16.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
    Bgra8,
}

impl PixelFormat {
    pub fn vk_format(self) -> vk::Format {
        match self {
            PixelFormat::Rgba8 => vk::Format::R8G8B8A8_SRGB,
            PixelFormat::Bgra8 => vk::Format::B8G8R8A8_SRGB,
        }
    }
}

/// Tightly packed 4-byte pixels, rows top to bottom.
#[derive(Clone, Debug)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, RenderError> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || data.len() != expected {
            return Err(RenderError::InvalidPixelBuffer {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// Two-colour checkerboard with `cell`-pixel squares.
    pub fn checkerboard(size: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> Result<Self, RenderError> {
        let cell = cell.max(1);
        let data = (0..size)
            .flat_map(|y| (0..size).map(move |x| ((x / cell) + (y / cell)) % 2 == 0))
            .flat_map(|even| if even { a } else { b })
            .collect();
        Self::new(size, size, PixelFormat::Rgba8, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Device-local sampled image. Destroyed explicitly by its owner.
pub struct TextureResource {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

impl TextureResource {
    /// Upload `pixels` and leave the image in SHADER_READ_ONLY_OPTIMAL.
    pub fn create(
        device: &GraphicsDevice,
        transfer: &StagingTransfer<'_>,
        pixels: &PixelBuffer,
    ) -> Result<Self> {
        let mut tex = Self {
            image: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
        };
        if let Err(e) = tex.build(device, transfer, pixels) {
            tex.destroy(device);
            return Err(e);
        }
        debug!(
            "texture uploaded: {}x{} {:?}",
            pixels.width, pixels.height, pixels.format
        );
        Ok(tex)
    }

    fn build(
        &mut self,
        device: &GraphicsDevice,
        transfer: &StagingTransfer<'_>,
        pixels: &PixelBuffer,
    ) -> Result<()> {
        let d = device.logical();
        let format = pixels.format.vk_format();
        let extent = vk::Extent3D {
            width: pixels.width,
            height: pixels.height,
            depth: 1,
        };

        let ici = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent,
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        self.image = unsafe { d.create_image(&ici, None) }.vk_call("vkCreateImage")?;
        let req = unsafe { d.get_image_memory_requirements(self.image) };
        self.memory = allocate_memory(device, req, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        unsafe { d.bind_image_memory(self.image, self.memory, 0) }
            .vk_call("vkBindImageMemory")?;

        // UNDEFINED -> TRANSFER_DST -> copy -> SHADER_READ_ONLY
        let mut staging = transfer.stage(pixels.data())?;
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: extent,
        };
        let copied = transfer.copy_buffer_to_image(staging.buffer, self.image, region);
        staging.destroy(device);
        copied?;

        let vci = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image: self.image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: color_subresource_range(),
            ..Default::default()
        };
        self.view = unsafe { d.create_image_view(&vci, None) }.vk_call("vkCreateImageView")?;

        let sci = sampler_info(device.max_anisotropy());
        self.sampler = unsafe { d.create_sampler(&sci, None) }.vk_call("vkCreateSampler")?;
        Ok(())
    }

    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// Device must be idle. Null handles are skipped.
    pub fn destroy(&mut self, device: &GraphicsDevice) {
        let d = device.logical();
        unsafe {
            if self.sampler != vk::Sampler::null() {
                d.destroy_sampler(self.sampler, None);
            }
            if self.view != vk::ImageView::null() {
                d.destroy_image_view(self.view, None);
            }
            if self.image != vk::Image::null() {
                d.destroy_image(self.image, None);
            }
            if self.memory != vk::DeviceMemory::null() {
                d.free_memory(self.memory, None);
            }
        }
        self.sampler = vk::Sampler::null();
        self.view = vk::ImageView::null();
        self.image = vk::Image::null();
        self.memory = vk::DeviceMemory::null();
    }
}

/// Linear filtering, repeat addressing. Anisotropy 16x clamped to the device
/// limit, or off when the feature is not enabled.
pub fn sampler_info(device_max_anisotropy: Option<f32>) -> vk::SamplerCreateInfo<'static> {
    let (anisotropy_enable, max_anisotropy) = match device_max_anisotropy {
        Some(limit) => (vk::TRUE, MAX_ANISOTROPY.min(limit)),
        None => (vk::FALSE, 1.0),
    };
    vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::LINEAR,
        min_filter: vk::Filter::LINEAR,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        address_mode_u: vk::SamplerAddressMode::REPEAT,
        address_mode_v: vk::SamplerAddressMode::REPEAT,
        address_mode_w: vk::SamplerAddressMode::REPEAT,
        anisotropy_enable,
        max_anisotropy,
        border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        unnormalized_coordinates: vk::FALSE,
        compare_enable: vk::FALSE,
        compare_op: vk::CompareOp::ALWAYS,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_buffer_checks_length() {
        assert!(PixelBuffer::new(2, 2, PixelFormat::Rgba8, vec![0; 16]).is_ok());
        let err = PixelBuffer::new(2, 2, PixelFormat::Bgra8, vec![0; 15]).unwrap_err();
        assert!(matches!(
            err,
            RenderError::InvalidPixelBuffer {
                expected: 16,
                actual: 15,
                ..
            }
        ));
    }

    #[test]
    fn empty_pixel_buffer_is_rejected() {
        assert!(PixelBuffer::new(0, 4, PixelFormat::Rgba8, Vec::new()).is_err());
    }

    #[test]
    fn checkerboard_alternates() {
        let white = [255; 4];
        let black = [0, 0, 0, 255];
        let px = PixelBuffer::checkerboard(4, 2, white, black).unwrap();
        assert_eq!(px.data().len(), 64);
        let at = |x: usize, y: usize| &px.data()[(y * 4 + x) * 4..][..4];
        assert_eq!(at(0, 0), white);
        assert_eq!(at(1, 1), white);
        assert_eq!(at(2, 0), black);
        assert_eq!(at(0, 2), black);
        assert_eq!(at(2, 2), white);
    }

    #[test]
    fn formats_are_srgb() {
        assert_eq!(PixelFormat::Rgba8.vk_format(), vk::Format::R8G8B8A8_SRGB);
        assert_eq!(PixelFormat::Bgra8.vk_format(), vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn sampler_anisotropy_follows_device() {
        let s = sampler_info(Some(8.0));
        assert_eq!(s.anisotropy_enable, vk::TRUE);
        assert_eq!(s.max_anisotropy, 8.0);
        let s = sampler_info(Some(64.0));
        assert_eq!(s.max_anisotropy, 16.0);
        let s = sampler_info(None);
        assert_eq!(s.anisotropy_enable, vk::FALSE);
        assert_eq!(s.address_mode_u, vk::SamplerAddressMode::REPEAT);
        assert_eq!(s.mag_filter, vk::Filter::LINEAR);
    }
}
