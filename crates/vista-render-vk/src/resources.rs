// SPDX-License-Identifier: CEPL-1.0
//! Geometry, texture, and the per-image uniform/descriptor state.
//!
//! Geometry and the texture live for the whole renderer. Uniform buffers, the
//! descriptor pool, and its sets are sized to the swapchain image count and
//! rebuilt with it:
//!   reset_uniform_buffers -> reset_descriptor_pool -> reset_descriptor_sets
use anyhow::{Context, Result};
use ash::vk;
use std::time::Instant;
use tracing::debug;
use vista_math::UniformTransform;
use vista_render::RenderSize;

use crate::device::GraphicsDevice;
use crate::error::VkResultExt;
use crate::geometry::{QUAD_INDICES, QUAD_VERTICES};
use crate::memory::BufferAllocation;
use crate::pipeline::{SAMPLER_BINDING, UNIFORM_BINDING};
use crate::texture::{PixelBuffer, TextureResource};
use crate::transfer::StagingTransfer;

const UNIFORM_SIZE: vk::DeviceSize = std::mem::size_of::<UniformTransform>() as vk::DeviceSize;

/// Exactly `image_count` sets; one descriptor type per binding in use.
pub fn descriptor_pool_sizes(image_count: u32, textured: bool) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes = vec![vk::DescriptorPoolSize {
        ty: vk::DescriptorType::UNIFORM_BUFFER,
        descriptor_count: image_count,
    }];
    if textured {
        sizes.push(vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: image_count,
        });
    }
    sizes
}

pub struct ResourceManager {
    vertices: BufferAllocation,
    indices: BufferAllocation,
    index_count: u32,
    texture: Option<TextureResource>,
    uniforms: Vec<BufferAllocation>,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    started: Instant,
}

/// Device-local buffer filled through a staging copy.
fn upload_buffer(
    device: &GraphicsDevice,
    transfer: &StagingTransfer<'_>,
    bytes: &[u8],
    usage: vk::BufferUsageFlags,
) -> Result<BufferAllocation> {
    let mut buf = BufferAllocation::new(
        device,
        bytes.len() as vk::DeviceSize,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    if let Err(e) = transfer.upload_to_buffer(bytes, buf.buffer) {
        buf.destroy(device);
        return Err(e);
    }
    Ok(buf)
}

impl ResourceManager {
    /// Upload the quad (and `texture`, if any). Per-image state starts empty.
    pub fn create(
        device: &GraphicsDevice,
        command_pool: vk::CommandPool,
        texture: Option<&PixelBuffer>,
    ) -> Result<Self> {
        let transfer = StagingTransfer::new(device, command_pool);

        let mut vertices = upload_buffer(
            device,
            &transfer,
            bytemuck::cast_slice(&QUAD_VERTICES),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )
        .context("vertex buffer")?;
        let mut indices = match upload_buffer(
            device,
            &transfer,
            bytemuck::cast_slice(&QUAD_INDICES),
            vk::BufferUsageFlags::INDEX_BUFFER,
        ) {
            Ok(b) => b,
            Err(e) => {
                vertices.destroy(device);
                return Err(e.context("index buffer"));
            }
        };
        let texture = match texture.map(|px| TextureResource::create(device, &transfer, px)) {
            None => None,
            Some(Ok(t)) => Some(t),
            Some(Err(e)) => {
                vertices.destroy(device);
                indices.destroy(device);
                return Err(e.context("texture"));
            }
        };

        Ok(Self {
            vertices,
            indices,
            index_count: QUAD_INDICES.len() as u32,
            texture,
            uniforms: Vec::new(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_sets: Vec::new(),
            started: Instant::now(),
        })
    }

    pub fn textured(&self) -> bool {
        self.texture.is_some()
    }

    /// One host-visible uniform buffer per swapchain image.
    pub fn reset_uniform_buffers(&mut self, device: &GraphicsDevice, image_count: usize) -> Result<()> {
        self.destroy_uniform_buffers(device);
        self.uniforms.reserve(image_count);
        for _ in 0..image_count {
            let ubo = BufferAllocation::host_visible(
                device,
                UNIFORM_SIZE,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            )?;
            self.uniforms.push(ubo);
        }
        Ok(())
    }

    /// Pool for exactly one set per uniform buffer.
    pub fn reset_descriptor_pool(&mut self, device: &GraphicsDevice) -> Result<()> {
        self.destroy_descriptor_pool(device);
        let image_count = self.uniforms.len() as u32;
        let sizes = descriptor_pool_sizes(image_count, self.textured());
        let info = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: image_count,
            pool_size_count: sizes.len() as u32,
            p_pool_sizes: sizes.as_ptr(),
            ..Default::default()
        };
        self.descriptor_pool = unsafe { device.logical().create_descriptor_pool(&info, None) }
            .vk_call("vkCreateDescriptorPool")?;
        Ok(())
    }

    /// Allocate one set per image and point it at that image's uniform
    /// buffer (and the shared texture).
    pub fn reset_descriptor_sets(
        &mut self,
        device: &GraphicsDevice,
        layout: vk::DescriptorSetLayout,
    ) -> Result<()> {
        let d = device.logical();
        // Sets are freed with their pool; a fresh pool has none outstanding.
        self.descriptor_sets.clear();
        let count = self.uniforms.len();
        if count == 0 {
            return Ok(());
        }
        let layouts = vec![layout; count];
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: self.descriptor_pool,
            descriptor_set_count: count as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        self.descriptor_sets =
            unsafe { d.allocate_descriptor_sets(&alloc) }.vk_call("vkAllocateDescriptorSets")?;

        let buffer_infos: Vec<vk::DescriptorBufferInfo> = self
            .uniforms
            .iter()
            .map(|u| vk::DescriptorBufferInfo {
                buffer: u.buffer,
                offset: 0,
                range: UNIFORM_SIZE,
            })
            .collect();
        let image_info = self.texture.as_ref().map(TextureResource::descriptor_info);

        let mut writes = Vec::with_capacity(count * 2);
        for (set, info) in self.descriptor_sets.iter().zip(&buffer_infos) {
            writes.push(vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: *set,
                dst_binding: UNIFORM_BINDING,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: info,
                ..Default::default()
            });
            if let Some(image_info) = &image_info {
                writes.push(vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    dst_set: *set,
                    dst_binding: SAMPLER_BINDING,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    p_image_info: image_info,
                    ..Default::default()
                });
            }
        }
        // SAFETY: buffer_infos and image_info outlive the call.
        unsafe { d.update_descriptor_sets(&writes, &[]) };
        debug!("{} descriptor sets written", self.descriptor_sets.len());
        Ok(())
    }

    /// Rebuild everything that depends on the swapchain image count.
    pub fn reset_per_image(
        &mut self,
        device: &GraphicsDevice,
        image_count: usize,
        layout: vk::DescriptorSetLayout,
    ) -> Result<()> {
        self.reset_uniform_buffers(device, image_count)?;
        self.reset_descriptor_pool(device)?;
        self.reset_descriptor_sets(device, layout)
    }

    /// Write this frame's transform into the uniform buffer of `image_index`.
    /// The image must not be in use by the GPU.
    pub fn update_uniform_buffers(
        &self,
        device: &GraphicsDevice,
        image_index: usize,
        extent: vk::Extent2D,
    ) -> Result<()> {
        let ubo = self
            .uniforms
            .get(image_index)
            .with_context(|| format!("no uniform buffer for image {image_index}"))?;
        let aspect = RenderSize::new(extent.width, extent.height).aspect();
        let transform = UniformTransform::spinning(self.started.elapsed().as_secs_f32(), aspect);
        ubo.write_bytes(device, bytemuck::bytes_of(&transform))
    }

    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertices.buffer
    }

    pub fn index_buffer(&self) -> vk::Buffer {
        self.indices.buffer
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn descriptor_sets(&self) -> &[vk::DescriptorSet] {
        &self.descriptor_sets
    }

    fn destroy_uniform_buffers(&mut self, device: &GraphicsDevice) {
        for mut ubo in self.uniforms.drain(..) {
            ubo.destroy(device);
        }
    }

    fn destroy_descriptor_pool(&mut self, device: &GraphicsDevice) {
        if self.descriptor_pool != vk::DescriptorPool::null() {
            unsafe {
                device
                    .logical()
                    .destroy_descriptor_pool(self.descriptor_pool, None)
            };
        }
        self.descriptor_pool = vk::DescriptorPool::null();
        self.descriptor_sets.clear();
    }

    /// Per-image subset only. Device must be idle.
    pub fn destroy_per_image(&mut self, device: &GraphicsDevice) {
        self.destroy_descriptor_pool(device);
        self.destroy_uniform_buffers(device);
    }

    /// Everything. Device must be idle.
    pub fn destroy(&mut self, device: &GraphicsDevice) {
        self.destroy_per_image(device);
        if let Some(mut tex) = self.texture.take() {
            tex.destroy(device);
        }
        self.indices.destroy(device);
        self.vertices.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_sizes_track_image_count() {
        let sizes = descriptor_pool_sizes(3, false);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 3);
    }

    #[test]
    fn textured_pool_has_both_types() {
        let sizes = descriptor_pool_sizes(4, true);
        assert_eq!(sizes.len(), 2);
        assert!(sizes.iter().all(|s| s.descriptor_count == 4));
        assert_eq!(sizes[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
    }

    #[test]
    fn uniform_payload_is_three_matrices() {
        assert_eq!(UNIFORM_SIZE, 3 * 64);
    }
}
