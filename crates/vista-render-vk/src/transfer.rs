// SPDX-License-Identifier: CEPL-1.0
//! Setup-time uploads through a host-visible staging buffer.
//!
//! Every copy is a one-shot command buffer submitted to the graphics queue
//! followed by a queue-idle wait. Transfers only happen while building a
//! renderer, never per frame, so there is no completion tracking.
use anyhow::Result;
use ash::vk;

use crate::device::GraphicsDevice;
use crate::error::VkResultExt;
use crate::memory::BufferAllocation;

pub struct StagingTransfer<'a> {
    device: &'a GraphicsDevice,
    pool: vk::CommandPool,
}

impl<'a> StagingTransfer<'a> {
    /// `pool` must belong to the graphics family of `device`.
    pub fn new(device: &'a GraphicsDevice, pool: vk::CommandPool) -> Self {
        Self { device, pool }
    }

    /// Copy `bytes` into a fresh host-visible, host-coherent transfer source.
    /// The caller destroys the returned buffer once the copy has completed.
    pub fn stage(&self, bytes: &[u8]) -> Result<BufferAllocation> {
        anyhow::ensure!(!bytes.is_empty(), "cannot stage an empty byte range");
        let staging = BufferAllocation::host_visible(
            self.device,
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        if let Err(e) = staging.write_bytes(self.device, bytes) {
            let mut staging = staging;
            staging.destroy(self.device);
            return Err(e);
        }
        Ok(staging)
    }

    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy) -> Result<()> {
        let d = self.device.logical();
        self.run_oneshot(|cmd| unsafe {
            d.cmd_copy_buffer(cmd, src, dst, std::slice::from_ref(&region));
        })
    }

    /// Copy into `dst`, moving it UNDEFINED -> TRANSFER_DST before the copy
    /// and TRANSFER_DST -> SHADER_READ_ONLY after it.
    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        region: vk::BufferImageCopy,
    ) -> Result<()> {
        let d = self.device.logical();
        self.run_oneshot(|cmd| unsafe {
            let to_transfer = layout_barrier(
                dst,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            );
            d.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&to_transfer),
            );

            d.cmd_copy_buffer_to_image(
                cmd,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );

            let to_shader = layout_barrier(
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
            );
            d.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&to_shader),
            );
        })
    }

    /// Stage `bytes` and copy them into the start of `dst`.
    pub fn upload_to_buffer(&self, bytes: &[u8], dst: vk::Buffer) -> Result<()> {
        let mut staging = self.stage(bytes)?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: staging.size,
        };
        let res = self.copy_buffer(staging.buffer, dst, region);
        staging.destroy(self.device);
        res
    }

    /// Allocate, begin, record, end, submit, wait, free.
    fn run_oneshot(&self, record: impl FnOnce(vk::CommandBuffer)) -> Result<()> {
        let d = self.device.logical();
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let cmd = unsafe { d.allocate_command_buffers(&ai) }
            .vk_call("vkAllocateCommandBuffers")?[0];

        let res = (|| -> Result<()> {
            let bi = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            unsafe { d.begin_command_buffer(cmd, &bi) }.vk_call("vkBeginCommandBuffer")?;
            record(cmd);
            unsafe { d.end_command_buffer(cmd) }.vk_call("vkEndCommandBuffer")?;

            let si = vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                ..Default::default()
            };
            let queue = self.device.graphics_queue();
            unsafe {
                d.queue_submit(queue, std::slice::from_ref(&si), vk::Fence::null())
                    .vk_call("vkQueueSubmit")?;
                d.queue_wait_idle(queue).vk_call("vkQueueWaitIdle")?;
            }
            Ok(())
        })();

        // SAFETY: either never submitted or the queue is idle.
        unsafe { d.free_command_buffers(self.pool, std::slice::from_ref(&cmd)) };
        res
    }
}

fn layout_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access_mask: vk::AccessFlags,
    dst_access_mask: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        src_access_mask,
        dst_access_mask,
        old_layout,
        new_layout,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: color_subresource_range(),
        ..Default::default()
    }
}

pub(crate) fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barriers_ignore_queue_ownership() {
        let b = layout_barrier(
            vk::Image::null(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
        );
        assert_eq!(b.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(b.dst_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(b.subresource_range.level_count, 1);
        assert_eq!(b.subresource_range.layer_count, 1);
        assert_eq!(b.subresource_range.aspect_mask, vk::ImageAspectFlags::COLOR);
    }
}
