// SPDX-License-Identifier: CEPL-1.0
//! Memory-type search and the buffer/memory pairs built on it.
use anyhow::Result;
use ash::vk;

use crate::device::GraphicsDevice;
use crate::error::{RenderError, VkResultExt};

/// First memory type whose bit is set in `type_bits` and whose property
/// flags contain every flag in `required`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, RenderError> {
    let count = props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && props.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(RenderError::NoSuitableMemoryType {
            type_bits,
            flags: required,
        })
}

/// Allocate memory satisfying `req` from the first matching memory type.
pub(crate) fn allocate_memory(
    device: &GraphicsDevice,
    req: vk::MemoryRequirements,
    props: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index = device.find_memory_type(req.memory_type_bits, props)?;
    let mai = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: req.size,
        memory_type_index,
        ..Default::default()
    };
    // SAFETY: mai holds no pointers.
    let memory = unsafe { device.logical().allocate_memory(&mai, None) }
        .vk_call("vkAllocateMemory")?;
    Ok(memory)
}

/// A buffer bound to its own dedicated allocation.
///
/// Not destroyed on drop: the owner decides when the GPU is done with it and
/// calls [`BufferAllocation::destroy`].
#[derive(Debug)]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl BufferAllocation {
    pub fn new(
        device: &GraphicsDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let d = device.logical();
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        // SAFETY: bci holds no pointers.
        let buffer = unsafe { d.create_buffer(&bci, None) }.vk_call("vkCreateBuffer")?;
        let req = unsafe { d.get_buffer_memory_requirements(buffer) };

        let memory = match allocate_memory(device, req, props) {
            Ok(m) => m,
            Err(e) => {
                // SAFETY: buffer is unbound and unused.
                unsafe { d.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(result) = unsafe { d.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                d.destroy_buffer(buffer, None);
                d.free_memory(memory, None);
            }
            return Err(RenderError::Vulkan {
                call: "vkBindBufferMemory",
                result,
            }
            .into());
        }

        Ok(Self {
            buffer,
            memory,
            size,
        })
    }

    /// Host-visible + host-coherent buffer, the kind written from the CPU.
    pub fn host_visible(
        device: &GraphicsDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Self::new(
            device,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Map, copy `bytes` to the start of the allocation, unmap.
    ///
    /// Only valid for host-visible memory.
    pub fn write_bytes(&self, device: &GraphicsDevice, bytes: &[u8]) -> Result<()> {
        anyhow::ensure!(
            bytes.len() as vk::DeviceSize <= self.size,
            "write of {} bytes into a {}-byte buffer",
            bytes.len(),
            self.size
        );
        let d = device.logical();
        // SAFETY: the range is inside the allocation and the memory is host-visible;
        // coherent memory needs no flush.
        unsafe {
            let ptr = d
                .map_memory(
                    self.memory,
                    0,
                    bytes.len() as vk::DeviceSize,
                    vk::MemoryMapFlags::empty(),
                )
                .vk_call("vkMapMemory")?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            d.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Map and copy the first `len` bytes out. Only valid for host-visible memory.
    pub fn read_bytes(&self, device: &GraphicsDevice, len: usize) -> Result<Vec<u8>> {
        anyhow::ensure!(
            len as vk::DeviceSize <= self.size,
            "read of {len} bytes from a {}-byte buffer",
            self.size
        );
        let d = device.logical();
        let mut out = vec![0u8; len];
        // SAFETY: as in write_bytes.
        unsafe {
            let ptr = d
                .map_memory(
                    self.memory,
                    0,
                    len as vk::DeviceSize,
                    vk::MemoryMapFlags::empty(),
                )
                .vk_call("vkMapMemory")?;
            std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), out.as_mut_ptr(), len);
            d.unmap_memory(self.memory);
        }
        Ok(out)
    }

    pub fn destroy(&mut self, device: &GraphicsDevice) {
        let d = device.logical();
        // SAFETY: the owner guarantees the GPU no longer references the buffer.
        unsafe {
            d.destroy_buffer(self.buffer, None);
            d.free_memory(self.memory, None);
        }
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, &f) in flags.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: f,
                heap_index: 0,
            };
        }
        props
    }

    const DL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HV: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HC: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;

    #[test]
    fn returns_first_qualifying_index() {
        let props = table(&[DL, HV | HC, HV | HC | DL]);
        assert_eq!(find_memory_type(&props, 0b111, HV | HC).unwrap(), 1);
        assert_eq!(find_memory_type(&props, 0b111, DL).unwrap(), 0);
    }

    #[test]
    fn respects_type_bits() {
        let props = table(&[DL, HV | HC, HV | HC | DL]);
        // Type 1 excluded by the mask, type 2 is a superset of the request.
        assert_eq!(find_memory_type(&props, 0b101, HV | HC).unwrap(), 2);
        assert_eq!(find_memory_type(&props, 0b100, DL).unwrap(), 2);
    }

    #[test]
    fn is_deterministic() {
        let props = table(&[HV, DL, HV | HC, DL | HV | HC]);
        let first = find_memory_type(&props, u32::MAX, HV).unwrap();
        for _ in 0..16 {
            assert_eq!(find_memory_type(&props, u32::MAX, HV).unwrap(), first);
        }
        assert_eq!(first, 0);
    }

    #[test]
    fn empty_request_matches_any_allowed_type() {
        let props = table(&[DL, HV]);
        assert_eq!(
            find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::empty()).unwrap(),
            1
        );
    }

    #[test]
    fn no_match_is_an_error() {
        let props = table(&[DL, DL]);
        let err = find_memory_type(&props, 0b11, HV | HC).unwrap_err();
        assert!(matches!(
            err,
            RenderError::NoSuitableMemoryType { type_bits: 0b11, .. }
        ));
        // Bits beyond the reported count are ignored.
        let err = find_memory_type(&props, 0b100, DL).unwrap_err();
        assert!(matches!(err, RenderError::NoSuitableMemoryType { .. }));
    }
}
