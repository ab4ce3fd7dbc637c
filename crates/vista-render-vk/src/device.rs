// SPDX-License-Identifier: CEPL-1.0
//! Logical device, its queues, and the physical-device policy used to pick one.
use anyhow::{Context, Result};
use ash::khr::swapchain;
use ash::vk;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{RenderError, VkResultExt};
use crate::instance::InstanceContext;
use crate::memory;

/// Queue family indices chosen for one physical device and surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, one `DeviceQueueCreateInfo` each.
    pub fn unique(&self) -> Vec<u32> {
        BTreeSet::from([self.graphics, self.present])
            .into_iter()
            .collect()
    }
}

/// Choose graphics and present families. A family that does both wins;
/// otherwise the first of each.
pub fn pick_queue_families<F>(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: F,
) -> Result<Option<QueueFamilies>, vk::Result>
where
    F: FnMut(u32) -> Result<bool, vk::Result>,
{
    let mut graphics = None;
    let mut present = None;
    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        let does_graphics =
            family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let does_present = family.queue_count > 0 && supports_present(i)?;
        if does_graphics && does_present {
            return Ok(Some(QueueFamilies {
                graphics: i,
                present: i,
            }));
        }
        if does_graphics && graphics.is_none() {
            graphics = Some(i);
        }
        if does_present && present.is_none() {
            present = Some(i);
        }
    }
    Ok(graphics
        .zip(present)
        .map(|(graphics, present)| QueueFamilies { graphics, present }))
}

/// Higher is better. Candidates are otherwise equal once they pass the
/// queue and extension checks.
pub fn device_type_score(ty: vk::PhysicalDeviceType) -> u32 {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

pub(crate) fn device_type_name(ty: vk::PhysicalDeviceType) -> &'static str {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual",
        vk::PhysicalDeviceType::CPU => "cpu",
        _ => "other",
    }
}

pub struct GraphicsDevice {
    context: Arc<InstanceContext>,
    physical: vk::PhysicalDevice,
    logical: ash::Device,
    swapchain_loader: swapchain::Device,
    families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    name: String,
    max_anisotropy: Option<f32>,
}

impl GraphicsDevice {
    /// Create the logical device with the swapchain extension and one queue
    /// per distinct family.
    pub(crate) fn create(
        context: &Arc<InstanceContext>,
        physical: vk::PhysicalDevice,
        families: QueueFamilies,
    ) -> Result<Self> {
        let instance = context.instance();
        // SAFETY: physical was enumerated from this instance.
        let (props, features, memory_properties) = unsafe {
            (
                instance.get_physical_device_properties(physical),
                instance.get_physical_device_features(physical),
                instance.get_physical_device_memory_properties(physical),
            )
        };
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed>".to_owned());

        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: priorities.as_ptr(),
                ..Default::default()
            })
            .collect();

        let anisotropy = features.sampler_anisotropy == vk::TRUE;
        let enabled = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: features.sampler_anisotropy,
            ..Default::default()
        };

        let device_exts = [swapchain::NAME.as_ptr()];
        let dinfo = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: queue_infos.len() as u32,
            p_queue_create_infos: queue_infos.as_ptr(),
            enabled_extension_count: device_exts.len() as u32,
            pp_enabled_extension_names: device_exts.as_ptr(),
            p_enabled_features: &enabled,
            ..Default::default()
        };
        // SAFETY: all pointers in dinfo refer to locals alive for the call.
        let logical = unsafe { instance.create_device(physical, &dinfo, None) }
            .vk_call("vkCreateDevice")
            .context("create_device")?;

        let (graphics_queue, present_queue) = unsafe {
            (
                logical.get_device_queue(families.graphics, 0),
                logical.get_device_queue(families.present, 0),
            )
        };
        let swapchain_loader = swapchain::Device::new(instance, &logical);

        info!(
            "device ready: {} ({}, api {}.{}.{}), graphics family {}, present family {}",
            name,
            device_type_name(props.device_type),
            vk::api_version_major(props.api_version),
            vk::api_version_minor(props.api_version),
            vk::api_version_patch(props.api_version),
            families.graphics,
            families.present,
        );

        Ok(Self {
            context: Arc::clone(context),
            physical,
            logical,
            swapchain_loader,
            families,
            graphics_queue,
            present_queue,
            memory_properties,
            name,
            max_anisotropy: anisotropy.then_some(props.limits.max_sampler_anisotropy),
        })
    }

    pub fn context(&self) -> &Arc<InstanceContext> {
        &self.context
    }

    pub fn physical(&self) -> vk::PhysicalDevice {
        self.physical
    }

    pub fn logical(&self) -> &ash::Device {
        &self.logical
    }

    /// Raw logical device handle; equal for every renderer sharing this device.
    pub fn handle(&self) -> vk::Device {
        self.logical.handle()
    }

    pub fn swapchain_loader(&self) -> &swapchain::Device {
        &self.swapchain_loader
    }

    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device anisotropy limit, when the feature was enabled.
    pub fn max_anisotropy(&self) -> Option<f32> {
        self.max_anisotropy
    }

    pub fn find_memory_type(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32, RenderError> {
        memory::find_memory_type(&self.memory_properties, type_bits, flags)
    }

    /// Whether this device's present family can present to `surface`.
    pub fn can_present_to(&self, surface: vk::SurfaceKHR) -> bool {
        // SAFETY: physical and surface both come from our instance.
        unsafe {
            self.context
                .surface_loader()
                .get_physical_device_surface_support(self.physical, self.families.present, surface)
        }
        .unwrap_or(false)
    }

    /// Command pool on the graphics family. Used for per-image command
    /// buffers and one-shot transfers alike; buffers are individually
    /// resettable so a clear-colour change can re-record in place.
    pub fn create_graphics_command_pool(&self) -> Result<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index: self.families.graphics,
            ..Default::default()
        };
        let pool = unsafe { self.logical.create_command_pool(&pool_info, None) }
            .vk_call("vkCreateCommandPool")?;
        Ok(pool)
    }

    /// Destroy a pool made by [`Self::create_graphics_command_pool`], freeing
    /// its buffers. The pool's buffers must not be pending execution.
    pub fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.logical.destroy_command_pool(pool, None) };
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.logical.device_wait_idle() }.vk_call("vkDeviceWaitIdle")?;
        Ok(())
    }
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        debug!("destroying device {}", self.name);
        // SAFETY: renderers hold an Arc to this device, so all of them (and
        // everything they allocated) are gone by now.
        unsafe {
            self.logical.device_wait_idle().ok();
            self.logical.destroy_device(None);
        }
    }
}

/// Whether `physical` exposes `VK_KHR_swapchain`.
pub(crate) fn supports_swapchain(
    instance: &ash::Instance,
    physical: vk::PhysicalDevice,
) -> Result<bool> {
    let exts = unsafe { instance.enumerate_device_extension_properties(physical) }
        .vk_call("vkEnumerateDeviceExtensionProperties")?;
    Ok(exts
        .iter()
        .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == swapchain::NAME)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_family_doing_both() {
        let fams = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        // Family 0 cannot present, 1 and 2 can.
        let picked = pick_queue_families(&fams, |i| Ok(i != 0)).unwrap();
        assert_eq!(
            picked,
            Some(QueueFamilies {
                graphics: 2,
                present: 2
            })
        );
        assert!(picked.unwrap().shared());
    }

    #[test]
    fn falls_back_to_separate_families() {
        let fams = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
        ];
        let picked = pick_queue_families(&fams, |i| Ok(i == 1)).unwrap().unwrap();
        assert_eq!(picked.graphics, 0);
        assert_eq!(picked.present, 1);
        assert!(!picked.shared());
        assert_eq!(picked.unique(), vec![0, 1]);
    }

    #[test]
    fn missing_present_or_graphics_is_none() {
        let fams = [family(vk::QueueFlags::GRAPHICS)];
        assert_eq!(pick_queue_families(&fams, |_| Ok(false)).unwrap(), None);

        let fams = [family(vk::QueueFlags::COMPUTE)];
        assert_eq!(pick_queue_families(&fams, |_| Ok(true)).unwrap(), None);
    }

    #[test]
    fn empty_families_are_skipped() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let fams = [empty, family(vk::QueueFlags::GRAPHICS)];
        let picked = pick_queue_families(&fams, |_| Ok(true)).unwrap().unwrap();
        assert_eq!(picked.graphics, 1);
    }

    #[test]
    fn present_query_errors_propagate() {
        let fams = [family(vk::QueueFlags::GRAPHICS)];
        let err = pick_queue_families(&fams, |_| Err(vk::Result::ERROR_SURFACE_LOST_KHR));
        assert_eq!(err, Err(vk::Result::ERROR_SURFACE_LOST_KHR));
    }

    #[test]
    fn shared_family_is_created_once() {
        let f = QueueFamilies {
            graphics: 3,
            present: 3,
        };
        assert_eq!(f.unique(), vec![3]);
    }

    #[test]
    fn discrete_beats_integrated_beats_cpu() {
        assert!(
            device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU)
                > device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(
            device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU)
                > device_type_score(vk::PhysicalDeviceType::VIRTUAL_GPU)
        );
        assert!(
            device_type_score(vk::PhysicalDeviceType::CPU)
                > device_type_score(vk::PhysicalDeviceType::OTHER)
        );
    }
}
