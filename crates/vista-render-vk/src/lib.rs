// SPDX-License-Identifier: CEPL-1.0
//! Vulkan presentation renderer.
//!
//! A [`DeviceSelector`] owns the instance and hands out [`VkRenderer`]s, one
//! per surface, sharing a [`GraphicsDevice`] wherever the device can present
//! to the new surface.
mod error;
mod frame;
mod geometry;
mod instance;
mod pipeline;
mod renderer;
mod resources;
mod selector;
mod shader;
mod swapchain;
mod texture;

pub mod device;
pub mod memory;
pub mod transfer;

pub use ash::vk;
pub use device::{GraphicsDevice, QueueFamilies};
pub use error::RenderError;
pub use frame::{
    AcquireOutcome, FrameOutcome, FrameScheduler, FrameState, PresentOutcome, SyncTriplet,
};
pub use geometry::{Vertex, QUAD_INDICES, QUAD_VERTICES};
pub use instance::{InstanceContext, PresentSurface, SelectorOptions, SurfaceSource};
pub use memory::{find_memory_type, BufferAllocation};
pub use pipeline::PipelineManager;
pub use renderer::{RendererConfig, VkPresentMode, VkRenderer};
pub use resources::{descriptor_pool_sizes, ResourceManager};
pub use selector::DeviceSelector;
pub use shader::{spirv_words, ShaderSet};
pub use swapchain::{
    choose_extent, choose_image_count, choose_present_mode, choose_surface_format,
    SwapchainManager,
};
pub use texture::{PixelBuffer, PixelFormat, TextureResource};
pub use transfer::StagingTransfer;
