// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

/// Failures the renderer can name. Everything here is fatal to the operation
/// that raised it; nothing is retried.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no memory type matches bits {type_bits:#034b} with properties {flags:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    #[error("no physical device offers both graphics and presentation for this surface")]
    NoSuitableDevice,

    #[error("pipeline creation failed: {0}")]
    PipelineCreationFailed(String),

    #[error("failed to read shader module {}: {source}", path.display())]
    ShaderLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("pixel buffer is {actual} bytes, expected {expected} for {width}x{height} at 4 bytes/pixel")]
    InvalidPixelBuffer {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("failed to load the Vulkan library: {0}")]
    Loader(String),

    #[error("window handle unavailable: {0}")]
    WindowHandle(String),

    /// An earlier draw, resize or re-record failed part-way; the chain and
    /// sync objects may be inconsistent, so the renderer refuses further work.
    #[error("renderer is unusable after an earlier failure")]
    Poisoned,
}

/// Attach the failing entry point name to a raw `vk::Result`.
pub(crate) trait VkResultExt<T> {
    fn vk_call(self, call: &'static str) -> Result<T, RenderError>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn vk_call(self, call: &'static str) -> Result<T, RenderError> {
        self.map_err(|result| RenderError::Vulkan { call, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_call_names_the_entry_point() {
        let r: Result<(), vk::Result> = Err(vk::Result::ERROR_DEVICE_LOST);
        let err = r.vk_call("vkQueueSubmit").unwrap_err();
        assert!(matches!(
            err,
            RenderError::Vulkan {
                call: "vkQueueSubmit",
                result: vk::Result::ERROR_DEVICE_LOST
            }
        ));
        assert!(err.to_string().contains("vkQueueSubmit"));
    }
}
