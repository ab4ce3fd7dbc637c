// SPDX-License-Identifier: CEPL-1.0
//! Pre-compiled SPIR-V modules, read from disk at pipeline build time.
use ash::vk;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::error::{RenderError, VkResultExt};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Directory the build script writes compiled shaders into.
pub fn builtin_dir(textured: bool) -> PathBuf {
    let set = if textured { "textured" } else { "colored" };
    Path::new(env!("OUT_DIR")).join("shaders").join(set)
}

/// A `vert.spv` / `frag.spv` pair in one directory.
#[derive(Clone, Debug)]
pub struct ShaderSet {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl ShaderSet {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            vertex: dir.join("vert.spv"),
            fragment: dir.join("frag.spv"),
        }
    }

    pub fn builtin(textured: bool) -> Self {
        Self::in_dir(builtin_dir(textured))
    }
}

/// Split a SPIR-V binary into little-endian words.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>, RenderError> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(RenderError::PipelineCreationFailed(format!(
            "shader module is {} bytes, not a whole number of 32-bit words",
            bytes.len()
        )));
    }
    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| RenderError::PipelineCreationFailed(format!("reading SPIR-V: {e}")))?;
    // read_spv normalises byte order, so a missing magic means this is not SPIR-V.
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(RenderError::PipelineCreationFailed(
            "shader module does not start with the SPIR-V magic number".to_owned(),
        ));
    }
    Ok(words)
}

pub(crate) fn load_words(path: &Path) -> Result<Vec<u32>, RenderError> {
    let bytes = std::fs::read(path).map_err(|source| RenderError::ShaderLoad {
        path: path.to_owned(),
        source,
    })?;
    spirv_words(&bytes).map_err(|e| match e {
        RenderError::PipelineCreationFailed(msg) => {
            RenderError::PipelineCreationFailed(format!("{}: {msg}", path.display()))
        }
        other => other,
    })
}

pub(crate) fn create_module(
    device: &ash::Device,
    words: &[u32],
) -> Result<vk::ShaderModule, RenderError> {
    let info = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        code_size: words.len() * 4,
        p_code: words.as_ptr(),
        ..Default::default()
    };
    // SAFETY: words is a validated SPIR-V stream alive for the call.
    unsafe { device.create_shader_module(&info, None) }.vk_call("vkCreateShaderModule")
}
