// SPDX-License-Identifier: CEPL-1.0
//! Render pass, descriptor-set layout, and the graphics pipeline.
//!
//! Built once per renderer against the renderer-lifetime surface format.
//! Viewport and scissor are dynamic, so a resize never touches anything here.
use anyhow::Result;
use ash::vk;
use tracing::debug;

use crate::device::GraphicsDevice;
use crate::error::{RenderError, VkResultExt};
use crate::geometry::Vertex;
use crate::shader::{self, ShaderSet};

pub const UNIFORM_BINDING: u32 = 0;
pub const SAMPLER_BINDING: u32 = 1;

pub struct PipelineManager {
    pub set_layout: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub pipeline: vk::Pipeline,
    textured: bool,
}

/// Binding 0: vertex-stage uniform buffer. Binding 1 (textured only):
/// fragment-stage combined image sampler.
pub fn descriptor_bindings(textured: bool) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
    let mut bindings = vec![vk::DescriptorSetLayoutBinding {
        binding: UNIFORM_BINDING,
        descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        descriptor_count: 1,
        stage_flags: vk::ShaderStageFlags::VERTEX,
        ..Default::default()
    }];
    if textured {
        bindings.push(vk::DescriptorSetLayoutBinding {
            binding: SAMPLER_BINDING,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            ..Default::default()
        });
    }
    bindings
}

impl PipelineManager {
    /// Any failure is reported as [`RenderError::PipelineCreationFailed`]
    /// (or [`RenderError::ShaderLoad`] for unreadable modules); partial
    /// objects are destroyed before returning.
    pub fn build(
        device: &GraphicsDevice,
        color_format: vk::Format,
        shaders: &ShaderSet,
        textured: bool,
    ) -> Result<Self> {
        let vert = shader::load_words(&shaders.vertex)?;
        let frag = shader::load_words(&shaders.fragment)?;

        let mut out = Self {
            set_layout: vk::DescriptorSetLayout::null(),
            layout: vk::PipelineLayout::null(),
            render_pass: vk::RenderPass::null(),
            pipeline: vk::Pipeline::null(),
            textured,
        };
        if let Err(e) = out.build_objects(device, color_format, &vert, &frag) {
            out.destroy(device);
            return Err(RenderError::PipelineCreationFailed(e.to_string()).into());
        }
        debug!("pipeline built ({color_format:?}, textured={textured})");
        Ok(out)
    }

    fn build_objects(
        &mut self,
        device: &GraphicsDevice,
        color_format: vk::Format,
        vert: &[u32],
        frag: &[u32],
    ) -> Result<(), RenderError> {
        let d = device.logical();

        // --- Descriptor-set layout + pipeline layout ---
        let bindings = descriptor_bindings(self.textured);
        let dsl_info = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: bindings.len() as u32,
            p_bindings: bindings.as_ptr(),
            ..Default::default()
        };
        self.set_layout = unsafe { d.create_descriptor_set_layout(&dsl_info, None) }
            .vk_call("vkCreateDescriptorSetLayout")?;

        let layout_info = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            set_layout_count: 1,
            p_set_layouts: &self.set_layout,
            ..Default::default()
        };
        self.layout = unsafe { d.create_pipeline_layout(&layout_info, None) }
            .vk_call("vkCreatePipelineLayout")?;

        // --- Render pass: one color attachment, clear -> store -> present ---
        self.render_pass = create_render_pass(d, color_format)?;

        // --- Shader modules (destroyed before return) ---
        let vs = shader::create_module(d, vert)?;
        let fs = match shader::create_module(d, frag) {
            Ok(fs) => fs,
            Err(e) => {
                unsafe { d.destroy_shader_module(vs, None) };
                return Err(e);
            }
        };
        let res = self.create_pipeline(d, vs, fs);
        unsafe {
            d.destroy_shader_module(vs, None);
            d.destroy_shader_module(fs, None);
        }
        self.pipeline = res?;
        Ok(())
    }

    fn create_pipeline(
        &self,
        d: &ash::Device,
        vs: vk::ShaderModule,
        fs: vk::ShaderModule,
    ) -> Result<vk::Pipeline, RenderError> {
        let entry = c"main";
        let stages = [
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::VERTEX,
                module: vs,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: fs,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
        ];

        // --- Fixed-function pipeline states ---
        let vb = Vertex::binding_description();
        let va = Vertex::attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
            vertex_binding_description_count: 1,
            p_vertex_binding_descriptions: &vb,
            vertex_attribute_description_count: va.len() as u32,
            p_vertex_attribute_descriptions: va.as_ptr(),
            ..Default::default()
        };
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            ..Default::default()
        };
        // Dynamic state (viewport/scissor set at record time)
        let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
            dynamic_state_count: dyn_states.len() as u32,
            p_dynamic_states: dyn_states.as_ptr(),
            ..Default::default()
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
            viewport_count: 1,
            p_viewports: std::ptr::null(), // dynamic
            scissor_count: 1,
            p_scissors: std::ptr::null(), // dynamic
            ..Default::default()
        };
        // Projection flips Y, so the quad's CCW winding survives into framebuffer space.
        let raster = vk::PipelineRasterizationStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            ..Default::default()
        };
        let multisample = vk::PipelineMultisampleStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };
        // No blending; write all RGBA
        let color_blend_att = vk::PipelineColorBlendAttachmentState {
            color_write_mask: vk::ColorComponentFlags::R
                | vk::ColorComponentFlags::G
                | vk::ColorComponentFlags::B
                | vk::ColorComponentFlags::A,
            blend_enable: vk::FALSE,
            ..Default::default()
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
            attachment_count: 1,
            p_attachments: &color_blend_att,
            ..Default::default()
        };

        let pipeline_info = vk::GraphicsPipelineCreateInfo {
            s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &raster,
            p_multisample_state: &multisample,
            p_color_blend_state: &color_blend,
            p_dynamic_state: &dynamic_state,
            layout: self.layout,
            render_pass: self.render_pass,
            subpass: 0,
            ..Default::default()
        };

        // SAFETY: every pointer in pipeline_info refers to locals above.
        let pipelines = unsafe {
            d.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipeline_info),
                None,
            )
        }
        .map_err(|(_, result)| RenderError::Vulkan {
            call: "vkCreateGraphicsPipelines",
            result,
        })?;
        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| RenderError::PipelineCreationFailed("driver returned no pipeline".into()))
    }

    pub fn textured(&self) -> bool {
        self.textured
    }

    /// Device must be idle. Null handles are skipped.
    pub fn destroy(&mut self, device: &GraphicsDevice) {
        let d = device.logical();
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                d.destroy_pipeline(self.pipeline, None);
            }
            if self.render_pass != vk::RenderPass::null() {
                d.destroy_render_pass(self.render_pass, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                d.destroy_pipeline_layout(self.layout, None);
            }
            if self.set_layout != vk::DescriptorSetLayout::null() {
                d.destroy_descriptor_set_layout(self.set_layout, None);
            }
        }
        self.pipeline = vk::Pipeline::null();
        self.render_pass = vk::RenderPass::null();
        self.layout = vk::PipelineLayout::null();
        self.set_layout = vk::DescriptorSetLayout::null();
    }
}

fn create_render_pass(d: &ash::Device, color_format: vk::Format) -> Result<vk::RenderPass, RenderError> {
    let attachment = vk::AttachmentDescription {
        format: color_format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        ..Default::default()
    };
    // The acquire semaphore is waited at COLOR_ATTACHMENT_OUTPUT; the layout
    // transition must not start before it.
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    };
    let info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &attachment,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    unsafe { d.create_render_pass(&info, None) }.vk_call("vkCreateRenderPass")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untextured_layout_has_only_the_uniform() {
        let b = descriptor_bindings(false);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].binding, UNIFORM_BINDING);
        assert_eq!(b[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(b[0].stage_flags, vk::ShaderStageFlags::VERTEX);
    }

    #[test]
    fn textured_layout_adds_fragment_sampler() {
        let b = descriptor_bindings(true);
        assert_eq!(b.len(), 2);
        assert_eq!(b[1].binding, SAMPLER_BINDING);
        assert_eq!(
            b[1].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(b[1].stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }
}
