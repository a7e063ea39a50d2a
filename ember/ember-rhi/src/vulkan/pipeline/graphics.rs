//! Vulkan Graphics Pipeline, built for dynamic rendering (no VkRenderPass objects).

use crate::{GraphicsPipeline, GraphicsPipelineDescriptor, RhiError, RhiResult};
use ash::vk;
use std::ffi::CString;

use super::super::descriptor::VulkanDescriptorSetLayout;
use super::super::texture::texture_format_to_vk;
use super::{create_pipeline_layout, create_shader_module};

pub struct VulkanGraphicsPipeline {
    pub(crate) device: ash::Device,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) push_stages: vk::ShaderStageFlags,
    pub(crate) _set_layout: Option<VulkanDescriptorSetLayout>,
}

impl VulkanGraphicsPipeline {
    pub fn create(device: &ash::Device, desc: &GraphicsPipelineDescriptor) -> RhiResult<Self> {
        let vs_module = create_shader_module(device, &desc.vertex_shader.source)?;
        let fs_module = match create_shader_module(device, &desc.fragment_shader.source) {
            Ok(m) => m,
            Err(e) => {
                unsafe { device.destroy_shader_module(vs_module, None) };
                return Err(e);
            }
        };
        let result = Self::build(device, desc, vs_module, fs_module);
        unsafe {
            device.destroy_shader_module(vs_module, None);
            device.destroy_shader_module(fs_module, None);
        }
        result
    }

    fn build(
        device: &ash::Device,
        desc: &GraphicsPipelineDescriptor,
        vs_module: vk::ShaderModule,
        fs_module: vk::ShaderModule,
    ) -> RhiResult<Self> {
        let vs_entry = CString::new(desc.vertex_shader.entry_point.as_str())
            .map_err(|e| RhiError::InvalidArgument(e.to_string()))?;
        let fs_entry = CString::new(desc.fragment_shader.entry_point.as_str())
            .map_err(|e| RhiError::InvalidArgument(e.to_string()))?;
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vs_module)
                .name(&vs_entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fs_module)
                .name(&fs_entry),
        ];

        // Vertices are pulled through buffer device addresses.
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .min_sample_shading(1.0);

        let color_formats: Vec<vk::Format> = desc
            .color_targets
            .iter()
            .map(|t| texture_format_to_vk(t.format))
            .collect();

        let color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
            .color_targets
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
                    .blend_enable(false)
            })
            .collect();

        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let depth_stencil = desc.depth_stencil.as_ref().map_or(
            vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(false)
                .depth_write_enable(false)
                .stencil_test_enable(false),
            |ds| {
                vk::PipelineDepthStencilStateCreateInfo::default()
                    .depth_test_enable(true)
                    .depth_write_enable(ds.depth_write_enabled)
                    .depth_compare_op(vk::CompareOp::GREATER_OR_EQUAL)
                    .depth_bounds_test_enable(false)
                    .stencil_test_enable(false)
                    .min_depth_bounds(0.0)
                    .max_depth_bounds(1.0)
            },
        );
        let depth_format = desc
            .depth_stencil
            .as_ref()
            .map(|ds| texture_format_to_vk(ds.format))
            .unwrap_or(vk::Format::UNDEFINED);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(depth_format);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let (layout, set_layout, push_stages) =
            create_pipeline_layout(device, &desc.layout_bindings, desc.push_constants)?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .push_next(&mut rendering_info)
            .stages(&stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blend)
            .depth_stencil_state(&depth_stencil)
            .dynamic_state(&dynamic_state)
            .layout(layout);

        let result = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let pipeline = match result {
            Ok(pipelines) => pipelines[0],
            Err((_partial, res)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(RhiError::Backend(format!(
                    "create_graphics_pipelines ({}): {:?}",
                    desc.label.unwrap_or("unnamed"),
                    res
                )));
            }
        };

        Ok(Self {
            device: device.clone(),
            pipeline,
            layout,
            push_stages,
            _set_layout: set_layout,
        })
    }
}

impl Drop for VulkanGraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

impl std::fmt::Debug for VulkanGraphicsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanGraphicsPipeline").finish()
    }
}

impl GraphicsPipeline for VulkanGraphicsPipeline {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
