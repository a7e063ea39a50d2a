mod compute;
mod graphics;

pub use compute::VulkanComputePipeline;
pub use graphics::VulkanGraphicsPipeline;

use crate::{DescriptorSetLayoutBinding, PushConstantRange, RhiError, RhiResult};
use ash::vk;

use super::descriptor::{self, shader_stages_to_vk, VulkanDescriptorSetLayout};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Build a shader module from SPIR-V bytes (word-aligned, little-endian).
pub(crate) fn create_shader_module(device: &ash::Device, source: &[u8]) -> RhiResult<vk::ShaderModule> {
    if source.is_empty() || source.len() % 4 != 0 {
        return Err(RhiError::InvalidArgument("SPIR-V must be 4-byte aligned".to_string()));
    }
    let code: Vec<u32> = source
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if code[0] != SPIRV_MAGIC {
        return Err(RhiError::InvalidArgument("missing SPIR-V magic number".to_string()));
    }
    let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
    unsafe {
        device
            .create_shader_module(&create_info, None)
            .map_err(|e| RhiError::Backend(format!("create_shader_module: {:?}", e)))
    }
}

/// Pipeline layout with at most one descriptor set (set 0) and one push-constant range.
pub(crate) fn create_pipeline_layout(
    device: &ash::Device,
    bindings: &[DescriptorSetLayoutBinding],
    push_constants: Option<PushConstantRange>,
) -> RhiResult<(vk::PipelineLayout, Option<VulkanDescriptorSetLayout>, vk::ShaderStageFlags)> {
    let set_layout = if bindings.is_empty() {
        None
    } else {
        Some(descriptor::create_descriptor_set_layout(device, bindings)?)
    };
    let set_layouts: Vec<vk::DescriptorSetLayout> = set_layout.iter().map(|l| l.layout).collect();
    let ranges: Vec<vk::PushConstantRange> = push_constants
        .iter()
        .map(|r| {
            vk::PushConstantRange::default()
                .stage_flags(shader_stages_to_vk(r.stages))
                .offset(r.offset)
                .size(r.size)
        })
        .collect();
    let push_stages = ranges
        .first()
        .map(|r| r.stage_flags)
        .unwrap_or_else(vk::ShaderStageFlags::empty);
    let create_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&ranges);
    let layout = unsafe {
        device
            .create_pipeline_layout(&create_info, None)
            .map_err(|e| RhiError::Backend(format!("create_pipeline_layout: {:?}", e)))?
    };
    Ok((layout, set_layout, push_stages))
}
