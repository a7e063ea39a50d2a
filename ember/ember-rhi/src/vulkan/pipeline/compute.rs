//! Vulkan Compute Pipeline.

use crate::{ComputePipeline, ComputePipelineDescriptor, RhiError, RhiResult};
use ash::vk;
use std::ffi::CString;

use super::super::descriptor::VulkanDescriptorSetLayout;
use super::{create_pipeline_layout, create_shader_module};

pub struct VulkanComputePipeline {
    pub(crate) device: ash::Device,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) push_stages: vk::ShaderStageFlags,
    pub(crate) _set_layout: Option<VulkanDescriptorSetLayout>,
}

impl VulkanComputePipeline {
    pub fn create(device: &ash::Device, desc: &ComputePipelineDescriptor) -> RhiResult<Self> {
        let shader_module = create_shader_module(device, &desc.shader_source)?;
        let (layout, set_layout, push_stages) =
            match create_pipeline_layout(device, &desc.layout_bindings, desc.push_constants) {
                Ok(l) => l,
                Err(e) => {
                    unsafe { device.destroy_shader_module(shader_module, None) };
                    return Err(e);
                }
            };
        let entry_name = CString::new(desc.entry_point.as_str())
            .map_err(|e| RhiError::InvalidArgument(e.to_string()))?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(&entry_name);
        let create_info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);
        let result = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        };
        unsafe {
            device.destroy_shader_module(shader_module, None);
        }
        let pipeline = match result {
            Ok(pipelines) => pipelines[0],
            Err((_partial, res)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(RhiError::Backend(format!(
                    "create_compute_pipelines ({}): {:?}",
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

impl Drop for VulkanComputePipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

impl std::fmt::Debug for VulkanComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanComputePipeline").finish()
    }
}

impl ComputePipeline for VulkanComputePipeline {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
