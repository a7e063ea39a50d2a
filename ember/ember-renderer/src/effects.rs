//! Background effects: compute shaders that fill the draw image before geometry.

use bytemuck::{Pod, Zeroable};
use ember_rhi::{
    ComputePipelineDescriptor, DescriptorSetLayoutBinding, DescriptorType, PushConstantRange,
    ShaderStages,
};

/// Push constants of every background effect: four `vec4`s, 64 bytes.
///
/// The meaning of each row is up to the shader, except `data4`, which the engine fills every
/// frame: `data4.xy` is the draw extent in pixels and `data4.w` the elapsed time in seconds.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ComputePushConstants {
    pub data1: [f32; 4],
    pub data2: [f32; 4],
    pub data3: [f32; 4],
    pub data4: [f32; 4],
}

impl ComputePushConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;

    /// Copy carrying this frame's draw extent and elapsed time.
    pub fn with_frame(mut self, draw_extent: (u32, u32), seconds: f32) -> Self {
        self.data4[0] = draw_extent.0 as f32;
        self.data4[1] = draw_extent.1 as f32;
        self.data4[3] = seconds;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundEffect {
    pub name: &'static str,
    /// SPIR-V blob name inside the shader directory.
    pub shader: &'static str,
    pub data: ComputePushConstants,
}

/// `gradient` (two-colour vertical blend) then `sky` (procedural star field).
pub fn default_effects() -> Vec<BackgroundEffect> {
    vec![
        BackgroundEffect {
            name: "gradient",
            shader: crate::shader::GRADIENT,
            data: ComputePushConstants {
                data1: [1.0, 0.0, 0.0, 1.0],
                data2: [0.0, 0.0, 1.0, 1.0],
                ..Default::default()
            },
        },
        BackgroundEffect {
            name: "sky",
            shader: crate::shader::SKY,
            data: ComputePushConstants {
                data1: [0.1, 0.2, 0.4, 0.97],
                ..Default::default()
            },
        },
    ]
}

/// Set 0 of every effect: the draw image as a storage image at binding 0.
pub fn effect_layout_bindings() -> Vec<DescriptorSetLayoutBinding> {
    vec![DescriptorSetLayoutBinding {
        binding: 0,
        descriptor_type: DescriptorType::StorageImage,
        count: 1,
        stages: ShaderStages::COMPUTE,
    }]
}

pub fn effect_pipeline_descriptor(effect: &BackgroundEffect, spirv: Vec<u8>) -> ComputePipelineDescriptor {
    ComputePipelineDescriptor {
        label: Some(effect.name),
        shader_source: spirv,
        entry_point: "main".to_string(),
        layout_bindings: effect_layout_bindings(),
        push_constants: Some(PushConstantRange {
            stages: ShaderStages::COMPUTE,
            offset: 0,
            size: ComputePushConstants::SIZE,
        }),
    }
}
