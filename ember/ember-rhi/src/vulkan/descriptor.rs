//! Vulkan Descriptor Set Layout, Pool, and Set.

use crate::{
    Buffer, DescriptorPool, DescriptorPoolDescriptor, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutBinding, DescriptorType, RhiError, RhiResult, ShaderStages, Texture,
};
use ash::vk;

use super::texture_view;

pub struct VulkanDescriptorSetLayout {
    pub device: ash::Device,
    pub layout: vk::DescriptorSetLayout,
    /// Bindings used to create this layout; sets use them to know the descriptor type per binding.
    pub bindings: Vec<DescriptorSetLayoutBinding>,
}

impl Drop for VulkanDescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

impl std::fmt::Debug for VulkanDescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDescriptorSetLayout").finish()
    }
}

impl DescriptorSetLayout for VulkanDescriptorSetLayout {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub fn descriptor_type_to_vk(t: DescriptorType) -> vk::DescriptorType {
    match t {
        DescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
    }
}

pub fn create_descriptor_set_layout(
    device: &ash::Device,
    bindings: &[DescriptorSetLayoutBinding],
) -> RhiResult<VulkanDescriptorSetLayout> {
    let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
        .iter()
        .map(|b| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(b.binding)
                .descriptor_type(descriptor_type_to_vk(b.descriptor_type))
                .descriptor_count(b.count)
                .stage_flags(shader_stages_to_vk(b.stages))
        })
        .collect();
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
    let layout = unsafe {
        device
            .create_descriptor_set_layout(&create_info, None)
            .map_err(|e| RhiError::Backend(format!("create_descriptor_set_layout: {:?}", e)))?
    };
    Ok(VulkanDescriptorSetLayout {
        device: device.clone(),
        layout,
        bindings: bindings.to_vec(),
    })
}

const DEFAULT_POOL_MULTIPLIER: u32 = 4;

pub fn create_descriptor_pool(
    device: &ash::Device,
    desc: &DescriptorPoolDescriptor,
) -> RhiResult<VulkanDescriptorPool> {
    let pool_sizes: Vec<vk::DescriptorPoolSize> = if desc.pool_ratios.is_empty() {
        [
            DescriptorType::UniformBuffer,
            DescriptorType::StorageBuffer,
            DescriptorType::StorageImage,
        ]
        .iter()
        .map(|ty| {
            vk::DescriptorPoolSize::default()
                .ty(descriptor_type_to_vk(*ty))
                .descriptor_count(desc.max_sets * DEFAULT_POOL_MULTIPLIER)
        })
        .collect()
    } else {
        desc.pool_ratios
            .iter()
            .map(|(ty, ratio)| {
                vk::DescriptorPoolSize::default()
                    .ty(descriptor_type_to_vk(*ty))
                    .descriptor_count(((desc.max_sets as f32 * ratio).ceil() as u32).max(1))
            })
            .collect()
    };
    let create_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(desc.max_sets)
        .pool_sizes(&pool_sizes);
    let pool = unsafe {
        device
            .create_descriptor_pool(&create_info, None)
            .map_err(|e| RhiError::Backend(format!("create_descriptor_pool: {:?}", e)))?
    };
    Ok(VulkanDescriptorPool {
        device: device.clone(),
        pool,
        max_sets: desc.max_sets,
    })
}

pub fn shader_stages_to_vk(s: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if s.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if s.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if s.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

pub struct VulkanDescriptorPool {
    pub device: ash::Device,
    pub pool: vk::DescriptorPool,
    pub max_sets: u32,
}

impl Drop for VulkanDescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

impl std::fmt::Debug for VulkanDescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDescriptorPool")
            .field("max_sets", &self.max_sets)
            .finish()
    }
}

impl DescriptorPool for VulkanDescriptorPool {
    fn allocate_set(&self, layout: &dyn DescriptorSetLayout) -> RhiResult<Box<dyn DescriptorSet>> {
        let vk_layout = layout
            .as_any()
            .downcast_ref::<VulkanDescriptorSetLayout>()
            .ok_or_else(|| RhiError::InvalidArgument("layout must be VulkanDescriptorSetLayout".to_string()))?;
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(std::slice::from_ref(&vk_layout.layout));
        let sets = unsafe {
            self.device.allocate_descriptor_sets(&alloc_info).map_err(|e| match e {
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                    RhiError::OutOfMemory
                }
                other => RhiError::Backend(format!("allocate_descriptor_sets: {:?}", other)),
            })?
        };
        let set = sets
            .first()
            .copied()
            .ok_or_else(|| RhiError::Backend("allocate_descriptor_sets returned no set".to_string()))?;
        Ok(Box::new(VulkanDescriptorSet {
            device: self.device.clone(),
            set,
            bindings: vk_layout.bindings.clone(),
        }))
    }

    fn reset(&self) -> RhiResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())
                .map_err(|e| RhiError::Backend(format!("reset_descriptor_pool: {:?}", e)))
        }
    }
}

/// Freed with its pool; there is no per-set destruction.
pub struct VulkanDescriptorSet {
    pub device: ash::Device,
    pub set: vk::DescriptorSet,
    bindings: Vec<DescriptorSetLayoutBinding>,
}

impl std::fmt::Debug for VulkanDescriptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDescriptorSet").finish()
    }
}

impl VulkanDescriptorSet {
    fn descriptor_type_for_binding(&self, binding: u32) -> RhiResult<DescriptorType> {
        self.bindings
            .iter()
            .find(|b| b.binding == binding)
            .map(|b| b.descriptor_type)
            .ok_or_else(|| RhiError::InvalidArgument(format!("binding {} not found in layout", binding)))
    }
}

impl DescriptorSet for VulkanDescriptorSet {
    fn write_buffer(&mut self, binding: u32, buffer: &dyn Buffer, offset: u64, size: u64) -> RhiResult<()> {
        let vk_ty = descriptor_type_to_vk(self.descriptor_type_for_binding(binding)?);
        let vk_buf = buffer
            .as_any()
            .downcast_ref::<super::buffer::VulkanBuffer>()
            .ok_or_else(|| RhiError::InvalidArgument("buffer must be VulkanBuffer".to_string()))?;
        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(vk_buf.buffer)
            .offset(offset)
            .range(if size > 0 { size } else { vk::WHOLE_SIZE });
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(binding)
            .descriptor_type(vk_ty)
            .buffer_info(std::slice::from_ref(&buffer_info));
        unsafe {
            self.device.update_descriptor_sets(&[write], &[]);
        }
        Ok(())
    }

    fn write_storage_image(&mut self, binding: u32, texture: &dyn Texture) -> RhiResult<()> {
        let ty = self.descriptor_type_for_binding(binding)?;
        if ty != DescriptorType::StorageImage {
            return Err(RhiError::InvalidArgument(format!(
                "binding {} is {:?}, not a storage image",
                binding, ty
            )));
        }
        let image_info = vk::DescriptorImageInfo::default()
            .image_view(texture_view(texture)?)
            .image_layout(vk::ImageLayout::GENERAL);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(std::slice::from_ref(&image_info));
        unsafe {
            self.device.update_descriptor_sets(&[write], &[]);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
