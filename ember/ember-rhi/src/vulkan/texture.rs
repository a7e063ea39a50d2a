//! Vulkan Texture: VkImage bound to allocator memory, plus a full-image view.

use crate::{ResourceId, RhiError, RhiResult, Texture, TextureDescriptor, TextureFormat, TextureUsage};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::memory::SharedAllocator;

/// Create a device-local 2D texture from descriptor.
pub fn create_texture(
    device: Arc<ash::Device>,
    allocator: &SharedAllocator,
    descriptor: &TextureDescriptor,
    id: ResourceId,
) -> RhiResult<VulkanTexture> {
    let (width, height, depth) = descriptor.size;
    let extent = vk::Extent3D {
        width: width.max(1),
        height: height.max(1),
        depth: depth.max(1),
    };
    let vk_format = texture_format_to_vk(descriptor.format);

    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(vk_format)
        .extent(extent)
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(texture_usage_to_vk(descriptor.usage, descriptor.format))
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe {
        device
            .create_image(&create_info, None)
            .map_err(|e| RhiError::Backend(format!("create_image: {:?}", e)))?
    };

    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let allocation = match allocator.allocate(
        descriptor.label.unwrap_or("texture"),
        requirements,
        MemoryLocation::GpuOnly,
        false,
    ) {
        Ok(a) => a,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            return Err(e);
        }
    };

    let bound = unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) };
    if let Err(e) = bound {
        unsafe { device.destroy_image(image, None) };
        allocator.free(allocation);
        return Err(RhiError::Backend(format!("bind_image_memory: {:?}", e)));
    }

    let view_create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(vk_format)
        .subresource_range(full_subresource_range(descriptor.format));

    let view = match unsafe { device.create_image_view(&view_create_info, None) } {
        Ok(v) => v,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            allocator.free(allocation);
            return Err(RhiError::Backend(format!("create_image_view: {:?}", e)));
        }
    };

    Ok(VulkanTexture {
        device,
        allocator: allocator.clone(),
        image,
        allocation: Some(allocation),
        view,
        format: descriptor.format,
        size: (extent.width, extent.height, extent.depth),
        id,
    })
}

pub struct VulkanTexture {
    pub(crate) device: Arc<ash::Device>,
    pub(crate) allocator: SharedAllocator,
    pub(crate) image: vk::Image,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) view: vk::ImageView,
    pub(crate) format: TextureFormat,
    pub(crate) size: (u32, u32, u32),
    pub(crate) id: ResourceId,
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.allocator.free(allocation);
        }
    }
}

impl std::fmt::Debug for VulkanTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanTexture")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("format", &self.format)
            .finish()
    }
}

impl Texture for VulkanTexture {
    fn id(&self) -> ResourceId {
        self.id
    }
    fn format(&self) -> TextureFormat {
        self.format
    }
    fn size(&self) -> (u32, u32, u32) {
        self.size
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub fn texture_format_to_vk(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::D32Float => vk::Format::D32_SFLOAT,
    }
}

pub fn texture_usage_to_vk(usage: TextureUsage, format: TextureFormat) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::COPY_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::STORAGE_BINDING) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        if format.is_depth() {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        } else {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
    }
    flags
}

pub fn aspect_for_format(format: TextureFormat) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub fn full_subresource_range(format: TextureFormat) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect_for_format(format))
        .base_mip_level(0)
        .level_count(vk::REMAINING_MIP_LEVELS)
        .base_array_layer(0)
        .layer_count(vk::REMAINING_ARRAY_LAYERS)
}
