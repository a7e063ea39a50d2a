//! Vulkan swapchain: FIFO presentation, transfer-destination capable images.

use crate::{ResourceId, RhiError, RhiResult, Semaphore, Swapchain, Texture, TextureFormat};
use ash::khr::swapchain::Device as SwapchainDevice;
use ash::vk;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::texture::{full_subresource_range, texture_format_to_vk};
use super::{map_vk_error, SurfaceState, VulkanSemaphore};

/// Swapchain image wrapper: implements Texture for use as blit target and color attachment.
/// Does not own the VkImage (the swapchain does).
pub struct VulkanSwapchainImage {
    pub(crate) device: Arc<ash::Device>,
    pub(crate) image: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) format: TextureFormat,
    pub(crate) extent: (u32, u32),
    pub(crate) id: ResourceId,
}

impl Drop for VulkanSwapchainImage {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
        }
    }
}

impl std::fmt::Debug for VulkanSwapchainImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSwapchainImage")
            .field("id", &self.id)
            .field("extent", &self.extent)
            .finish()
    }
}

impl Texture for VulkanSwapchainImage {
    fn id(&self) -> ResourceId {
        self.id
    }
    fn format(&self) -> TextureFormat {
        self.format
    }
    fn size(&self) -> (u32, u32, u32) {
        (self.extent.0, self.extent.1, 1)
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct VulkanSwapchain {
    swapchain_loader: SwapchainDevice,
    swapchain: vk::SwapchainKHR,
    images: Vec<VulkanSwapchainImage>,
    queue: vk::Queue,
    extent: (u32, u32),
    format: TextureFormat,
}

impl VulkanSwapchain {
    pub(crate) fn create(
        device: &Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
        state: &SurfaceState,
        queue: vk::Queue,
        extent: (u32, u32),
        format: TextureFormat,
        next_id: &AtomicU64,
    ) -> RhiResult<Self> {
        let caps = unsafe {
            state
                .surface_loader
                .get_physical_device_surface_capabilities(physical_device, state.surface)
                .map_err(map_vk_error("get_physical_device_surface_capabilities"))?
        };
        let extent_vk = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: extent.0.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: extent.1.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };
        if extent_vk.width == 0 || extent_vk.height == 0 {
            return Err(RhiError::InvalidArgument("surface has zero extent".to_string()));
        }
        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 {
            image_count = image_count.min(caps.max_image_count);
        }

        let vk_format = texture_format_to_vk(format);
        let formats = unsafe {
            state
                .surface_loader
                .get_physical_device_surface_formats(physical_device, state.surface)
                .map_err(map_vk_error("get_physical_device_surface_formats"))?
        };
        let surface_format = formats
            .iter()
            .copied()
            .find(|f| f.format == vk_format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .ok_or_else(|| RhiError::Unsupported(format!("surface format {:?}", format)))?;

        // FIFO is always available and vsynced.
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(state.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent_vk)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true);
        let swapchain = unsafe {
            state
                .swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(map_vk_error("create_swapchain"))?
        };

        let mut chain = Self {
            swapchain_loader: state.swapchain_loader.clone(),
            swapchain,
            images: Vec::new(),
            queue,
            extent: (extent_vk.width, extent_vk.height),
            format,
        };
        // From here on Drop cleans up partially built chains.
        let vk_images = unsafe {
            chain
                .swapchain_loader
                .get_swapchain_images(swapchain)
                .map_err(map_vk_error("get_swapchain_images"))?
        };
        for image in vk_images {
            let view_create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(vk_format)
                .subresource_range(full_subresource_range(format));
            let view = unsafe {
                device
                    .create_image_view(&view_create_info, None)
                    .map_err(map_vk_error("create_image_view"))?
            };
            chain.images.push(VulkanSwapchainImage {
                device: Arc::clone(device),
                image,
                view,
                format,
                extent: chain.extent,
                id: next_id.fetch_add(1, Ordering::Relaxed),
            });
        }
        log::info!(
            target: "vulkan",
            "swapchain created: {}x{}, {} images, {:?}",
            chain.extent.0,
            chain.extent.1,
            chain.images.len(),
            format
        );
        Ok(chain)
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        self.images.clear(); // destroy image views
        unsafe {
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

impl std::fmt::Debug for VulkanSwapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSwapchain")
            .field("extent", &self.extent)
            .field("image_count", &self.images.len())
            .finish()
    }
}

fn vk_semaphore(s: &dyn Semaphore) -> RhiResult<vk::Semaphore> {
    s.as_any()
        .downcast_ref::<VulkanSemaphore>()
        .map(|vs| vs.semaphore)
        .ok_or_else(|| RhiError::InvalidArgument("semaphore must be VulkanSemaphore".to_string()))
}

impl Swapchain for VulkanSwapchain {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn acquire_next_image(&mut self, signal: &dyn Semaphore, timeout_ns: u64) -> RhiResult<u32> {
        let semaphore = vk_semaphore(signal)?;
        // A suboptimal chain still presents correctly; only OUT_OF_DATE forces a rebuild.
        let (index, _suboptimal) = unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, timeout_ns, semaphore, vk::Fence::null())
                .map_err(map_vk_error("acquire_next_image"))?
        };
        Ok(index)
    }

    fn image(&self, index: u32) -> Option<&dyn Texture> {
        self.images.get(index as usize).map(|i| i as &dyn Texture)
    }

    fn present(&self, image_index: u32, wait: &dyn Semaphore) -> RhiResult<()> {
        let wait_semas = [vk_semaphore(wait)?];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semas)
            .swapchains(std::slice::from_ref(&self.swapchain))
            .image_indices(&image_indices);
        unsafe {
            self.swapchain_loader
                .queue_present(self.queue, &present_info)
                .map_err(map_vk_error("queue_present"))?;
        }
        Ok(())
    }

    fn extent(&self) -> (u32, u32) {
        self.extent
    }

    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn format(&self) -> TextureFormat {
        self.format
    }
}
