//! Vulkan 1.3 backend for Ember RHI.
//! Dynamic rendering and synchronization2 throughout; memory comes from `gpu-allocator`.

mod buffer;
mod descriptor;
mod memory;
mod pipeline;
mod queue;
mod render_pass;
mod swapchain;
mod texture;

use crate::{
    Buffer, BufferDescriptor, BufferMemoryPreference, BufferUsage, CommandContext,
    CommandEncoder, ComputePass, ComputePipelineDescriptor, DescriptorPool,
    DescriptorPoolDescriptor, DescriptorSetLayout, DescriptorSetLayoutBinding, Device, Fence,
    GraphicsPipelineDescriptor, ImageLayout, RenderPassDescriptor, ResourceId, RhiError,
    RhiResult, Semaphore, Texture, TextureDescriptor, TextureFormat,
};
use ash::vk;
use gpu_allocator::MemoryLocation;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_void, CStr};
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use buffer::VulkanBuffer;
pub use descriptor::{VulkanDescriptorPool, VulkanDescriptorSet, VulkanDescriptorSetLayout};
pub use pipeline::{VulkanComputePipeline, VulkanGraphicsPipeline};
pub use render_pass::VulkanRenderPassRecorder;
pub use swapchain::{VulkanSwapchain, VulkanSwapchainImage};
pub use texture::VulkanTexture;

use memory::SharedAllocator;
use texture::aspect_for_format;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const APP_NAME: &CStr = c"Ember";

/// Map a failed Vulkan call to an [`RhiError`], keeping the call name for diagnostics.
pub(crate) fn map_vk_error(op: &'static str) -> impl Fn(vk::Result) -> RhiError {
    move |result| match result {
        vk::Result::ERROR_OUT_OF_DATE_KHR => RhiError::OutOfDate,
        vk::Result::TIMEOUT => RhiError::Timeout,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            RhiError::OutOfMemory
        }
        other => RhiError::Backend(format!("{}: {:?}", op, other)),
    }
}

pub(crate) fn texture_view(texture: &dyn Texture) -> RhiResult<vk::ImageView> {
    if let Some(t) = texture.as_any().downcast_ref::<VulkanTexture>() {
        return Ok(t.view);
    }
    if let Some(s) = texture.as_any().downcast_ref::<VulkanSwapchainImage>() {
        return Ok(s.view);
    }
    Err(RhiError::InvalidArgument(
        "texture must be VulkanTexture or VulkanSwapchainImage".to_string(),
    ))
}

pub(crate) fn texture_image(texture: &dyn Texture) -> RhiResult<vk::Image> {
    if let Some(t) = texture.as_any().downcast_ref::<VulkanTexture>() {
        return Ok(t.image);
    }
    if let Some(s) = texture.as_any().downcast_ref::<VulkanSwapchainImage>() {
        return Ok(s.image);
    }
    Err(RhiError::InvalidArgument(
        "texture must be VulkanTexture or VulkanSwapchainImage".to_string(),
    ))
}

fn image_layout_to_vk(l: ImageLayout) -> vk::ImageLayout {
    match l {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthAttachment => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

fn buffer_usage_to_vk(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::DEVICE_ADDRESS) {
        flags |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    flags
}

unsafe extern "system" fn vulkan_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() || (*callback_data).p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*callback_data).p_message).to_string_lossy()
    };
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!(target: "vulkan", "[{:?}] {}", message_type, message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!(target: "vulkan", "[{:?}] {}", message_type, message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::debug!(target: "vulkan", "[{:?}] {}", message_type, message);
    } else {
        log::trace!(target: "vulkan", "[{:?}] {}", message_type, message);
    }
    vk::FALSE
}

/// Surface plus the loaders needed to build swapchains on it.
pub(crate) struct SurfaceState {
    pub(crate) surface: vk::SurfaceKHR,
    pub(crate) surface_loader: ash::khr::surface::Instance,
    pub(crate) swapchain_loader: ash::khr::swapchain::Device,
}

struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

/// Instance-level objects that exist before a logical device does.
struct InstanceParts {
    entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    surface: Option<(vk::SurfaceKHR, ash::khr::surface::Instance)>,
}

impl InstanceParts {
    /// Tear down in reverse creation order; used when device creation fails.
    fn destroy(self) {
        unsafe {
            if let Some((surface, loader)) = &self.surface {
                loader.destroy_surface(*surface, None);
            }
            if let Some(debug) = &self.debug {
                debug.loader.destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Physical device and queue family chosen for rendering.
struct Selection {
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    name: String,
}

pub struct VulkanDevice {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    surface_state: Option<SurfaceState>,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    queue: vk::Queue,
    queue_family_index: u32,
    allocator: ManuallyDrop<SharedAllocator>,
    next_id: AtomicU64,
}

impl VulkanDevice {
    /// Create an offscreen device (no surface, swapchain creation is unsupported).
    pub fn new(validation: bool) -> RhiResult<Arc<Self>> {
        let parts = Self::create_instance(&[], validation)?;
        Self::finish(parts)
    }

    /// Create a device that can present to the given window.
    pub fn new_with_window(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        validation: bool,
    ) -> RhiResult<Arc<Self>> {
        let surface_exts = ash_window::enumerate_required_extensions(display)
            .map_err(map_vk_error("enumerate_required_extensions"))?;
        let mut parts = Self::create_instance(surface_exts, validation)?;
        let surface = unsafe {
            ash_window::create_surface(&parts.entry, &parts.instance, display, window, None)
        };
        match surface {
            Ok(surface) => {
                let loader = ash::khr::surface::Instance::new(&parts.entry, &parts.instance);
                parts.surface = Some((surface, loader));
            }
            Err(e) => {
                parts.destroy();
                return Err(map_vk_error("create_surface")(e));
            }
        }
        Self::finish(parts)
    }

    fn create_instance(
        required_extensions: &[*const std::ffi::c_char],
        validation: bool,
    ) -> RhiResult<InstanceParts> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| RhiError::Unsupported(format!("Vulkan loader: {}", e)))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .engine_name(APP_NAME)
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = required_extensions.to_vec();
        let mut layers = Vec::new();
        let validation = validation && {
            let available = unsafe { entry.enumerate_instance_layer_properties() }
                .map_err(map_vk_error("enumerate_instance_layer_properties"))?;
            let found = available
                .iter()
                .any(|l| l.layer_name_as_c_str().map(|n| n == VALIDATION_LAYER).unwrap_or(false));
            if !found {
                log::warn!(target: "vulkan", "validation requested but {:?} is not installed", VALIDATION_LAYER);
            }
            found
        };
        if validation {
            layers.push(VALIDATION_LAYER.as_ptr());
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(map_vk_error("create_instance"))?;

        let debug = if validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));
            match unsafe { loader.create_debug_utils_messenger(&info, None) } {
                Ok(messenger) => Some(DebugMessenger { loader, messenger }),
                Err(e) => {
                    log::warn!(target: "vulkan", "debug messenger unavailable: {:?}", e);
                    None
                }
            }
        } else {
            None
        };
        log::info!(target: "vulkan", "instance created (validation: {})", debug.is_some());
        Ok(InstanceParts {
            entry,
            instance,
            debug,
            surface: None,
        })
    }

    fn finish(parts: InstanceParts) -> RhiResult<Arc<Self>> {
        let selection = match Self::select_physical_device(&parts) {
            Ok(s) => s,
            Err(e) => {
                parts.destroy();
                return Err(e);
            }
        };
        let device = match Self::create_logical_device(&parts, &selection) {
            Ok(d) => d,
            Err(e) => {
                parts.destroy();
                return Err(e);
            }
        };
        let allocator =
            match SharedAllocator::new(&parts.instance, &device, selection.physical_device) {
                Ok(a) => a,
                Err(e) => {
                    unsafe { device.destroy_device(None) };
                    parts.destroy();
                    return Err(e);
                }
            };
        let queue = unsafe { device.get_device_queue(selection.queue_family_index, 0) };
        let InstanceParts {
            entry,
            instance,
            debug,
            surface,
        } = parts;
        let surface_state = surface.map(|(surface, surface_loader)| SurfaceState {
            surface,
            surface_loader,
            swapchain_loader: ash::khr::swapchain::Device::new(&instance, &device),
        });
        log::info!(
            target: "vulkan",
            "using {} (queue family {})",
            selection.name,
            selection.queue_family_index
        );
        Ok(Arc::new(Self {
            _entry: entry,
            instance,
            debug,
            surface_state,
            physical_device: selection.physical_device,
            device: Arc::new(device),
            queue,
            queue_family_index: selection.queue_family_index,
            allocator: ManuallyDrop::new(allocator),
            next_id: AtomicU64::new(1),
        }))
    }

    /// Pick a 1.3 device with the required features and a graphics (+present) queue; prefer discrete GPUs.
    fn select_physical_device(parts: &InstanceParts) -> RhiResult<Selection> {
        let instance = &parts.instance;
        let candidates = unsafe { instance.enumerate_physical_devices() }
            .map_err(map_vk_error("enumerate_physical_devices"))?;
        let mut best: Option<(u32, Selection)> = None;
        for physical_device in candidates {
            let props = unsafe { instance.get_physical_device_properties(physical_device) };
            let name = props
                .device_name_as_c_str()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown device".to_string());
            if props.api_version < vk::API_VERSION_1_3 {
                log::debug!(target: "vulkan", "skipping {}: Vulkan 1.3 not supported", name);
                continue;
            }
            if !Self::supports_required_features(instance, physical_device) {
                log::debug!(target: "vulkan", "skipping {}: missing required features", name);
                continue;
            }
            let families =
                unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
            let family = families.iter().enumerate().find_map(|(i, p)| {
                let index = i as u32;
                let graphics = p.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
                let present = match &parts.surface {
                    Some((surface, loader)) => unsafe {
                        loader
                            .get_physical_device_surface_support(physical_device, index, *surface)
                            .unwrap_or(false)
                    },
                    None => true,
                };
                (graphics && present).then_some(index)
            });
            let Some(queue_family_index) = family else {
                log::debug!(target: "vulkan", "skipping {}: no graphics+present queue", name);
                continue;
            };
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 3,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
                vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
                _ => 0,
            };
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((
                    score,
                    Selection {
                        physical_device,
                        queue_family_index,
                        name,
                    },
                ));
            }
        }
        best.map(|(_, s)| s).ok_or_else(|| {
            RhiError::Unsupported(
                "no GPU with Vulkan 1.3, dynamic rendering, synchronization2 and buffer device address"
                    .to_string(),
            )
        })
    }

    fn supports_required_features(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> bool {
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        {
            let mut features2 = vk::PhysicalDeviceFeatures2::default()
                .push_next(&mut features12)
                .push_next(&mut features13);
            unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        }
        features13.dynamic_rendering == vk::TRUE
            && features13.synchronization2 == vk::TRUE
            && features12.buffer_device_address == vk::TRUE
            && features12.descriptor_indexing == vk::TRUE
    }

    fn create_logical_device(parts: &InstanceParts, selection: &Selection) -> RhiResult<ash::Device> {
        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(selection.queue_family_index)
            .queue_priorities(&priorities);
        let mut extensions = Vec::new();
        if parts.surface.is_some() {
            extensions.push(ash::khr::swapchain::NAME.as_ptr());
        }
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&extensions)
            .push_next(&mut features12)
            .push_next(&mut features13);
        unsafe {
            parts
                .instance
                .create_device(selection.physical_device, &create_info, None)
                .map_err(map_vk_error("create_device"))
        }
    }

    fn next_id(&self) -> ResourceId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn has_surface(&self) -> bool {
        self.surface_state.is_some()
    }

    fn vk_buffer<'b>(buffer: &'b dyn Buffer) -> RhiResult<&'b VulkanBuffer> {
        buffer
            .as_any()
            .downcast_ref::<VulkanBuffer>()
            .ok_or_else(|| RhiError::InvalidArgument("buffer must be VulkanBuffer".to_string()))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!(target: "vulkan", "device_wait_idle during teardown: {:?}", e);
            }
        }
        let owners = self.allocator.outstanding_owners();
        if owners > 1 {
            log::warn!(
                target: "vulkan",
                "{} GPU resources still alive at device teardown",
                owners - 1
            );
        }
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            if let Some(s) = &self.surface_state {
                s.surface_loader.destroy_surface(s.surface, None);
            }
            if let Some(debug) = &self.debug {
                debug.loader.destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        log::info!(target: "vulkan", "device destroyed");
    }
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("queue_family_index", &self.queue_family_index)
            .field("surface", &self.surface_state.is_some())
            .finish_non_exhaustive()
    }
}

impl Device for VulkanDevice {
    fn create_buffer(&self, desc: &BufferDescriptor) -> RhiResult<Box<dyn Buffer>> {
        if desc.size == 0 {
            return Err(RhiError::InvalidArgument("buffer size must be non-zero".to_string()));
        }
        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(buffer_usage_to_vk(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&create_info, None) }
            .map_err(map_vk_error("create_buffer"))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let host_visible = desc.memory == BufferMemoryPreference::HostVisible;
        let location = if host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation = match self.allocator.allocate(
            desc.label.unwrap_or("buffer"),
            requirements,
            location,
            true,
        ) {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.allocator.free(allocation);
            return Err(map_vk_error("bind_buffer_memory")(e));
        }
        let device_address = desc.usage.contains(BufferUsage::DEVICE_ADDRESS).then(|| unsafe {
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        });
        let id = self.next_id();
        log::trace!(target: "vulkan", "buffer {} '{}' created ({} bytes)", id, desc.label.unwrap_or("buffer"), desc.size);
        Ok(Box::new(VulkanBuffer {
            device: Arc::clone(&self.device),
            allocator: (*self.allocator).clone(),
            buffer,
            allocation: Some(allocation),
            size: desc.size,
            id,
            label: desc.label,
            host_visible,
            device_address,
        }))
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> RhiResult<Box<dyn Texture>> {
        let tex = texture::create_texture(Arc::clone(&self.device), &self.allocator, desc, self.next_id())?;
        Ok(Box::new(tex))
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor,
    ) -> RhiResult<Box<dyn crate::ComputePipeline>> {
        Ok(Box::new(VulkanComputePipeline::create(&self.device, desc)?))
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor,
    ) -> RhiResult<Box<dyn crate::GraphicsPipeline>> {
        Ok(Box::new(VulkanGraphicsPipeline::create(&self.device, desc)?))
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> RhiResult<Box<dyn DescriptorSetLayout>> {
        Ok(Box::new(descriptor::create_descriptor_set_layout(&self.device, bindings)?))
    }

    fn create_descriptor_pool(
        &self,
        desc: &DescriptorPoolDescriptor,
    ) -> RhiResult<Box<dyn DescriptorPool>> {
        Ok(Box::new(descriptor::create_descriptor_pool(&self.device, desc)?))
    }

    fn create_command_context(&self) -> RhiResult<Box<dyn CommandContext>> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { self.device.create_command_pool(&pool_info, None) }
            .map_err(map_vk_error("create_command_pool"))?;
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = match unsafe { self.device.allocate_command_buffers(&allocate_info) } {
            Ok(buffers) if !buffers.is_empty() => buffers[0],
            Ok(_) => {
                unsafe { self.device.destroy_command_pool(pool, None) };
                return Err(RhiError::Backend("allocate_command_buffers returned nothing".to_string()));
            }
            Err(e) => {
                unsafe { self.device.destroy_command_pool(pool, None) };
                return Err(map_vk_error("allocate_command_buffers")(e));
            }
        };
        Ok(Box::new(VulkanCommandContext {
            pool,
            buffer,
            encoder: VulkanCommandEncoder {
                device: Arc::clone(&self.device),
                buffer,
            },
        }))
    }

    fn queue(&self) -> RhiResult<Box<dyn crate::Queue>> {
        Ok(Box::new(queue::VulkanQueue::new(Arc::clone(&self.device), self.queue)))
    }

    fn write_buffer(&self, buffer: &dyn Buffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let vk_buf = Self::vk_buffer(buffer)?;
        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > vk_buf.size) {
            return Err(RhiError::InvalidArgument(format!(
                "write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                vk_buf.size
            )));
        }
        let ptr = vk_buf.mapped_ptr().ok_or_else(|| {
            RhiError::InvalidArgument("write_buffer needs a host-visible buffer".to_string())
        })?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: &dyn Buffer, offset: u64, len: u64) -> RhiResult<Vec<u8>> {
        let vk_buf = Self::vk_buffer(buffer)?;
        let mapped = vk_buf.mapped_slice().ok_or_else(|| {
            RhiError::InvalidArgument("read_buffer needs a host-visible buffer".to_string())
        })?;
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|end| *end as u64 <= vk_buf.size)
            .ok_or_else(|| RhiError::InvalidArgument("read past end of buffer".to_string()))?;
        Ok(mapped[start..end].to_vec())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(map_vk_error("device_wait_idle"))
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<Box<dyn Fence>> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
        .map_err(map_vk_error("create_fence"))?;
        Ok(Box::new(VulkanFence {
            device: Arc::clone(&self.device),
            fence,
            id: self.next_id(),
        }))
    }

    fn create_semaphore(&self) -> RhiResult<Box<dyn Semaphore>> {
        let semaphore = unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .map_err(map_vk_error("create_semaphore"))?;
        Ok(Box::new(VulkanSemaphore {
            device: Arc::clone(&self.device),
            semaphore,
        }))
    }

    fn create_swapchain(
        &self,
        extent: (u32, u32),
        format: TextureFormat,
    ) -> RhiResult<Box<dyn crate::Swapchain>> {
        let state = self.surface_state.as_ref().ok_or_else(|| {
            RhiError::Unsupported("swapchain (device created without surface)".to_string())
        })?;
        let chain = VulkanSwapchain::create(
            &self.device,
            self.physical_device,
            state,
            self.queue,
            extent,
            format,
            &self.next_id,
        )?;
        Ok(Box::new(chain))
    }
}

/// One command pool with one primary buffer. `begin` resets the whole pool.
pub struct VulkanCommandContext {
    pool: vk::CommandPool,
    pub(crate) buffer: vk::CommandBuffer,
    encoder: VulkanCommandEncoder,
}

impl Drop for VulkanCommandContext {
    fn drop(&mut self) {
        unsafe {
            self.encoder.device.destroy_command_pool(self.pool, None);
        }
    }
}

impl std::fmt::Debug for VulkanCommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanCommandContext").finish_non_exhaustive()
    }
}

impl CommandContext for VulkanCommandContext {
    fn begin(&mut self) -> RhiResult<()> {
        let device = &self.encoder.device;
        unsafe {
            device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
                .map_err(map_vk_error("reset_command_pool"))?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(self.buffer, &begin_info)
                .map_err(map_vk_error("begin_command_buffer"))
        }
    }

    fn encoder(&mut self) -> &mut dyn CommandEncoder {
        &mut self.encoder
    }

    fn end(&mut self) -> RhiResult<()> {
        unsafe { self.encoder.device.end_command_buffer(self.buffer) }
            .map_err(map_vk_error("end_command_buffer"))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct VulkanCommandEncoder {
    device: Arc<ash::Device>,
    buffer: vk::CommandBuffer,
}

impl std::fmt::Debug for VulkanCommandEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanCommandEncoder").finish()
    }
}

fn color_layers(format: TextureFormat) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(aspect_for_format(format))
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1)
}

impl CommandEncoder for VulkanCommandEncoder {
    fn begin_compute_pass(&mut self) -> Box<dyn ComputePass + '_> {
        Box::new(VulkanComputePass {
            device: Arc::clone(&self.device),
            buffer: self.buffer,
            pipeline_layout: None,
            push_stages: vk::ShaderStageFlags::empty(),
        })
    }

    fn begin_render_pass<'a>(
        &mut self,
        desc: &RenderPassDescriptor<'a>,
    ) -> RhiResult<Box<dyn crate::RenderPass + '_>> {
        let recorder = render_pass::begin_rendering(&self.device, self.buffer, desc)?;
        Ok(Box::new(recorder))
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: &dyn Buffer,
        src_offset: u64,
        dst: &dyn Buffer,
        dst_offset: u64,
        size: u64,
    ) -> RhiResult<()> {
        let src_buf = VulkanDevice::vk_buffer(src)?;
        let dst_buf = VulkanDevice::vk_buffer(dst)?;
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        unsafe {
            self.device
                .cmd_copy_buffer(self.buffer, src_buf.buffer, dst_buf.buffer, &[region]);
        }
        Ok(())
    }

    fn blit_texture(
        &mut self,
        src: &dyn Texture,
        src_extent: (u32, u32),
        dst: &dyn Texture,
        dst_extent: (u32, u32),
    ) -> RhiResult<()> {
        let corner = |(w, h): (u32, u32)| {
            [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D { x: w as i32, y: h as i32, z: 1 },
            ]
        };
        let region = vk::ImageBlit2::default()
            .src_subresource(color_layers(src.format()))
            .src_offsets(corner(src_extent))
            .dst_subresource(color_layers(dst.format()))
            .dst_offsets(corner(dst_extent));
        let blit_info = vk::BlitImageInfo2::default()
            .src_image(texture_image(src)?)
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_image(texture_image(dst)?)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .filter(vk::Filter::LINEAR)
            .regions(std::slice::from_ref(&region));
        unsafe {
            self.device.cmd_blit_image2(self.buffer, &blit_info);
        }
        Ok(())
    }

    fn pipeline_barrier_texture(
        &mut self,
        texture: &dyn Texture,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) -> RhiResult<()> {
        // Coarse ALL_COMMANDS barrier; a handful per frame is cheap enough.
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
            .old_layout(image_layout_to_vk(old_layout))
            .new_layout(image_layout_to_vk(new_layout))
            .image(texture_image(texture)?)
            .subresource_range(texture::full_subresource_range(texture.format()));
        let dependency =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            self.device.cmd_pipeline_barrier2(self.buffer, &dependency);
        }
        Ok(())
    }
}

struct VulkanComputePass {
    device: Arc<ash::Device>,
    buffer: vk::CommandBuffer,
    pipeline_layout: Option<vk::PipelineLayout>,
    push_stages: vk::ShaderStageFlags,
}

impl std::fmt::Debug for VulkanComputePass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanComputePass").finish()
    }
}

impl ComputePass for VulkanComputePass {
    fn set_pipeline(&mut self, pipeline: &dyn crate::ComputePipeline) {
        if let Some(vk_pipe) = pipeline.as_any().downcast_ref::<VulkanComputePipeline>() {
            unsafe {
                self.device
                    .cmd_bind_pipeline(self.buffer, vk::PipelineBindPoint::COMPUTE, vk_pipe.pipeline);
            }
            self.pipeline_layout = Some(vk_pipe.layout);
            self.push_stages = vk_pipe.push_stages;
        }
    }

    fn bind_descriptor_set(&mut self, set_index: u32, set: &dyn crate::DescriptorSet) {
        if let (Some(layout), Some(vk_set)) = (
            self.pipeline_layout,
            set.as_any().downcast_ref::<VulkanDescriptorSet>(),
        ) {
            unsafe {
                self.device.cmd_bind_descriptor_sets(
                    self.buffer,
                    vk::PipelineBindPoint::COMPUTE,
                    layout,
                    set_index,
                    &[vk_set.set],
                    &[],
                );
            }
        }
    }

    fn set_push_constants(&mut self, data: &[u8]) {
        if let Some(layout) = self.pipeline_layout {
            unsafe {
                self.device
                    .cmd_push_constants(self.buffer, layout, self.push_stages, 0, data);
            }
        }
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe {
            self.device.cmd_dispatch(self.buffer, x, y, z);
        }
    }
}

pub(crate) struct VulkanFence {
    device: Arc<ash::Device>,
    pub(crate) fence: vk::Fence,
    id: ResourceId,
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

impl std::fmt::Debug for VulkanFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanFence").field("id", &self.id).finish()
    }
}

impl Fence for VulkanFence {
    fn wait(&self, timeout_ns: u64) -> RhiResult<()> {
        unsafe { self.device.wait_for_fences(&[self.fence], true, timeout_ns) }
            .map_err(map_vk_error("wait_for_fences"))
    }

    fn reset(&self) -> RhiResult<()> {
        unsafe { self.device.reset_fences(&[self.fence]) }.map_err(map_vk_error("reset_fences"))
    }

    fn is_signaled(&self) -> RhiResult<bool> {
        unsafe { self.device.get_fence_status(self.fence) }
            .map_err(map_vk_error("get_fence_status"))
    }

    fn id(&self) -> ResourceId {
        self.id
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub(crate) struct VulkanSemaphore {
    device: Arc<ash::Device>,
    pub(crate) semaphore: vk::Semaphore,
}

impl Drop for VulkanSemaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

impl std::fmt::Debug for VulkanSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSemaphore").finish()
    }
}

impl Semaphore for VulkanSemaphore {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_date_and_timeout_map_to_dedicated_errors() {
        assert_eq!(map_vk_error("x")(vk::Result::ERROR_OUT_OF_DATE_KHR), RhiError::OutOfDate);
        assert_eq!(map_vk_error("x")(vk::Result::TIMEOUT), RhiError::Timeout);
        assert_eq!(
            map_vk_error("x")(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            RhiError::OutOfMemory
        );
        assert!(matches!(
            map_vk_error("queue_submit2")(vk::Result::ERROR_DEVICE_LOST),
            RhiError::Backend(msg) if msg.starts_with("queue_submit2")
        ));
    }

    #[test]
    fn device_address_usage_requests_shader_device_address() {
        let flags = buffer_usage_to_vk(BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS);
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        assert!(flags.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(!flags.contains(vk::BufferUsageFlags::INDEX_BUFFER));
    }

    #[test]
    fn present_layout_maps_to_khr_layout() {
        assert_eq!(image_layout_to_vk(ImageLayout::PresentSrc), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(image_layout_to_vk(ImageLayout::General), vk::ImageLayout::GENERAL);
    }
}
