//! Vulkan Buffer implementation.

use crate::{Buffer, ResourceId};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use std::sync::Arc;

use super::memory::SharedAllocator;

pub struct VulkanBuffer {
    pub(crate) device: Arc<ash::Device>,
    pub(crate) allocator: SharedAllocator,
    pub(crate) buffer: vk::Buffer,
    pub(crate) allocation: Option<Allocation>,
    pub(crate) size: u64,
    pub(crate) id: ResourceId,
    pub(crate) label: Option<&'static str>,
    pub(crate) host_visible: bool,
    pub(crate) device_address: Option<u64>,
}

impl VulkanBuffer {
    /// Start of the persistent mapping of a host-visible buffer.
    pub(crate) fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr().cast::<u8>())
    }

    pub(crate) fn mapped_slice(&self) -> Option<&[u8]> {
        self.allocation.as_ref().and_then(|a| a.mapped_slice())
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.allocator.free(allocation);
        }
    }
}

impl std::fmt::Debug for VulkanBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBuffer")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("size", &self.size)
            .finish()
    }
}

impl Buffer for VulkanBuffer {
    fn id(&self) -> ResourceId {
        self.id
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn label(&self) -> Option<&'static str> {
        self.label
    }
    fn host_visible(&self) -> bool {
        self.host_visible
    }
    fn device_address(&self) -> Option<u64> {
        self.device_address
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
