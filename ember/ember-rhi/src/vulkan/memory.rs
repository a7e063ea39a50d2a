//! Vulkan memory management: every buffer and image allocation goes through one shared
//! `gpu-allocator` instance so create/destroy pairs keep its bookkeeping consistent.

use crate::{RhiError, RhiResult};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::sync::{Arc, Mutex, MutexGuard};

/// Device-wide sub-allocator. Cloned into every resource so it can free its own memory on drop.
#[derive(Clone)]
pub struct SharedAllocator {
    inner: Arc<Mutex<Allocator>>,
}

impl SharedAllocator {
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> RhiResult<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RhiError::Backend(format!("create allocator: {}", e)))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(allocator)),
        })
    }

    fn lock(&self) -> RhiResult<MutexGuard<'_, Allocator>> {
        self.inner
            .lock()
            .map_err(|_| RhiError::Backend("allocator lock poisoned".to_string()))
    }

    pub fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> RhiResult<Allocation> {
        self.lock()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                log::error!(target: "vulkan", "allocation '{}' ({} bytes) failed: {}", name, requirements.size, e);
                RhiError::OutOfMemory
            })
    }

    /// Free an allocation. Errors are logged; they only happen on bookkeeping corruption.
    pub fn free(&self, allocation: Allocation) {
        match self.lock() {
            Ok(mut allocator) => {
                if let Err(e) = allocator.free(allocation) {
                    log::error!(target: "vulkan", "free allocation: {}", e);
                }
            }
            Err(e) => log::error!(target: "vulkan", "free allocation: {}", e),
        }
    }

    /// Number of handles still sharing the allocator (1 = only the device).
    pub fn outstanding_owners(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for SharedAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedAllocator").finish_non_exhaustive()
    }
}
