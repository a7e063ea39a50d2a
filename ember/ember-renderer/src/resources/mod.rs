//! Allocator: registry of every GPU buffer and image the renderer owns.
//!
//! Callers hold small copyable handles; the registry holds the RHI objects. Destruction always goes
//! through [`Allocator::destroy_buffer`] / [`Allocator::destroy_image`], so a stale or repeated
//! destroy is reported as an error instead of freeing memory twice.

use std::sync::Arc;

use ember_rhi::{Buffer, BufferDescriptor, Device, Texture, TextureDescriptor};

use crate::error::{RendererError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational arena. Freed slots are reused with a bumped generation.
struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }
}

impl<T> Registry<T> {
    fn insert(&mut self, value: T) -> (u32, u32) {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return (index, slot.generation);
        }
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        ((self.slots.len() - 1) as u32, 0)
    }

    fn get(&self, index: u32, generation: u32) -> Option<&T> {
        self.slots
            .get(index as usize)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.value.as_ref())
    }

    fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .filter(|s| s.generation == generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.live -= 1;
        Some(value)
    }

    fn drain(&mut self) -> Vec<T> {
        self.live = 0;
        self.free.clear();
        self.slots.drain(..).filter_map(|s| s.value).collect()
    }
}

pub struct Allocator {
    device: Arc<dyn Device>,
    buffers: Registry<Box<dyn Buffer>>,
    images: Registry<Box<dyn Texture>>,
}

impl Allocator {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            buffers: Registry::default(),
            images: Registry::default(),
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn create_buffer(&mut self, desc: &BufferDescriptor) -> Result<BufferHandle> {
        let buffer = self.device.create_buffer(desc)?;
        let (index, generation) = self.buffers.insert(buffer);
        Ok(BufferHandle { index, generation })
    }

    pub fn create_image(&mut self, desc: &TextureDescriptor) -> Result<ImageHandle> {
        let image = self.device.create_texture(desc)?;
        log::debug!(
            "image '{}' created: {:?} {:?}",
            desc.label.unwrap_or("image"),
            desc.size,
            desc.format
        );
        let (index, generation) = self.images.insert(image);
        Ok(ImageHandle { index, generation })
    }

    pub fn buffer(&self, handle: BufferHandle) -> Result<&dyn Buffer> {
        self.buffers
            .get(handle.index, handle.generation)
            .map(|b| b.as_ref())
            .ok_or(RendererError::UnknownBuffer(handle))
    }

    pub fn image(&self, handle: ImageHandle) -> Result<&dyn Texture> {
        self.images
            .get(handle.index, handle.generation)
            .map(|t| t.as_ref())
            .ok_or(RendererError::UnknownImage(handle))
    }

    /// Write bytes into a host-visible buffer.
    pub fn write_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = self.buffer(handle)?;
        self.device.write_buffer(buffer, offset, data)?;
        Ok(())
    }

    pub fn destroy_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let buffer = self
            .buffers
            .remove(handle.index, handle.generation)
            .ok_or(RendererError::UnknownBuffer(handle))?;
        log::trace!("buffer {:?} ({:?}) destroyed", handle, buffer.label());
        drop(buffer);
        Ok(())
    }

    pub fn destroy_image(&mut self, handle: ImageHandle) -> Result<()> {
        let image = self
            .images
            .remove(handle.index, handle.generation)
            .ok_or(RendererError::UnknownImage(handle))?;
        log::trace!("image {:?} destroyed", handle);
        drop(image);
        Ok(())
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.live
    }

    pub fn live_images(&self) -> usize {
        self.images.live
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        let (buffers, images) = (self.buffers.drain(), self.images.drain());
        if !buffers.is_empty() || !images.is_empty() {
            log::warn!(
                "allocator dropped with {} buffers and {} images still registered",
                buffers.len(),
                images.len()
            );
        }
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("live_buffers", &self.buffers.live)
            .field("live_images", &self.images.live)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_rhi::{BufferUsage, HeadlessDevice, TextureFormat, TextureUsage};

    fn allocator() -> (Arc<HeadlessDevice>, Allocator) {
        let device = HeadlessDevice::new();
        let allocator = Allocator::new(device.clone());
        (device, allocator)
    }

    fn buffer_desc(size: u64) -> BufferDescriptor {
        BufferDescriptor {
            label: Some("test"),
            size,
            usage: BufferUsage::UNIFORM,
            ..Default::default()
        }
    }

    #[test]
    fn create_lookup_destroy() {
        let (device, mut allocator) = allocator();
        let handle = allocator.create_buffer(&buffer_desc(64)).unwrap();
        assert_eq!(allocator.buffer(handle).unwrap().size(), 64);
        assert_eq!(device.live_buffer_count(), 1);

        allocator.destroy_buffer(handle).unwrap();
        assert_eq!(allocator.live_buffers(), 0);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn double_destroy_is_reported() {
        let (_device, mut allocator) = allocator();
        let handle = allocator.create_buffer(&buffer_desc(16)).unwrap();
        allocator.destroy_buffer(handle).unwrap();
        assert!(matches!(
            allocator.destroy_buffer(handle),
            Err(RendererError::UnknownBuffer(h)) if h == handle
        ));
    }

    #[test]
    fn stale_handle_does_not_alias_reused_slot() {
        let (_device, mut allocator) = allocator();
        let old = allocator.create_buffer(&buffer_desc(16)).unwrap();
        allocator.destroy_buffer(old).unwrap();
        let new = allocator.create_buffer(&buffer_desc(32)).unwrap();
        assert_ne!(old, new);
        assert!(allocator.buffer(old).is_err());
        assert_eq!(allocator.buffer(new).unwrap().size(), 32);
    }

    #[test]
    fn images_are_tracked_separately() {
        let (_device, mut allocator) = allocator();
        let image = allocator
            .create_image(&TextureDescriptor {
                label: Some("draw"),
                size: (8, 8, 1),
                format: TextureFormat::Rgba16Float,
                usage: TextureUsage::STORAGE_BINDING,
            })
            .unwrap();
        assert_eq!(allocator.live_images(), 1);
        assert_eq!(allocator.live_buffers(), 0);
        assert_eq!(allocator.image(image).unwrap().size(), (8, 8, 1));
        allocator.destroy_image(image).unwrap();
        assert!(matches!(allocator.destroy_image(image), Err(RendererError::UnknownImage(_))));
    }

    #[test]
    fn dropping_allocator_releases_leftovers() {
        let (device, mut allocator) = allocator();
        allocator.create_buffer(&buffer_desc(16)).unwrap();
        allocator.create_buffer(&buffer_desc(16)).unwrap();
        drop(allocator);
        assert_eq!(device.live_buffer_count(), 0);
    }
}
