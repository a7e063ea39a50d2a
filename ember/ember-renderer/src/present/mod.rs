//! Swapchain manager: owns the presentable image chain.
//!
//! The chain is never mutated in place. A stale chain is reported through [`AcquireOutcome`] /
//! [`PresentOutcome`] and rebuilt by [`SwapchainManager::resize`], which the engine only calls
//! after such a report.

use std::sync::Arc;

use ember_rhi::{Device, RhiError, Semaphore, Swapchain, Texture, TextureFormat};

use crate::error::{RendererError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Image(u32),
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    OutOfDate,
}

#[derive(Debug)]
pub struct SwapchainManager {
    swapchain: Option<Box<dyn Swapchain>>,
    format: TextureFormat,
    timeout_ns: u64,
    device: Arc<dyn Device>,
}

impl SwapchainManager {
    pub fn new(device: Arc<dyn Device>, format: TextureFormat, timeout_ns: u64) -> Self {
        Self {
            swapchain: None,
            format,
            timeout_ns,
            device,
        }
    }

    /// Build a FIFO chain at `extent`. Any existing chain is destroyed first.
    pub fn create(&mut self, extent: (u32, u32)) -> Result<()> {
        self.destroy();
        let swapchain = self.device.create_swapchain(extent, self.format)?;
        log::info!(
            "swapchain created: {}x{} {:?}, {} images",
            swapchain.extent().0,
            swapchain.extent().1,
            swapchain.format(),
            swapchain.image_count()
        );
        self.swapchain = Some(swapchain);
        Ok(())
    }

    /// Drop the chain and its image views.
    pub fn destroy(&mut self) {
        if let Some(swapchain) = self.swapchain.take() {
            log::info!("swapchain destroyed ({}x{})", swapchain.extent().0, swapchain.extent().1);
        }
    }

    /// Wait for the GPU to go idle, then destroy and recreate the chain at `window_extent`.
    pub fn resize(&mut self, window_extent: (u32, u32)) -> Result<()> {
        self.device.wait_idle()?;
        self.destroy();
        self.create(window_extent)?;
        log::info!("swapchain resized to {}x{}", window_extent.0, window_extent.1);
        Ok(())
    }

    pub fn acquire(&mut self, signal: &dyn Semaphore) -> Result<AcquireOutcome> {
        let timeout_ns = self.timeout_ns;
        let swapchain = self.chain_mut()?;
        match swapchain.acquire_next_image(signal, timeout_ns) {
            Ok(index) => Ok(AcquireOutcome::Image(index)),
            Err(RhiError::OutOfDate) => {
                log::debug!("swapchain out of date on acquire");
                Ok(AcquireOutcome::OutOfDate)
            }
            Err(RhiError::Timeout) => Err(RendererError::GpuTimeout {
                what: "swapchain image".to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn present(&self, image_index: u32, wait: &dyn Semaphore) -> Result<PresentOutcome> {
        match self.chain()?.present(image_index, wait) {
            Ok(()) => Ok(PresentOutcome::Presented),
            Err(RhiError::OutOfDate) => {
                log::debug!("swapchain out of date on present");
                Ok(PresentOutcome::OutOfDate)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn image(&self, index: u32) -> Result<&dyn Texture> {
        self.chain()?.image(index).ok_or_else(|| {
            RendererError::InvalidState(format!("swapchain has no image {}", index))
        })
    }

    pub fn extent(&self) -> Option<(u32, u32)> {
        self.swapchain.as_ref().map(|s| s.extent())
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn is_created(&self) -> bool {
        self.swapchain.is_some()
    }

    fn chain(&self) -> Result<&dyn Swapchain> {
        self.swapchain
            .as_deref()
            .ok_or_else(|| RendererError::InvalidState("no swapchain".to_string()))
    }

    fn chain_mut(&mut self) -> Result<&mut Box<dyn Swapchain>> {
        self.swapchain
            .as_mut()
            .ok_or_else(|| RendererError::InvalidState("no swapchain".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_rhi::headless::HeadlessEvent;
    use ember_rhi::HeadlessDevice;

    fn manager(device: &Arc<HeadlessDevice>) -> SwapchainManager {
        SwapchainManager::new(device.clone(), TextureFormat::Bgra8Unorm, 1_000)
    }

    #[test]
    fn create_replaces_existing_chain() {
        let device = HeadlessDevice::new();
        let mut swapchain = manager(&device);
        swapchain.create((64, 64)).unwrap();
        swapchain.create((32, 32)).unwrap();
        assert_eq!(swapchain.extent(), Some((32, 32)));
        let events = device.events();
        let destroyed = events
            .iter()
            .position(|e| *e == HeadlessEvent::SwapchainDestroyed { extent: (64, 64) })
            .unwrap();
        let created = events
            .iter()
            .position(|e| *e == HeadlessEvent::SwapchainCreated { extent: (32, 32) })
            .unwrap();
        assert!(destroyed < created);
    }

    #[test]
    fn resize_waits_idle_then_destroys_then_creates() {
        let device = HeadlessDevice::new();
        let mut swapchain = manager(&device);
        swapchain.create((64, 64)).unwrap();
        device.clear_events();
        swapchain.resize((128, 96)).unwrap();
        assert_eq!(
            device.events(),
            vec![
                HeadlessEvent::WaitIdle,
                HeadlessEvent::SwapchainDestroyed { extent: (64, 64) },
                HeadlessEvent::SwapchainCreated { extent: (128, 96) },
            ]
        );
    }

    #[test]
    fn stale_chain_is_an_outcome_not_an_error() {
        let device = HeadlessDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        let mut swapchain = manager(&device);
        swapchain.create((16, 16)).unwrap();

        device.fail_next_acquires(1);
        assert_eq!(swapchain.acquire(semaphore.as_ref()).unwrap(), AcquireOutcome::OutOfDate);
        assert_eq!(swapchain.acquire(semaphore.as_ref()).unwrap(), AcquireOutcome::Image(0));

        device.fail_next_presents(1);
        assert_eq!(swapchain.present(0, semaphore.as_ref()).unwrap(), PresentOutcome::OutOfDate);
        assert_eq!(swapchain.present(0, semaphore.as_ref()).unwrap(), PresentOutcome::Presented);
    }

    #[test]
    fn surfaceless_device_cannot_create_a_chain() {
        let device = HeadlessDevice::without_surface();
        let mut swapchain = SwapchainManager::new(device, TextureFormat::Bgra8Unorm, 1_000);
        assert!(matches!(
            swapchain.create((8, 8)),
            Err(RendererError::Rhi(RhiError::Unsupported(_)))
        ));
        assert!(!swapchain.is_created());
        assert!(swapchain.image(0).is_err());
    }
}
