//! Immediate-submit channel: synchronous one-shot command submission for setup-time transfers.

use ember_rhi::{CommandContext, CommandEncoder, Device, Fence, Queue};

use crate::error::{RendererError, Result};

/// Dedicated command context and fence, independent of the frame ring.
#[derive(Debug)]
pub struct ImmediateSubmit {
    context: Box<dyn CommandContext>,
    fence: Box<dyn Fence>,
    timeout_ns: u64,
}

impl ImmediateSubmit {
    pub fn new(device: &dyn Device, timeout_ns: u64) -> Result<Self> {
        Ok(Self {
            context: device.create_command_context()?,
            fence: device.create_fence(true)?,
            timeout_ns,
        })
    }

    /// Record commands through `record`, submit them and block until the GPU has finished.
    ///
    /// `&mut self` keeps the channel non-reentrant. If `record` fails nothing is submitted.
    pub fn submit<F>(&mut self, queue: &dyn Queue, record: F) -> Result<()>
    where
        F: FnOnce(&mut dyn CommandEncoder) -> Result<()>,
    {
        self.fence.reset()?;
        self.context.begin()?;
        let recorded = record(self.context.encoder());
        self.context.end()?;
        recorded?;

        queue.submit(&[self.context.as_ref()], &[], &[], Some(self.fence.as_ref()))?;
        self.fence
            .wait(self.timeout_ns)
            .map_err(|e| RendererError::from_wait(e, "immediate submit"))?;
        log::trace!("immediate submit complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_rhi::headless::{HeadlessEvent, RecordedCommand};
    use ember_rhi::{BufferDescriptor, BufferMemoryPreference, BufferUsage, HeadlessDevice};

    #[test]
    fn submit_blocks_until_copy_has_run() {
        let device = HeadlessDevice::new();
        let queue = device.queue().unwrap();
        let mut immediate = ImmediateSubmit::new(device.as_ref(), 1_000_000).unwrap();
        let src = device
            .create_buffer(&BufferDescriptor { size: 4, ..Default::default() })
            .unwrap();
        let dst = device
            .create_buffer(&BufferDescriptor {
                size: 4,
                usage: BufferUsage::COPY_DST | BufferUsage::STORAGE,
                memory: BufferMemoryPreference::DeviceLocal,
                ..Default::default()
            })
            .unwrap();
        device.write_buffer(src.as_ref(), 0, &[9, 8, 7, 6]).unwrap();

        immediate
            .submit(queue.as_ref(), |enc| {
                enc.copy_buffer_to_buffer(src.as_ref(), 0, dst.as_ref(), 0, 4)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(device.read_buffer(dst.as_ref(), 0, 4).unwrap(), vec![9, 8, 7, 6]);
        let events = device.events();
        let submitted = events
            .iter()
            .position(|e| matches!(e, HeadlessEvent::Submitted { .. }))
            .unwrap();
        let waited = events
            .iter()
            .rposition(|e| matches!(e, HeadlessEvent::FenceWaited { .. }))
            .unwrap();
        assert!(submitted < waited);
    }

    #[test]
    fn failed_recording_submits_nothing() {
        let device = HeadlessDevice::new();
        let queue = device.queue().unwrap();
        let mut immediate = ImmediateSubmit::new(device.as_ref(), 1_000_000).unwrap();
        let err = immediate
            .submit(queue.as_ref(), |_| Err(RendererError::InvalidState("nope".to_string())))
            .unwrap_err();
        assert!(matches!(err, RendererError::InvalidState(_)));
        assert!(device.submissions().is_empty());

        immediate.submit(queue.as_ref(), |_| Ok(())).unwrap();
        assert_eq!(device.submissions(), vec![Vec::<RecordedCommand>::new()]);
    }

    #[test]
    fn stalled_gpu_is_a_timeout() {
        let device = HeadlessDevice::new();
        device.set_stalled(true);
        let queue = device.queue().unwrap();
        let mut immediate = ImmediateSubmit::new(device.as_ref(), 1_000).unwrap();
        let err = immediate.submit(queue.as_ref(), |_| Ok(())).unwrap_err();
        assert!(matches!(err, RendererError::GpuTimeout { ref what } if what == "immediate submit"));
    }
}
