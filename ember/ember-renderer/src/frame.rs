//! Frame ring: `FRAME_OVERLAP` frame slots recorded ahead of the GPU.
//!
//! Each slot owns a command context, a completion fence, the acquire/render semaphores, a
//! deletion queue and a descriptor pool for transient sets. A slot is only touched by the CPU
//! after its fence has been observed signaled, which is what makes flushing its deletion queue at
//! the top of `begin_frame` safe.

use std::sync::Arc;

use ember_rhi::{
    CommandContext, CommandEncoder, DescriptorPool, DescriptorPoolDescriptor, DescriptorType,
    Device, Fence, Queue, Semaphore,
};

use crate::deletion::DeletionQueue;
use crate::error::{RendererError, Result};
use crate::resources::Allocator;

/// Number of frames in flight.
pub const FRAME_OVERLAP: usize = 2;

/// Transient descriptor sets a slot can allocate per frame.
const FRAME_DESCRIPTOR_SETS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    InFlight,
}

#[derive(Debug)]
pub struct FrameContext {
    commands: Box<dyn CommandContext>,
    render_fence: Box<dyn Fence>,
    swapchain_semaphore: Box<dyn Semaphore>,
    render_semaphore: Box<dyn Semaphore>,
    descriptors: Box<dyn DescriptorPool>,
    deletion: DeletionQueue,
    state: SlotState,
}

impl FrameContext {
    fn new(device: &dyn Device) -> Result<Self> {
        Ok(Self {
            commands: device.create_command_context()?,
            // Pre-signaled so the first begin_frame on this slot does not block.
            render_fence: device.create_fence(true)?,
            swapchain_semaphore: device.create_semaphore()?,
            render_semaphore: device.create_semaphore()?,
            descriptors: device.create_descriptor_pool(&DescriptorPoolDescriptor {
                max_sets: FRAME_DESCRIPTOR_SETS,
                pool_ratios: vec![
                    (DescriptorType::UniformBuffer, 1.0),
                    (DescriptorType::StorageBuffer, 1.0),
                    (DescriptorType::StorageImage, 1.0),
                ],
            })?,
            deletion: DeletionQueue::new("frame"),
            state: SlotState::Idle,
        })
    }

    pub fn encoder(&mut self) -> &mut dyn CommandEncoder {
        self.commands.encoder()
    }

    pub fn swapchain_semaphore(&self) -> &dyn Semaphore {
        self.swapchain_semaphore.as_ref()
    }

    pub fn render_semaphore(&self) -> &dyn Semaphore {
        self.render_semaphore.as_ref()
    }

    pub fn render_fence(&self) -> &dyn Fence {
        self.render_fence.as_ref()
    }

    /// Pool for sets that live exactly one frame; reset at the top of each reuse.
    pub fn descriptors(&self) -> &dyn DescriptorPool {
        self.descriptors.as_ref()
    }

    pub fn deletion(&mut self) -> &mut DeletionQueue {
        &mut self.deletion
    }

    pub fn pending_deletions(&self) -> usize {
        self.deletion.len()
    }

    pub fn state(&self) -> SlotState {
        self.state
    }
}

#[derive(Debug)]
pub struct FrameRing {
    frames: Vec<FrameContext>,
    frame_number: u64,
    timeout_ns: u64,
    // Declared last: slot objects are destroyed before the device can go away.
    device: Arc<dyn Device>,
}

impl FrameRing {
    pub fn new(device: Arc<dyn Device>, count: usize, timeout_ns: u64) -> Result<Self> {
        if count == 0 {
            return Err(RendererError::Config("frame ring needs at least one slot".to_string()));
        }
        let frames = (0..count)
            .map(|_| FrameContext::new(device.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            frames,
            frame_number: 0,
            timeout_ns,
            device,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn current_index(&self) -> usize {
        (self.frame_number % self.frames.len() as u64) as usize
    }

    pub fn current(&self) -> &FrameContext {
        &self.frames[self.current_index()]
    }

    pub fn current_mut(&mut self) -> &mut FrameContext {
        let index = self.current_index();
        &mut self.frames[index]
    }

    pub fn slot(&self, index: usize) -> Option<&FrameContext> {
        self.frames.get(index)
    }

    /// Wait for the slot's previous GPU work, flush its deletion queue, reset its descriptor pool
    /// and fence, and start recording.
    ///
    /// A wait that outlasts the timeout is fatal: the slot's deletion queue is left untouched.
    pub fn begin_frame(&mut self, allocator: &mut Allocator) -> Result<&mut FrameContext> {
        let index = self.current_index();
        let frame_number = self.frame_number;
        let timeout_ns = self.timeout_ns;
        let frame = &mut self.frames[index];
        if frame.state == SlotState::Recording {
            return Err(RendererError::InvalidState(format!(
                "frame slot {} is already recording",
                index
            )));
        }

        frame
            .render_fence
            .wait(timeout_ns)
            .map_err(|e| RendererError::from_wait(e, format!("frame slot {} fence", index)))?;
        frame.state = SlotState::Idle;

        frame.deletion.flush(allocator)?;
        frame.descriptors.reset()?;
        frame.render_fence.reset()?;

        frame.commands.begin()?;
        frame.state = SlotState::Recording;
        log::trace!("frame {} recording on slot {}", frame_number, index);
        Ok(frame)
    }

    /// End recording and submit: wait on acquire, signal render-complete and the slot fence.
    pub fn submit(&mut self, queue: &dyn Queue) -> Result<()> {
        let frame = self.current_mut();
        if frame.state != SlotState::Recording {
            return Err(RendererError::InvalidState(format!(
                "submit on a slot in state {:?}",
                frame.state
            )));
        }
        frame.commands.end()?;
        queue.submit(
            &[frame.commands.as_ref()],
            &[frame.swapchain_semaphore.as_ref()],
            &[frame.render_semaphore.as_ref()],
            Some(frame.render_fence.as_ref()),
        )?;
        frame.state = SlotState::InFlight;
        Ok(())
    }

    /// Abandon the frame being recorded without submitting anything.
    ///
    /// `begin_frame` already reset the fence, and nothing will signal it now, so it is replaced
    /// with a pre-signaled one. The frame number does not advance.
    pub fn cancel_frame(&mut self) -> Result<()> {
        let fence = self.device.create_fence(true)?;
        let index = self.current_index();
        let frame = &mut self.frames[index];
        if frame.state != SlotState::Recording {
            return Err(RendererError::InvalidState(format!(
                "cancel on a slot in state {:?}",
                frame.state
            )));
        }
        frame.render_fence = fence;
        frame.state = SlotState::Idle;
        log::debug!("frame {} cancelled on slot {}", self.frame_number, index);
        Ok(())
    }

    pub fn advance(&mut self) {
        self.frame_number += 1;
    }

    /// Flush every slot's deletion queue. The caller waits for the device to go idle first.
    pub fn destroy(&mut self, allocator: &mut Allocator) -> Result<()> {
        let mut first_error = None;
        for frame in &mut self.frames {
            if let Err(e) = frame.deletion.flush(allocator) {
                first_error.get_or_insert(e);
            }
            frame.state = SlotState::Idle;
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_rhi::headless::HeadlessEvent;
    use ember_rhi::HeadlessDevice;
    use std::sync::Mutex;

    fn setup() -> (Arc<HeadlessDevice>, Allocator, FrameRing, Box<dyn Queue>) {
        let device = HeadlessDevice::new();
        let allocator = Allocator::new(device.clone());
        let ring = FrameRing::new(device.clone(), FRAME_OVERLAP, 1_000_000).unwrap();
        let queue = device.queue().unwrap();
        (device, allocator, ring, queue)
    }

    fn run_frame(ring: &mut FrameRing, allocator: &mut Allocator, queue: &dyn Queue) {
        ring.begin_frame(allocator).unwrap();
        ring.submit(queue).unwrap();
        ring.advance();
    }

    #[test]
    fn slots_cycle_and_first_begin_does_not_block() {
        let (_device, mut allocator, mut ring, queue) = setup();
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(ring.current_index());
            run_frame(&mut ring, &mut allocator, queue.as_ref());
        }
        assert_eq!(seen, vec![0, 1, 0, 1]);
        assert_eq!(ring.frame_number(), 4);
    }

    #[test]
    fn begin_frame_waits_then_flushes_then_resets() {
        let (device, mut allocator, mut ring, queue) = setup();
        ring.begin_frame(&mut allocator).unwrap();
        {
            let device = Arc::clone(&device);
            ring.current_mut()
                .deletion()
                .push_action(move || device.mark("slot 0 flushed"));
        }
        ring.submit(queue.as_ref()).unwrap();
        ring.advance();
        run_frame(&mut ring, &mut allocator, queue.as_ref());

        device.clear_events();
        ring.begin_frame(&mut allocator).unwrap();
        let sequence: Vec<&str> = device
            .events()
            .iter()
            .filter_map(|e| match e {
                HeadlessEvent::FenceWaited { .. } => Some("wait"),
                HeadlessEvent::Marker(_) => Some("flush"),
                HeadlessEvent::DescriptorPoolReset => Some("pool"),
                HeadlessEvent::FenceReset { .. } => Some("reset"),
                _ => None,
            })
            .collect();
        assert_eq!(sequence, vec!["wait", "flush", "pool", "reset"]);
        assert_eq!(ring.current().pending_deletions(), 0);
    }

    #[test]
    fn stalled_gpu_times_out_without_flushing() {
        let (device, mut allocator, mut ring, queue) = setup();
        let flushed = Arc::new(Mutex::new(false));
        device.set_stalled(true);

        ring.begin_frame(&mut allocator).unwrap();
        {
            let flushed = Arc::clone(&flushed);
            ring.current_mut()
                .deletion()
                .push_action(move || *flushed.lock().unwrap() = true);
        }
        ring.submit(queue.as_ref()).unwrap();
        ring.advance();
        run_frame(&mut ring, &mut allocator, queue.as_ref());

        let err = ring.begin_frame(&mut allocator).unwrap_err();
        assert!(matches!(err, RendererError::GpuTimeout { .. }));
        assert!(!*flushed.lock().unwrap());
        assert_eq!(ring.current().pending_deletions(), 1);

        device.set_stalled(false);
        ring.destroy(&mut allocator).unwrap();
    }

    #[test]
    fn cancelled_frame_leaves_slot_reusable() {
        let (_device, mut allocator, mut ring, queue) = setup();
        ring.begin_frame(&mut allocator).unwrap();
        ring.cancel_frame().unwrap();
        assert_eq!(ring.frame_number(), 0);
        assert_eq!(ring.current().state(), SlotState::Idle);
        assert!(ring.current().render_fence().is_signaled().unwrap());

        ring.begin_frame(&mut allocator).unwrap();
        ring.submit(queue.as_ref()).unwrap();
        assert_eq!(ring.current().state(), SlotState::InFlight);
    }

    #[test]
    fn double_begin_is_rejected() {
        let (_device, mut allocator, mut ring, _queue) = setup();
        ring.begin_frame(&mut allocator).unwrap();
        assert!(matches!(
            ring.begin_frame(&mut allocator),
            Err(RendererError::InvalidState(_))
        ));
    }

    #[test]
    fn per_frame_buffers_are_released_when_the_slot_comes_back() {
        let (device, mut allocator, mut ring, queue) = setup();
        ring.begin_frame(&mut allocator).unwrap();
        let scratch = allocator
            .create_buffer(&ember_rhi::BufferDescriptor {
                label: Some("scratch"),
                size: 256,
                ..Default::default()
            })
            .unwrap();
        ring.current_mut().deletion().push_buffer(scratch);
        ring.submit(queue.as_ref()).unwrap();
        ring.advance();
        assert_eq!(device.live_buffer_count(), 1);

        run_frame(&mut ring, &mut allocator, queue.as_ref());
        assert_eq!(device.live_buffer_count(), 1);
        run_frame(&mut ring, &mut allocator, queue.as_ref());
        assert_eq!(device.live_buffer_count(), 0);
    }
}
