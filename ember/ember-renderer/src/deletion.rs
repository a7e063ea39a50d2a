//! Deletion queues: deferred, strictly LIFO destruction.
//!
//! One queue lives for the whole engine and is flushed at teardown; each frame slot has another
//! that is flushed when the slot is reused, after its fence proves the GPU is done with it.

use crate::error::Result;
use crate::resources::{Allocator, BufferHandle, ImageHandle};

/// Something to destroy later.
pub enum Deferred {
    Buffer(BufferHandle),
    Image(ImageHandle),
    /// Arbitrary cleanup, e.g. dropping the last reference to a pipeline or descriptor pool.
    Action(Box<dyn FnOnce() + Send>),
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Deferred::Buffer(h) => f.debug_tuple("Buffer").field(h).finish(),
            Deferred::Image(h) => f.debug_tuple("Image").field(h).finish(),
            Deferred::Action(_) => f.write_str("Action"),
        }
    }
}

#[derive(Debug)]
pub struct DeletionQueue {
    label: &'static str,
    pending: Vec<Deferred>,
}

impl DeletionQueue {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, item: Deferred) {
        self.pending.push(item);
    }

    pub fn push_buffer(&mut self, handle: BufferHandle) {
        self.push(Deferred::Buffer(handle));
    }

    pub fn push_image(&mut self, handle: ImageHandle) {
        self.push(Deferred::Image(handle));
    }

    pub fn push_action(&mut self, action: impl FnOnce() + Send + 'static) {
        self.push(Deferred::Action(Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Run every pending item newest-first and leave the queue empty.
    ///
    /// Every item runs even if an earlier one fails; the first error is returned.
    pub fn flush(&mut self, allocator: &mut Allocator) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        log::trace!("flushing deletion queue '{}' ({} items)", self.label, self.pending.len());
        let mut first_error = None;
        while let Some(item) = self.pending.pop() {
            let result = match item {
                Deferred::Buffer(h) => allocator.destroy_buffer(h),
                Deferred::Image(h) => allocator.destroy_image(h),
                Deferred::Action(action) => {
                    action();
                    Ok(())
                }
            };
            if let Err(e) = result {
                log::error!("deletion queue '{}': {}", self.label, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            log::warn!(
                "deletion queue '{}' dropped with {} unflushed items",
                self.label,
                self.pending.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RendererError;
    use ember_rhi::headless::HeadlessEvent;
    use ember_rhi::{Buffer, BufferDescriptor, BufferUsage, HeadlessDevice};
    use std::sync::{Arc, Mutex};

    #[test]
    fn actions_run_in_reverse_push_order() {
        let device = HeadlessDevice::new();
        let mut allocator = Allocator::new(device);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut queue = DeletionQueue::new("test");
        for name in ["A", "B", "C"] {
            let order = Arc::clone(&order);
            queue.push_action(move || order.lock().unwrap().push(name));
        }
        queue.flush(&mut allocator).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["C", "B", "A"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn buffers_are_destroyed_newest_first() {
        let device = HeadlessDevice::new();
        let mut allocator = Allocator::new(device.clone());
        let mut queue = DeletionQueue::new("test");
        let mut ids = Vec::new();
        for label in ["first", "second"] {
            let h = allocator
                .create_buffer(&BufferDescriptor {
                    label: Some(label),
                    size: 4,
                    usage: BufferUsage::STORAGE,
                    ..Default::default()
                })
                .unwrap();
            ids.push(allocator.buffer(h).unwrap().id());
            queue.push_buffer(h);
        }
        device.clear_events();
        queue.flush(&mut allocator).unwrap();

        let destroyed: Vec<_> = device
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HeadlessEvent::BufferDestroyed { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(destroyed, vec![ids[1], ids[0]]);
        assert_eq!(allocator.live_buffers(), 0);
    }

    #[test]
    fn failing_item_does_not_stop_the_flush() {
        let device = HeadlessDevice::new();
        let mut allocator = Allocator::new(device);
        let h = allocator
            .create_buffer(&BufferDescriptor { size: 4, ..Default::default() })
            .unwrap();
        let ran = Arc::new(Mutex::new(false));
        let mut queue = DeletionQueue::new("test");
        {
            let ran = Arc::clone(&ran);
            queue.push_action(move || *ran.lock().unwrap() = true);
        }
        queue.push_buffer(h);
        queue.push_buffer(h);

        let err = queue.flush(&mut allocator).unwrap_err();
        assert!(matches!(err, RendererError::UnknownBuffer(_)));
        assert!(*ran.lock().unwrap());
        assert!(queue.is_empty());
    }

    #[test]
    fn flushing_an_empty_queue_is_a_no_op() {
        let mut allocator = Allocator::new(HeadlessDevice::new());
        let mut queue = DeletionQueue::new("empty");
        queue.flush(&mut allocator).unwrap();
        assert_eq!(queue.len(), 0);
    }
}
