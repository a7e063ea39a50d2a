//! Vulkan Queue: synchronization2 submission with semaphores and a fence.

use crate::{CommandContext, Fence, Queue, RhiError, RhiResult, Semaphore};
use ash::vk;
use std::sync::Arc;

use super::{VulkanCommandContext, VulkanFence, VulkanSemaphore};

pub struct VulkanQueue {
    pub device: Arc<ash::Device>,
    pub queue: vk::Queue,
}

impl VulkanQueue {
    pub fn new(device: Arc<ash::Device>, queue: vk::Queue) -> Self {
        Self { device, queue }
    }
}

impl std::fmt::Debug for VulkanQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanQueue").finish()
    }
}

fn semaphore_handle(s: &dyn Semaphore) -> RhiResult<vk::Semaphore> {
    s.as_any()
        .downcast_ref::<VulkanSemaphore>()
        .map(|vs| vs.semaphore)
        .ok_or_else(|| RhiError::InvalidArgument("semaphore must be VulkanSemaphore".to_string()))
}

impl Queue for VulkanQueue {
    fn submit(
        &self,
        contexts: &[&dyn CommandContext],
        wait_semaphores: &[&dyn Semaphore],
        signal_semaphores: &[&dyn Semaphore],
        signal_fence: Option<&dyn Fence>,
    ) -> RhiResult<()> {
        let cmd_infos = contexts
            .iter()
            .map(|ctx| {
                ctx.as_any()
                    .downcast_ref::<VulkanCommandContext>()
                    .map(|c| vk::CommandBufferSubmitInfo::default().command_buffer(c.buffer))
                    .ok_or_else(|| {
                        RhiError::InvalidArgument("context must be VulkanCommandContext".to_string())
                    })
            })
            .collect::<RhiResult<Vec<_>>>()?;

        // Image barriers use ALL_COMMANDS, so they chain off this wait stage.
        let wait_infos = wait_semaphores
            .iter()
            .map(|s| {
                Ok(vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore_handle(*s)?)
                    .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                    .value(1))
            })
            .collect::<RhiResult<Vec<_>>>()?;
        let signal_infos = signal_semaphores
            .iter()
            .map(|s| {
                Ok(vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore_handle(*s)?)
                    .stage_mask(vk::PipelineStageFlags2::ALL_GRAPHICS)
                    .value(1))
            })
            .collect::<RhiResult<Vec<_>>>()?;

        let fence = match signal_fence {
            Some(f) => f
                .as_any()
                .downcast_ref::<VulkanFence>()
                .map(|vf| vf.fence)
                .ok_or_else(|| RhiError::InvalidArgument("fence must be VulkanFence".to_string()))?,
            None => vk::Fence::null(),
        };

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .signal_semaphore_infos(&signal_infos)
            .command_buffer_infos(&cmd_infos);

        unsafe {
            self.device
                .queue_submit2(self.queue, &[submit_info], fence)
                .map_err(super::map_vk_error("queue_submit2"))
        }
    }
}
