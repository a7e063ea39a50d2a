//! Dynamic rendering (`vkCmdBeginRendering`) setup and draw recording.

use crate::{
    Buffer, ClearColor, DescriptorSet, GraphicsPipeline, LoadOp,
    RenderPassDescriptor, RhiError, RhiResult, StoreOp, Viewport,
};
use ash::vk;
use std::marker::PhantomData;
use std::sync::Arc;

use super::buffer::VulkanBuffer;
use super::descriptor::VulkanDescriptorSet;
use super::pipeline::VulkanGraphicsPipeline;
use super::texture_view;

fn load_op_to_vk(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
    }
}

fn store_op_to_vk(op: StoreOp) -> vk::AttachmentStoreOp {
    match op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

/// Begin dynamic rendering on `command_buffer` and return the recorder that ends it.
pub(crate) fn begin_rendering<'a>(
    device: &Arc<ash::Device>,
    command_buffer: vk::CommandBuffer,
    desc: &RenderPassDescriptor<'_>,
) -> RhiResult<VulkanRenderPassRecorder<'a>> {
    let color_attachments = desc
        .color_attachments
        .iter()
        .map(|a| {
            let ClearColor { r, g, b, a: alpha } =
                a.clear_value.unwrap_or(ClearColor { r: 0.0, g: 0.0, b: 0.0, a: 1.0 });
            Ok(vk::RenderingAttachmentInfo::default()
                .image_view(texture_view(a.texture)?)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(load_op_to_vk(a.load_op))
                .store_op(store_op_to_vk(a.store_op))
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue { float32: [r, g, b, alpha] },
                }))
        })
        .collect::<RhiResult<Vec<_>>>()?;

    let depth_attachment = match &desc.depth_stencil_attachment {
        Some(d) => Some(
            vk::RenderingAttachmentInfo::default()
                .image_view(texture_view(d.texture)?)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(load_op_to_vk(d.depth_load_op))
                .store_op(store_op_to_vk(d.depth_store_op))
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth: d.clear_depth, stencil: 0 },
                }),
        ),
        None => None,
    };

    let (width, height) = desc.render_area;
    if width == 0 || height == 0 {
        return Err(RhiError::InvalidArgument("render area must be non-empty".to_string()));
    }
    let extent = vk::Extent2D { width, height };
    let mut rendering_info = vk::RenderingInfo::default()
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        })
        .layer_count(1)
        .color_attachments(&color_attachments);
    if let Some(depth) = depth_attachment.as_ref() {
        rendering_info = rendering_info.depth_attachment(depth);
    }

    unsafe {
        device.cmd_begin_rendering(command_buffer, &rendering_info);
    }

    Ok(VulkanRenderPassRecorder {
        device: Arc::clone(device),
        command_buffer,
        extent,
        pipeline_layout: None,
        push_stages: vk::ShaderStageFlags::empty(),
        _encoder: PhantomData,
    })
}

/// Vulkan render pass recording - implements RenderPass trait.
pub struct VulkanRenderPassRecorder<'a> {
    pub(crate) device: Arc<ash::Device>,
    pub(crate) command_buffer: vk::CommandBuffer,
    pub(crate) extent: vk::Extent2D,
    pub(crate) pipeline_layout: Option<vk::PipelineLayout>,
    pub(crate) push_stages: vk::ShaderStageFlags,
    _encoder: PhantomData<&'a mut ()>,
}

impl crate::RenderPass for VulkanRenderPassRecorder<'_> {
    fn set_pipeline(&mut self, pipeline: &dyn GraphicsPipeline) {
        if let Some(vk_pipe) = pipeline.as_any().downcast_ref::<VulkanGraphicsPipeline>() {
            unsafe {
                self.device.cmd_bind_pipeline(
                    self.command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    vk_pipe.pipeline,
                );
            }
            self.pipeline_layout = Some(vk_pipe.layout);
            self.push_stages = vk_pipe.push_stages;
        }
    }

    fn bind_descriptor_set(&mut self, set_index: u32, set: &dyn DescriptorSet) {
        if let (Some(layout), Some(vk_set)) = (
            self.pipeline_layout,
            set.as_any().downcast_ref::<VulkanDescriptorSet>(),
        ) {
            unsafe {
                self.device.cmd_bind_descriptor_sets(
                    self.command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
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
                self.device.cmd_push_constants(
                    self.command_buffer,
                    layout,
                    self.push_stages,
                    0,
                    data,
                );
            }
        }
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        let vk_viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe {
            self.device.cmd_set_viewport(self.command_buffer, 0, &[vk_viewport]);
        }
    }

    fn set_scissor(&mut self, offset: (i32, i32), extent: (u32, u32)) {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: offset.0, y: offset.1 },
            extent: vk::Extent2D { width: extent.0, height: extent.1 },
        };
        unsafe {
            self.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
    }

    fn set_index_buffer(&mut self, buffer: &dyn Buffer, offset: u64) {
        let Some(vk_buf) = buffer.as_any().downcast_ref::<VulkanBuffer>() else {
            log::error!(target: "vulkan", "set_index_buffer: buffer is not a VulkanBuffer");
            return;
        };
        unsafe {
            self.device.cmd_bind_index_buffer(
                self.command_buffer,
                vk_buf.buffer,
                offset,
                vk::IndexType::UINT32,
            );
        }
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    fn end(self: Box<Self>) {
        unsafe {
            self.device.cmd_end_rendering(self.command_buffer);
        }
    }
}

impl std::fmt::Debug for VulkanRenderPassRecorder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanRenderPassRecorder")
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}
