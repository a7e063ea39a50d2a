//! Headless backend: executes nothing on a GPU, records everything.
//!
//! Every command, fence operation, submission, present and resource lifetime event is appended
//! to an ordered [`HeadlessEvent`] log that tests inspect. Buffer contents live in host memory and
//! buffer copies execute when the command context is submitted, so data round-trips can be
//! verified byte-for-byte. A submission signals its fence immediately unless the device is
//! stalled, in which case fence waits time out.

use crate::{
    Buffer, BufferDescriptor, BufferMemoryPreference, BufferUsage, ClearColor, CommandContext,
    CommandEncoder, ComputePass, ComputePipeline, ComputePipelineDescriptor, DescriptorPool,
    DescriptorPoolDescriptor, DescriptorSet, DescriptorSetLayout, DescriptorSetLayoutBinding,
    Device, Fence, GraphicsPipeline, GraphicsPipelineDescriptor, ImageLayout, LoadOp,
    Queue, RenderPass, RenderPassDescriptor, ResourceId, RhiError, RhiResult, Semaphore,
    Swapchain, Texture, TextureDescriptor, TextureFormat, Viewport,
};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const DEVICE_ADDRESS_BASE: u64 = 0x1_0000_0000;
const DEFAULT_CLEAR: ClearColor = ClearColor { r: 0.0, g: 0.0, b: 0.0, a: 1.0 };

/// One entry of the headless event log.
#[derive(Debug, Clone, PartialEq)]
pub enum HeadlessEvent {
    BufferCreated { id: ResourceId, size: u64, label: Option<&'static str> },
    BufferDestroyed { id: ResourceId, label: Option<&'static str> },
    TextureCreated { id: ResourceId, size: (u32, u32, u32), format: TextureFormat },
    TextureDestroyed { id: ResourceId },
    FenceWaited { fence: ResourceId },
    FenceReset { fence: ResourceId },
    FenceSignaled { fence: ResourceId },
    Submitted {
        commands: Vec<RecordedCommand>,
        wait_semaphores: usize,
        signal_semaphores: usize,
        fence: Option<ResourceId>,
    },
    SwapchainCreated { extent: (u32, u32) },
    SwapchainDestroyed { extent: (u32, u32) },
    Acquired { image_index: u32 },
    AcquireOutOfDate,
    Presented { image_index: u32 },
    PresentOutOfDate,
    DescriptorPoolReset,
    WaitIdle,
    /// Free-form entry pushed through [`HeadlessDevice::mark`].
    Marker(String),
}

/// A command recorded into a headless command context.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    Barrier { texture: ResourceId, old: ImageLayout, new: ImageLayout },
    CopyBuffer { src: ResourceId, dst: ResourceId, size: u64 },
    Blit { src: ResourceId, src_extent: (u32, u32), dst: ResourceId, dst_extent: (u32, u32) },
    BindComputePipeline,
    BindGraphicsPipeline,
    BindDescriptorSet { set_index: u32 },
    PushConstants { data: Vec<u8> },
    Dispatch { x: u32, y: u32, z: u32 },
    /// `clears` holds, per color attachment, the clear color when its load op is `Clear`.
    BeginRendering {
        color: Vec<ResourceId>,
        clears: Vec<Option<ClearColor>>,
        depth: Option<ResourceId>,
        render_area: (u32, u32),
    },
    SetViewport { width: f32, height: f32 },
    SetScissor { extent: (u32, u32) },
    BindIndexBuffer { buffer: ResourceId },
    DrawIndexed { index_count: u32, first_index: u32 },
    EndRendering,
}

#[derive(Debug, Default)]
struct EventLog {
    events: Mutex<Vec<HeadlessEvent>>,
}

impl EventLog {
    fn push(&self, event: HeadlessEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    acquire_out_of_date: AtomicU32,
    present_out_of_date: AtomicU32,
    stalled: AtomicBool,
}

type Storage = Arc<Mutex<Vec<u8>>>;

fn lock_storage(storage: &Storage) -> RhiResult<MutexGuard<'_, Vec<u8>>> {
    storage
        .lock()
        .map_err(|_| RhiError::Backend("headless buffer storage poisoned".to_string()))
}

/// CPU-side device. Cheap to clone through `Arc`.
#[derive(Debug)]
pub struct HeadlessDevice {
    log: Arc<EventLog>,
    faults: Arc<Faults>,
    next_id: Arc<AtomicU64>,
    live_buffers: Arc<AtomicU64>,
    surface: bool,
}

impl HeadlessDevice {
    /// Device with a virtual surface, so swapchains can be created.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    /// Device without a surface; `create_swapchain` fails like on a real headless device.
    pub fn without_surface() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    fn build(surface: bool) -> Self {
        Self {
            log: Arc::new(EventLog::default()),
            faults: Arc::new(Faults::default()),
            next_id: Arc::new(AtomicU64::new(1)),
            live_buffers: Arc::new(AtomicU64::new(0)),
            surface,
        }
    }

    fn next_id(&self) -> ResourceId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<HeadlessEvent> {
        self.log.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear_events(&self) {
        if let Ok(mut events) = self.log.events.lock() {
            events.clear();
        }
    }

    /// Append a marker to the event log (used to order CPU-side actions against GPU events).
    pub fn mark(&self, label: impl Into<String>) {
        self.log.push(HeadlessEvent::Marker(label.into()));
    }

    /// The next `count` acquires report the swapchain as out of date.
    pub fn fail_next_acquires(&self, count: u32) {
        self.faults.acquire_out_of_date.store(count, Ordering::SeqCst);
    }

    /// The next `count` presents report the swapchain as out of date.
    pub fn fail_next_presents(&self, count: u32) {
        self.faults.present_out_of_date.store(count, Ordering::SeqCst);
    }

    /// While stalled, submissions never signal their fence.
    pub fn set_stalled(&self, stalled: bool) {
        self.faults.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Buffers created and not yet dropped.
    pub fn live_buffer_count(&self) -> u64 {
        self.live_buffers.load(Ordering::SeqCst)
    }

    /// Submission events only, in order.
    pub fn submissions(&self) -> Vec<Vec<RecordedCommand>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HeadlessEvent::Submitted { commands, .. } => Some(commands),
                _ => None,
            })
            .collect()
    }
}

impl Device for HeadlessDevice {
    fn create_buffer(&self, desc: &BufferDescriptor) -> RhiResult<Box<dyn Buffer>> {
        if desc.size == 0 {
            return Err(RhiError::InvalidArgument("buffer size must be non-zero".to_string()));
        }
        let id = self.next_id();
        let device_address = desc
            .usage
            .contains(BufferUsage::DEVICE_ADDRESS)
            .then(|| DEVICE_ADDRESS_BASE + (id << 24));
        self.live_buffers.fetch_add(1, Ordering::SeqCst);
        self.log.push(HeadlessEvent::BufferCreated { id, size: desc.size, label: desc.label });
        Ok(Box::new(HeadlessBuffer {
            id,
            label: desc.label,
            size: desc.size,
            host_visible: desc.memory == BufferMemoryPreference::HostVisible,
            device_address,
            storage: Arc::new(Mutex::new(vec![0; desc.size as usize])),
            log: Arc::clone(&self.log),
            live: Arc::clone(&self.live_buffers),
        }))
    }

    fn create_texture(&self, desc: &TextureDescriptor) -> RhiResult<Box<dyn Texture>> {
        let id = self.next_id();
        self.log.push(HeadlessEvent::TextureCreated { id, size: desc.size, format: desc.format });
        Ok(Box::new(HeadlessTexture {
            id,
            format: desc.format,
            size: desc.size,
            log: Some(Arc::clone(&self.log)),
        }))
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor,
    ) -> RhiResult<Box<dyn ComputePipeline>> {
        check_spirv(&desc.shader_source)?;
        Ok(Box::new(HeadlessPipeline { label: desc.label }))
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor,
    ) -> RhiResult<Box<dyn GraphicsPipeline>> {
        check_spirv(&desc.vertex_shader.source)?;
        check_spirv(&desc.fragment_shader.source)?;
        Ok(Box::new(HeadlessPipeline { label: desc.label }))
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> RhiResult<Box<dyn DescriptorSetLayout>> {
        Ok(Box::new(HeadlessDescriptorSetLayout { bindings: bindings.to_vec() }))
    }

    fn create_descriptor_pool(
        &self,
        desc: &DescriptorPoolDescriptor,
    ) -> RhiResult<Box<dyn DescriptorPool>> {
        Ok(Box::new(HeadlessDescriptorPool {
            max_sets: desc.max_sets,
            allocated: AtomicU32::new(0),
            log: Arc::clone(&self.log),
        }))
    }

    fn create_command_context(&self) -> RhiResult<Box<dyn CommandContext>> {
        Ok(Box::new(HeadlessCommandContext {
            encoder: HeadlessEncoder::default(),
            recording: false,
            recorded: false,
        }))
    }

    fn queue(&self) -> RhiResult<Box<dyn Queue>> {
        Ok(Box::new(HeadlessQueue {
            log: Arc::clone(&self.log),
            faults: Arc::clone(&self.faults),
        }))
    }

    fn write_buffer(&self, buffer: &dyn Buffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let buf = downcast_buffer(buffer)?;
        if !buf.host_visible {
            return Err(RhiError::InvalidArgument(
                "write_buffer on a device-local buffer".to_string(),
            ));
        }
        let mut storage = lock_storage(&buf.storage)?;
        let range = byte_range(offset, data.len() as u64, buf.size)?;
        storage[range].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &dyn Buffer, offset: u64, len: u64) -> RhiResult<Vec<u8>> {
        let buf = downcast_buffer(buffer)?;
        let storage = lock_storage(&buf.storage)?;
        let range = byte_range(offset, len, buf.size)?;
        Ok(storage[range].to_vec())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.log.push(HeadlessEvent::WaitIdle);
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<Box<dyn Fence>> {
        Ok(Box::new(HeadlessFence {
            id: self.next_id(),
            signaled: AtomicBool::new(signaled),
            log: Arc::clone(&self.log),
        }))
    }

    fn create_semaphore(&self) -> RhiResult<Box<dyn Semaphore>> {
        Ok(Box::new(HeadlessSemaphore { id: self.next_id() }))
    }

    fn create_swapchain(
        &self,
        extent: (u32, u32),
        format: TextureFormat,
    ) -> RhiResult<Box<dyn Swapchain>> {
        if !self.surface {
            return Err(RhiError::Unsupported(
                "swapchain (device created without surface)".to_string(),
            ));
        }
        if extent.0 == 0 || extent.1 == 0 {
            return Err(RhiError::InvalidArgument(format!("swapchain extent {:?}", extent)));
        }
        let images = (0..3)
            .map(|_| HeadlessTexture {
                id: self.next_id(),
                format,
                size: (extent.0, extent.1, 1),
                log: None,
            })
            .collect();
        self.log.push(HeadlessEvent::SwapchainCreated { extent });
        Ok(Box::new(HeadlessSwapchain {
            images,
            extent,
            format,
            next_image: 0,
            log: Arc::clone(&self.log),
            faults: Arc::clone(&self.faults),
        }))
    }
}

fn check_spirv(bytes: &[u8]) -> RhiResult<()> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(RhiError::InvalidArgument("SPIR-V must be 4-byte aligned".to_string()));
    }
    Ok(())
}

fn byte_range(offset: u64, len: u64, size: u64) -> RhiResult<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= size)
        .ok_or_else(|| {
            RhiError::InvalidArgument(format!("range {}+{} exceeds buffer size {}", offset, len, size))
        })?;
    Ok(offset as usize..end as usize)
}

fn downcast_buffer(buffer: &dyn Buffer) -> RhiResult<&HeadlessBuffer> {
    buffer
        .as_any()
        .downcast_ref::<HeadlessBuffer>()
        .ok_or_else(|| RhiError::InvalidArgument("buffer is not a headless buffer".to_string()))
}

pub struct HeadlessBuffer {
    id: ResourceId,
    label: Option<&'static str>,
    size: u64,
    host_visible: bool,
    device_address: Option<u64>,
    storage: Storage,
    log: Arc<EventLog>,
    live: Arc<AtomicU64>,
}

impl Drop for HeadlessBuffer {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.log.push(HeadlessEvent::BufferDestroyed { id: self.id, label: self.label });
    }
}

impl std::fmt::Debug for HeadlessBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessBuffer")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("size", &self.size)
            .finish()
    }
}

impl Buffer for HeadlessBuffer {
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
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Texture record; swapchain images carry no log because the chain owns them.
#[derive(Debug)]
pub struct HeadlessTexture {
    id: ResourceId,
    format: TextureFormat,
    size: (u32, u32, u32),
    log: Option<Arc<EventLog>>,
}

impl Drop for HeadlessTexture {
    fn drop(&mut self) {
        if let Some(log) = &self.log {
            log.push(HeadlessEvent::TextureDestroyed { id: self.id });
        }
    }
}

impl Texture for HeadlessTexture {
    fn id(&self) -> ResourceId {
        self.id
    }
    fn format(&self) -> TextureFormat {
        self.format
    }
    fn size(&self) -> (u32, u32, u32) {
        self.size
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct HeadlessPipeline {
    #[allow(dead_code)]
    label: Option<&'static str>,
}

impl ComputePipeline for HeadlessPipeline {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl GraphicsPipeline for HeadlessPipeline {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct HeadlessDescriptorSetLayout {
    bindings: Vec<DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayout for HeadlessDescriptorSetLayout {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct HeadlessDescriptorPool {
    max_sets: u32,
    allocated: AtomicU32,
    log: Arc<EventLog>,
}

impl DescriptorPool for HeadlessDescriptorPool {
    fn allocate_set(&self, layout: &dyn DescriptorSetLayout) -> RhiResult<Box<dyn DescriptorSet>> {
        let layout = layout
            .as_any()
            .downcast_ref::<HeadlessDescriptorSetLayout>()
            .ok_or_else(|| RhiError::InvalidArgument("layout is not a headless layout".to_string()))?;
        if self.allocated.fetch_add(1, Ordering::SeqCst) >= self.max_sets {
            self.allocated.fetch_sub(1, Ordering::SeqCst);
            return Err(RhiError::OutOfMemory);
        }
        Ok(Box::new(HeadlessDescriptorSet {
            bindings: layout.bindings.iter().map(|b| b.binding).collect(),
        }))
    }

    fn reset(&self) -> RhiResult<()> {
        self.allocated.store(0, Ordering::SeqCst);
        self.log.push(HeadlessEvent::DescriptorPoolReset);
        Ok(())
    }
}

#[derive(Debug)]
struct HeadlessDescriptorSet {
    bindings: Vec<u32>,
}

impl HeadlessDescriptorSet {
    fn check_binding(&self, binding: u32) -> RhiResult<()> {
        if self.bindings.contains(&binding) {
            Ok(())
        } else {
            Err(RhiError::InvalidArgument(format!("binding {} not in layout", binding)))
        }
    }
}

impl DescriptorSet for HeadlessDescriptorSet {
    fn write_buffer(&mut self, binding: u32, _buffer: &dyn Buffer, _offset: u64, _size: u64) -> RhiResult<()> {
        self.check_binding(binding)
    }

    fn write_storage_image(&mut self, binding: u32, _texture: &dyn Texture) -> RhiResult<()> {
        self.check_binding(binding)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Deferred buffer copy, executed on submit.
#[derive(Debug, Clone)]
struct PendingCopy {
    src: Storage,
    src_offset: u64,
    dst: Storage,
    dst_offset: u64,
    size: u64,
}

impl PendingCopy {
    fn execute(&self) -> RhiResult<()> {
        let bytes = {
            let src = lock_storage(&self.src)?;
            let range = byte_range(self.src_offset, self.size, src.len() as u64)?;
            src[range].to_vec()
        };
        let mut dst = lock_storage(&self.dst)?;
        let range = byte_range(self.dst_offset, self.size, dst.len() as u64)?;
        dst[range].copy_from_slice(&bytes);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HeadlessEncoder {
    commands: Vec<RecordedCommand>,
    copies: Vec<PendingCopy>,
}

impl CommandEncoder for HeadlessEncoder {
    fn begin_compute_pass(&mut self) -> Box<dyn ComputePass + '_> {
        Box::new(HeadlessPass { commands: &mut self.commands })
    }

    fn begin_render_pass<'a>(
        &mut self,
        desc: &RenderPassDescriptor<'a>,
    ) -> RhiResult<Box<dyn RenderPass + '_>> {
        if desc.color_attachments.is_empty() && desc.depth_stencil_attachment.is_none() {
            return Err(RhiError::InvalidArgument("render pass without attachments".to_string()));
        }
        self.commands.push(RecordedCommand::BeginRendering {
            color: desc.color_attachments.iter().map(|a| a.texture.id()).collect(),
            clears: desc
                .color_attachments
                .iter()
                .map(|a| match a.load_op {
                    LoadOp::Clear => Some(a.clear_value.unwrap_or(DEFAULT_CLEAR)),
                    LoadOp::Load => None,
                })
                .collect(),
            depth: desc.depth_stencil_attachment.as_ref().map(|d| d.texture.id()),
            render_area: desc.render_area,
        });
        Ok(Box::new(HeadlessPass { commands: &mut self.commands }))
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: &dyn Buffer,
        src_offset: u64,
        dst: &dyn Buffer,
        dst_offset: u64,
        size: u64,
    ) -> RhiResult<()> {
        let (src_buf, dst_buf) = (downcast_buffer(src)?, downcast_buffer(dst)?);
        byte_range(src_offset, size, src_buf.size)?;
        byte_range(dst_offset, size, dst_buf.size)?;
        self.commands.push(RecordedCommand::CopyBuffer { src: src.id(), dst: dst.id(), size });
        self.copies.push(PendingCopy {
            src: Arc::clone(&src_buf.storage),
            src_offset,
            dst: Arc::clone(&dst_buf.storage),
            dst_offset,
            size,
        });
        Ok(())
    }

    fn blit_texture(
        &mut self,
        src: &dyn Texture,
        src_extent: (u32, u32),
        dst: &dyn Texture,
        dst_extent: (u32, u32),
    ) -> RhiResult<()> {
        self.commands.push(RecordedCommand::Blit {
            src: src.id(),
            src_extent,
            dst: dst.id(),
            dst_extent,
        });
        Ok(())
    }

    fn pipeline_barrier_texture(
        &mut self,
        texture: &dyn Texture,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) -> RhiResult<()> {
        self.commands.push(RecordedCommand::Barrier {
            texture: texture.id(),
            old: old_layout,
            new: new_layout,
        });
        Ok(())
    }
}

/// Shared recorder for compute and render passes.
#[derive(Debug)]
struct HeadlessPass<'a> {
    commands: &'a mut Vec<RecordedCommand>,
}

impl ComputePass for HeadlessPass<'_> {
    fn set_pipeline(&mut self, _pipeline: &dyn ComputePipeline) {
        self.commands.push(RecordedCommand::BindComputePipeline);
    }
    fn bind_descriptor_set(&mut self, set_index: u32, _set: &dyn DescriptorSet) {
        self.commands.push(RecordedCommand::BindDescriptorSet { set_index });
    }
    fn set_push_constants(&mut self, data: &[u8]) {
        self.commands.push(RecordedCommand::PushConstants { data: data.to_vec() });
    }
    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(RecordedCommand::Dispatch { x, y, z });
    }
}

impl RenderPass for HeadlessPass<'_> {
    fn set_pipeline(&mut self, _pipeline: &dyn GraphicsPipeline) {
        self.commands.push(RecordedCommand::BindGraphicsPipeline);
    }
    fn bind_descriptor_set(&mut self, set_index: u32, _set: &dyn DescriptorSet) {
        self.commands.push(RecordedCommand::BindDescriptorSet { set_index });
    }
    fn set_push_constants(&mut self, data: &[u8]) {
        self.commands.push(RecordedCommand::PushConstants { data: data.to_vec() });
    }
    fn set_viewport(&mut self, viewport: &Viewport) {
        self.commands.push(RecordedCommand::SetViewport {
            width: viewport.width,
            height: viewport.height,
        });
    }
    fn set_scissor(&mut self, _offset: (i32, i32), extent: (u32, u32)) {
        self.commands.push(RecordedCommand::SetScissor { extent });
    }
    fn set_index_buffer(&mut self, buffer: &dyn Buffer, _offset: u64) {
        self.commands.push(RecordedCommand::BindIndexBuffer { buffer: buffer.id() });
    }
    fn draw_indexed(
        &mut self,
        index_count: u32,
        _instance_count: u32,
        first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.commands.push(RecordedCommand::DrawIndexed { index_count, first_index });
    }
    fn end(self: Box<Self>) {
        self.commands.push(RecordedCommand::EndRendering);
    }
}

#[derive(Debug)]
struct HeadlessCommandContext {
    encoder: HeadlessEncoder,
    recording: bool,
    recorded: bool,
}

impl CommandContext for HeadlessCommandContext {
    fn begin(&mut self) -> RhiResult<()> {
        self.encoder.commands.clear();
        self.encoder.copies.clear();
        self.recording = true;
        self.recorded = false;
        Ok(())
    }

    fn encoder(&mut self) -> &mut dyn CommandEncoder {
        &mut self.encoder
    }

    fn end(&mut self) -> RhiResult<()> {
        if !self.recording {
            return Err(RhiError::InvalidArgument("end without begin".to_string()));
        }
        self.recording = false;
        self.recorded = true;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct HeadlessQueue {
    log: Arc<EventLog>,
    faults: Arc<Faults>,
}

impl Queue for HeadlessQueue {
    fn submit(
        &self,
        contexts: &[&dyn CommandContext],
        wait_semaphores: &[&dyn Semaphore],
        signal_semaphores: &[&dyn Semaphore],
        signal_fence: Option<&dyn Fence>,
    ) -> RhiResult<()> {
        let mut commands = Vec::new();
        for ctx in contexts {
            let ctx = ctx
                .as_any()
                .downcast_ref::<HeadlessCommandContext>()
                .ok_or_else(|| RhiError::InvalidArgument("context is not headless".to_string()))?;
            if !ctx.recorded {
                return Err(RhiError::InvalidArgument(
                    "submitted a command context that is not ended".to_string(),
                ));
            }
            for copy in &ctx.encoder.copies {
                copy.execute()?;
            }
            commands.extend(ctx.encoder.commands.iter().cloned());
        }
        let fence = match signal_fence {
            Some(f) => Some(
                f.as_any()
                    .downcast_ref::<HeadlessFence>()
                    .ok_or_else(|| RhiError::InvalidArgument("fence is not headless".to_string()))?,
            ),
            None => None,
        };
        self.log.push(HeadlessEvent::Submitted {
            commands,
            wait_semaphores: wait_semaphores.len(),
            signal_semaphores: signal_semaphores.len(),
            fence: fence.map(|f| f.id),
        });
        if let Some(fence) = fence {
            if !self.faults.stalled.load(Ordering::SeqCst) {
                fence.signaled.store(true, Ordering::SeqCst);
                self.log.push(HeadlessEvent::FenceSignaled { fence: fence.id });
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct HeadlessFence {
    id: ResourceId,
    signaled: AtomicBool,
    log: Arc<EventLog>,
}

impl Fence for HeadlessFence {
    fn wait(&self, _timeout_ns: u64) -> RhiResult<()> {
        // Work executes at submit time, so an unsignaled fence will never signal.
        if !self.signaled.load(Ordering::SeqCst) {
            return Err(RhiError::Timeout);
        }
        self.log.push(HeadlessEvent::FenceWaited { fence: self.id });
        Ok(())
    }

    fn reset(&self) -> RhiResult<()> {
        self.signaled.store(false, Ordering::SeqCst);
        self.log.push(HeadlessEvent::FenceReset { fence: self.id });
        Ok(())
    }

    fn is_signaled(&self) -> RhiResult<bool> {
        Ok(self.signaled.load(Ordering::SeqCst))
    }

    fn id(&self) -> ResourceId {
        self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct HeadlessSemaphore {
    #[allow(dead_code)]
    id: ResourceId,
}

impl Semaphore for HeadlessSemaphore {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct HeadlessSwapchain {
    images: Vec<HeadlessTexture>,
    extent: (u32, u32),
    format: TextureFormat,
    next_image: u32,
    log: Arc<EventLog>,
    faults: Arc<Faults>,
}

fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Drop for HeadlessSwapchain {
    fn drop(&mut self) {
        self.log.push(HeadlessEvent::SwapchainDestroyed { extent: self.extent });
    }
}

impl Swapchain for HeadlessSwapchain {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn acquire_next_image(&mut self, _signal: &dyn Semaphore, _timeout_ns: u64) -> RhiResult<u32> {
        if take_fault(&self.faults.acquire_out_of_date) {
            self.log.push(HeadlessEvent::AcquireOutOfDate);
            return Err(RhiError::OutOfDate);
        }
        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % self.images.len() as u32;
        self.log.push(HeadlessEvent::Acquired { image_index });
        Ok(image_index)
    }

    fn image(&self, index: u32) -> Option<&dyn Texture> {
        self.images.get(index as usize).map(|t| t as &dyn Texture)
    }

    fn present(&self, image_index: u32, _wait: &dyn Semaphore) -> RhiResult<()> {
        if take_fault(&self.faults.present_out_of_date) {
            self.log.push(HeadlessEvent::PresentOutOfDate);
            return Err(RhiError::OutOfDate);
        }
        self.log.push(HeadlessEvent::Presented { image_index });
        Ok(())
    }

    fn extent(&self) -> (u32, u32) {
        self.extent
    }

    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn format(&self) -> TextureFormat {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BufferUsage;

    fn submit_one(device: &HeadlessDevice, record: impl FnOnce(&mut dyn CommandEncoder)) {
        let mut ctx = device.create_command_context().unwrap();
        ctx.begin().unwrap();
        record(ctx.encoder());
        ctx.end().unwrap();
        let fence = device.create_fence(false).unwrap();
        device.queue().unwrap().submit(&[ctx.as_ref()], &[], &[], Some(fence.as_ref())).unwrap();
        fence.wait(0).unwrap();
    }

    #[test]
    fn copies_execute_on_submit() {
        let device = HeadlessDevice::new();
        let src = device
            .create_buffer(&BufferDescriptor { size: 8, ..Default::default() })
            .unwrap();
        let dst = device
            .create_buffer(&BufferDescriptor {
                size: 8,
                usage: BufferUsage::STORAGE | BufferUsage::COPY_DST,
                memory: BufferMemoryPreference::DeviceLocal,
                ..Default::default()
            })
            .unwrap();
        device.write_buffer(src.as_ref(), 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        submit_one(&device, |enc| {
            enc.copy_buffer_to_buffer(src.as_ref(), 4, dst.as_ref(), 0, 4).unwrap();
        });
        assert_eq!(device.read_buffer(dst.as_ref(), 0, 4).unwrap(), vec![5, 6, 7, 8]);
        assert!(device.write_buffer(dst.as_ref(), 0, &[0]).is_err());
    }

    #[test]
    fn stalled_device_times_out_fence_waits() {
        let device = HeadlessDevice::new();
        device.set_stalled(true);
        let mut ctx = device.create_command_context().unwrap();
        ctx.begin().unwrap();
        ctx.end().unwrap();
        let fence = device.create_fence(false).unwrap();
        device.queue().unwrap().submit(&[ctx.as_ref()], &[], &[], Some(fence.as_ref())).unwrap();
        assert_eq!(fence.wait(1_000), Err(RhiError::Timeout));
    }

    #[test]
    fn injected_acquire_failure_is_reported_once() {
        let device = HeadlessDevice::new();
        let mut swapchain = device.create_swapchain((64, 32), TextureFormat::Bgra8Unorm).unwrap();
        let semaphore = device.create_semaphore().unwrap();
        device.fail_next_acquires(1);
        assert_eq!(
            swapchain.acquire_next_image(semaphore.as_ref(), 0),
            Err(RhiError::OutOfDate)
        );
        assert_eq!(swapchain.acquire_next_image(semaphore.as_ref(), 0), Ok(0));
        drop(swapchain);
        assert!(device
            .events()
            .contains(&HeadlessEvent::SwapchainDestroyed { extent: (64, 32) }));
    }

    #[test]
    fn dropped_buffers_are_logged() {
        let device = HeadlessDevice::new();
        let buffer = device
            .create_buffer(&BufferDescriptor { label: Some("tmp"), size: 4, ..Default::default() })
            .unwrap();
        assert_eq!(device.live_buffer_count(), 1);
        let id = buffer.id();
        drop(buffer);
        assert_eq!(device.live_buffer_count(), 0);
        assert!(device
            .events()
            .contains(&HeadlessEvent::BufferDestroyed { id, label: Some("tmp") }));
    }
}
