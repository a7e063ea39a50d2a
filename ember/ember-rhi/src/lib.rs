//! Ember RHI: Backend-agnostic Rendering Hardware Interface.
//! This crate defines the traits and types the renderer records against, plus a Vulkan 1.3
//! backend and a headless recording backend used for tests and smoke runs.

use std::any::Any;
use std::fmt::Debug;

pub mod headless;

/// Unique identifier for a GPU resource.
pub type ResourceId = u64;

/// Errors reported by backends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RhiError {
    /// The swapchain no longer matches the surface and must be recreated.
    #[error("swapchain is out of date")]
    OutOfDate,
    /// A bounded wait expired before the GPU signaled.
    #[error("timed out waiting for the GPU")]
    Timeout,
    #[error("out of GPU or host memory")]
    OutOfMemory,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type RhiResult<T> = Result<T, RhiError>;

bitflags::bitflags! {
    /// Buffer usage flags; combine for buffers used in multiple ways (e.g. Storage | CopyDst | DeviceAddress).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const INDEX = 1 << 0;
        const UNIFORM = 1 << 1;
        const STORAGE = 1 << 2;
        const COPY_SRC = 1 << 3;
        const COPY_DST = 1 << 4;
        /// Shaders read the buffer through a raw device address instead of a bound descriptor.
        const DEVICE_ADDRESS = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Bgra8Unorm,
    Rgba16Float,
    D32Float,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::D32Float)
    }
}

/// The core device trait that all backends must implement.
pub trait Device: Send + Sync + Debug {
    fn create_buffer(&self, desc: &BufferDescriptor) -> RhiResult<Box<dyn Buffer>>;
    fn create_texture(&self, desc: &TextureDescriptor) -> RhiResult<Box<dyn Texture>>;
    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor,
    ) -> RhiResult<Box<dyn ComputePipeline>>;
    /// Create a graphics pipeline rendered with dynamic rendering.
    /// **Compatibility:** the attachments passed to [`CommandEncoder::begin_render_pass`] must use
    /// the same color/depth formats as `color_targets` and `depth_stencil` in this descriptor.
    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDescriptor,
    ) -> RhiResult<Box<dyn GraphicsPipeline>>;
    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> RhiResult<Box<dyn DescriptorSetLayout>>;
    /// Create a descriptor pool. When `desc.pool_ratios` is empty, backends reserve
    /// `max_sets * 4` descriptors of every type.
    fn create_descriptor_pool(
        &self,
        desc: &DescriptorPoolDescriptor,
    ) -> RhiResult<Box<dyn DescriptorPool>>;

    /// Create a command context: one command pool plus one primary command buffer.
    /// Pools are not thread-safe, so every recording thread needs its own context.
    fn create_command_context(&self) -> RhiResult<Box<dyn CommandContext>>;

    /// Get the main queue (graphics+compute) for submissions.
    fn queue(&self) -> RhiResult<Box<dyn Queue>>;

    /// Write data into a buffer. Buffer must be host-visible (Buffer::host_visible() == true).
    fn write_buffer(&self, buffer: &dyn Buffer, offset: u64, data: &[u8]) -> RhiResult<()>;

    /// Read `len` bytes back from a buffer. Buffer must be host-visible unless the backend
    /// can read device memory directly (the headless backend can).
    fn read_buffer(&self, buffer: &dyn Buffer, offset: u64, len: u64) -> RhiResult<Vec<u8>>;

    /// Wait for the device to become idle (all submitted work finished).
    fn wait_idle(&self) -> RhiResult<()>;

    /// Create a fence for CPU-GPU synchronization.
    fn create_fence(&self, signaled: bool) -> RhiResult<Box<dyn Fence>>;
    /// Create a semaphore for GPU-GPU synchronization.
    fn create_semaphore(&self) -> RhiResult<Box<dyn Semaphore>>;

    /// Create a swapchain for presentation (only supported when the device was created with a surface).
    /// The caller destroys the previous swapchain first; the chain is never mutated in place.
    fn create_swapchain(
        &self,
        extent: (u32, u32),
        format: TextureFormat,
    ) -> RhiResult<Box<dyn Swapchain>> {
        let _ = (extent, format);
        Err(RhiError::Unsupported(
            "swapchain (device created without surface)".to_string(),
        ))
    }
}

/// Fence: CPU can wait for GPU to complete submitted work.
pub trait Fence: Send + Sync + Debug {
    /// Returns [`RhiError::Timeout`] when `timeout_ns` expires first.
    fn wait(&self, timeout_ns: u64) -> RhiResult<()>;
    fn reset(&self) -> RhiResult<()>;
    fn is_signaled(&self) -> RhiResult<bool>;
    fn id(&self) -> ResourceId;
    fn as_any(&self) -> &dyn Any;
}

/// Semaphore: GPU-GPU ordering between queue operations.
pub trait Semaphore: Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
}

/// Queue for submitting work. Supports non-blocking submit with semaphores and fence.
/// The caller must keep the command contexts alive and unrecorded until `signal_fence`
/// has been waited on.
pub trait Queue: Send + Sync + Debug {
    fn submit(
        &self,
        contexts: &[&dyn CommandContext],
        wait_semaphores: &[&dyn Semaphore],
        signal_semaphores: &[&dyn Semaphore],
        signal_fence: Option<&dyn Fence>,
    ) -> RhiResult<()>;
}

/// HostVisible: mappable, write_buffer works. DeviceLocal: faster GPU access, write via copy from staging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferMemoryPreference {
    #[default]
    HostVisible,
    DeviceLocal,
}

#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<&'static str>,
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: BufferMemoryPreference,
}

impl Default for BufferDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            size: 0,
            usage: BufferUsage::STORAGE,
            memory: BufferMemoryPreference::HostVisible,
        }
    }
}

pub trait Buffer: Send + Sync + Debug {
    fn id(&self) -> ResourceId;
    fn size(&self) -> u64;
    fn label(&self) -> Option<&'static str> {
        None
    }
    /// If true, Device::write_buffer can be used. If false, buffer is device-local; upload via staging copy.
    fn host_visible(&self) -> bool {
        true
    }
    /// GPU virtual address; `None` unless created with [`BufferUsage::DEVICE_ADDRESS`].
    fn device_address(&self) -> Option<u64> {
        None
    }
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<&'static str>,
    /// (width, height, depth). 2D textures use depth = 1.
    pub size: (u32, u32, u32),
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            size: (1, 1, 1),
            format: TextureFormat::Rgba16Float,
            usage: TextureUsage::empty(),
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const STORAGE_BINDING = 1 << 2;
        const RENDER_ATTACHMENT = 1 << 3;
    }
}

pub trait Texture: Send + Sync + Debug {
    fn id(&self) -> ResourceId;
    fn format(&self) -> TextureFormat;
    fn size(&self) -> (u32, u32, u32);
    fn as_any(&self) -> &dyn Any;
}

/// Push-constant range shared by every stage in `stages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

pub trait ComputePipeline: Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, Default)]
pub struct ComputePipelineDescriptor {
    pub label: Option<&'static str>,
    /// SPIR-V binary (little-endian, 4-byte aligned).
    pub shader_source: Vec<u8>,
    pub entry_point: String,
    pub layout_bindings: Vec<DescriptorSetLayoutBinding>,
    pub push_constants: Option<PushConstantRange>,
}

/// Graphics pipeline for rasterization (vertex + fragment).
pub trait GraphicsPipeline: Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
}

/// Descriptor for creating a graphics pipeline. Vertices are pulled by the vertex shader
/// through buffer device addresses, so there is no fixed-function vertex input. Pipelines
/// rasterize filled triangle lists without culling or blending.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDescriptor {
    pub label: Option<&'static str>,
    pub vertex_shader: ShaderStage,
    pub fragment_shader: ShaderStage,
    pub color_targets: Vec<ColorTargetState>,
    pub depth_stencil: Option<DepthStencilState>,
    /// Bindings of descriptor set 0. Used to create the pipeline layout.
    pub layout_bindings: Vec<DescriptorSetLayoutBinding>,
    pub push_constants: Option<PushConstantRange>,
}

#[derive(Debug, Clone)]
pub struct ShaderStage {
    pub source: Vec<u8>, // SPIR-V bytes
    pub entry_point: String,
}

#[derive(Debug, Clone)]
pub struct ColorTargetState {
    pub format: TextureFormat,
}

/// Depth is reversed: cleared to 0.0, and a fragment passes when its depth is greater than
/// or equal to the stored value.
#[derive(Debug, Clone)]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_write_enabled: bool,
}

/// Render pass descriptor for begin_render_pass. Attachments must already be in
/// [`ImageLayout::ColorAttachment`] / [`ImageLayout::DepthAttachment`].
#[derive(Debug, Clone)]
pub struct RenderPassDescriptor<'a> {
    pub label: Option<&'static str>,
    pub color_attachments: Vec<ColorAttachment<'a>>,
    pub depth_stencil_attachment: Option<DepthStencilAttachment<'a>>,
    /// Rendered region, anchored at the origin. May be smaller than the attachments.
    pub render_area: (u32, u32),
}

#[derive(Debug, Clone)]
pub struct ColorAttachment<'a> {
    pub texture: &'a dyn Texture,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: Option<ClearColor>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

#[derive(Debug, Clone)]
pub struct DepthStencilAttachment<'a> {
    pub texture: &'a dyn Texture,
    pub depth_load_op: LoadOp,
    pub depth_store_op: StoreOp,
    pub clear_depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    /// Contents are discarded by the transition.
    Undefined,
    /// Read/write from compute shaders (storage image).
    General,
    ColorAttachment,
    DepthAttachment,
    TransferSrc,
    TransferDst,
    /// For swapchain images before present.
    PresentSrc,
}

/// Records commands into the command buffer of a [`CommandContext`].
pub trait CommandEncoder: Debug {
    fn begin_compute_pass(&mut self) -> Box<dyn ComputePass + '_>;
    fn begin_render_pass<'a>(
        &mut self,
        desc: &RenderPassDescriptor<'a>,
    ) -> RhiResult<Box<dyn RenderPass + '_>>;
    fn copy_buffer_to_buffer(
        &mut self,
        src: &dyn Buffer,
        src_offset: u64,
        dst: &dyn Buffer,
        dst_offset: u64,
        size: u64,
    ) -> RhiResult<()>;
    /// Scaled, filtered copy of `src_extent` of `src` onto `dst_extent` of `dst`.
    /// `src` must be in [`ImageLayout::TransferSrc`], `dst` in [`ImageLayout::TransferDst`].
    fn blit_texture(
        &mut self,
        src: &dyn Texture,
        src_extent: (u32, u32),
        dst: &dyn Texture,
        dst_extent: (u32, u32),
    ) -> RhiResult<()>;
    /// Insert a full pipeline barrier that moves `texture` from `old_layout` to `new_layout`.
    fn pipeline_barrier_texture(
        &mut self,
        texture: &dyn Texture,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) -> RhiResult<()>;
}

/// A resettable command pool with one primary command buffer.
pub trait CommandContext: Send + Sync + Debug {
    /// Reset the pool and start one-time-submit recording.
    fn begin(&mut self) -> RhiResult<()>;
    /// Encoder for the buffer currently being recorded.
    fn encoder(&mut self) -> &mut dyn CommandEncoder;
    /// Finish recording; the context can then be submitted.
    fn end(&mut self) -> RhiResult<()>;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Full-depth viewport covering `extent` from the origin.
    pub fn from_extent(extent: (u32, u32)) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: extent.0 as f32,
            height: extent.1 as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Render pass for recording draw calls.
pub trait RenderPass: Debug {
    fn set_pipeline(&mut self, pipeline: &dyn GraphicsPipeline);
    /// Bind a descriptor set for the currently bound graphics pipeline (set_index must match layout).
    fn bind_descriptor_set(&mut self, set_index: u32, set: &dyn DescriptorSet);
    /// Push constants for the bound pipeline, starting at offset 0 of its push-constant range.
    fn set_push_constants(&mut self, data: &[u8]);
    fn set_viewport(&mut self, viewport: &Viewport);
    fn set_scissor(&mut self, offset: (i32, i32), extent: (u32, u32));
    /// Bind a buffer of `u32` indices.
    fn set_index_buffer(&mut self, buffer: &dyn Buffer, offset: u64);
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn end(self: Box<Self>);
}

pub trait ComputePass: Debug {
    fn set_pipeline(&mut self, pipeline: &dyn ComputePipeline);
    fn bind_descriptor_set(&mut self, set_index: u32, set: &dyn DescriptorSet);
    fn set_push_constants(&mut self, data: &[u8]);
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
}

/// Descriptor binding type for layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    StorageImage,
}

/// Descriptor set layout binding.
#[derive(Debug, Clone)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub count: u32,
    pub stages: ShaderStages,
}

/// Descriptor for creating a descriptor pool with configurable per-type capacities.
#[derive(Debug, Clone, Default)]
pub struct DescriptorPoolDescriptor {
    pub max_sets: u32,
    /// Per-type capacity as a ratio of `max_sets` (e.g. `(StorageImage, 1.0)`).
    pub pool_ratios: Vec<(DescriptorType, f32)>,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

/// Descriptor set layout.
pub trait DescriptorSetLayout: Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
}

/// Descriptor pool for allocating sets.
pub trait DescriptorPool: Send + Sync + Debug {
    fn allocate_set(&self, layout: &dyn DescriptorSetLayout) -> RhiResult<Box<dyn DescriptorSet>>;
    /// Return every set allocated from this pool. Sets from before the reset must not be used again.
    fn reset(&self) -> RhiResult<()>;
}

/// Descriptor set for binding resources.
pub trait DescriptorSet: Send + Sync + Debug {
    fn write_buffer(&mut self, binding: u32, buffer: &dyn Buffer, offset: u64, size: u64) -> RhiResult<()>;
    /// Bind a texture in [`ImageLayout::General`] as a storage image.
    fn write_storage_image(&mut self, binding: u32, texture: &dyn Texture) -> RhiResult<()>;
    fn as_any(&self) -> &dyn Any;
}

/// Swapchain for presenting to a window. Acquire an image, render to it, then present.
/// Dropping the swapchain destroys its image views and the chain, never the images themselves.
pub trait Swapchain: Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
    /// Acquire the next image index. `signal` is signaled once the image may be written.
    /// Returns [`RhiError::OutOfDate`] when the chain is stale.
    fn acquire_next_image(&mut self, signal: &dyn Semaphore, timeout_ns: u64) -> RhiResult<u32>;
    /// Presentable image `index` as a texture (transfer destination / color attachment).
    fn image(&self, index: u32) -> Option<&dyn Texture>;
    /// Present the image once `wait` is signaled. Returns [`RhiError::OutOfDate`] when the chain is stale.
    fn present(&self, image_index: u32, wait: &dyn Semaphore) -> RhiResult<()>;
    /// Current extent (width, height).
    fn extent(&self) -> (u32, u32);
    fn image_count(&self) -> u32;
    /// Color format of swapchain images.
    fn format(&self) -> TextureFormat;
}

#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use headless::HeadlessDevice;
#[cfg(feature = "vulkan")]
pub use vulkan::VulkanDevice;
