//! The engine: owns every core component and drives one frame per [`Engine::tick`].
//!
//! Setup order is device → allocator → swapchain → frame ring → immediate channel → draw/depth
//! images → descriptors → pipelines → default quad. Everything persistent is registered with the
//! global deletion queue as it is created, so teardown is a single LIFO flush.

use std::sync::Arc;
use std::time::Instant;

use ember_rhi::{
    BufferDescriptor, BufferMemoryPreference, BufferUsage, ClearColor, ColorAttachment,
    ColorTargetState, CommandEncoder, ComputePipeline, DepthStencilAttachment, DepthStencilState,
    DescriptorPool, DescriptorPoolDescriptor, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutBinding, DescriptorType, Device, GraphicsPipeline,
    GraphicsPipelineDescriptor, LoadOp, PushConstantRange, Queue,
    RenderPassDescriptor, ShaderStage, ShaderStages, StoreOp, TextureDescriptor, TextureUsage,
    Viewport,
};
use glam::Mat4;

use crate::config::EngineConfig;
use crate::deletion::{Deferred, DeletionQueue};
use crate::effects::{default_effects, effect_layout_bindings, effect_pipeline_descriptor, ComputePushConstants};
use crate::error::{RendererError, Result};
use crate::events::{EngineEvent, EventEffect, LoopControl, LoopState};
use crate::frame::FrameRing;
use crate::graph::{self, FramePasses, FrameTargets, FRAME_SCHEDULE};
use crate::immediate::ImmediateSubmit;
use crate::loader::{self, MeshAsset};
use crate::overlay::{Overlay, Tunables};
use crate::present::{AcquireOutcome, PresentOutcome, SwapchainManager};
use crate::resources::{Allocator, ImageHandle};
use crate::scene::{aspect_ratio, Camera, GpuDrawPushConstants, SceneData};
use crate::shader::{self, ShaderLibrary};
use crate::upload::{self, GpuMeshBuffers, Vertex};

/// How a single `draw` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Acquire reported a stale swapchain; nothing was submitted.
    Skipped,
    /// Submitted, but present reported a stale swapchain.
    PresentStale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub frames_submitted: u64,
    pub frames_skipped: u64,
    pub swapchain_rebuilds: u64,
}

/// Descriptor objects and pipelines that live until teardown.
///
/// The global deletion queue holds clones of every `Arc`; the GPU objects are destroyed when the
/// queue is flushed after this struct has been dropped.
#[derive(Debug)]
struct Persistent {
    draw_image_set: Box<dyn DescriptorSet>,
    scene_layout: Arc<dyn DescriptorSetLayout>,
    effect_pipelines: Vec<Arc<dyn ComputePipeline>>,
    mesh_pipeline: Arc<dyn GraphicsPipeline>,
}

#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    queue: Box<dyn Queue>,
    swapchain: SwapchainManager,
    frames: FrameRing,
    immediate: ImmediateSubmit,
    draw_image: ImageHandle,
    depth_image: ImageHandle,
    draw_image_extent: (u32, u32),
    persistent: Option<Persistent>,
    quad: Option<GpuMeshBuffers>,
    meshes: Vec<MeshAsset>,
    tunables: Tunables,
    camera: Camera,
    state: LoopState,
    started: Instant,
    stats: EngineStats,
    cleaned_up: bool,
    global_deletion: DeletionQueue,
    allocator: Allocator,
    device: Arc<dyn Device>,
}

impl Engine {
    /// Bring up every core component on `device` and upload the default quad.
    ///
    /// `window_extent` is the current framebuffer size; the draw image uses
    /// `config.window_extent`.
    pub fn new(
        device: Arc<dyn Device>,
        config: EngineConfig,
        shaders: &ShaderLibrary,
        window_extent: (u32, u32),
    ) -> Result<Self> {
        config.validate()?;
        let timeout_ns = config.fence_timeout_ns();
        let queue = device.queue()?;
        let mut allocator = Allocator::new(Arc::clone(&device));

        let mut swapchain = SwapchainManager::new(Arc::clone(&device), config.swapchain_format, timeout_ns);
        swapchain.create(window_extent)?;
        let frames = FrameRing::new(Arc::clone(&device), config.frames_in_flight, timeout_ns)?;
        let immediate = ImmediateSubmit::new(device.as_ref(), timeout_ns)?;

        let mut global_deletion = DeletionQueue::new("global");
        let (draw_image, depth_image, persistent) =
            match init_persistent(device.as_ref(), &config, shaders, &mut allocator, &mut global_deletion) {
                Ok(parts) => parts,
                Err(e) => {
                    if let Err(flush_err) = global_deletion.flush(&mut allocator) {
                        log::warn!("cleanup after failed init: {}", flush_err);
                    }
                    return Err(e);
                }
            };

        let mut engine = Self {
            draw_image_extent: config.window_extent,
            tunables: Tunables::new(config.render_scale, default_effects()),
            config,
            queue,
            swapchain,
            frames,
            immediate,
            draw_image,
            depth_image,
            persistent: Some(persistent),
            quad: None,
            meshes: Vec::new(),
            camera: Camera::default(),
            state: LoopState::Running,
            started: Instant::now(),
            stats: EngineStats::default(),
            cleaned_up: false,
            global_deletion,
            allocator,
            device,
        };

        let (indices, vertices) = default_quad();
        engine.quad = Some(engine.upload_mesh(&indices, &vertices)?);

        log::info!(
            "engine initialized: draw image {}x{}, {} frames in flight",
            engine.draw_image_extent.0,
            engine.draw_image_extent.1,
            engine.frames.len()
        );
        Ok(engine)
    }

    /// Upload a mesh and register its buffers with the global deletion queue.
    pub fn upload_mesh(&mut self, indices: &[u32], vertices: &[Vertex]) -> Result<GpuMeshBuffers> {
        let buffers = upload::upload_mesh(
            &mut self.allocator,
            self.queue.as_ref(),
            &mut self.immediate,
            indices,
            vertices,
        )?;
        buffers.defer_destroy(&mut self.global_deletion);
        Ok(buffers)
    }

    /// Draw `meshes` after the quad from the next frame on.
    pub fn add_meshes(&mut self, meshes: Vec<MeshAsset>) {
        self.meshes.extend(meshes);
    }

    /// Load `config.mesh_path`. A missing file leaves the scene with just the quad.
    pub fn load_default_meshes(&mut self) -> Result<usize> {
        let path = self.config.mesh_path.clone();
        let meshes = loader::load_meshes(&path, self)?;
        let count = meshes.len();
        self.add_meshes(meshes);
        Ok(count)
    }

    /// One iteration of the main loop: pending resize, events, then at most one frame.
    pub fn tick(
        &mut self,
        events: &[EngineEvent],
        window_size: (u32, u32),
        overlay: &mut dyn Overlay,
    ) -> Result<LoopControl> {
        if self.state == LoopState::ResizePending && window_size.0 > 0 && window_size.1 > 0 {
            self.swapchain.resize(window_size)?;
            self.stats.swapchain_rebuilds += 1;
            self.state = LoopState::Running;
        }

        for event in events {
            if let EventEffect::ForwardKey(key) = self.state.on_event(*event) {
                overlay.handle_key(key, &mut self.tunables);
            }
        }

        match self.state {
            LoopState::Quitting => return Ok(LoopControl::Exit),
            LoopState::Suspended | LoopState::ResizePending => return Ok(LoopControl::Throttle),
            LoopState::Running => {}
        }

        overlay.prepare(&mut self.tunables);
        match self.draw(overlay)? {
            FrameOutcome::Presented => {}
            FrameOutcome::Skipped | FrameOutcome::PresentStale => {
                self.state = LoopState::ResizePending;
            }
        }
        Ok(LoopControl::Continue)
    }

    /// Record, submit and present one frame.
    pub fn draw(&mut self, overlay: &mut dyn Overlay) -> Result<FrameOutcome> {
        let persistent = self
            .persistent
            .as_ref()
            .ok_or_else(|| RendererError::InvalidState("draw after cleanup".to_string()))?;

        self.frames.begin_frame(&mut self.allocator)?;
        let image_index = match self.swapchain.acquire(self.frames.current().swapchain_semaphore())? {
            AcquireOutcome::Image(index) => index,
            AcquireOutcome::OutOfDate => {
                self.frames.cancel_frame()?;
                self.stats.frames_skipped += 1;
                return Ok(FrameOutcome::Skipped);
            }
        };

        let swapchain_extent = self
            .swapchain
            .extent()
            .ok_or_else(|| RendererError::InvalidState("no swapchain".to_string()))?;
        let draw_extent = graph::draw_extent(
            swapchain_extent,
            self.draw_image_extent,
            self.tunables.render_scale,
        );
        let aspect = aspect_ratio(draw_extent);

        let scene_buffer = self.allocator.create_buffer(&BufferDescriptor {
            label: Some("scene data"),
            size: std::mem::size_of::<SceneData>() as u64,
            usage: BufferUsage::UNIFORM,
            memory: BufferMemoryPreference::HostVisible,
        })?;
        self.frames.current_mut().deletion().push_buffer(scene_buffer);
        let scene = SceneData::new(&self.camera, aspect);
        self.allocator
            .write_buffer(scene_buffer, 0, bytemuck::bytes_of(&scene))?;
        let mut scene_set = self
            .frames
            .current()
            .descriptors()
            .allocate_set(persistent.scene_layout.as_ref())?;
        scene_set.write_buffer(
            0,
            self.allocator.buffer(scene_buffer)?,
            0,
            std::mem::size_of::<SceneData>() as u64,
        )?;

        let background = match self.tunables.active_index() {
            Some(index) => {
                let pipeline = persistent.effect_pipelines.get(index).ok_or_else(|| {
                    RendererError::InvalidState(format!("no pipeline for effect {}", index))
                })?;
                let data = self.tunables.effects[index]
                    .data
                    .with_frame(draw_extent, self.started.elapsed().as_secs_f32());
                Some((pipeline.as_ref(), data))
            }
            None => None,
        };

        let mut draws = Vec::new();
        if let Some(quad) = &self.quad {
            draws.push(MeshDraw {
                index_buffer: self.allocator.buffer(quad.index_buffer)?,
                first_index: 0,
                index_count: quad.index_count,
                push: GpuDrawPushConstants::new(Mat4::IDENTITY, quad.vertex_buffer_address),
            });
        }
        let world = self.camera.world(Mat4::IDENTITY, aspect);
        for mesh in &self.meshes {
            let index_buffer = self.allocator.buffer(mesh.buffers.index_buffer)?;
            for surface in &mesh.surfaces {
                draws.push(MeshDraw {
                    index_buffer,
                    first_index: surface.start_index,
                    index_count: surface.count,
                    push: GpuDrawPushConstants::new(world, mesh.buffers.vertex_buffer_address),
                });
            }
        }

        let targets = FrameTargets {
            draw: self.allocator.image(self.draw_image)?,
            depth: self.allocator.image(self.depth_image)?,
            swapchain: self.swapchain.image(image_index)?,
            draw_extent,
            swapchain_extent,
        };
        let mut passes = EnginePasses {
            background,
            effect_set: persistent.draw_image_set.as_ref(),
            mesh_pipeline: persistent.mesh_pipeline.as_ref(),
            scene_set: scene_set.as_ref(),
            draws: &draws,
            clear_depth: self.config.clear_depth,
            overlay,
        };
        graph::record_frame(
            self.frames.current_mut().encoder(),
            &targets,
            FRAME_SCHEDULE,
            &mut passes,
        )?;

        self.frames.submit(self.queue.as_ref())?;
        let presented = self
            .swapchain
            .present(image_index, self.frames.current().render_semaphore())?;
        self.frames.advance();
        self.stats.frames_submitted += 1;
        log::trace!("frame {} submitted", self.stats.frames_submitted);

        Ok(match presented {
            PresentOutcome::Presented => FrameOutcome::Presented,
            PresentOutcome::OutOfDate => FrameOutcome::PresentStale,
        })
    }

    /// Wait for the GPU, flush every deletion queue and destroy the swapchain. Idempotent.
    ///
    /// Every step runs even if an earlier one fails; the first error is returned.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        self.cleaned_up = true;
        let mut first_error: Option<RendererError> = None;
        if let Err(e) = self.device.wait_idle() {
            log::error!("cleanup: wait idle: {}", e);
            first_error.get_or_insert(e.into());
        }
        if let Err(e) = self.frames.destroy(&mut self.allocator) {
            first_error.get_or_insert(e);
        }
        self.meshes.clear();
        self.quad = None;
        self.persistent = None;
        if let Err(e) = self.global_deletion.flush(&mut self.allocator) {
            first_error.get_or_insert(e);
        }
        self.swapchain.destroy();
        if let Some(e) = first_error {
            return Err(e);
        }
        log::info!(
            "engine cleaned up after {} frames ({} skipped, {} swapchain rebuilds)",
            self.stats.frames_submitted,
            self.stats.frames_skipped,
            self.stats.swapchain_rebuilds
        );
        Ok(())
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn tunables_mut(&mut self) -> &mut Tunables {
        &mut self.tunables
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn meshes(&self) -> &[MeshAsset] {
        &self.meshes
    }

    pub fn quad(&self) -> Option<&GpuMeshBuffers> {
        self.quad.as_ref()
    }

    /// Register `item` with the current frame slot. It runs the next time that slot is reused.
    pub fn defer_per_frame(&mut self, item: Deferred) {
        self.frames.current_mut().deletion().push(item);
    }

    pub fn frames(&self) -> &FrameRing {
        &self.frames
    }

    pub fn swapchain(&self) -> &SwapchainManager {
        &self.swapchain
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut Allocator {
        &mut self.allocator
    }

    pub fn pending_global_deletions(&self) -> usize {
        self.global_deletion.len()
    }

    pub fn draw_image_extent(&self) -> (u32, u32) {
        self.draw_image_extent
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::error!("engine cleanup failed: {}", e);
        }
    }
}

/// Draw and depth images, descriptors and pipelines, each registered with `deletion`.
fn init_persistent(
    device: &dyn Device,
    config: &EngineConfig,
    shaders: &ShaderLibrary,
    allocator: &mut Allocator,
    deletion: &mut DeletionQueue,
) -> Result<(ImageHandle, ImageHandle, Persistent)> {
    let (width, height) = config.window_extent;
    let draw_image = allocator.create_image(&TextureDescriptor {
        label: Some("draw image"),
        size: (width, height, 1),
        format: config.draw_format,
        usage: TextureUsage::STORAGE_BINDING
            | TextureUsage::COPY_SRC
            | TextureUsage::COPY_DST
            | TextureUsage::RENDER_ATTACHMENT,
    })?;
    deletion.push_image(draw_image);
    let depth_image = allocator.create_image(&TextureDescriptor {
        label: Some("depth image"),
        size: (width, height, 1),
        format: config.depth_format,
        usage: TextureUsage::RENDER_ATTACHMENT,
    })?;
    deletion.push_image(depth_image);

    let global_descriptors: Arc<dyn DescriptorPool> =
        Arc::from(device.create_descriptor_pool(&DescriptorPoolDescriptor {
            max_sets: 10,
            pool_ratios: vec![(DescriptorType::StorageImage, 1.0)],
        })?);
    let effect_layout: Arc<dyn DescriptorSetLayout> =
        Arc::from(device.create_descriptor_set_layout(&effect_layout_bindings())?);
    let scene_layout: Arc<dyn DescriptorSetLayout> =
        Arc::from(device.create_descriptor_set_layout(&scene_layout_bindings())?);
    {
        let held = (
            Arc::clone(&global_descriptors),
            Arc::clone(&effect_layout),
            Arc::clone(&scene_layout),
        );
        deletion.push_action(move || drop(held));
    }
    let mut draw_image_set = global_descriptors.allocate_set(effect_layout.as_ref())?;
    draw_image_set.write_storage_image(0, allocator.image(draw_image)?)?;

    let mut effect_pipelines = Vec::new();
    for effect in default_effects() {
        let spirv = shaders.get(effect.shader)?.to_vec();
        let pipeline = device.create_compute_pipeline(&effect_pipeline_descriptor(&effect, spirv))?;
        effect_pipelines.push(Arc::<dyn ComputePipeline>::from(pipeline));
    }
    let mesh_pipeline: Arc<dyn GraphicsPipeline> =
        Arc::from(device.create_graphics_pipeline(&mesh_pipeline_descriptor(config, shaders)?)?);
    {
        let held = (effect_pipelines.clone(), Arc::clone(&mesh_pipeline));
        deletion.push_action(move || drop(held));
    }
    log::debug!("created {} background pipelines and the mesh pipeline", effect_pipelines.len());

    Ok((
        draw_image,
        depth_image,
        Persistent {
            draw_image_set,
            scene_layout,
            effect_pipelines,
            mesh_pipeline,
        },
    ))
}

/// Set 0 of the mesh pipeline: the per-frame scene uniform buffer.
fn scene_layout_bindings() -> Vec<DescriptorSetLayoutBinding> {
    vec![DescriptorSetLayoutBinding {
        binding: 0,
        descriptor_type: DescriptorType::UniformBuffer,
        count: 1,
        stages: ShaderStages::VERTEX | ShaderStages::FRAGMENT,
    }]
}

fn mesh_pipeline_descriptor(
    config: &EngineConfig,
    shaders: &ShaderLibrary,
) -> Result<GraphicsPipelineDescriptor> {
    Ok(GraphicsPipelineDescriptor {
        label: Some("mesh"),
        vertex_shader: ShaderStage {
            source: shaders.get(shader::MESH_VERT)?.to_vec(),
            entry_point: "main".to_string(),
        },
        fragment_shader: ShaderStage {
            source: shaders.get(shader::MESH_FRAG)?.to_vec(),
            entry_point: "main".to_string(),
        },
        color_targets: vec![ColorTargetState {
            format: config.draw_format,
        }],
        // Reversed depth: near is 1, so closer fragments compare greater.
        depth_stencil: Some(DepthStencilState {
            format: config.depth_format,
            depth_write_enabled: true,
        }),
        layout_bindings: scene_layout_bindings(),
        push_constants: Some(PushConstantRange {
            stages: ShaderStages::VERTEX,
            offset: 0,
            size: GpuDrawPushConstants::SIZE,
        }),
    })
}

/// The hardcoded rectangle drawn before any loaded mesh.
fn default_quad() -> ([u32; 6], [Vertex; 4]) {
    let vertex = |position: [f32; 3], color: [f32; 4]| Vertex {
        position,
        color,
        ..Default::default()
    };
    (
        [0, 1, 2, 2, 1, 3],
        [
            vertex([0.5, -0.5, 0.0], [0.0, 0.0, 0.0, 1.0]),
            vertex([0.5, 0.5, 0.0], [0.5, 0.5, 0.5, 1.0]),
            vertex([-0.5, -0.5, 0.0], [1.0, 0.0, 0.0, 1.0]),
            vertex([-0.5, 0.5, 0.0], [0.0, 1.0, 0.0, 1.0]),
        ],
    )
}

/// Draw image clear color for frames with no active background effect.
pub const EMPTY_BACKGROUND: ClearColor = ClearColor {
    r: 0.0,
    g: 0.0,
    b: 0.0,
    a: 1.0,
};

/// One indexed draw, resolved before recording starts.
#[derive(Debug)]
struct MeshDraw<'a> {
    index_buffer: &'a dyn ember_rhi::Buffer,
    first_index: u32,
    index_count: u32,
    push: GpuDrawPushConstants,
}

struct EnginePasses<'a> {
    background: Option<(&'a dyn ComputePipeline, ComputePushConstants)>,
    effect_set: &'a dyn DescriptorSet,
    mesh_pipeline: &'a dyn GraphicsPipeline,
    scene_set: &'a dyn DescriptorSet,
    draws: &'a [MeshDraw<'a>],
    clear_depth: f32,
    overlay: &'a mut dyn Overlay,
}

impl FramePasses for EnginePasses<'_> {
    fn background(&mut self, encoder: &mut dyn CommandEncoder, targets: &FrameTargets<'_>) -> Result<()> {
        let Some((pipeline, data)) = self.background else {
            return Ok(());
        };
        let (x, y) = graph::dispatch_groups(targets.draw_extent);
        let mut pass = encoder.begin_compute_pass();
        pass.set_pipeline(pipeline);
        pass.bind_descriptor_set(0, self.effect_set);
        pass.set_push_constants(bytemuck::bytes_of(&data));
        pass.dispatch(x, y, 1);
        Ok(())
    }

    fn geometry(&mut self, encoder: &mut dyn CommandEncoder, targets: &FrameTargets<'_>) -> Result<()> {
        // Without a background pass the draw image still holds undefined contents.
        let (load_op, clear_value) = match self.background {
            Some(_) => (LoadOp::Load, None),
            None => (LoadOp::Clear, Some(EMPTY_BACKGROUND)),
        };
        let mut pass = encoder.begin_render_pass(&RenderPassDescriptor {
            label: Some("geometry"),
            color_attachments: vec![ColorAttachment {
                texture: targets.draw,
                load_op,
                store_op: StoreOp::Store,
                clear_value,
            }],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                texture: targets.depth,
                depth_load_op: LoadOp::Clear,
                depth_store_op: StoreOp::DontCare,
                clear_depth: self.clear_depth,
            }),
            render_area: targets.draw_extent,
        })?;
        pass.set_pipeline(self.mesh_pipeline);
        pass.set_viewport(&Viewport::from_extent(targets.draw_extent));
        pass.set_scissor((0, 0), targets.draw_extent);
        pass.bind_descriptor_set(0, self.scene_set);
        for draw in self.draws {
            pass.set_push_constants(bytemuck::bytes_of(&draw.push));
            pass.set_index_buffer(draw.index_buffer, 0);
            pass.draw_indexed(draw.index_count, 1, draw.first_index, 0, 0);
        }
        pass.end();
        Ok(())
    }

    fn overlay(&mut self, encoder: &mut dyn CommandEncoder, targets: &FrameTargets<'_>) -> Result<()> {
        self.overlay
            .record(encoder, targets.swapchain, targets.swapchain_extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::NoOverlay;
    use ember_rhi::headless::RecordedCommand;
    use ember_rhi::HeadlessDevice;

    fn shaders() -> ShaderLibrary {
        let blob = || {
            let mut bytes = shader::SPIRV_MAGIC.to_le_bytes().to_vec();
            bytes.extend_from_slice(&[0; 12]);
            bytes
        };
        ShaderLibrary::from_blobs(shader::REQUIRED.iter().map(|name| (*name, blob()))).unwrap()
    }

    fn engine(device: &Arc<HeadlessDevice>) -> Engine {
        let config = EngineConfig {
            window_extent: (64, 32),
            ..EngineConfig::default()
        };
        Engine::new(device.clone(), config, &shaders(), (64, 32)).unwrap()
    }

    #[test]
    fn quad_is_uploaded_at_init() {
        let device = HeadlessDevice::new();
        let engine = engine(&device);
        let quad = engine.quad().unwrap();
        assert_eq!(quad.index_count, 6);
        // draw and depth images, descriptor and pipeline actions, two quad buffers
        assert_eq!(engine.pending_global_deletions(), 6);
        assert_eq!(device.live_buffer_count(), 2);
    }

    #[test]
    fn frame_dispatches_then_draws_the_quad() {
        let device = HeadlessDevice::new();
        let mut engine = engine(&device);
        assert_eq!(engine.draw(&mut NoOverlay).unwrap(), FrameOutcome::Presented);

        let submissions = device.submissions();
        let frame = submissions.last().unwrap();
        assert!(frame.contains(&RecordedCommand::Dispatch { x: 4, y: 2, z: 1 }));
        assert!(frame.contains(&RecordedCommand::DrawIndexed {
            index_count: 6,
            first_index: 0
        }));
        assert_eq!(engine.stats().frames_submitted, 1);
        assert_eq!(engine.frames().frame_number(), 1);
    }

    #[test]
    fn cleanup_releases_everything_once() {
        let device = HeadlessDevice::new();
        let mut engine = engine(&device);
        engine.draw(&mut NoOverlay).unwrap();
        engine.cleanup().unwrap();
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(engine.pending_global_deletions(), 0);
        assert_eq!(engine.allocator().live_images(), 0);
        assert!(!engine.swapchain().is_created());
        engine.cleanup().unwrap();
        assert!(matches!(
            engine.draw(&mut NoOverlay),
            Err(RendererError::InvalidState(_))
        ));
    }
}
