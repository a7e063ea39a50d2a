//! Ember frame graph: the fixed per-frame pass sequence and its image layout transitions.
//!
//! A frame is a list of [`Step`]s: layout transitions of the three frame targets interleaved
//! with passes. Every pass declares the layouts it needs; the recorder tracks the current layout
//! of each target (starting from `Undefined`, since no target keeps its contents across frames)
//! and refuses to record a pass whose targets are in the wrong layout. The schedule must leave
//! the swapchain image ready to present.

use std::collections::HashMap;

use ember_rhi::{CommandEncoder, ImageLayout, Texture};

use crate::error::{RendererError, Result};

/// Compute workgroup edge, in pixels, of the background effects.
pub const WORKGROUP_SIZE: u32 = 16;

pub const MIN_RENDER_SCALE: f32 = 0.1;
pub const MAX_RENDER_SCALE: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    DrawImage,
    DepthImage,
    SwapchainImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// Compute effect writing the draw image.
    Background,
    /// Meshes rendered into the draw image with depth.
    Geometry,
    /// Scaled copy of the draw image onto the swapchain image.
    Blit,
    /// UI drawn directly onto the swapchain image.
    Overlay,
}

impl PassKind {
    pub fn required_layouts(self) -> &'static [(Target, ImageLayout)] {
        match self {
            PassKind::Background => &[(Target::DrawImage, ImageLayout::General)],
            PassKind::Geometry => &[
                (Target::DrawImage, ImageLayout::ColorAttachment),
                (Target::DepthImage, ImageLayout::DepthAttachment),
            ],
            PassKind::Blit => &[
                (Target::DrawImage, ImageLayout::TransferSrc),
                (Target::SwapchainImage, ImageLayout::TransferDst),
            ],
            PassKind::Overlay => &[(Target::SwapchainImage, ImageLayout::ColorAttachment)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Transition {
        target: Target,
        from: ImageLayout,
        to: ImageLayout,
    },
    Pass(PassKind),
}

const fn transition(target: Target, from: ImageLayout, to: ImageLayout) -> Step {
    Step::Transition { target, from, to }
}

/// compute → geometry → blit → overlay → present.
pub const FRAME_SCHEDULE: &[Step] = &[
    transition(Target::DrawImage, ImageLayout::Undefined, ImageLayout::General),
    Step::Pass(PassKind::Background),
    transition(Target::DrawImage, ImageLayout::General, ImageLayout::ColorAttachment),
    transition(Target::DepthImage, ImageLayout::Undefined, ImageLayout::DepthAttachment),
    Step::Pass(PassKind::Geometry),
    transition(Target::DrawImage, ImageLayout::ColorAttachment, ImageLayout::TransferSrc),
    transition(Target::SwapchainImage, ImageLayout::Undefined, ImageLayout::TransferDst),
    Step::Pass(PassKind::Blit),
    transition(Target::SwapchainImage, ImageLayout::TransferDst, ImageLayout::ColorAttachment),
    Step::Pass(PassKind::Overlay),
    transition(Target::SwapchainImage, ImageLayout::ColorAttachment, ImageLayout::PresentSrc),
];

/// Tracked layout per target.
#[derive(Debug, Default)]
struct LayoutTracker {
    layouts: HashMap<Target, ImageLayout>,
}

impl LayoutTracker {
    fn layout(&self, target: Target) -> ImageLayout {
        self.layouts.get(&target).copied().unwrap_or(ImageLayout::Undefined)
    }

    fn apply(&mut self, step: &Step) -> Result<()> {
        match *step {
            Step::Transition { target, from, to } => {
                let current = self.layout(target);
                // Transitions from Undefined discard the contents and are valid from any layout.
                if from != ImageLayout::Undefined && from != current {
                    return Err(RendererError::InvalidState(format!(
                        "{:?}: transition from {:?} but image is in {:?}",
                        target, from, current
                    )));
                }
                self.layouts.insert(target, to);
            }
            Step::Pass(kind) => {
                for &(target, needed) in kind.required_layouts() {
                    let current = self.layout(target);
                    if current != needed {
                        return Err(RendererError::InvalidState(format!(
                            "{:?} pass needs {:?} in {:?}, found {:?}",
                            kind, target, needed, current
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        let swapchain = self.layout(Target::SwapchainImage);
        if swapchain != ImageLayout::PresentSrc {
            return Err(RendererError::InvalidState(format!(
                "frame ends with the swapchain image in {:?}",
                swapchain
            )));
        }
        Ok(())
    }
}

/// Check a schedule's transitions and pass requirements without recording anything.
pub fn validate_schedule(steps: &[Step]) -> Result<()> {
    let mut tracker = LayoutTracker::default();
    for step in steps {
        tracker.apply(step)?;
    }
    tracker.finish()
}

/// The images a frame renders to, plus the extents the blit maps between.
#[derive(Debug, Clone, Copy)]
pub struct FrameTargets<'a> {
    pub draw: &'a dyn Texture,
    pub depth: &'a dyn Texture,
    pub swapchain: &'a dyn Texture,
    pub draw_extent: (u32, u32),
    pub swapchain_extent: (u32, u32),
}

impl<'a> FrameTargets<'a> {
    pub fn get(&self, target: Target) -> &'a dyn Texture {
        match target {
            Target::DrawImage => self.draw,
            Target::DepthImage => self.depth,
            Target::SwapchainImage => self.swapchain,
        }
    }
}

/// Pass bodies supplied by the engine. The blit is recorded by [`record_frame`] itself.
pub trait FramePasses {
    fn background(&mut self, encoder: &mut dyn CommandEncoder, targets: &FrameTargets<'_>) -> Result<()>;
    fn geometry(&mut self, encoder: &mut dyn CommandEncoder, targets: &FrameTargets<'_>) -> Result<()>;
    fn overlay(&mut self, encoder: &mut dyn CommandEncoder, targets: &FrameTargets<'_>) -> Result<()>;
}

/// Record `steps` into `encoder`, emitting a barrier for every transition and checking every
/// pass against the tracked layouts before it runs.
pub fn record_frame(
    encoder: &mut dyn CommandEncoder,
    targets: &FrameTargets<'_>,
    steps: &[Step],
    passes: &mut dyn FramePasses,
) -> Result<()> {
    let mut tracker = LayoutTracker::default();
    for step in steps {
        tracker.apply(step)?;
        match *step {
            Step::Transition { target, from, to } => {
                encoder.pipeline_barrier_texture(targets.get(target), from, to)?;
            }
            Step::Pass(PassKind::Background) => passes.background(encoder, targets)?,
            Step::Pass(PassKind::Geometry) => passes.geometry(encoder, targets)?,
            Step::Pass(PassKind::Blit) => encoder.blit_texture(
                targets.draw,
                targets.draw_extent,
                targets.swapchain,
                targets.swapchain_extent,
            )?,
            Step::Pass(PassKind::Overlay) => passes.overlay(encoder, targets)?,
        }
    }
    tracker.finish()
}

/// Clamp to [`MIN_RENDER_SCALE`, `MAX_RENDER_SCALE`]; NaN falls back to full scale.
pub fn clamp_render_scale(scale: f32) -> f32 {
    if scale.is_nan() {
        return MAX_RENDER_SCALE;
    }
    scale.clamp(MIN_RENDER_SCALE, MAX_RENDER_SCALE)
}

/// Region of the draw image rendered this frame: `min(swapchain, image) * scale`, at least 1x1.
pub fn draw_extent(swapchain: (u32, u32), image: (u32, u32), render_scale: f32) -> (u32, u32) {
    let scale = clamp_render_scale(render_scale);
    let axis = |s: u32, i: u32| ((s.min(i) as f32 * scale).floor() as u32).max(1);
    (axis(swapchain.0, image.0), axis(swapchain.1, image.1))
}

/// Workgroups covering `extent` with `WORKGROUP_SIZE`² tiles.
pub fn dispatch_groups(extent: (u32, u32)) -> (u32, u32) {
    (extent.0.div_ceil(WORKGROUP_SIZE), extent.1.div_ceil(WORKGROUP_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_rhi::headless::RecordedCommand;
    use ember_rhi::{
        CommandContext, Device, HeadlessDevice, Queue, TextureDescriptor, TextureFormat, TextureUsage,
    };

    #[test]
    fn frame_schedule_is_consistent() {
        assert_eq!(FRAME_SCHEDULE.len(), 11);
        validate_schedule(FRAME_SCHEDULE).unwrap();
    }

    #[test]
    fn pass_without_its_transition_is_rejected() {
        let steps = [
            transition(Target::DrawImage, ImageLayout::Undefined, ImageLayout::General),
            Step::Pass(PassKind::Geometry),
        ];
        assert!(matches!(validate_schedule(&steps), Err(RendererError::InvalidState(_))));
    }

    #[test]
    fn transition_from_wrong_layout_is_rejected() {
        let steps = [transition(
            Target::DrawImage,
            ImageLayout::ColorAttachment,
            ImageLayout::TransferSrc,
        )];
        assert!(validate_schedule(&steps).is_err());
    }

    #[test]
    fn schedule_must_end_presentable() {
        assert!(validate_schedule(&FRAME_SCHEDULE[..FRAME_SCHEDULE.len() - 1]).is_err());
    }

    #[test]
    fn draw_extent_follows_render_scale() {
        assert_eq!(draw_extent((1920, 1080), (1920, 1080), 0.5), (960, 540));
        assert_eq!(draw_extent((1920, 1080), (1920, 1080), 1.0), (1920, 1080));
        assert_eq!(draw_extent((800, 600), (1920, 1080), 1.0), (800, 600));
        assert_eq!(draw_extent((1920, 1080), (1920, 1080), 4.0), (1920, 1080));
        assert_eq!(draw_extent((1920, 1080), (1920, 1080), 0.0), (192, 108));
        assert_eq!(draw_extent((1, 1), (1, 1), 0.1), (1, 1));
    }

    #[test]
    fn render_scale_is_clamped() {
        assert_eq!(clamp_render_scale(0.01), MIN_RENDER_SCALE);
        assert_eq!(clamp_render_scale(3.0), MAX_RENDER_SCALE);
        assert_eq!(clamp_render_scale(0.75), 0.75);
        assert_eq!(clamp_render_scale(f32::NAN), MAX_RENDER_SCALE);
    }

    #[test]
    fn dispatch_rounds_up() {
        assert_eq!(dispatch_groups((900, 550)), (57, 35));
        assert_eq!(dispatch_groups((16, 32)), (1, 2));
        assert_eq!(dispatch_groups((1, 1)), (1, 1));
    }

    #[derive(Default)]
    struct Trace(Vec<&'static str>);

    impl FramePasses for Trace {
        fn background(&mut self, _: &mut dyn CommandEncoder, _: &FrameTargets<'_>) -> Result<()> {
            self.0.push("background");
            Ok(())
        }
        fn geometry(&mut self, _: &mut dyn CommandEncoder, _: &FrameTargets<'_>) -> Result<()> {
            self.0.push("geometry");
            Ok(())
        }
        fn overlay(&mut self, _: &mut dyn CommandEncoder, _: &FrameTargets<'_>) -> Result<()> {
            self.0.push("overlay");
            Ok(())
        }
    }

    #[test]
    fn record_frame_emits_barriers_and_blit_in_order() {
        let device = HeadlessDevice::new();
        let texture = |format, size: (u32, u32)| {
            device
                .create_texture(&TextureDescriptor {
                    label: None,
                    size: (size.0, size.1, 1),
                    format,
                    usage: TextureUsage::RENDER_ATTACHMENT,
                })
                .unwrap()
        };
        let draw = texture(TextureFormat::Rgba16Float, (64, 64));
        let depth = texture(TextureFormat::D32Float, (64, 64));
        let swap = texture(TextureFormat::Bgra8Unorm, (40, 30));
        let targets = FrameTargets {
            draw: draw.as_ref(),
            depth: depth.as_ref(),
            swapchain: swap.as_ref(),
            draw_extent: (40, 30),
            swapchain_extent: (40, 30),
        };

        let mut ctx = device.create_command_context().unwrap();
        ctx.begin().unwrap();
        let mut trace = Trace::default();
        record_frame(ctx.encoder(), &targets, FRAME_SCHEDULE, &mut trace).unwrap();
        ctx.end().unwrap();
        device.queue().unwrap().submit(&[ctx.as_ref()], &[], &[], None).unwrap();

        assert_eq!(trace.0, vec!["background", "geometry", "overlay"]);
        let commands = device.submissions().remove(0);
        assert_eq!(commands.len(), 8);
        assert_eq!(
            commands[0],
            RecordedCommand::Barrier {
                texture: draw.id(),
                old: ImageLayout::Undefined,
                new: ImageLayout::General
            }
        );
        assert_eq!(
            commands[5],
            RecordedCommand::Blit {
                src: draw.id(),
                src_extent: (40, 30),
                dst: swap.id(),
                dst_extent: (40, 30)
            }
        );
        assert_eq!(
            commands[7],
            RecordedCommand::Barrier {
                texture: swap.id(),
                old: ImageLayout::ColorAttachment,
                new: ImageLayout::PresentSrc
            }
        );
    }
}
