//! Overlay collaborator: reads and writes the engine tunables once per frame and draws on top of
//! the swapchain image after the blit.

use ember_rhi::{ColorAttachment, CommandEncoder, LoadOp, RenderPassDescriptor, StoreOp, Texture};

use crate::effects::BackgroundEffect;
use crate::error::Result;
use crate::events::Key;
use crate::graph::clamp_render_scale;

/// State the overlay may change between frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub render_scale: f32,
    /// Index into `effects`; values past the end select the last effect.
    pub active_effect: usize,
    pub effects: Vec<BackgroundEffect>,
}

impl Tunables {
    pub fn new(render_scale: f32, effects: Vec<BackgroundEffect>) -> Self {
        Self {
            render_scale,
            active_effect: 0,
            effects,
        }
    }

    pub fn active_index(&self) -> Option<usize> {
        match self.effects.len() {
            0 => None,
            n => Some(self.active_effect.min(n - 1)),
        }
    }

    pub fn active(&self) -> Option<&BackgroundEffect> {
        self.active_index().map(|i| &self.effects[i])
    }

    pub fn active_mut(&mut self) -> Option<&mut BackgroundEffect> {
        self.active_index().map(move |i| &mut self.effects[i])
    }
}

pub trait Overlay {
    /// Called once per frame before any recording.
    fn prepare(&mut self, _tunables: &mut Tunables) {}

    /// Keys the loop does not consume itself.
    fn handle_key(&mut self, _key: Key, _tunables: &mut Tunables) {}

    /// Record into `target`, which is in `ColorAttachment` layout.
    fn record(
        &mut self,
        encoder: &mut dyn CommandEncoder,
        target: &dyn Texture,
        extent: (u32, u32),
    ) -> Result<()>;
}

/// Load/store pass over the swapchain image with nothing drawn.
fn empty_pass(encoder: &mut dyn CommandEncoder, target: &dyn Texture, extent: (u32, u32)) -> Result<()> {
    let pass = encoder.begin_render_pass(&RenderPassDescriptor {
        label: Some("overlay"),
        color_attachments: vec![ColorAttachment {
            texture: target,
            load_op: LoadOp::Load,
            store_op: StoreOp::Store,
            clear_value: None,
        }],
        depth_stencil_attachment: None,
        render_area: extent,
    })?;
    pass.end();
    Ok(())
}

#[derive(Debug, Default)]
pub struct NoOverlay;

impl Overlay for NoOverlay {
    fn record(
        &mut self,
        encoder: &mut dyn CommandEncoder,
        target: &dyn Texture,
        extent: (u32, u32),
    ) -> Result<()> {
        empty_pass(encoder, target, extent)
    }
}

/// Keyboard controls: Left/Right cycle background effects, Up/Down step the render scale,
/// Space resets the active effect's parameters.
#[derive(Debug, Default)]
pub struct KeyboardOverlay {
    defaults: Vec<BackgroundEffect>,
}

impl KeyboardOverlay {
    pub const SCALE_STEP: f32 = 0.1;
}

impl Overlay for KeyboardOverlay {
    fn prepare(&mut self, tunables: &mut Tunables) {
        if self.defaults.is_empty() {
            self.defaults = tunables.effects.clone();
        }
    }

    fn handle_key(&mut self, key: Key, tunables: &mut Tunables) {
        let count = tunables.effects.len();
        match key {
            Key::Right if count > 0 => {
                tunables.active_effect = (tunables.active_index().unwrap_or(0) + 1) % count;
            }
            Key::Left if count > 0 => {
                tunables.active_effect = (tunables.active_index().unwrap_or(0) + count - 1) % count;
            }
            Key::Up => {
                tunables.render_scale = clamp_render_scale(tunables.render_scale + Self::SCALE_STEP);
            }
            Key::Down => {
                tunables.render_scale = clamp_render_scale(tunables.render_scale - Self::SCALE_STEP);
            }
            Key::Space => {
                if let Some(index) = tunables.active_index() {
                    if let Some(default) = self.defaults.get(index) {
                        tunables.effects[index].data = default.data;
                    }
                }
            }
            _ => return,
        }
        log::info!(
            "effect: {}, render scale: {:.1}",
            tunables.active().map_or("none", |e| e.name),
            tunables.render_scale
        );
    }

    fn record(
        &mut self,
        encoder: &mut dyn CommandEncoder,
        target: &dyn Texture,
        extent: (u32, u32),
    ) -> Result<()> {
        empty_pass(encoder, target, extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::default_effects;

    #[test]
    fn out_of_range_selection_clamps_to_last() {
        let mut tunables = Tunables::new(1.0, default_effects());
        tunables.active_effect = 7;
        assert_eq!(tunables.active().map(|e| e.name), Some("sky"));
        assert!(Tunables::new(1.0, Vec::new()).active().is_none());
    }

    #[test]
    fn arrows_cycle_effects_and_scale() {
        let mut tunables = Tunables::new(1.0, default_effects());
        let mut overlay = KeyboardOverlay::default();
        overlay.prepare(&mut tunables);

        overlay.handle_key(Key::Left, &mut tunables);
        assert_eq!(tunables.active_effect, 1);
        overlay.handle_key(Key::Right, &mut tunables);
        assert_eq!(tunables.active_effect, 0);

        overlay.handle_key(Key::Up, &mut tunables);
        assert_eq!(tunables.render_scale, 1.0);
        for _ in 0..20 {
            overlay.handle_key(Key::Down, &mut tunables);
        }
        assert_eq!(tunables.render_scale, crate::graph::MIN_RENDER_SCALE);
    }

    #[test]
    fn space_restores_default_parameters() {
        let mut tunables = Tunables::new(1.0, default_effects());
        let mut overlay = KeyboardOverlay::default();
        overlay.prepare(&mut tunables);
        let original = tunables.effects[0].data;
        tunables.active_mut().unwrap().data.data1 = [0.0; 4];
        overlay.handle_key(Key::Space, &mut tunables);
        assert_eq!(tunables.effects[0].data, original);
    }
}
