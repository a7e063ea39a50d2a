//! Engine configuration: window, frame pacing, render targets, asset locations.

use std::path::PathBuf;
use std::time::Duration;

use ember_rhi::TextureFormat;

use crate::error::{RendererError, Result};

/// Engine configuration. `Default` gives the demo settings; `from_env` overlays `EMBER_*` variables.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Initial window extent; also the size of the draw and depth images.
    pub window_extent: (u32, u32),
    /// Number of frame slots recorded ahead of the GPU.
    pub frames_in_flight: usize,
    /// Bound on every fence wait. Expiry is fatal.
    pub fence_timeout: Duration,
    /// Fraction of the draw image rendered each frame; clamped to [0.1, 1.0] when used.
    pub render_scale: f32,
    pub draw_format: TextureFormat,
    pub depth_format: TextureFormat,
    pub swapchain_format: TextureFormat,
    /// Directory holding the precompiled SPIR-V shaders.
    pub shader_dir: PathBuf,
    /// Wavefront OBJ loaded at startup. A missing file only logs a warning.
    pub mesh_path: PathBuf,
    /// Enable the Vulkan validation layer and route its messages into `log`.
    pub validation: bool,
    /// Depth clear value. 0.0 because depth is reversed.
    pub clear_depth: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_extent: (900, 550),
            frames_in_flight: crate::frame::FRAME_OVERLAP,
            fence_timeout: Duration::from_secs(1),
            render_scale: 1.0,
            draw_format: TextureFormat::Rgba16Float,
            depth_format: TextureFormat::D32Float,
            swapchain_format: TextureFormat::Bgra8Unorm,
            shader_dir: PathBuf::from("shaders"),
            mesh_path: PathBuf::from("assets/basicmesh.obj"),
            validation: cfg!(debug_assertions),
            clear_depth: 0.0,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `EMBER_VALIDATION`, `EMBER_RENDER_SCALE`, `EMBER_SHADER_DIR`,
    /// `EMBER_MESH_PATH` and `EMBER_FRAMES_IN_FLIGHT`.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key/value source (the process environment in `from_env`).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("EMBER_VALIDATION") {
            self.validation = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(RendererError::Config(format!(
                        "EMBER_VALIDATION: expected a boolean, got {:?}",
                        other
                    )))
                }
            };
        }
        if let Some(v) = lookup("EMBER_RENDER_SCALE") {
            self.render_scale = v.trim().parse().map_err(|e| {
                RendererError::Config(format!("EMBER_RENDER_SCALE {:?}: {}", v, e))
            })?;
        }
        if let Some(v) = lookup("EMBER_SHADER_DIR") {
            self.shader_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("EMBER_MESH_PATH") {
            self.mesh_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("EMBER_FRAMES_IN_FLIGHT") {
            self.frames_in_flight = v.trim().parse().map_err(|e| {
                RendererError::Config(format!("EMBER_FRAMES_IN_FLIGHT {:?}: {}", v, e))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(RendererError::Config("frames_in_flight must be at least 1".to_string()));
        }
        if self.window_extent.0 == 0 || self.window_extent.1 == 0 {
            return Err(RendererError::Config(format!(
                "window extent {:?} must be non-zero",
                self.window_extent
            )));
        }
        if !self.render_scale.is_finite() {
            return Err(RendererError::Config(format!(
                "render scale {} is not finite",
                self.render_scale
            )));
        }
        if !self.depth_format.is_depth() || self.draw_format.is_depth() {
            return Err(RendererError::Config(
                "depth_format must be a depth format and draw_format a color format".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn fence_timeout_ns(&self) -> u64 {
        u64::try_from(self.fence_timeout.as_nanos()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_demo_settings() {
        let config = EngineConfig::default();
        assert_eq!(config.window_extent, (900, 550));
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.fence_timeout_ns(), 1_000_000_000);
        assert_eq!(config.draw_format, TextureFormat::Rgba16Float);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_are_applied() {
        let config = EngineConfig::default()
            .with_overrides(lookup(&[
                ("EMBER_VALIDATION", "true"),
                ("EMBER_RENDER_SCALE", "0.5"),
                ("EMBER_FRAMES_IN_FLIGHT", "3"),
                ("EMBER_SHADER_DIR", "/opt/shaders"),
            ]))
            .unwrap();
        assert!(config.validation);
        assert_eq!(config.render_scale, 0.5);
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.shader_dir, PathBuf::from("/opt/shaders"));
    }

    #[test]
    fn malformed_values_are_config_errors() {
        let err = EngineConfig::default()
            .with_overrides(lookup(&[("EMBER_RENDER_SCALE", "half")]))
            .unwrap_err();
        assert!(matches!(err, RendererError::Config(_)));

        let err = EngineConfig::default()
            .with_overrides(lookup(&[("EMBER_VALIDATION", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, RendererError::Config(_)));
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let err = EngineConfig::default()
            .with_overrides(lookup(&[("EMBER_FRAMES_IN_FLIGHT", "0")]))
            .unwrap_err();
        assert!(matches!(err, RendererError::Config(_)));
    }

    #[test]
    fn non_finite_render_scale_is_rejected() {
        let config = EngineConfig {
            render_scale: f32::NAN,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
