//! Shared setup: an engine on the headless backend with placeholder SPIR-V.

#![allow(dead_code)]

use std::sync::Arc;

use ember_renderer::shader::{self, ShaderLibrary};
use ember_renderer::{Engine, EngineConfig};
use ember_rhi::HeadlessDevice;

pub const WINDOW: (u32, u32) = (128, 64);

/// Magic number plus four empty words; the headless backend only checks shape.
pub fn spirv_stub() -> Vec<u8> {
    let mut bytes = shader::SPIRV_MAGIC.to_le_bytes().to_vec();
    bytes.extend_from_slice(&[0; 16]);
    bytes
}

pub fn shaders() -> ShaderLibrary {
    ShaderLibrary::from_blobs(shader::REQUIRED.iter().map(|name| (*name, spirv_stub())))
        .expect("stub shaders")
}

pub fn config() -> EngineConfig {
    EngineConfig {
        window_extent: WINDOW,
        fence_timeout: std::time::Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

pub fn engine() -> (Arc<HeadlessDevice>, Engine) {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = HeadlessDevice::new();
    let engine = Engine::new(device.clone(), config(), &shaders(), WINDOW).expect("engine");
    (device, engine)
}
