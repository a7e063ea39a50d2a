//! Runs the engine loop on the headless backend: no window, no GPU.
//! Halfway through, the next acquire is reported stale so the resize path runs once.
//! Run: cargo run -p debug --bin headless_loop [frames]

use std::sync::Arc;

use ember_renderer::logging::{init_logging, LoggingConfig};
use ember_renderer::shader::{self, ShaderLibrary};
use ember_renderer::{Engine, EngineConfig, LoopControl, NoOverlay};
use ember_rhi::headless::HeadlessEvent;
use ember_rhi::HeadlessDevice;

const DEFAULT_FRAMES: u64 = 60;

/// The headless backend checks blob shape only, so a bare SPIR-V header is enough.
fn stub_shaders() -> ember_renderer::Result<ShaderLibrary> {
    let mut blob = shader::SPIRV_MAGIC.to_le_bytes().to_vec();
    blob.extend_from_slice(&[0; 16]);
    ShaderLibrary::from_blobs(shader::REQUIRED.iter().map(|name| (*name, blob.clone())))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LoggingConfig::default());
    let frames = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<u64>()?,
        None => DEFAULT_FRAMES,
    };

    let config = EngineConfig::from_env()?;
    let window = config.window_extent;
    let device = HeadlessDevice::new();
    let mut engine = Engine::new(
        Arc::clone(&device) as Arc<dyn ember_rhi::Device>,
        config,
        &stub_shaders()?,
        window,
    )?;
    let meshes = engine.load_default_meshes()?;

    let mut ticks = 0u64;
    while engine.stats().frames_submitted < frames {
        if ticks == frames / 2 {
            device.fail_next_acquires(1);
        }
        match engine.tick(&[], window, &mut NoOverlay)? {
            LoopControl::Continue | LoopControl::Throttle => {}
            LoopControl::Exit => break,
        }
        ticks += 1;
    }

    let presents = device
        .events()
        .iter()
        .filter(|e| matches!(e, HeadlessEvent::Presented { .. }))
        .count();
    let stats = engine.stats();
    engine.cleanup()?;

    println!("ticks:              {}", ticks);
    println!("meshes loaded:      {}", meshes);
    println!("frames submitted:   {}", stats.frames_submitted);
    println!("frames skipped:     {}", stats.frames_skipped);
    println!("swapchain rebuilds: {}", stats.swapchain_rebuilds);
    println!("submissions:        {}", device.submissions().len());
    println!("presents:           {}", presents);
    println!("live buffers:       {}", device.live_buffer_count());
    Ok(())
}
