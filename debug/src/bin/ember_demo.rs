//! Window demo: Vulkan device on a winit window, background effects, quad and the OBJ mesh.
//! Left/Right switch the background effect, Up/Down change the render scale, Space resets the
//! effect, Escape quits.
//! Run: cargo run -p debug --bin ember_demo

use std::sync::Arc;
use std::time::Duration;

use ember_renderer::logging::{init_logging, LoggingConfig};
use ember_renderer::{
    Engine, EngineConfig, EngineEvent, Key, KeyboardOverlay, LoopControl, RendererError,
    ShaderLibrary,
};
use ember_rhi::{Device, VulkanDevice};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::application::ApplicationHandler;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow};
use winit::keyboard::{Key as WinitKey, NamedKey};
use winit::window::{Window, WindowId};

const THROTTLE: Duration = Duration::from_millis(100);

struct App {
    config: EngineConfig,
    /// Dropped before `window`.
    engine: Option<Engine>,
    window: Option<Window>,
    overlay: KeyboardOverlay,
    pending: Vec<EngineEvent>,
    error: Option<RendererError>,
}

impl App {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            engine: None,
            window: None,
            overlay: KeyboardOverlay::default(),
            pending: Vec::new(),
            error: None,
        }
    }

    fn start(&mut self, window: &Window) -> Result<Engine, RendererError> {
        let shaders = ShaderLibrary::load(&self.config.shader_dir)?;
        let (display, handle) = match (window.display_handle(), window.window_handle()) {
            (Ok(dh), Ok(wh)) => (dh.as_raw(), wh.as_raw()),
            _ => {
                return Err(RendererError::InvalidState(
                    "window has no raw handles".to_string(),
                ))
            }
        };
        let device: Arc<dyn Device> =
            VulkanDevice::new_with_window(display, handle, self.config.validation)?;
        let size = window.inner_size();
        let mut engine = Engine::new(device, self.config.clone(), &shaders, (size.width, size.height))?;
        engine.load_default_meshes()?;
        Ok(engine)
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: RendererError) {
        log::error!("{}", e);
        self.error = Some(e);
        event_loop.exit();
    }
}

fn map_key(key: &WinitKey) -> Key {
    match key {
        WinitKey::Named(NamedKey::Escape) => Key::Escape,
        WinitKey::Named(NamedKey::ArrowLeft) => Key::Left,
        WinitKey::Named(NamedKey::ArrowRight) => Key::Right,
        WinitKey::Named(NamedKey::ArrowUp) => Key::Up,
        WinitKey::Named(NamedKey::ArrowDown) => Key::Down,
        WinitKey::Named(NamedKey::Space) => Key::Space,
        _ => Key::Other,
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let (width, height) = self.config.window_extent;
        let attrs = Window::default_attributes()
            .with_title("Ember")
            .with_inner_size(winit::dpi::PhysicalSize::new(width, height))
            .with_resizable(true);
        let window = match event_loop.create_window(attrs) {
            Ok(window) => window,
            Err(e) => {
                self.fail(event_loop, RendererError::InvalidState(format!("create window: {}", e)));
                return;
            }
        };
        match self.start(&window) {
            Ok(engine) => self.engine = Some(engine),
            Err(e) => {
                self.fail(event_loop, e);
                return;
            }
        }
        self.window = Some(window);
        event_loop.set_control_flow(ControlFlow::Poll);
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => self.pending.push(EngineEvent::CloseRequested),
            WindowEvent::Occluded(true) => self.pending.push(EngineEvent::Minimized),
            WindowEvent::Occluded(false) => self.pending.push(EngineEvent::Restored),
            WindowEvent::Resized(size) => {
                if size.width == 0 || size.height == 0 {
                    self.pending.push(EngineEvent::Minimized);
                } else {
                    self.pending.push(EngineEvent::Restored);
                    self.pending.push(EngineEvent::Resized {
                        width: size.width,
                        height: size.height,
                    });
                }
            }
            WindowEvent::KeyboardInput { event, .. } if event.state == ElementState::Pressed => {
                self.pending.push(EngineEvent::KeyPressed(map_key(&event.logical_key)));
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(engine), Some(window)) = (self.engine.as_mut(), self.window.as_ref()) else {
            return;
        };
        let size = window.inner_size();
        let events = std::mem::take(&mut self.pending);
        match engine.tick(&events, (size.width, size.height), &mut self.overlay) {
            Ok(LoopControl::Continue) => {}
            Ok(LoopControl::Throttle) => std::thread::sleep(THROTTLE),
            Ok(LoopControl::Exit) => event_loop.exit(),
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(mut engine) = self.engine.take() {
            if let Err(e) = engine.cleanup() {
                log::error!("cleanup: {}", e);
                self.error.get_or_insert(e);
            }
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LoggingConfig::default());
    let config = EngineConfig::from_env()?;
    let event_loop = winit::event_loop::EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    match app.error.take() {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
