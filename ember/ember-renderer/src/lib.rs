//! Ember Renderer: the real-time core on top of the RHI.
//! Frame ring with per-slot deletion queues, an immediate-submit channel for uploads, a fixed
//! compute → geometry → blit → overlay frame graph with explicit layout transitions, and the
//! swapchain lifecycle around it.

pub mod config;
pub mod deletion;
pub mod effects;
pub mod engine;
pub mod error;
pub mod events;
pub mod frame;
pub mod graph;
pub mod immediate;
pub mod loader;
pub mod logging;
pub mod overlay;
pub mod present;
pub mod resources;
pub mod scene;
pub mod shader;
pub mod upload;

pub use config::EngineConfig;
pub use deletion::{Deferred, DeletionQueue};
pub use engine::{Engine, EngineStats, FrameOutcome, EMPTY_BACKGROUND};
pub use error::{RendererError, Result};
pub use events::{EngineEvent, Key, LoopControl, LoopState};
pub use frame::{FrameRing, FRAME_OVERLAP};
pub use overlay::{KeyboardOverlay, NoOverlay, Overlay, Tunables};
pub use resources::{Allocator, BufferHandle, ImageHandle};
pub use shader::ShaderLibrary;
pub use upload::{GpuMeshBuffers, Vertex};
