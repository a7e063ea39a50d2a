//! Renderer error type. Everything below the process entry point propagates with `?`.

use std::path::PathBuf;

use ember_rhi::RhiError;

use crate::resources::{BufferHandle, ImageHandle};

#[derive(Debug, thiserror::Error)]
pub enum RendererError {
    #[error(transparent)]
    Rhi(#[from] RhiError),
    /// A bounded fence wait expired: the GPU hung or the driver faulted.
    #[error("timed out waiting for {what}")]
    GpuTimeout { what: String },
    #[error("shader {path:?}: {reason}")]
    Shader { path: PathBuf, reason: String },
    #[error("unknown or already destroyed buffer {0:?}")]
    UnknownBuffer(BufferHandle),
    #[error("unknown or already destroyed image {0:?}")]
    UnknownImage(ImageHandle),
    #[error("asset: {0}")]
    Asset(String),
    #[error("config: {0}")]
    Config(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, RendererError>;

impl RendererError {
    /// Turn an RHI timeout into the fatal renderer timeout, naming what was waited on.
    pub(crate) fn from_wait(err: RhiError, what: impl Into<String>) -> Self {
        match err {
            RhiError::Timeout => RendererError::GpuTimeout { what: what.into() },
            other => RendererError::Rhi(other),
        }
    }
}
