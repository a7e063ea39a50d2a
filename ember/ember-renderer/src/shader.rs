//! Precompiled SPIR-V blobs read from the shader directory at startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{RendererError, Result};

pub const GRADIENT: &str = "gradient_color.comp.spv";
pub const SKY: &str = "sky.comp.spv";
pub const MESH_VERT: &str = "colored_triangle_mesh.vert.spv";
pub const MESH_FRAG: &str = "colored_triangle.frag.spv";

/// Every blob the engine needs.
pub const REQUIRED: [&str; 4] = [GRADIENT, SKY, MESH_VERT, MESH_FRAG];

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Clone, Default)]
pub struct ShaderLibrary {
    blobs: HashMap<&'static str, Vec<u8>>,
}

impl ShaderLibrary {
    /// Read all [`REQUIRED`] blobs from `dir`. Any missing or malformed blob is fatal.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut blobs = HashMap::new();
        for name in REQUIRED {
            let path = dir.join(name);
            let bytes = std::fs::read(&path).map_err(|e| {
                log::error!("failed to read shader {}: {}", path.display(), e);
                RendererError::Shader {
                    path: path.clone(),
                    reason: e.to_string(),
                }
            })?;
            check_spirv(&path, &bytes)?;
            log::debug!("loaded shader {} ({} words)", name, bytes.len() / 4);
            blobs.insert(name, bytes);
        }
        Ok(Self { blobs })
    }

    /// Build from in-memory blobs keyed by file name. Every [`REQUIRED`] name must be present.
    pub fn from_blobs(named: impl IntoIterator<Item = (&'static str, Vec<u8>)>) -> Result<Self> {
        let blobs: HashMap<_, _> = named.into_iter().collect();
        for name in REQUIRED {
            let bytes = blobs.get(name).ok_or_else(|| RendererError::Shader {
                path: PathBuf::from(name),
                reason: "missing".to_string(),
            })?;
            check_spirv(Path::new(name), bytes)?;
        }
        Ok(Self { blobs })
    }

    pub fn get(&self, name: &str) -> Result<&[u8]> {
        self.blobs
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| RendererError::Shader {
                path: PathBuf::from(name),
                reason: "not loaded".to_string(),
            })
    }
}

/// Word-aligned, non-empty, and starting with the SPIR-V magic number.
pub fn check_spirv(path: &Path, bytes: &[u8]) -> Result<()> {
    let fail = |reason: String| {
        log::error!("invalid shader {}: {}", path.display(), reason);
        RendererError::Shader {
            path: path.to_path_buf(),
            reason,
        }
    };
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(fail(format!("length {} is not a whole number of words", bytes.len())));
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != SPIRV_MAGIC {
        return Err(fail(format!("bad magic {:#010x}", magic)));
    }
    Ok(())
}
