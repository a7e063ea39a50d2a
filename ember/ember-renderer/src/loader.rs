//! Wavefront OBJ meshes, uploaded through the engine's upload pipeline.

use std::path::Path;

use crate::engine::Engine;
use crate::error::{RendererError, Result};
use crate::upload::{GpuMeshBuffers, Vertex};

/// Index range of one drawable part of a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeoSurface {
    pub start_index: u32,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshAsset {
    pub name: String,
    pub surfaces: Vec<GeoSurface>,
    pub buffers: GpuMeshBuffers,
}

/// CPU-side mesh, ready for upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub name: String,
    pub indices: Vec<u32>,
    pub vertices: Vec<Vertex>,
    pub surfaces: Vec<GeoSurface>,
}

/// Read `path` and upload every model in it. A missing file logs a warning and yields nothing.
pub fn load_meshes(path: impl AsRef<Path>, engine: &mut Engine) -> Result<Vec<MeshAsset>> {
    let meshes = read_obj(path)?;
    let mut assets = Vec::with_capacity(meshes.len());
    for mesh in meshes {
        let buffers = engine.upload_mesh(&mesh.indices, &mesh.vertices)?;
        assets.push(MeshAsset {
            name: mesh.name,
            surfaces: mesh.surfaces,
            buffers,
        });
    }
    Ok(assets)
}

pub fn read_obj(path: impl AsRef<Path>) -> Result<Vec<MeshData>> {
    let path = path.as_ref();
    if !path.exists() {
        log::warn!("mesh file {} not found, no meshes loaded", path.display());
        return Ok(Vec::new());
    }
    let (models, _materials) = tobj::load_obj(path, &tobj::GPU_LOAD_OPTIONS)
        .map_err(|e| RendererError::Asset(format!("{}: {}", path.display(), e)))?;
    let meshes = meshes_from_models(models);
    log::info!("loaded {} meshes from {}", meshes.len(), path.display());
    Ok(meshes)
}

/// Convert single-index models. Vertex colour is the normal, for debugging.
pub fn meshes_from_models(models: Vec<tobj::Model>) -> Vec<MeshData> {
    models
        .into_iter()
        .filter(|m| !m.mesh.indices.is_empty())
        .map(|model| {
            let mesh = model.mesh;
            let vertex_count = mesh.positions.len() / 3;
            let vertices = (0..vertex_count)
                .map(|i| {
                    let normal = triple(&mesh.normals, i).unwrap_or([1.0, 0.0, 0.0]);
                    let [uv_x, uv_y] = pair(&mesh.texcoords, i).unwrap_or([0.0, 0.0]);
                    Vertex {
                        position: triple(&mesh.positions, i).unwrap_or_default(),
                        uv_x,
                        normal,
                        uv_y,
                        color: [normal[0], normal[1], normal[2], 1.0],
                    }
                })
                .collect();
            let count = mesh.indices.len() as u32;
            MeshData {
                name: model.name,
                indices: mesh.indices,
                vertices,
                surfaces: vec![GeoSurface { start_index: 0, count }],
            }
        })
        .collect()
}

fn triple(data: &[f32], i: usize) -> Option<[f32; 3]> {
    data.get(i * 3..i * 3 + 3).map(|s| [s[0], s[1], s[2]])
}

fn pair(data: &[f32], i: usize) -> Option<[f32; 2]> {
    data.get(i * 2..i * 2 + 2).map(|s| [s[0], s[1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> tobj::Model {
        let mesh = tobj::Mesh {
            positions: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            normals: vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            texcoords: vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            indices: vec![0, 1, 2],
            ..Default::default()
        };
        tobj::Model::new(mesh, "triangle".to_string())
    }

    #[test]
    fn colour_is_the_normal() {
        let meshes = meshes_from_models(vec![triangle()]);
        assert_eq!(meshes.len(), 1);
        let mesh = &meshes[0];
        assert_eq!(mesh.name, "triangle");
        assert_eq!(mesh.vertices.len(), 3);
        assert_eq!(mesh.vertices[1].position, [1.0, 0.0, 0.0]);
        assert_eq!(mesh.vertices[2].uv_y, 1.0);
        assert_eq!(mesh.vertices[0].color, [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(mesh.surfaces, vec![GeoSurface { start_index: 0, count: 3 }]);
    }

    #[test]
    fn models_without_indices_are_skipped() {
        let empty = tobj::Model::new(tobj::Mesh::default(), "empty".to_string());
        assert!(meshes_from_models(vec![empty, triangle()]).len() == 1);
    }

    #[test]
    fn missing_file_yields_no_meshes() {
        assert!(read_obj("/nonexistent/ember/basicmesh.obj").unwrap().is_empty());
    }
}
