//! Mesh upload through a single staging buffer.
//!
//! Vertices go to a device-local storage buffer that shaders read through its device address,
//! indices to a device-local index buffer. Both are filled from one host-visible staging buffer
//! (vertex bytes first, index bytes appended) by a copy on the immediate-submit channel. The
//! staging buffer never outlives the call.

use bytemuck::{Pod, Zeroable};
use ember_rhi::{BufferDescriptor, BufferMemoryPreference, BufferUsage, Queue};

use crate::deletion::DeletionQueue;
use crate::error::{RendererError, Result};
use crate::immediate::ImmediateSubmit;
use crate::resources::{Allocator, BufferHandle};

/// Vertex layout shared with `colored_triangle_mesh.vert`. UVs are split to pack into 16-byte rows.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub uv_x: f32,
    pub normal: [f32; 3],
    pub uv_y: f32,
    pub color: [f32; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMeshBuffers {
    pub index_buffer: BufferHandle,
    pub vertex_buffer: BufferHandle,
    pub vertex_buffer_address: u64,
    pub index_count: u32,
}

impl GpuMeshBuffers {
    /// Hand both buffers to a deletion queue. The index buffer is registered last so it goes first.
    pub fn defer_destroy(&self, queue: &mut DeletionQueue) {
        queue.push_buffer(self.vertex_buffer);
        queue.push_buffer(self.index_buffer);
    }
}

/// Upload `indices` and `vertices` into new GPU buffers, blocking until the copy has finished.
///
/// On failure every buffer created by the call is destroyed again.
pub fn upload_mesh(
    allocator: &mut Allocator,
    queue: &dyn Queue,
    immediate: &mut ImmediateSubmit,
    indices: &[u32],
    vertices: &[Vertex],
) -> Result<GpuMeshBuffers> {
    if indices.is_empty() || vertices.is_empty() {
        return Err(RendererError::InvalidState(format!(
            "mesh upload with {} indices and {} vertices",
            indices.len(),
            vertices.len()
        )));
    }
    let index_count = u32::try_from(indices.len())
        .map_err(|_| RendererError::InvalidState("index count exceeds u32".to_string()))?;
    let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
    let index_bytes: &[u8] = bytemuck::cast_slice(indices);

    let vertex_buffer = allocator.create_buffer(&BufferDescriptor {
        label: Some("mesh vertices"),
        size: vertex_bytes.len() as u64,
        usage: BufferUsage::STORAGE | BufferUsage::COPY_DST | BufferUsage::DEVICE_ADDRESS,
        memory: BufferMemoryPreference::DeviceLocal,
    })?;
    let index_buffer = match allocator.create_buffer(&BufferDescriptor {
        label: Some("mesh indices"),
        size: index_bytes.len() as u64,
        usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
        memory: BufferMemoryPreference::DeviceLocal,
    }) {
        Ok(handle) => handle,
        Err(e) => {
            release(allocator, &[vertex_buffer]);
            return Err(e);
        }
    };

    let filled = vertex_address(allocator, vertex_buffer).and_then(|address| {
        stage_and_copy(
            allocator,
            queue,
            immediate,
            (vertex_buffer, vertex_bytes),
            (index_buffer, index_bytes),
        )
        .map(|()| address)
    });

    match filled {
        Ok(vertex_buffer_address) => {
            log::debug!(
                "uploaded mesh: {} vertices, {} indices",
                vertices.len(),
                indices.len()
            );
            Ok(GpuMeshBuffers {
                index_buffer,
                vertex_buffer,
                vertex_buffer_address,
                index_count,
            })
        }
        Err(e) => {
            release(allocator, &[index_buffer, vertex_buffer]);
            Err(e)
        }
    }
}

fn vertex_address(allocator: &Allocator, vertex_buffer: BufferHandle) -> Result<u64> {
    allocator
        .buffer(vertex_buffer)?
        .device_address()
        .ok_or_else(|| RendererError::InvalidState("vertex buffer has no device address".to_string()))
}

fn stage_and_copy(
    allocator: &mut Allocator,
    queue: &dyn Queue,
    immediate: &mut ImmediateSubmit,
    (vertex_buffer, vertex_bytes): (BufferHandle, &[u8]),
    (index_buffer, index_bytes): (BufferHandle, &[u8]),
) -> Result<()> {
    let vertex_size = vertex_bytes.len() as u64;
    let index_size = index_bytes.len() as u64;
    let staging = allocator.create_buffer(&BufferDescriptor {
        label: Some("staging"),
        size: vertex_size + index_size,
        usage: BufferUsage::COPY_SRC,
        memory: BufferMemoryPreference::HostVisible,
    })?;

    let copied = copy_through(
        allocator,
        queue,
        immediate,
        staging,
        (vertex_buffer, vertex_bytes),
        (index_buffer, index_bytes),
    );
    let destroyed = allocator.destroy_buffer(staging);
    copied.and(destroyed)
}

fn copy_through(
    allocator: &Allocator,
    queue: &dyn Queue,
    immediate: &mut ImmediateSubmit,
    staging: BufferHandle,
    (vertex_buffer, vertex_bytes): (BufferHandle, &[u8]),
    (index_buffer, index_bytes): (BufferHandle, &[u8]),
) -> Result<()> {
    let vertex_size = vertex_bytes.len() as u64;
    allocator.write_buffer(staging, 0, vertex_bytes)?;
    allocator.write_buffer(staging, vertex_size, index_bytes)?;

    let src = allocator.buffer(staging)?;
    let vertices = allocator.buffer(vertex_buffer)?;
    let indices = allocator.buffer(index_buffer)?;
    immediate.submit(queue, |encoder| {
        encoder.copy_buffer_to_buffer(src, 0, vertices, 0, vertex_size)?;
        encoder.copy_buffer_to_buffer(src, vertex_size, indices, 0, index_bytes.len() as u64)?;
        Ok(())
    })
}

fn release(allocator: &mut Allocator, buffers: &[BufferHandle]) {
    for &handle in buffers {
        if let Err(e) = allocator.destroy_buffer(handle) {
            log::error!("releasing buffer after failed upload: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_rhi::headless::{HeadlessEvent, RecordedCommand};
    use ember_rhi::{Buffer, Device, HeadlessDevice};
    use std::sync::Arc;

    struct Rig {
        device: Arc<HeadlessDevice>,
        allocator: Allocator,
        queue: Box<dyn Queue>,
        immediate: ImmediateSubmit,
    }

    fn rig() -> Rig {
        let device = HeadlessDevice::new();
        Rig {
            allocator: Allocator::new(device.clone()),
            queue: device.queue().unwrap(),
            immediate: ImmediateSubmit::new(device.as_ref(), 1_000_000).unwrap(),
            device,
        }
    }

    fn quad() -> Vec<Vertex> {
        [[0.5, -0.5, 0.0], [0.5, 0.5, 0.0], [-0.5, -0.5, 0.0], [-0.5, 0.5, 0.0]]
            .iter()
            .enumerate()
            .map(|(i, &position)| Vertex {
                position,
                color: [i as f32, 0.5, 1.0, 1.0],
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn vertex_is_48_bytes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
    }

    #[test]
    fn upload_round_trips_and_drops_staging() {
        let mut rig = rig();
        let indices = [0u32, 1, 2, 2, 1, 3];
        let vertices = quad();
        let mesh = upload_mesh(
            &mut rig.allocator,
            rig.queue.as_ref(),
            &mut rig.immediate,
            &indices,
            &vertices,
        )
        .unwrap();

        let vb = rig.allocator.buffer(mesh.vertex_buffer).unwrap();
        let ib = rig.allocator.buffer(mesh.index_buffer).unwrap();
        assert_eq!(
            rig.device.read_buffer(vb, 0, vb.size()).unwrap(),
            bytemuck::cast_slice::<Vertex, u8>(&vertices)
        );
        assert_eq!(
            rig.device.read_buffer(ib, 0, ib.size()).unwrap(),
            bytemuck::cast_slice::<u32, u8>(&indices)
        );
        assert_eq!(mesh.index_count, 6);
        assert_eq!(Some(mesh.vertex_buffer_address), vb.device_address());

        assert_eq!(rig.allocator.live_buffers(), 2);
        assert_eq!(rig.device.live_buffer_count(), 2);
        assert!(rig
            .device
            .events()
            .iter()
            .any(|e| matches!(e, HeadlessEvent::BufferDestroyed { label: Some("staging"), .. })));
    }

    #[test]
    fn staging_holds_vertices_then_indices() {
        let mut rig = rig();
        let mesh = upload_mesh(
            &mut rig.allocator,
            rig.queue.as_ref(),
            &mut rig.immediate,
            &[0, 1, 2],
            &quad()[..3],
        )
        .unwrap();
        let vb_id = rig.allocator.buffer(mesh.vertex_buffer).unwrap().id();
        let ib_id = rig.allocator.buffer(mesh.index_buffer).unwrap().id();
        let copies: Vec<_> = rig
            .device
            .submissions()
            .concat()
            .into_iter()
            .filter_map(|c| match c {
                RecordedCommand::CopyBuffer { dst, size, .. } => Some((dst, size)),
                _ => None,
            })
            .collect();
        assert_eq!(copies, vec![(vb_id, 3 * 48), (ib_id, 12)]);
    }

    #[test]
    fn empty_mesh_is_rejected_without_allocating() {
        let mut rig = rig();
        let err = upload_mesh(&mut rig.allocator, rig.queue.as_ref(), &mut rig.immediate, &[], &quad())
            .unwrap_err();
        assert!(matches!(err, RendererError::InvalidState(_)));
        assert_eq!(rig.device.live_buffer_count(), 0);
    }

    #[test]
    fn failed_copy_leaves_nothing_behind() {
        let mut rig = rig();
        rig.device.set_stalled(true);
        let err = upload_mesh(
            &mut rig.allocator,
            rig.queue.as_ref(),
            &mut rig.immediate,
            &[0, 1, 2],
            &quad()[..3],
        )
        .unwrap_err();
        assert!(matches!(err, RendererError::GpuTimeout { .. }));
        assert_eq!(rig.allocator.live_buffers(), 0);
        assert_eq!(rig.device.live_buffer_count(), 0);
    }

    #[test]
    fn deferred_destroy_releases_both_buffers() {
        let mut rig = rig();
        let mesh = upload_mesh(
            &mut rig.allocator,
            rig.queue.as_ref(),
            &mut rig.immediate,
            &[0, 1, 2],
            &quad()[..3],
        )
        .unwrap();
        let mut deletion = DeletionQueue::new("test");
        mesh.defer_destroy(&mut deletion);
        deletion.flush(&mut rig.allocator).unwrap();
        assert_eq!(rig.device.live_buffer_count(), 0);
    }
}
