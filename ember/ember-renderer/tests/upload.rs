mod common;

use std::io::Write;
use std::path::PathBuf;

use tempfile::NamedTempFile;

use ember_renderer::{Engine, EngineConfig, NoOverlay, Vertex};
use ember_rhi::headless::{HeadlessEvent, RecordedCommand};
use ember_rhi::{Device, HeadlessDevice};

fn triangle() -> (Vec<u32>, Vec<Vertex>) {
    let vertex = |x: f32, y: f32| Vertex {
        position: [x, y, 0.0],
        color: [x, y, 1.0, 1.0],
        ..Default::default()
    };
    (
        vec![0, 1, 2],
        vec![vertex(0.0, 0.0), vertex(1.0, 0.0), vertex(0.0, 1.0)],
    )
}

fn temp_obj(body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("ember-")
        .suffix(".obj")
        .tempfile()
        .unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn engine_upload_round_trips_and_frees_staging() {
    let (device, mut engine) = common::engine();
    let (indices, vertices) = triangle();
    device.clear_events();

    let mesh = engine.upload_mesh(&indices, &vertices).unwrap();
    assert_eq!(mesh.index_count, 3);
    assert_ne!(mesh.vertex_buffer_address, 0);

    let allocator = engine.allocator();
    let vertex_buffer = allocator.buffer(mesh.vertex_buffer).unwrap();
    let stored = device
        .read_buffer(vertex_buffer, 0, vertex_buffer.size())
        .unwrap();
    assert_eq!(stored, bytemuck::cast_slice::<Vertex, u8>(&vertices));

    let index_buffer = allocator.buffer(mesh.index_buffer).unwrap();
    let stored = device.read_buffer(index_buffer, 0, index_buffer.size()).unwrap();
    assert_eq!(stored, bytemuck::cast_slice::<u32, u8>(&indices));

    let staging_destroyed = device.events().iter().any(|e| {
        matches!(
            e,
            HeadlessEvent::BufferDestroyed {
                label: Some("staging"),
                ..
            }
        )
    });
    assert!(staging_destroyed);
    // Quad plus this mesh; no staging left behind.
    assert_eq!(device.live_buffer_count(), 4);
    assert_eq!(engine.pending_global_deletions(), 8);
}

#[test]
fn empty_mesh_is_rejected() {
    let (device, mut engine) = common::engine();
    assert!(engine.upload_mesh(&[], &[]).is_err());
    assert_eq!(device.live_buffer_count(), 2);
}

#[test]
fn missing_mesh_file_still_draws_the_quad() {
    let device = HeadlessDevice::new();
    let config = EngineConfig {
        mesh_path: PathBuf::from("does/not/exist.obj"),
        ..common::config()
    };
    let mut engine = Engine::new(device.clone(), config, &common::shaders(), common::WINDOW).unwrap();
    assert_eq!(engine.load_default_meshes().unwrap(), 0);

    engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap();
    let submissions = device.submissions();
    let draws = submissions
        .last()
        .unwrap()
        .iter()
        .filter(|c| matches!(c, RecordedCommand::DrawIndexed { .. }))
        .count();
    assert_eq!(draws, 1);
}

#[test]
fn loaded_meshes_are_drawn_after_the_quad() {
    let obj = temp_obj("o tri\nv 0 0 0\nv 1 0 0\nv 0 1 0\nvn 0 0 1\nf 1//1 2//1 3//1\n");
    let device = HeadlessDevice::new();
    let config = EngineConfig {
        mesh_path: obj.path().to_path_buf(),
        ..common::config()
    };
    let mut engine = Engine::new(device.clone(), config, &common::shaders(), common::WINDOW).unwrap();
    assert_eq!(engine.load_default_meshes().unwrap(), 1);
    assert_eq!(engine.meshes()[0].name, "tri");

    engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap();
    let submissions = device.submissions();
    let draws: Vec<&RecordedCommand> = submissions
        .last()
        .unwrap()
        .iter()
        .filter(|c| matches!(c, RecordedCommand::DrawIndexed { .. }))
        .collect();
    assert_eq!(
        draws,
        vec![
            &RecordedCommand::DrawIndexed {
                index_count: 6,
                first_index: 0
            },
            &RecordedCommand::DrawIndexed {
                index_count: 3,
                first_index: 0
            },
        ]
    );

    drop(engine);
    assert_eq!(device.live_buffer_count(), 0);
}
